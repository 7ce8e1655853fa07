//! Building footprints and the nearest-footprint spatial index.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};
use geo::{BoundingRect, EuclideanDistance, Point, Polygon};
use rstar::{PointDistance, RTree, RTreeObject, AABB};

use crate::error::EmptyFootprintSetError;
use crate::geojson::FeatureCollection;
use crate::tile::TileId;

/// Distances closer than this are considered equal; ties resolve to the
/// lexicographically smallest building id so reruns and reorderings agree.
const TIE_EPS_M: f64 = 1e-6;

#[derive(Debug, Clone)]
pub struct Footprint {
    pub id: String,
    pub polygon: Polygon<f64>,
}

/// Loads the per-tile footprint FeatureCollection written by the mesh
/// converter. MultiPolygons are exploded into parts sharing the building id.
pub fn load_footprints(path: &Path) -> Result<Vec<Footprint>> {
    let file =
        File::open(path).with_context(|| format!("cannot open footprints {}", path.display()))?;
    let collection: FeatureCollection = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("cannot parse footprints {}", path.display()))?;

    let mut footprints = Vec::new();
    for feature in &collection.features {
        let id = feature
            .properties
            .get("id")
            .or_else(|| feature.properties.get("identificatie"))
            .and_then(|v| v.as_str())
            .with_context(|| format!("footprint feature without id in {}", path.display()))?
            .to_owned();
        for polygon in feature.geometry.polygons()? {
            footprints.push(Footprint {
                id: id.clone(),
                polygon,
            });
        }
    }
    Ok(footprints)
}

#[derive(Debug)]
struct Entry {
    idx: usize,
    env: AABB<[f64; 2]>,
}

impl RTreeObject for Entry {
    type Envelope = AABB<[f64; 2]>;

    #[inline]
    fn envelope(&self) -> Self::Envelope {
        self.env
    }
}

impl PointDistance for Entry {
    // Envelope distance: a lower bound on the exact polygon distance, which
    // is what the pruning in `nearest` relies on.
    #[inline]
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        self.env.distance_2(point)
    }
}

/// Immutable nearest-footprint index over one tile's buildings.
///
/// Queries are read-only; the store can be shared across worker threads
/// without locking.
#[derive(Debug)]
pub struct FootprintStore {
    footprints: Vec<Footprint>,
    tree: RTree<Entry>,
}

impl FootprintStore {
    pub fn build(
        tile_id: TileId,
        footprints: Vec<Footprint>,
    ) -> Result<Self, EmptyFootprintSetError> {
        if footprints.is_empty() {
            return Err(EmptyFootprintSetError {
                tile_id: tile_id.to_string(),
            });
        }

        let entries = footprints
            .iter()
            .enumerate()
            .map(|(idx, fp)| {
                // A degenerate polygon still has a bounding rect of its
                // exterior coordinates; fall back to a point envelope.
                let env = match fp.polygon.bounding_rect() {
                    Some(rect) => {
                        AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y])
                    }
                    None => AABB::from_point([0.0, 0.0]),
                };
                Entry { idx, env }
            })
            .collect();

        Ok(Self {
            footprints,
            tree: RTree::bulk_load(entries),
        })
    }

    pub fn len(&self) -> usize {
        self.footprints.len()
    }

    /// Nearest footprint to a point: `(building_id, distance_m)`.
    ///
    /// Distance is to the polygon boundary, zero anywhere inside. Candidates
    /// come out of the tree ordered by envelope distance, a lower bound on
    /// the true distance, so the scan stops once no closer polygon can exist.
    pub fn nearest(&self, x: f64, y: f64) -> (&str, f64) {
        let point = Point::new(x, y);
        let mut best_dist = f64::INFINITY;
        let mut best_id: Option<&str> = None;

        for (entry, env_d2) in self.tree.nearest_neighbor_iter_with_distance_2(&[x, y]) {
            if best_id.is_some() {
                let bound = best_dist + TIE_EPS_M;
                if env_d2 > bound * bound {
                    break;
                }
            }

            let footprint = &self.footprints[entry.idx];
            let dist = footprint.polygon.euclidean_distance(&point);

            let closer = dist < best_dist - TIE_EPS_M;
            let tied_smaller_id = (dist - best_dist).abs() <= TIE_EPS_M
                && best_id.map_or(true, |id| footprint.id.as_str() < id);
            if closer || tied_smaller_id {
                best_dist = dist;
                best_id = Some(&footprint.id);
            }
        }

        // The constructor rejects empty sets, so a winner always exists.
        (best_id.unwrap_or(""), best_dist.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    fn unit_square(id: &str, x0: f64, y0: f64) -> Footprint {
        Footprint {
            id: id.to_owned(),
            polygon: polygon![
                (x: x0, y: y0),
                (x: x0 + 10.0, y: y0),
                (x: x0 + 10.0, y: y0 + 10.0),
                (x: x0, y: y0 + 10.0),
            ],
        }
    }

    fn tile_id() -> TileId {
        "10-430-720".parse().unwrap()
    }

    #[test]
    fn empty_set_is_an_error() {
        let err = FootprintStore::build(tile_id(), Vec::new()).unwrap_err();
        assert_eq!(err.tile_id, "10-430-720");
    }

    #[test]
    fn interior_distance_is_zero() {
        let store = FootprintStore::build(tile_id(), vec![unit_square("b1", 0.0, 0.0)]).unwrap();
        let (id, dist) = store.nearest(5.0, 5.0);
        assert_eq!(id, "b1");
        assert_eq!(dist, 0.0);
    }

    #[test]
    fn picks_the_closest_footprint() {
        let store = FootprintStore::build(
            tile_id(),
            vec![unit_square("far", 100.0, 0.0), unit_square("near", 0.0, 0.0)],
        )
        .unwrap();
        let (id, dist) = store.nearest(15.0, 5.0);
        assert_eq!(id, "near");
        assert!((dist - 5.0).abs() < 1e-9);
    }

    #[test]
    fn ties_resolve_to_smallest_id_under_reordering() {
        // Two squares symmetric about x = 50; the query sits exactly between.
        let a = unit_square("a", 0.0, 0.0);
        let b = unit_square("b", 90.0, 0.0);

        let forward = FootprintStore::build(tile_id(), vec![a.clone(), b.clone()]).unwrap();
        let reversed = FootprintStore::build(tile_id(), vec![b, a]).unwrap();

        for store in [&forward, &reversed] {
            let (id, dist) = store.nearest(50.0, 5.0);
            assert_eq!(id, "a");
            assert!((dist - 40.0).abs() < 1e-9);
        }
    }

    #[test]
    fn envelope_pruning_does_not_change_results() {
        // A wide, thin footprint whose envelope is much closer than its
        // boundary, next to a small square that actually wins.
        let thin = Footprint {
            id: "thin".to_owned(),
            polygon: polygon![
                (x: 0.0, y: 0.0),
                (x: 200.0, y: 0.0),
                (x: 200.0, y: 1.0),
                (x: 0.0, y: 1.0),
            ],
        };
        let near = unit_square("near", 95.0, 20.0);
        let store = FootprintStore::build(tile_id(), vec![thin, near]).unwrap();

        let (id, dist) = store.nearest(100.0, 25.0);
        assert_eq!(id, "near");
        assert_eq!(dist, 0.0);
    }
}
