//! Tile identifiers and per-tile spatial extent queries.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use geo::{EuclideanDistance, Intersects, Point, Polygon};

use crate::geojson::FeatureCollection;

/// National-grid tile identifier, `<zoom>-<x>-<y>`.
///
/// The tile index historically used both dash form (`10-430-720`) and slash
/// form (`10/430/720`); both parse, dash form is canonical on output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileId {
    pub zoom: u32,
    pub x: u32,
    pub y: u32,
}

impl FromStr for TileId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let sep = if s.contains('/') { '/' } else { '-' };
        let parts: Vec<&str> = s.split(sep).collect();
        if parts.len() != 3 {
            bail!("malformed tile id '{s}' (expected <zoom>-<x>-<y>)");
        }
        let field = |i: usize, name: &str| -> Result<u32> {
            parts[i]
                .parse::<u32>()
                .with_context(|| format!("malformed tile id '{s}': bad {name}"))
        };
        Ok(Self {
            zoom: field(0, "zoom")?,
            x: field(1, "x")?,
            y: field(2, "y")?,
        })
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.zoom, self.x, self.y)
    }
}

/// Tile index file: tile id -> boundary polygon in RD meters.
///
/// Loaded once per run; tiles are looked up by normalized id so dash and
/// slash forms in the file both resolve.
pub struct TileIndexFile {
    entries: Vec<(TileId, Polygon<f64>)>,
}

impl TileIndexFile {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("cannot open tile index {}", path.display()))?;
        let collection: FeatureCollection = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("cannot parse tile index {}", path.display()))?;

        let mut entries = Vec::with_capacity(collection.features.len());
        for feature in &collection.features {
            let raw = feature
                .properties
                .get("tile_id")
                .and_then(|v| v.as_str())
                .with_context(|| format!("tile index feature without tile_id in {}", path.display()))?;
            let id: TileId = raw.parse()?;
            let mut polygons = feature.geometry.polygons()?;
            if polygons.len() != 1 {
                bail!("tile {id} boundary must be a single polygon");
            }
            entries.push((id, polygons.remove(0)));
        }
        Ok(Self { entries })
    }

    pub fn polygon(&self, id: TileId) -> Option<&Polygon<f64>> {
        self.entries
            .iter()
            .find(|(tid, _)| *tid == id)
            .map(|(_, poly)| poly)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// One tile's acceptance region: boundary polygon plus an outward margin.
#[derive(Debug, Clone)]
pub struct TileIndex {
    pub id: TileId,
    polygon: Polygon<f64>,
    margin_m: f64,
}

impl TileIndex {
    pub fn new(id: TileId, polygon: Polygon<f64>, margin_m: f64) -> Self {
        debug_assert!(margin_m >= 0.0, "margin must be non-negative");
        Self {
            id,
            polygon,
            margin_m,
        }
    }

    pub fn margin_m(&self) -> f64 {
        self.margin_m
    }

    /// Point-in-polygon against the raw boundary. Closed semantics: a point
    /// exactly on the boundary counts as inside.
    pub fn contains_strict(&self, x: f64, y: f64) -> bool {
        self.polygon.intersects(&Point::new(x, y))
    }

    /// Point-in-polygon against the boundary expanded outward by the margin.
    /// Distance to the polygon is zero anywhere inside it, so this is the
    /// buffered-containment test without constructing the buffer.
    pub fn contains_with_margin(&self, x: f64, y: f64) -> bool {
        self.polygon.euclidean_distance(&Point::new(x, y)) <= self.margin_m
    }
}
