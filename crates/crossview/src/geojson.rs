//! Minimal GeoJSON-shaped input parsing.
//!
//! The upstream converters hand us FeatureCollections with Polygon or
//! MultiPolygon geometries in RD meters; nothing here validates CRS
//! metadata, coordinates are taken as-is.

use anyhow::{bail, Context, Result};
use geo::{LineString, Polygon};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct FeatureCollection {
    pub features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
pub struct Feature {
    pub geometry: Geometry,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct Geometry {
    #[serde(rename = "type")]
    pub kind: String,
    pub coordinates: serde_json::Value,
}

type Ring = Vec<[f64; 2]>;

fn ring_to_line_string(ring: Ring) -> LineString<f64> {
    LineString::from(
        ring.into_iter()
            .map(|[x, y]| (x, y))
            .collect::<Vec<(f64, f64)>>(),
    )
}

fn rings_to_polygon(mut rings: Vec<Ring>) -> Result<Polygon<f64>> {
    if rings.is_empty() {
        bail!("polygon geometry without rings");
    }
    let exterior = ring_to_line_string(rings.remove(0));
    let interiors = rings.into_iter().map(ring_to_line_string).collect();
    Ok(Polygon::new(exterior, interiors))
}

impl Geometry {
    /// Flattens the geometry into plain polygons; MultiPolygons explode into
    /// one entry per part.
    pub fn polygons(&self) -> Result<Vec<Polygon<f64>>> {
        match self.kind.as_str() {
            "Polygon" => {
                let rings: Vec<Ring> = serde_json::from_value(self.coordinates.clone())
                    .context("malformed Polygon coordinates")?;
                Ok(vec![rings_to_polygon(rings)?])
            }
            "MultiPolygon" => {
                let parts: Vec<Vec<Ring>> = serde_json::from_value(self.coordinates.clone())
                    .context("malformed MultiPolygon coordinates")?;
                parts.into_iter().map(rings_to_polygon).collect()
            }
            other => bail!("unsupported geometry type '{other}'"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_polygon_and_multipolygon() {
        let collection: FeatureCollection = serde_json::from_value(json!({
            "type": "FeatureCollection",
            "features": [
                {
                    "type": "Feature",
                    "properties": {"id": "a"},
                    "geometry": {
                        "type": "Polygon",
                        "coordinates": [[[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0], [0.0, 0.0]]]
                    }
                },
                {
                    "type": "Feature",
                    "properties": {"id": "b"},
                    "geometry": {
                        "type": "MultiPolygon",
                        "coordinates": [
                            [[[20.0, 0.0], [30.0, 0.0], [30.0, 10.0], [20.0, 0.0]]],
                            [[[40.0, 0.0], [50.0, 0.0], [50.0, 10.0], [40.0, 0.0]]]
                        ]
                    }
                }
            ]
        }))
        .unwrap();

        assert_eq!(collection.features.len(), 2);
        assert_eq!(collection.features[0].geometry.polygons().unwrap().len(), 1);
        assert_eq!(collection.features[1].geometry.polygons().unwrap().len(), 2);
    }

    #[test]
    fn rejects_unknown_geometry() {
        let geometry = Geometry {
            kind: "Point".into(),
            coordinates: json!([1.0, 2.0]),
        };
        assert!(geometry.polygons().is_err());
    }
}
