//! Mapping verification: tile membership and building-proximity checks for
//! every capture point, plus the aggregate diagnostics.
//!
//! `verify_points` is a pure function of (tile geometry, footprint set,
//! point set, threshold); it touches no files and no network, so it can be
//! re-run with a different threshold without re-fetching anything.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use log::{info, warn};
use rayon::prelude::*;
use rdnap::RdNew;
use serde::{Deserialize, Serialize};

use crate::footprints::FootprintStore;
use crate::meta::ImagePoint;
use crate::tile::TileIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Kept,
    DroppedOutsideTile,
    DroppedTooFar,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Kept => "kept",
            Category::DroppedOutsideTile => "dropped_outside_tile",
            Category::DroppedTooFar => "dropped_too_far",
        }
    }
}

/// One row of the verification table. Computed once per run, then treated
/// as immutable; a threshold change means a full recompute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub id: String,
    pub lon: f64,
    pub lat: f64,
    pub x: f64,
    pub y: f64,
    pub inside_tile: bool,
    pub inside_margin: bool,
    pub nearest_building_id: Option<String>,
    pub distance_m: Option<f64>,
    pub category: Category,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistanceSummary {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p90: f64,
}

/// Aggregates for one verification run. `distances_m` is the full empirical
/// distribution, in record order, for downstream plotting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostics {
    pub tile_id: String,
    pub max_dist_m: f64,
    pub margin_m: f64,
    pub total_points: usize,
    pub kept: usize,
    pub dropped_outside_tile: usize,
    pub dropped_too_far: usize,
    pub out_of_domain: usize,
    pub footprint_count: usize,
    pub distance_summary: Option<DistanceSummary>,
    pub distances_m: Vec<f64>,
}

pub struct VerifyOutcome {
    pub records: Vec<VerificationRecord>,
    pub diagnostics: Diagnostics,
}

/// Classifies every point against one tile.
///
/// `store` is `None` when the tile has no footprints: there is no anchor to
/// measure against, so every inside-margin point drops as too-far with no
/// nearest building recorded.
pub fn verify_points(
    transformer: &RdNew,
    tile: &TileIndex,
    store: Option<&FootprintStore>,
    points: &[ImagePoint],
    max_dist_m: f64,
) -> VerifyOutcome {
    // Queries are read-only against immutable indices; order of the output
    // must match the input, which par_iter + collect preserves.
    let records: Vec<VerificationRecord> = points
        .par_iter()
        .filter_map(|point| {
            let (x, y) = match point.projected(transformer) {
                Ok(xy) => xy,
                Err(err) => {
                    warn!("{}: {err}", point.id);
                    return None;
                }
            };

            let inside_tile = tile.contains_strict(x, y);
            let inside_margin = tile.contains_with_margin(x, y);

            let nearest = store.map(|s| s.nearest(x, y));
            let (nearest_building_id, distance_m) = match &nearest {
                Some((id, dist)) => (Some((*id).to_owned()), Some(*dist)),
                None => (None, None),
            };

            let category = if !inside_margin {
                Category::DroppedOutsideTile
            } else {
                match distance_m {
                    Some(dist) if dist <= max_dist_m => Category::Kept,
                    _ => Category::DroppedTooFar,
                }
            };

            Some(VerificationRecord {
                id: point.id.clone(),
                lon: point.lon,
                lat: point.lat,
                x,
                y,
                inside_tile,
                inside_margin,
                nearest_building_id,
                distance_m,
                category,
            })
        })
        .collect();

    let diagnostics = summarize(tile, store, points.len(), &records, max_dist_m);
    info!(
        "{}: {} points | kept {} | outside {} | too far {} | out of domain {}",
        tile.id,
        diagnostics.total_points,
        diagnostics.kept,
        diagnostics.dropped_outside_tile,
        diagnostics.dropped_too_far,
        diagnostics.out_of_domain
    );

    VerifyOutcome {
        records,
        diagnostics,
    }
}

fn summarize(
    tile: &TileIndex,
    store: Option<&FootprintStore>,
    total_points: usize,
    records: &[VerificationRecord],
    max_dist_m: f64,
) -> Diagnostics {
    let count = |cat: Category| records.iter().filter(|r| r.category == cat).count();

    let distances_m: Vec<f64> = records.iter().filter_map(|r| r.distance_m).collect();
    let distance_summary = (!distances_m.is_empty()).then(|| {
        let mut sorted = distances_m.clone();
        sorted.sort_by(f64::total_cmp);
        DistanceSummary {
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            mean: sorted.iter().sum::<f64>() / sorted.len() as f64,
            p50: percentile(&sorted, 50.0),
            p90: percentile(&sorted, 90.0),
        }
    });

    Diagnostics {
        tile_id: tile.id.to_string(),
        max_dist_m,
        margin_m: tile.margin_m(),
        total_points,
        kept: count(Category::Kept),
        dropped_outside_tile: count(Category::DroppedOutsideTile),
        dropped_too_far: count(Category::DroppedTooFar),
        out_of_domain: total_points - records.len(),
        footprint_count: store.map_or(0, FootprintStore::len),
        distance_summary,
        distances_m,
    }
}

/// Linear-interpolated percentile over a pre-sorted slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    let rank = q / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}

/// Writes the verification table as CSV, one row per point, in record
/// order. Optional fields render empty.
pub fn write_records_csv(path: &Path, records: &[VerificationRecord]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("cannot write {}", path.display()))?;
    let mut out = BufWriter::new(file);
    writeln!(
        out,
        "id,lon,lat,x,y,inside_tile,inside_margin,nearest_building_id,distance_m,category"
    )?;
    for r in records {
        writeln!(
            out,
            "{},{},{},{},{},{},{},{},{},{}",
            r.id,
            r.lon,
            r.lat,
            r.x,
            r.y,
            r.inside_tile,
            r.inside_margin,
            r.nearest_building_id.as_deref().unwrap_or(""),
            r.distance_m.map(|d| d.to_string()).unwrap_or_default(),
            r.category.as_str()
        )?;
    }
    out.flush()?;
    Ok(())
}

/// Writes the record table as JSONL for the downstream subset stage.
pub fn write_records_jsonl(path: &Path, records: &[VerificationRecord]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("cannot write {}", path.display()))?;
    let mut out = BufWriter::new(file);
    for r in records {
        serde_json::to_writer(&mut out, r)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

pub fn read_records_jsonl(path: &Path) -> Result<Vec<VerificationRecord>> {
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}

pub fn write_diagnostics_json(path: &Path, diagnostics: &Diagnostics) -> Result<()> {
    let file = File::create(path).with_context(|| format!("cannot write {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), diagnostics)?;
    Ok(())
}
