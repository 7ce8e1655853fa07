//! Street-level imagery metadata: JSONL reading/writing and the
//! augmentation step that caches projected coordinates.
//!
//! Rows are arbitrary JSON objects from the imagery provider; only `id`,
//! `lon` and `lat` are interpreted, everything else passes through
//! untouched.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use log::warn;
use rdnap::RdNew;
use serde_json::{Map, Value};

use crate::error::OutOfDomainError;

pub type Row = Map<String, Value>;

/// Reads JSONL, skipping blank and unparseable lines.
pub fn read_jsonl(path: &Path) -> Result<Vec<Row>> {
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let mut rows = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<Row>(trimmed) {
            Ok(row) => rows.push(row),
            Err(err) => warn!("{}:{}: skipping bad row: {err}", path.display(), lineno + 1),
        }
    }
    Ok(rows)
}

pub fn write_jsonl(path: &Path, rows: &[Row]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("cannot write {}", path.display()))?;
    let mut out = BufWriter::new(file);
    for row in rows {
        serde_json::to_writer(&mut out, row)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

fn row_str(row: &Row, key: &str) -> Option<String> {
    match row.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn row_f64(row: &Row, key: &str) -> Option<f64> {
    let v = row.get(key)?.as_f64()?;
    v.is_finite().then_some(v)
}

/// `captured_at` normalisation: epoch milliseconds (number or digit string)
/// or an ISO-8601 string, to RFC 3339 UTC. Unrecognised values are left out.
pub fn normalize_timestamp(value: &Value) -> Option<String> {
    let utc = |dt: DateTime<Utc>| dt.to_rfc3339_opts(SecondsFormat::Secs, true);

    if let Some(ms) = value.as_i64() {
        return Utc.timestamp_millis_opt(ms).single().map(utc);
    }
    let s = value.as_str()?.trim();
    if s.is_empty() {
        return None;
    }
    if s.chars().all(|c| c.is_ascii_digit()) {
        let ms: i64 = s.parse().ok()?;
        return Utc.timestamp_millis_opt(ms).single().map(utc);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(utc(dt.with_timezone(&Utc)));
    }
    // Naive timestamps are taken as UTC.
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| utc(naive.and_utc()))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AugmentStats {
    pub input: usize,
    pub with_coords: usize,
    pub after_dedup: usize,
    pub out_of_domain: usize,
}

/// Augments raw metadata rows: drops rows without usable coordinates,
/// de-duplicates by id keeping the first occurrence, caches projected
/// `x_28992`/`y_28992`, and normalises `captured_at` to `captured_at_utc`.
pub fn augment_rows(rows: Vec<Row>, transformer: &RdNew) -> (Vec<Row>, AugmentStats) {
    let mut stats = AugmentStats {
        input: rows.len(),
        ..AugmentStats::default()
    };

    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(rows.len());

    for mut row in rows {
        let (Some(id), Some(lon), Some(lat)) = (
            row_str(&row, "id"),
            row_f64(&row, "lon"),
            row_f64(&row, "lat"),
        ) else {
            continue;
        };
        stats.with_coords += 1;

        if !seen.insert(id) {
            continue;
        }
        stats.after_dedup += 1;

        match transformer.to_rd(lon, lat) {
            Ok((x, y)) => {
                row.insert("x_28992".into(), x.into());
                row.insert("y_28992".into(), y.into());
            }
            Err(err) => {
                // Kept in the table; the verifier counts and excludes it.
                stats.out_of_domain += 1;
                warn!("point outside transform domain: {err}");
            }
        }

        let captured_utc = row.get("captured_at").and_then(normalize_timestamp);
        if let Some(utc) = captured_utc {
            row.insert("captured_at_utc".into(), utc.into());
        }

        out.push(row);
    }

    (out, stats)
}

/// One capture point ready for verification.
#[derive(Debug, Clone)]
pub struct ImagePoint {
    pub id: String,
    pub lon: f64,
    pub lat: f64,
    /// Projected coordinates cached by the augment step, if present.
    pub cached_xy: Option<(f64, f64)>,
}

impl ImagePoint {
    /// Projected coordinates: the cached pair when the augment step already
    /// computed one, otherwise a fresh reprojection.
    pub fn projected(&self, transformer: &RdNew) -> Result<(f64, f64), OutOfDomainError> {
        match self.cached_xy {
            Some(xy) => Ok(xy),
            None => transformer.to_rd(self.lon, self.lat),
        }
    }
}

/// Extracts verification inputs from augmented metadata rows. Rows without
/// id or coordinates are skipped with a warning.
pub fn points_from_rows(rows: &[Row]) -> Vec<ImagePoint> {
    rows.iter()
        .filter_map(|row| {
            let (Some(id), Some(lon), Some(lat)) = (
                row_str(row, "id"),
                row_f64(row, "lon"),
                row_f64(row, "lat"),
            ) else {
                warn!("metadata row without id/lon/lat, skipping");
                return None;
            };
            let cached_xy = match (row_f64(row, "x_28992"), row_f64(row, "y_28992")) {
                (Some(x), Some(y)) => Some((x, y)),
                _ => None,
            };
            Some(ImagePoint {
                id,
                lon,
                lat,
                cached_xy,
            })
        })
        .collect()
}

/// Min/max `captured_at_utc` over a set of rows, for manifest time spans.
pub fn time_span(rows: &[Row]) -> [Option<String>; 2] {
    let mut min: Option<String> = None;
    let mut max: Option<String> = None;
    for row in rows {
        let Some(ts) = row.get("captured_at_utc").and_then(|v| v.as_str()) else {
            continue;
        };
        // RFC 3339 UTC strings order lexicographically.
        if min.as_deref().map_or(true, |m| ts < m) {
            min = Some(ts.to_owned());
        }
        if max.as_deref().map_or(true, |m| ts > m) {
            max = Some(ts.to_owned());
        }
    }
    [min, max]
}
