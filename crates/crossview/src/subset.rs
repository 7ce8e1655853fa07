//! Clean-subset selection: cap the kept records, filter the metadata table
//! and materialize the matching image assets.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use log::{info, warn};

use crate::error::AssetCopyError;
use crate::meta::Row;
use crate::verify::{Category, VerificationRecord};

/// Picks the clean subset: kept records ordered by ascending
/// nearest-footprint distance, ties broken by image id, truncated to
/// `max_images`. Stable across runs and input reorderings, and a cap
/// prefers well-anchored imagery.
pub fn select_clean<'a>(
    records: &'a [VerificationRecord],
    max_images: usize,
) -> Vec<&'a VerificationRecord> {
    let mut kept: Vec<&VerificationRecord> = records
        .iter()
        .filter(|r| r.category == Category::Kept)
        .collect();
    kept.sort_by(|a, b| {
        let da = a.distance_m.unwrap_or(f64::INFINITY);
        let db = b.distance_m.unwrap_or(f64::INFINITY);
        da.total_cmp(&db).then_with(|| a.id.cmp(&b.id))
    });
    kept.truncate(max_images);
    kept
}

/// Filters metadata rows down to the selected ids, preserving the original
/// row order of the table.
pub fn filter_meta_rows(rows: &[Row], selected: &HashSet<&str>) -> Vec<Row> {
    rows.iter()
        .filter(|row| {
            row.get("id")
                .map(|v| match v {
                    serde_json::Value::String(s) => selected.contains(s.as_str()),
                    serde_json::Value::Number(n) => selected.contains(n.to_string().as_str()),
                    _ => false,
                })
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

#[derive(Debug, Default)]
pub struct AssetReport {
    pub written: usize,
    pub failures: Vec<AssetCopyError>,
}

/// Copies (or symlinks) `<id>.jpg` for every selected id into `out_dir`.
///
/// A single broken asset must not abort the subset build: the item is
/// warned about, recorded, and the loop continues.
pub fn materialize_assets(
    images_dir: &Path,
    out_dir: &Path,
    ids: &[&str],
    link: bool,
) -> Result<AssetReport> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("cannot create {}", out_dir.display()))?;

    let mut report = AssetReport::default();
    for id in ids {
        let src = images_dir.join(format!("{id}.jpg"));
        let dst = out_dir.join(format!("{id}.jpg"));

        let result = if link {
            link_asset(&src, &dst)
        } else {
            copy_asset(&src, &dst)
        };

        match result {
            Ok(()) => report.written += 1,
            Err(source) => {
                let err = AssetCopyError { path: src, source };
                warn!("{err}");
                report.failures.push(err);
            }
        }
    }

    info!(
        "materialized {} assets into {} ({} failed)",
        report.written,
        out_dir.display(),
        report.failures.len()
    );
    Ok(report)
}

fn copy_asset(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::copy(src, dst).map(|_| ())
}

#[cfg(unix)]
fn link_asset(src: &Path, dst: &Path) -> std::io::Result<()> {
    let target = src.canonicalize()?;
    if dst.exists() {
        fs::remove_file(dst)?;
    }
    std::os::unix::fs::symlink(target, dst)
}

#[cfg(not(unix))]
fn link_asset(src: &Path, dst: &Path) -> std::io::Result<()> {
    copy_asset(src, dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, distance_m: f64) -> VerificationRecord {
        VerificationRecord {
            id: id.to_owned(),
            lon: 4.9,
            lat: 52.37,
            x: 120_500.0,
            y: 487_500.0,
            inside_tile: true,
            inside_margin: true,
            nearest_building_id: Some("bag.1".to_owned()),
            distance_m: Some(distance_m),
            category: Category::Kept,
        }
    }

    fn dropped(id: &str) -> VerificationRecord {
        VerificationRecord {
            category: Category::DroppedOutsideTile,
            inside_tile: false,
            inside_margin: false,
            ..record(id, 999.0)
        }
    }

    fn sample() -> Vec<VerificationRecord> {
        vec![
            record("e", 12.0),
            dropped("z"),
            record("a", 3.0),
            record("c", 7.0),
            record("b", 7.0), // tied with c, id breaks the tie
            record("d", 9.0),
        ]
    }

    #[test]
    fn selection_orders_by_distance_then_id() {
        let records = sample();
        let ids: Vec<&str> = select_clean(&records, 10)
            .iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, ["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn cap_boundaries() {
        let records = sample();
        assert!(select_clean(&records, 0).is_empty());

        let capped: Vec<&str> = select_clean(&records, 3)
            .iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(capped, ["a", "b", "c"]); // prefix of the full ordering

        assert_eq!(select_clean(&records, 5).len(), 5);
        assert_eq!(select_clean(&records, 100).len(), 5); // fewer than N is fine
    }

    #[test]
    fn meta_filter_preserves_row_order() {
        let rows: Vec<Row> = ["e", "a", "c", "b"]
            .iter()
            .map(|id| {
                json!({"id": id, "lon": 4.9, "lat": 52.37})
                    .as_object()
                    .unwrap()
                    .clone()
            })
            .collect();

        let selected: HashSet<&str> = ["a", "b", "e"].into_iter().collect();
        let filtered = filter_meta_rows(&rows, &selected);
        let order: Vec<&str> = filtered
            .iter()
            .map(|r| r["id"].as_str().unwrap())
            .collect();
        assert_eq!(order, ["e", "a", "b"]);
    }

    #[test]
    fn numeric_ids_match_string_selection() {
        let rows = vec![json!({"id": 42}).as_object().unwrap().clone()];
        let selected: HashSet<&str> = ["42"].into_iter().collect();
        assert_eq!(filter_meta_rows(&rows, &selected).len(), 1);
    }

    #[test]
    fn missing_asset_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images");
        fs::create_dir_all(&images).unwrap();
        fs::write(images.join("a.jpg"), b"jpeg-a").unwrap();
        fs::write(images.join("c.jpg"), b"jpeg-c").unwrap();
        // b.jpg deliberately absent

        let out = dir.path().join("images_clean");
        let report = materialize_assets(&images, &out, &["a", "b", "c"], false).unwrap();

        assert_eq!(report.written, 2);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].path.ends_with("b.jpg"));
        assert!(out.join("a.jpg").exists());
        assert!(!out.join("b.jpg").exists());
        assert!(out.join("c.jpg").exists());
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_assets_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images");
        fs::create_dir_all(&images).unwrap();
        fs::write(images.join("a.jpg"), b"jpeg-a").unwrap();

        let out = dir.path().join("images_clean");
        let report = materialize_assets(&images, &out, &["a"], true).unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(fs::read(out.join("a.jpg")).unwrap(), b"jpeg-a");
    }
}
