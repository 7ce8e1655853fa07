//! Per-tile manifest assembly and the cross-tile index merge.
//!
//! A manifest joins the three modalities for one tile: mesh artifacts,
//! clean street-level imagery and aerial rasters. Every referenced path is
//! existence-checked at build time; missing required artifacts mark the
//! tile incomplete without aborting a multi-tile batch.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::IncompleteTileError;
use crate::meta::{self, time_span};
use crate::tile::TileId;

pub const CRS: &str = "EPSG:28992";

/// Root directories of the three modalities plus the processed output.
#[derive(Debug, Clone)]
pub struct DataRoots {
    pub data_root: PathBuf,
    pub mesh_root: PathBuf,
    pub map_root: PathBuf,
    pub aerial_root: PathBuf,
    pub out_root: PathBuf,
}

impl DataRoots {
    /// Standard layout under one base directory; any root can be overridden.
    pub fn new(
        data_root: PathBuf,
        mesh_root: Option<PathBuf>,
        map_root: Option<PathBuf>,
        aerial_root: Option<PathBuf>,
        out_root: Option<PathBuf>,
    ) -> Self {
        Self {
            mesh_root: mesh_root.unwrap_or_else(|| data_root.join("mesh")),
            map_root: map_root.unwrap_or_else(|| data_root.join("streetlevel")),
            aerial_root: aerial_root.unwrap_or_else(|| data_root.join("aerial")),
            out_root: out_root.unwrap_or_else(|| data_root.join("processed")),
            data_root,
        }
    }

    pub fn mesh_gpkg(&self, tile: TileId) -> PathBuf {
        self.mesh_root.join(tile.to_string()).join(format!("{tile}.gpkg"))
    }

    pub fn footprints_json(&self, tile: TileId) -> PathBuf {
        self.mesh_root.join(tile.to_string()).join("footprints.json")
    }

    pub fn tile_dir(&self, tile: TileId) -> PathBuf {
        self.map_root.join(tile.to_string())
    }

    pub fn out_dir(&self, tile: TileId) -> PathBuf {
        self.out_root.join(tile.to_string())
    }

    /// Path rendered relative to the data root, for portable manifests.
    fn rel(&self, path: &Path) -> String {
        path.strip_prefix(&self.data_root)
            .unwrap_or(path)
            .display()
            .to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Complete,
    Incomplete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSpans {
    pub raw: [Option<String>; 2],
    pub clean: [Option<String>; 2],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileManifest {
    pub tile_id: String,
    pub created_at: String,
    pub crs: String,
    pub mesh_path: Option<String>,
    pub clean_metadata_path: Option<String>,
    pub clean_images_dir: Option<String>,
    pub aerial_paths: Vec<String>,
    pub image_count: Option<usize>,
    pub footprint_count: Option<usize>,
    pub time_spans: TimeSpans,
    pub build_status: BuildStatus,
    pub missing: Vec<String>,
}

impl TileManifest {
    pub fn status_error(&self) -> Option<IncompleteTileError> {
        (self.build_status == BuildStatus::Incomplete).then(|| IncompleteTileError {
            tile_id: self.tile_id.clone(),
            missing: self.missing.clone(),
        })
    }
}

fn existing(path: PathBuf) -> Option<PathBuf> {
    path.exists().then_some(path)
}

/// Aerial rasters follow the `aerial_<gsd>m.tif` / `.png` convention of the
/// ortho fetcher; sorted for stable manifests.
fn aerial_paths(dir: &Path) -> Vec<PathBuf> {
    if !dir.is_dir() {
        return Vec::new();
    }
    let mut paths: Vec<PathBuf> = WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            let name = p.file_name().and_then(|n| n.to_str()).unwrap_or("");
            name.starts_with("aerial_") && (name.ends_with(".tif") || name.ends_with(".png"))
        })
        .collect();
    paths.sort();
    paths
}

/// Assembles one tile's manifest. Always returns a manifest; required
/// artifacts that are missing set `build_status: incomplete` and the
/// `missing` list, which [`TileManifest::status_error`] turns into an
/// [`IncompleteTileError`] for batch reporting.
pub fn assemble(
    roots: &DataRoots,
    tile: TileId,
    require_aerial: bool,
    footprint_count: Option<usize>,
) -> Result<TileManifest> {
    let tile_dir = roots.tile_dir(tile);

    let mesh_gpkg = existing(roots.mesh_gpkg(tile));
    let clean_meta = existing(tile_dir.join("meta_clean.jsonl"));
    let clean_images = existing(tile_dir.join("images_clean"));
    let aerials = aerial_paths(&roots.aerial_root.join(tile.to_string()));

    let mut missing = Vec::new();
    if mesh_gpkg.is_none() {
        missing.push("mesh_gpkg".to_owned());
    }
    if clean_meta.is_none() {
        missing.push("clean_metadata".to_owned());
    }
    if require_aerial && aerials.is_empty() {
        missing.push("aerial".to_owned());
    }

    // Counts and spans come from the tables themselves when present.
    let has_clean_meta = clean_meta.is_some();
    let raw_rows = existing(tile_dir.join("meta_28992.jsonl"))
        .map(|p| meta::read_jsonl(&p))
        .transpose()?
        .unwrap_or_default();
    let clean_rows = clean_meta
        .as_deref()
        .map(meta::read_jsonl)
        .transpose()?
        .unwrap_or_default();

    Ok(TileManifest {
        tile_id: tile.to_string(),
        created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        crs: CRS.to_owned(),
        mesh_path: mesh_gpkg.map(|p| roots.rel(&p)),
        clean_metadata_path: clean_meta.map(|p| roots.rel(&p)),
        clean_images_dir: clean_images.map(|p| roots.rel(&p)),
        aerial_paths: aerials.iter().map(|p| roots.rel(p)).collect(),
        image_count: has_clean_meta.then_some(clean_rows.len()),
        footprint_count,
        time_spans: TimeSpans {
            raw: time_span(&raw_rows),
            clean: time_span(&clean_rows),
        },
        build_status: if missing.is_empty() {
            BuildStatus::Complete
        } else {
            BuildStatus::Incomplete
        },
        missing,
    })
}

pub fn write_manifest(path: &Path, manifest: &TileManifest) -> Result<()> {
    let file = File::create(path).with_context(|| format!("cannot write {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), manifest)?;
    Ok(())
}

pub fn read_manifest(path: &Path) -> Result<TileManifest> {
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IndexSummary {
    pub tiles: usize,
    pub complete: usize,
    pub incomplete: usize,
    pub image_count: usize,
    pub footprint_count: usize,
    pub time_spans: TimeSpans,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatasetIndex {
    pub created_at: String,
    pub version: u32,
    pub summary: IndexSummary,
    pub tiles: Vec<TileManifest>,
}

fn fold_span(acc: &mut [Option<String>; 2], span: &[Option<String>; 2]) {
    if let Some(lo) = &span[0] {
        if acc[0].as_deref().map_or(true, |m| lo.as_str() < m) {
            acc[0] = Some(lo.clone());
        }
    }
    if let Some(hi) = &span[1] {
        if acc[1].as_deref().map_or(true, |m| hi.as_str() > m) {
            acc[1] = Some(hi.clone());
        }
    }
}

/// Folds every `<out_root>/<tile>/manifest.json` into a single dataset
/// index. Unreadable manifests are warned about and skipped.
pub fn merge(out_root: &Path) -> Result<DatasetIndex> {
    if !out_root.is_dir() {
        bail!("processed root not found: {}", out_root.display());
    }

    let mut subdirs: Vec<PathBuf> = std::fs::read_dir(out_root)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    subdirs.sort();

    let mut tiles = Vec::new();
    let mut raw_span = [None, None];
    let mut clean_span = [None, None];
    let (mut complete, mut images, mut footprints) = (0usize, 0usize, 0usize);

    for dir in subdirs {
        let path = dir.join("manifest.json");
        if !path.exists() {
            continue;
        }
        let manifest = match read_manifest(&path) {
            Ok(m) => m,
            Err(err) => {
                warn!("skipping unreadable manifest {}: {err:#}", path.display());
                continue;
            }
        };
        if manifest.build_status == BuildStatus::Complete {
            complete += 1;
        }
        images += manifest.image_count.unwrap_or(0);
        footprints += manifest.footprint_count.unwrap_or(0);
        fold_span(&mut raw_span, &manifest.time_spans.raw);
        fold_span(&mut clean_span, &manifest.time_spans.clean);
        tiles.push(manifest);
    }

    if tiles.is_empty() {
        bail!("no manifests found under {}", out_root.display());
    }

    Ok(DatasetIndex {
        created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        version: 1,
        summary: IndexSummary {
            tiles: tiles.len(),
            complete,
            incomplete: tiles.len() - complete,
            image_count: images,
            footprint_count: footprints,
            time_spans: TimeSpans {
                raw: raw_span,
                clean: clean_span,
            },
        },
        tiles,
    })
}

pub fn write_index(path: &Path, index: &DatasetIndex) -> Result<()> {
    let file = File::create(path).with_context(|| format!("cannot write {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), index)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tile_id() -> TileId {
        "10-430-720".parse().unwrap()
    }

    fn roots(base: &Path) -> DataRoots {
        DataRoots::new(base.to_path_buf(), None, None, None, None)
    }

    fn seed_tile(roots: &DataRoots, tile: TileId, with_aerial: bool) {
        let mesh_dir = roots.mesh_root.join(tile.to_string());
        fs::create_dir_all(&mesh_dir).unwrap();
        fs::write(roots.mesh_gpkg(tile), b"gpkg").unwrap();

        let tile_dir = roots.tile_dir(tile);
        fs::create_dir_all(tile_dir.join("images_clean")).unwrap();
        fs::write(
            tile_dir.join("meta_clean.jsonl"),
            concat!(
                "{\"id\":\"a\",\"captured_at_utc\":\"2022-01-01T00:00:00Z\"}\n",
                "{\"id\":\"b\",\"captured_at_utc\":\"2022-06-01T00:00:00Z\"}\n",
            ),
        )
        .unwrap();

        if with_aerial {
            let aerial_dir = roots.aerial_root.join(tile.to_string());
            fs::create_dir_all(&aerial_dir).unwrap();
            fs::write(aerial_dir.join("aerial_0.25m.tif"), b"tif").unwrap();
        }
    }

    #[test]
    fn complete_tile_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let roots = roots(dir.path());
        seed_tile(&roots, tile_id(), true);

        let manifest = assemble(&roots, tile_id(), true, Some(3)).unwrap();
        assert_eq!(manifest.build_status, BuildStatus::Complete);
        assert!(manifest.status_error().is_none());
        assert_eq!(manifest.image_count, Some(2));
        assert_eq!(manifest.footprint_count, Some(3));
        assert_eq!(manifest.aerial_paths.len(), 1);
        assert_eq!(
            manifest.mesh_path.as_deref(),
            Some("mesh/10-430-720/10-430-720.gpkg")
        );
        assert_eq!(
            manifest.time_spans.clean,
            [
                Some("2022-01-01T00:00:00Z".to_owned()),
                Some("2022-06-01T00:00:00Z".to_owned())
            ]
        );
    }

    #[test]
    fn aerial_requirement_follows_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let roots = roots(dir.path());
        seed_tile(&roots, tile_id(), false);

        // Aerial optional: the tile is complete without rasters.
        let relaxed = assemble(&roots, tile_id(), false, None).unwrap();
        assert_eq!(relaxed.build_status, BuildStatus::Complete);

        // Aerial required: same tile is incomplete, batch-level error.
        let strict = assemble(&roots, tile_id(), true, None).unwrap();
        assert_eq!(strict.build_status, BuildStatus::Incomplete);
        assert_eq!(strict.missing, ["aerial"]);
        let err = strict.status_error().unwrap();
        assert_eq!(err.tile_id, "10-430-720");
    }

    #[test]
    fn missing_mesh_and_metadata_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let roots = roots(dir.path());

        let manifest = assemble(&roots, tile_id(), false, None).unwrap();
        assert_eq!(manifest.build_status, BuildStatus::Incomplete);
        assert_eq!(manifest.missing, ["mesh_gpkg", "clean_metadata"]);
        assert_eq!(manifest.image_count, None);
    }

    #[test]
    fn merge_folds_manifests_and_skips_unreadable_ones() {
        let dir = tempfile::tempdir().unwrap();
        let roots = roots(dir.path());

        let a: TileId = "10-430-720".parse().unwrap();
        let b: TileId = "10-430-721".parse().unwrap();
        seed_tile(&roots, a, true);
        seed_tile(&roots, b, true);

        for (tile, count) in [(a, Some(3)), (b, Some(5))] {
            let manifest = assemble(&roots, tile, false, count).unwrap();
            let out = roots.out_dir(tile);
            fs::create_dir_all(&out).unwrap();
            write_manifest(&out.join("manifest.json"), &manifest).unwrap();
        }

        // A corrupt manifest must be skipped, not fatal.
        let broken = roots.out_root.join("10-430-722");
        fs::create_dir_all(&broken).unwrap();
        fs::write(broken.join("manifest.json"), b"{ not json").unwrap();

        let index = merge(&roots.out_root).unwrap();
        assert_eq!(index.summary.tiles, 2);
        assert_eq!(index.summary.complete, 2);
        assert_eq!(index.summary.image_count, 4);
        assert_eq!(index.summary.footprint_count, 8);
        assert_eq!(
            index.summary.time_spans.clean[1].as_deref(),
            Some("2022-06-01T00:00:00Z")
        );
    }
}
