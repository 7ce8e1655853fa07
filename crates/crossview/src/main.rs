use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use rayon::prelude::*;
use rdnap::RdNew;

mod error;
mod footprints;
mod geojson;
mod manifest;
mod meta;
mod subset;
mod tile;
mod verify;

use footprints::FootprintStore;
use manifest::{BuildStatus, DataRoots, TileManifest};
use tile::{TileId, TileIndex, TileIndexFile};

#[derive(Parser, Debug)]
#[command(
    name = "crossview",
    version,
    about = "Align and verify per-tile building, street-level and aerial data"
)]
struct Cli {
    /// Base data directory (expects mesh/, streetlevel/, aerial/ under it).
    #[arg(long, global = true, env = "CROSSVIEW_DATA_ROOT", default_value = "data/amsterdam")]
    data_root: PathBuf,

    #[arg(long, global = true, help = "Override mesh root (default: <data-root>/mesh)")]
    mesh_root: Option<PathBuf>,

    #[arg(long, global = true, help = "Override street-level root (default: <data-root>/streetlevel)")]
    map_root: Option<PathBuf>,

    #[arg(long, global = true, help = "Override aerial root (default: <data-root>/aerial)")]
    aerial_root: Option<PathBuf>,

    #[arg(long, global = true, help = "Override processed root (default: <data-root>/processed)")]
    out_root: Option<PathBuf>,

    /// Tile index file, GeoJSON in RD meters (default: <mesh-root>/tile_index.json).
    #[arg(long, global = true)]
    tile_index: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Cache projected coordinates and UTC timestamps into the metadata table.
    Augment {
        #[arg(long)]
        tile_id: String,
        #[arg(long, default_value_t = false)]
        overwrite: bool,
    },
    /// Verify tile membership and building proximity for every capture point.
    Verify {
        #[arg(long)]
        tile_id: String,
        /// Keep points at most this far (meters) from the nearest building.
        #[arg(long)]
        max_dist_m: f64,
        /// Acceptance margin (meters) around the tile boundary.
        #[arg(long, default_value_t = 15.0)]
        margin_m: f64,
        #[arg(long, default_value_t = false)]
        overwrite: bool,
    },
    /// Select the clean subset: capped metadata table plus image assets.
    Clean {
        #[arg(long)]
        tile_id: String,
        /// Cap on retained images per tile.
        #[arg(long, default_value_t = 1000)]
        max_images: usize,
        /// Symlink assets instead of copying.
        #[arg(long, default_value_t = false)]
        link: bool,
        #[arg(long, default_value_t = false)]
        overwrite: bool,
    },
    /// Assemble the per-tile cross-modality manifest.
    Manifest {
        #[arg(long)]
        tile_id: String,
        /// Treat aerial rasters as a required artifact.
        #[arg(long, default_value_t = false)]
        require_aerial: bool,
    },
    /// Merge per-tile manifests into a single dataset index.
    Merge {
        /// Output path (default: <out-root>/index.json).
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Run augment, verify, clean and manifest for many tiles in parallel.
    Run {
        /// Comma-separated tile ids, dash or slash form.
        #[arg(long, value_delimiter = ',', required = true)]
        tiles: Vec<String>,
        #[arg(long)]
        max_dist_m: f64,
        #[arg(long, default_value_t = 15.0)]
        margin_m: f64,
        #[arg(long, default_value_t = 1000)]
        max_images: usize,
        #[arg(long, default_value_t = false)]
        link: bool,
        #[arg(long, default_value_t = false)]
        require_aerial: bool,
        #[arg(long, default_value_t = false)]
        overwrite: bool,
    },
}

struct Pipeline {
    roots: DataRoots,
    tile_index_path: PathBuf,
    transformer: RdNew,
}

#[derive(Debug, Clone, Copy)]
struct RunParams {
    max_dist_m: f64,
    margin_m: f64,
    max_images: usize,
    link: bool,
    require_aerial: bool,
    overwrite: bool,
}

enum TileStatus {
    Complete,
    Incomplete(Vec<String>),
    Failed(String),
}

impl Pipeline {
    fn augment(&self, tile: TileId, overwrite: bool) -> Result<()> {
        let tile_dir = self.roots.tile_dir(tile);
        let src = tile_dir.join("meta.jsonl");
        let dst = tile_dir.join("meta_28992.jsonl");
        if dst.exists() && !overwrite {
            info!("{tile}: skip augment ({} exists)", dst.display());
            return Ok(());
        }

        let rows = meta::read_jsonl(&src)?;
        if rows.is_empty() {
            bail!("no usable rows in {}", src.display());
        }
        let (rows, stats) = meta::augment_rows(rows, &self.transformer);
        meta::write_jsonl(&dst, &rows)?;
        info!(
            "{tile}: augment {} rows -> {} ({} without coordinates, {} duplicate, {} outside domain)",
            stats.input,
            rows.len(),
            stats.input - stats.with_coords,
            stats.with_coords - stats.after_dedup,
            stats.out_of_domain
        );
        Ok(())
    }

    fn verify(
        &self,
        index_file: &TileIndexFile,
        tile: TileId,
        params: &RunParams,
    ) -> Result<()> {
        let out_dir = self.roots.out_dir(tile);
        let records_path = out_dir.join("verification.jsonl");
        if records_path.exists() && !params.overwrite {
            info!("{tile}: skip verify ({} exists)", records_path.display());
            return Ok(());
        }

        let polygon = index_file
            .polygon(tile)
            .with_context(|| format!("tile {tile} not in {}", self.tile_index_path.display()))?
            .clone();
        let tile_index = TileIndex::new(tile, polygon, params.margin_m);

        let footprint_list = footprints::load_footprints(&self.roots.footprints_json(tile))?;
        let store = match FootprintStore::build(tile, footprint_list) {
            Ok(store) => Some(store),
            Err(err) => {
                warn!("{err}; classifying without building anchors");
                None
            }
        };

        let rows = meta::read_jsonl(&self.roots.tile_dir(tile).join("meta_28992.jsonl"))?;
        let points = meta::points_from_rows(&rows);

        let outcome = verify::verify_points(
            &self.transformer,
            &tile_index,
            store.as_ref(),
            &points,
            params.max_dist_m,
        );

        fs::create_dir_all(&out_dir)?;
        verify::write_records_jsonl(&records_path, &outcome.records)?;
        verify::write_records_csv(&out_dir.join("diagnostics.csv"), &outcome.records)?;
        verify::write_diagnostics_json(&out_dir.join("diagnostics.json"), &outcome.diagnostics)?;
        if let Some(summary) = &outcome.diagnostics.distance_summary {
            info!(
                "{tile}: dist to buildings (m): p50={:.1} p90={:.1} max={:.1}",
                summary.p50, summary.p90, summary.max
            );
        }
        Ok(())
    }

    fn clean(&self, tile: TileId, params: &RunParams) -> Result<()> {
        let tile_dir = self.roots.tile_dir(tile);
        let out_dir = self.roots.out_dir(tile);
        let clean_meta_path = tile_dir.join("meta_clean.jsonl");
        if clean_meta_path.exists() && !params.overwrite {
            info!("{tile}: skip clean ({} exists)", clean_meta_path.display());
            return Ok(());
        }

        let records = verify::read_records_jsonl(&out_dir.join("verification.jsonl"))
            .with_context(|| format!("no verification output for {tile}; run verify first"))?;

        let selected = subset::select_clean(&records, params.max_images);
        let ids: Vec<&str> = selected.iter().map(|r| r.id.as_str()).collect();
        info!(
            "{tile}: clean subset {} of {} records (cap {})",
            selected.len(),
            records.len(),
            params.max_images
        );

        let selected_rows: Vec<verify::VerificationRecord> =
            selected.iter().map(|&r| r.clone()).collect();
        verify::write_records_csv(&out_dir.join("clean.csv"), &selected_rows)?;

        let rows = meta::read_jsonl(&tile_dir.join("meta_28992.jsonl"))?;
        let keep: HashSet<&str> = ids.iter().copied().collect();
        let filtered = subset::filter_meta_rows(&rows, &keep);
        meta::write_jsonl(&clean_meta_path, &filtered)?;

        subset::materialize_assets(
            &tile_dir.join("images"),
            &tile_dir.join("images_clean"),
            &ids,
            params.link,
        )?;
        Ok(())
    }

    fn manifest(&self, tile: TileId, require_aerial: bool) -> Result<TileManifest> {
        let footprint_count = {
            let path = self.roots.footprints_json(tile);
            path.exists()
                .then(|| footprints::load_footprints(&path).map(|f| f.len()))
                .transpose()?
        };

        let manifest = manifest::assemble(&self.roots, tile, require_aerial, footprint_count)?;
        let out_dir = self.roots.out_dir(tile);
        fs::create_dir_all(&out_dir)?;
        manifest::write_manifest(&out_dir.join("manifest.json"), &manifest)?;

        match manifest.status_error() {
            Some(err) => warn!("{err}"),
            None => info!("{tile}: manifest complete"),
        }
        Ok(manifest)
    }

    fn run_one(&self, index_file: &TileIndexFile, tile: TileId, params: &RunParams) -> TileStatus {
        let chain = || -> Result<TileManifest> {
            self.augment(tile, params.overwrite)?;
            self.verify(index_file, tile, params)?;
            self.clean(tile, params)?;
            self.manifest(tile, params.require_aerial)
        };
        match chain() {
            Ok(manifest) if manifest.build_status == BuildStatus::Incomplete => {
                TileStatus::Incomplete(manifest.missing)
            }
            Ok(_) => TileStatus::Complete,
            Err(err) => {
                warn!("{tile}: {err:#}");
                TileStatus::Failed(format!("{err:#}"))
            }
        }
    }

    /// Tiles are independent; no shared mutable state crosses a tile
    /// boundary, so the batch fans out with no locking. A failing tile is
    /// isolated and summarized at the end.
    fn run_batch(&self, tiles: &[TileId], params: &RunParams) -> Result<()> {
        let index_file = TileIndexFile::load(&self.tile_index_path)?;
        info!("running {} tiles ({} in tile index)", tiles.len(), index_file.len());

        let statuses: Vec<(TileId, TileStatus)> = tiles
            .par_iter()
            .map(|&tile| (tile, self.run_one(&index_file, tile, params)))
            .collect();

        let mut failed = 0usize;
        for (tile, status) in &statuses {
            match status {
                TileStatus::Complete => info!("[ok] {tile}"),
                TileStatus::Incomplete(missing) => {
                    info!("[incomplete] {tile}: missing {}", missing.join(", "))
                }
                TileStatus::Failed(reason) => {
                    failed += 1;
                    warn!("[failed] {tile}: {reason}");
                }
            }
        }

        if failed > 0 {
            bail!("{failed} of {} tiles failed", tiles.len());
        }
        Ok(())
    }
}

fn check_non_negative(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        bail!("{name} must be a non-negative number, got {value}");
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let roots = DataRoots::new(
        cli.data_root,
        cli.mesh_root,
        cli.map_root,
        cli.aerial_root,
        cli.out_root,
    );
    let tile_index_path = cli
        .tile_index
        .unwrap_or_else(|| roots.mesh_root.join("tile_index.json"));
    let pipeline = Pipeline {
        roots,
        tile_index_path,
        transformer: RdNew::new(),
    };

    // Configuration problems are fatal before any file is touched.
    match cli.command {
        Commands::Augment { tile_id, overwrite } => {
            let tile: TileId = tile_id.parse()?;
            pipeline.augment(tile, overwrite)
        }
        Commands::Verify {
            tile_id,
            max_dist_m,
            margin_m,
            overwrite,
        } => {
            let tile: TileId = tile_id.parse()?;
            check_non_negative("--max-dist-m", max_dist_m)?;
            check_non_negative("--margin-m", margin_m)?;
            let params = RunParams {
                max_dist_m,
                margin_m,
                max_images: 0,
                link: false,
                require_aerial: false,
                overwrite,
            };
            let index_file = TileIndexFile::load(&pipeline.tile_index_path)?;
            pipeline.verify(&index_file, tile, &params)
        }
        Commands::Clean {
            tile_id,
            max_images,
            link,
            overwrite,
        } => {
            let tile: TileId = tile_id.parse()?;
            let params = RunParams {
                max_dist_m: 0.0,
                margin_m: 0.0,
                max_images,
                link,
                require_aerial: false,
                overwrite,
            };
            pipeline.clean(tile, &params)
        }
        Commands::Manifest {
            tile_id,
            require_aerial,
        } => {
            let tile: TileId = tile_id.parse()?;
            pipeline.manifest(tile, require_aerial).map(|_| ())
        }
        Commands::Merge { out } => {
            let index = manifest::merge(&pipeline.roots.out_root)?;
            let out_path = out.unwrap_or_else(|| pipeline.roots.out_root.join("index.json"));
            manifest::write_index(&out_path, &index)?;
            info!(
                "wrote {} ({} tiles, {} complete)",
                out_path.display(),
                index.summary.tiles,
                index.summary.complete
            );
            Ok(())
        }
        Commands::Run {
            tiles,
            max_dist_m,
            margin_m,
            max_images,
            link,
            require_aerial,
            overwrite,
        } => {
            check_non_negative("--max-dist-m", max_dist_m)?;
            check_non_negative("--margin-m", margin_m)?;
            let tiles: Vec<TileId> = tiles
                .iter()
                .map(|s| s.parse())
                .collect::<Result<Vec<_>>>()?;
            let params = RunParams {
                max_dist_m,
                margin_m,
                max_images,
                link,
                require_aerial,
                overwrite,
            };
            pipeline.run_batch(&tiles, &params)
        }
    }
}
