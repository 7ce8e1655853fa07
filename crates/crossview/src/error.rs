use std::path::PathBuf;

use thiserror::Error;

pub use rdnap::OutOfDomainError;

/// A tile carries no building footprints at all. Non-fatal: the verifier
/// classifies every inside-margin point as `dropped_too_far` since there is
/// no anchor to measure against.
#[derive(Debug, Error)]
#[error("tile {tile_id} has no building footprints")]
pub struct EmptyFootprintSetError {
    pub tile_id: String,
}

/// A single image asset could not be copied or linked into the clean set.
/// The item is skipped with a warning; the subset build continues.
#[derive(Debug, Error)]
#[error("failed to materialize {}: {source}", path.display())]
pub struct AssetCopyError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Manifest assembly found required upstream artifacts missing. The tile is
/// marked incomplete and reported; a multi-tile batch keeps going.
#[derive(Debug, Error)]
#[error("tile {tile_id} incomplete, missing: {}", missing.join(", "))]
pub struct IncompleteTileError {
    pub tile_id: String,
    pub missing: Vec<String>,
}
