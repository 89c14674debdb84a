// pgvault/src/backup/archive.rs
use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::info;

use crate::errors::{AppError, Result};

/// Gzip stream into an unnamed temporary file in the staging directory. Until
/// `finish_artifact` renames it, nothing discoverable exists on disk and a
/// dropped writer removes the temporary file.
pub type ArtifactWriter = GzEncoder<NamedTempFile>;

pub fn create_staged_artifact(staging_dir: &Path) -> Result<ArtifactWriter> {
    std::fs::create_dir_all(staging_dir)?;
    let temp = tempfile::Builder::new()
        .prefix(".dump-")
        .suffix(".partial")
        .tempfile_in(staging_dir)?;
    Ok(GzEncoder::new(temp, Compression::default()))
}

/// Completes the gzip stream, syncs it and atomically renames it to `dest`.
pub fn finish_artifact(writer: ArtifactWriter, dest: &Path) -> Result<PathBuf> {
    let temp = writer.finish()?;
    temp.as_file().sync_all()?;
    temp.persist(dest).map_err(|e| AppError::Io(e.error))?;
    info!("✓ Artifact written to {}", dest.display());
    Ok(dest.to_path_buf())
}

/// Opens a gzip artifact for streaming decompression. Multi-member streams
/// are accepted.
pub fn open_artifact(archive_path: &Path) -> Result<BufReader<MultiGzDecoder<File>>> {
    if !archive_path.is_file() {
        return Err(AppError::corrupt(
            archive_path.display().to_string(),
            "artifact is not a file",
        ));
    }
    let archive_file = File::open(archive_path)?;
    Ok(BufReader::new(MultiGzDecoder::new(archive_file)))
}
