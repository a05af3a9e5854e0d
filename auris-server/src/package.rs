//! Output artifact packaging
//!
//! On job completion the manager packages every succeeded output into a
//! single downloadable archive. Packaging failure is reported at the job
//! level and never invalidates the per-file results.

use std::fs::File;
use std::path::Path;
use thiserror::Error;
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("Packaging I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// Builds the downloadable artifact for a job's output tree
pub trait Packager: Send + Sync {
    /// Package every file under `output_dir` into `artifact`, overwriting
    /// any previous archive. Returns the number of files packaged.
    fn package(&self, output_dir: &Path, artifact: &Path) -> Result<usize, PackageError>;
}

/// Deflate-compressed zip packager
pub struct ZipPackager;

impl Packager for ZipPackager {
    fn package(&self, output_dir: &Path, artifact: &Path) -> Result<usize, PackageError> {
        if let Some(parent) = artifact.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = File::create(artifact)?;
        let mut writer = ZipWriter::new(file);
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

        let mut count = 0;
        for entry in WalkDir::new(output_dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let arcname = entry
                .path()
                .strip_prefix(output_dir)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");

            writer.start_file(arcname, options)?;
            let mut reader = File::open(entry.path())?;
            std::io::copy(&mut reader, &mut writer)?;
            count += 1;
        }

        writer.finish()?;
        Ok(count)
    }
}
