//! Downloadable result bundles.

use crate::errors::SketchflowError;
use serde::Serialize;
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Archive entry name of the run log.
pub const LOG_ENTRY: &str = "flow_log.txt";

/// The terminal artifact of a completed run plus its log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultBundle {
    /// Terminal artifact on disk.
    pub artifact: PathBuf,
    /// Run log, when one exists.
    pub log: Option<PathBuf>,
}

impl ResultBundle {
    /// Archive entry name of the terminal artifact.
    #[must_use]
    pub fn artifact_name(&self) -> String {
        self.artifact
            .file_name()
            .map_or_else(|| "result".to_string(), |n| n.to_string_lossy().into_owned())
    }

    /// Renders the bundle as a ZIP archive in memory.
    pub fn to_zip(&self) -> Result<Vec<u8>, SketchflowError> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        add_file(&mut writer, &self.artifact_name(), &self.artifact, options)?;
        if let Some(log) = &self.log {
            add_file(&mut writer, LOG_ENTRY, log, options)?;
        }

        let cursor = writer.finish().map_err(zip_error)?;
        Ok(cursor.into_inner())
    }

    /// Writes the ZIP archive to `path`.
    pub fn write_zip(&self, path: &Path) -> Result<(), SketchflowError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_zip()?)?;
        Ok(())
    }
}

fn add_file(
    writer: &mut ZipWriter<Cursor<Vec<u8>>>,
    name: &str,
    path: &Path,
    options: SimpleFileOptions,
) -> Result<(), SketchflowError> {
    let bytes = fs::read(path)?;
    writer.start_file(name, options).map_err(zip_error)?;
    writer.write_all(&bytes)?;
    Ok(())
}

fn zip_error(err: zip::result::ZipError) -> SketchflowError {
    SketchflowError::Internal(format!("zip: {err}"))
}
