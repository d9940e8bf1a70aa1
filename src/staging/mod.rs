// ABOUTME: Staged-file codec: table snapshots to and from JSON or Parquet on disk
// ABOUTME: Dispatches on format and classifies every filesystem failure as StagingIo

pub mod json;
pub mod parquet;
pub mod paths;

use crate::error::MoverError;
use crate::table::TabularBuffer;
use anyhow::Result;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagingFormat {
    /// Row-oriented array of objects
    #[default]
    Json,
    /// Columnar Arrow data in a Parquet container
    #[serde(alias = "columnar")]
    Parquet,
}

impl StagingFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            StagingFormat::Json => "json",
            StagingFormat::Parquet => "parquet",
        }
    }
}

impl fmt::Display for StagingFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.extension())
    }
}

/// Write a snapshot to `path`, creating parent directories as needed
///
/// The data lands in a `.partial` sibling first and is renamed into place, so a
/// half-written snapshot is never picked up by an import.
pub fn write_staged(path: &Path, buffer: &TabularBuffer, format: StagingFormat) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| MoverError::staging_io(parent, e))?;
        }
    }

    let partial = partial_path(path);
    let written = match format {
        StagingFormat::Json => json::write_json(&partial, buffer),
        StagingFormat::Parquet => parquet::write_parquet(&partial, buffer),
    };

    if let Err(e) = written {
        let _ = std::fs::remove_file(&partial);
        return Err(MoverError::staging_io(path, format!("{:#}", e)).into());
    }

    std::fs::rename(&partial, path).map_err(|e| MoverError::staging_io(path, e))?;

    tracing::debug!(
        "Wrote {} rows x {} columns to {}",
        buffer.len(),
        buffer.columns().len(),
        path.display()
    );
    Ok(())
}

/// Read a snapshot back into memory
pub fn read_staged(path: &Path, format: StagingFormat) -> Result<TabularBuffer> {
    let decoded = match format {
        StagingFormat::Json => json::read_json(path),
        StagingFormat::Parquet => parquet::read_parquet(path),
    };

    decoded.map_err(|e| MoverError::staging_io(path, format!("{:#}", e)).into())
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}
