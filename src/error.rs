// ABOUTME: Error taxonomy for export and import runs
// ABOUTME: Lets the job runner tell configuration mistakes apart from per-table failures

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Classified failure raised somewhere below the job runner.
///
/// Library code returns `anyhow::Result` throughout; a `MoverError` is attached as
/// the root cause wherever a failure can be classified, and [`MoverError::classify`]
/// recovers the class from any error chain.
#[derive(Error, Debug)]
pub enum MoverError {
    /// Bad or missing job/connection fields. Always aborts the run.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The engine for a connection could not be built or opened.
    #[error("Connection error for '{connection}': {message}")]
    Connection { connection: String, message: String },

    /// A staged file could not be read or written.
    #[error("Staged file error at {}: {message}", path.display())]
    StagingIo { path: PathBuf, message: String },

    /// A row violated a constraint on insert.
    #[error("Integrity violation on table '{table}': {message}")]
    Integrity { table: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Connection,
    StagingIo,
    Integrity,
    Other,
}

impl MoverError {
    pub fn config(message: impl Into<String>) -> Self {
        MoverError::Config(message.into())
    }

    pub fn connection(connection: impl Into<String>, message: impl ToString) -> Self {
        MoverError::Connection {
            connection: connection.into(),
            message: message.to_string(),
        }
    }

    pub fn staging_io(path: &Path, message: impl ToString) -> Self {
        MoverError::StagingIo {
            path: path.to_path_buf(),
            message: message.to_string(),
        }
    }

    pub fn integrity(table: impl Into<String>, message: impl ToString) -> Self {
        MoverError::Integrity {
            table: table.into(),
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MoverError::Config(_) => ErrorKind::Config,
            MoverError::Connection { .. } => ErrorKind::Connection,
            MoverError::StagingIo { .. } => ErrorKind::StagingIo,
            MoverError::Integrity { .. } => ErrorKind::Integrity,
        }
    }

    /// Find the first classified cause in an error chain.
    pub fn classify(err: &anyhow::Error) -> ErrorKind {
        if let Some(mover) = err.downcast_ref::<MoverError>() {
            return mover.kind();
        }

        err.chain()
            .find_map(|cause| cause.downcast_ref::<MoverError>())
            .map(MoverError::kind)
            .unwrap_or(ErrorKind::Other)
    }
}
