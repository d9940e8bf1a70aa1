// ABOUTME: Jobs-file model: connections, ordered export/import jobs, table policies
// ABOUTME: Loads the document from JSON or TOML and surfaces every problem as a ConfigError

pub mod validation;

use crate::error::MoverError;
use crate::migration::dedup::DedupPolicy;
use crate::migration::identity::{ForeignKey, ForeignKeySchema};
use crate::staging::StagingFormat;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

pub use validation::validate_jobs_file;

/// Column the target assigns on insert, unless the jobs file says otherwise
pub const DEFAULT_IDENTITY_COLUMN: &str = "id";

/// The whole jobs document
#[derive(Debug, Clone, Deserialize)]
pub struct JobsFile {
    pub connections: Vec<ConnectionDescriptor>,
    pub jobs: Vec<Job>,
    /// Natural-key columns per table; tables absent here dedup on the whole row
    #[serde(default)]
    pub dedup_keys: BTreeMap<String, Vec<String>>,
    /// Declared foreign keys per table
    #[serde(default)]
    pub foreign_keys: BTreeMap<String, Vec<ForeignKeyEntry>>,
    /// Fall back to the `<table>_id` naming convention for undeclared tables
    #[serde(default)]
    pub infer_foreign_keys: bool,
    #[serde(default = "default_identity_column")]
    pub identity_column: String,
}

fn default_identity_column() -> String {
    DEFAULT_IDENTITY_COLUMN.to_string()
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyEntry {
    pub column: String,
    pub references: String,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Sqlite,
    #[serde(alias = "postgresql")]
    Postgres,
    #[serde(alias = "mariadb")]
    Mysql,
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseKind::Sqlite => write!(f, "sqlite"),
            DatabaseKind::Postgres => write!(f, "postgres"),
            DatabaseKind::Mysql => write!(f, "mysql"),
        }
    }
}

/// A named database the jobs refer to
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DatabaseKind,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    pub database: String,
    /// File holding the password; absent means connect without one
    #[serde(default)]
    pub password_file: Option<PathBuf>,
}

impl ConnectionDescriptor {
    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or("localhost")
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(match self.kind {
            DatabaseKind::Postgres => 5432,
            DatabaseKind::Mysql => 3306,
            DatabaseKind::Sqlite => 0,
        })
    }

    pub fn username(&self) -> &str {
        match (&self.username, self.kind) {
            (Some(user), _) => user,
            (None, DatabaseKind::Mysql) => "root",
            (None, _) => "postgres",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Export,
    Import,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Export => write!(f, "export"),
            JobKind::Import => write!(f, "import"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Job {
    Export(ExportJob),
    Import(ImportJob),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportJob {
    #[serde(alias = "source_connection")]
    pub connection: String,
    pub tables: Vec<String>,
    #[serde(alias = "output_path")]
    pub dump_path: String,
    #[serde(default)]
    pub dump_format: StagingFormat,
    #[serde(default)]
    pub continue_on_error: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImportJob {
    #[serde(alias = "target_connection")]
    pub connection: String,
    pub tables: Vec<String>,
    #[serde(alias = "input_path")]
    pub dump_path: String,
    #[serde(default)]
    pub dump_format: StagingFormat,
    /// Explicit `{ts}` to import; today's date when absent
    #[serde(default, alias = "as_of_timestamp")]
    pub as_of: Option<String>,
    /// Natural key for every table of this job, overriding `dedup_keys`
    #[serde(default)]
    pub deduplicate_on: Option<Vec<String>>,
    #[serde(default)]
    pub continue_on_error: Option<bool>,
}

impl Job {
    pub fn kind(&self) -> JobKind {
        match self {
            Job::Export(_) => JobKind::Export,
            Job::Import(_) => JobKind::Import,
        }
    }

    pub fn connection(&self) -> &str {
        match self {
            Job::Export(job) => &job.connection,
            Job::Import(job) => &job.connection,
        }
    }

    pub fn tables(&self) -> &[String] {
        match self {
            Job::Export(job) => &job.tables,
            Job::Import(job) => &job.tables,
        }
    }

    pub fn dump_path(&self) -> &str {
        match self {
            Job::Export(job) => &job.dump_path,
            Job::Import(job) => &job.dump_path,
        }
    }

    /// Whether a failure of this job lets the run carry on.
    ///
    /// Exports default to continuing and imports to stopping, since a failed
    /// parent import leaves every later child import without its identity map.
    pub fn continue_on_error(&self) -> bool {
        match self {
            Job::Export(job) => job.continue_on_error.unwrap_or(true),
            Job::Import(job) => job.continue_on_error.unwrap_or(false),
        }
    }
}

impl JobsFile {
    /// Parse a jobs document; `.toml` files as TOML, anything else as JSON
    pub fn parse(contents: &str, is_toml: bool) -> Result<Self> {
        let parsed = if is_toml {
            toml::from_str::<JobsFile>(contents).map_err(|e| MoverError::config(e.to_string()))
        } else {
            serde_json::from_str::<JobsFile>(contents)
                .map_err(|e| MoverError::config(e.to_string()))
        };
        Ok(parsed?)
    }

    pub fn connection(&self, name: &str) -> Option<&ConnectionDescriptor> {
        self.connections.iter().find(|c| c.name == name)
    }

    pub fn dedup_policy(&self) -> DedupPolicy {
        DedupPolicy::new(self.dedup_keys.clone())
    }

    pub fn foreign_key_schema(&self) -> ForeignKeySchema {
        let declared = self
            .foreign_keys
            .iter()
            .map(|(table, entries)| {
                let keys = entries
                    .iter()
                    .map(|e| ForeignKey::new(&e.column, &e.references))
                    .collect();
                (table.clone(), keys)
            })
            .collect();
        ForeignKeySchema::new(declared, self.infer_foreign_keys)
    }
}

/// Load a jobs file from disk
pub fn load_jobs_file(path: &Path) -> Result<JobsFile> {
    tracing::debug!("Loading jobs file {}", path.display());

    let contents = std::fs::read_to_string(path)
        .map_err(|e| MoverError::config(format!("Cannot read jobs file {}: {}", path.display(), e)))?;

    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);

    JobsFile::parse(&contents, is_toml)
        .with_context(|| format!("Invalid jobs file {}", path.display()))
}
