// ABOUTME: Turns a connection descriptor and its optional password file into an open engine
// ABOUTME: Builds per-kind connection URIs and logs them with the password redacted

use super::mysql::{MysqlEngine, MysqlParams};
use super::postgres::{self, PostgresEngine};
use super::sqlite::SqliteEngine;
use super::Engine;
use crate::config::{ConnectionDescriptor, DatabaseKind, JobKind};
use crate::error::MoverError;
use anyhow::Result;
use std::path::Path;

/// Read the password for a connection
///
/// The file content is trimmed; no file, or an empty one, means no password.
pub fn read_password(descriptor: &ConnectionDescriptor) -> Result<Option<String>> {
    let Some(path) = &descriptor.password_file else {
        return Ok(None);
    };

    let contents = std::fs::read_to_string(path).map_err(|e| {
        MoverError::config(format!(
            "Connection '{}': cannot read password_file {}: {}",
            descriptor.name,
            path.display(),
            e
        ))
    })?;

    let password = contents.trim();
    Ok((!password.is_empty()).then(|| password.to_string()))
}

/// The connection string for a descriptor
///
/// - sqlite: `sqlite://<database>`
/// - postgres: `postgresql://<user>[:<password>]@<host>:<port>/<database>`
/// - mysql: `mysql://<user>[:<password>]@<host>:<port>/<database>`
pub fn connection_uri(descriptor: &ConnectionDescriptor, password: Option<&str>) -> String {
    let scheme = match descriptor.kind {
        DatabaseKind::Sqlite => return format!("sqlite://{}", descriptor.database),
        DatabaseKind::Postgres => "postgresql",
        DatabaseKind::Mysql => "mysql",
    };

    let credentials = match password {
        Some(password) => format!("{}:{}", descriptor.username(), password),
        None => descriptor.username().to_string(),
    };

    format!(
        "{}://{}@{}:{}/{}",
        scheme,
        credentials,
        descriptor.host(),
        descriptor.port(),
        descriptor.database
    )
}

/// Open the engine a descriptor points at
///
/// A bad password file is a `ConfigError`; anything that goes wrong while
/// opening is a `ConnectionError` for this connection. A SQLite file is only
/// created for imports; an export reads from a database that must exist.
pub async fn resolve(descriptor: &ConnectionDescriptor, purpose: JobKind) -> Result<Engine> {
    let password = read_password(descriptor)?;
    let shown = connection_uri(descriptor, password.as_ref().map(|_| "***"));

    tracing::info!("Opening connection '{}' ({})", descriptor.name, shown);

    let opened = match descriptor.kind {
        DatabaseKind::Sqlite => {
            let path = Path::new(&descriptor.database);
            match purpose {
                JobKind::Export => SqliteEngine::open_existing(path),
                JobKind::Import => SqliteEngine::open(path),
            }
            .map(Engine::Sqlite)
        }
        DatabaseKind::Postgres => {
            let mut config = tokio_postgres::Config::new();
            config
                .host(descriptor.host())
                .port(descriptor.port())
                .user(descriptor.username())
                .dbname(&descriptor.database);
            if let Some(password) = &password {
                config.password(password);
            }

            postgres::connect_with_retry(&config)
                .await
                .map(|client| Engine::Postgres(PostgresEngine::new(client)))
        }
        DatabaseKind::Mysql => {
            let params = MysqlParams {
                host: descriptor.host(),
                port: descriptor.port(),
                username: descriptor.username(),
                password: password.as_deref(),
                database: &descriptor.database,
            };
            MysqlEngine::connect(&params).await.map(Engine::Mysql)
        }
    };

    let engine =
        opened.map_err(|e| MoverError::connection(&descriptor.name, format!("{:#}", e)))?;

    tracing::info!("✓ Connected to '{}'", descriptor.name);
    Ok(engine)
}
