// ABOUTME: Relational engine handle shared by exporters and importers
// ABOUTME: One enum over the SQLite, PostgreSQL and MySQL backends

pub mod mysql;
pub mod postgres;
pub mod resolver;
pub mod sqlite;

use crate::config::DatabaseKind;
use crate::table::{TabularBuffer, Value};
use anyhow::Result;

pub use resolver::{connection_uri, read_password, resolve};

/// An opened connection, owned by the job that resolved it
pub enum Engine {
    Sqlite(sqlite::SqliteEngine),
    Postgres(postgres::PostgresEngine),
    Mysql(mysql::MysqlEngine),
}

impl Engine {
    pub fn kind(&self) -> DatabaseKind {
        match self {
            Engine::Sqlite(_) => DatabaseKind::Sqlite,
            Engine::Postgres(_) => DatabaseKind::Postgres,
            Engine::Mysql(_) => DatabaseKind::Mysql,
        }
    }

    /// Full snapshot of a table, columns in table order
    pub async fn read_table(&mut self, table: &str) -> Result<TabularBuffer> {
        match self {
            Engine::Sqlite(engine) => engine.read_table(table),
            Engine::Postgres(engine) => engine.read_table(table).await,
            Engine::Mysql(engine) => engine.read_table(table).await,
        }
    }

    /// Every value of one column
    pub async fn read_column(&mut self, table: &str, column: &str) -> Result<Vec<Value>> {
        match self {
            Engine::Sqlite(engine) => engine.read_column(table, column),
            Engine::Postgres(engine) => engine.read_column(table, column).await,
            Engine::Mysql(engine) => engine.read_column(table, column).await,
        }
    }

    pub async fn table_exists(&mut self, table: &str) -> Result<bool> {
        match self {
            Engine::Sqlite(engine) => engine.table_exists(table),
            Engine::Postgres(engine) => engine.table_exists(table).await,
            Engine::Mysql(engine) => engine.table_exists(table).await,
        }
    }

    /// Insert all rows as one unit of work; returns the number inserted
    pub async fn insert_rows(&mut self, table: &str, rows: &TabularBuffer) -> Result<u64> {
        match self {
            Engine::Sqlite(engine) => engine.insert_rows(table, rows),
            Engine::Postgres(engine) => engine.insert_rows(table, rows).await,
            Engine::Mysql(engine) => engine.insert_rows(table, rows).await,
        }
    }

    pub async fn close(self) -> Result<()> {
        match self {
            Engine::Sqlite(engine) => engine.close(),
            // the driver task ends once the client is dropped
            Engine::Postgres(engine) => {
                drop(engine);
                Ok(())
            }
            Engine::Mysql(engine) => engine.close().await,
        }
    }
}
