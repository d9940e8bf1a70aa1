// ABOUTME: Table export: full snapshot of each requested table into a staged file
// ABOUTME: Files land in a date partition taken from the job's start time

use crate::config::ExportJob;
use crate::engine::Engine;
use crate::staging::{paths, write_staged};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::PathBuf;

/// One table written by an export job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableExport {
    pub table: String,
    pub path: PathBuf,
    pub rows: usize,
}

/// Export every table of `job`, in order
///
/// The first failing table aborts the rest of the job.
pub async fn export_tables(
    engine: &mut Engine,
    job: &ExportJob,
    started: DateTime<Utc>,
) -> Result<Vec<TableExport>> {
    let mut exported = Vec::with_capacity(job.tables.len());

    for table in &job.tables {
        let result = export_table(engine, job, table, started)
            .await
            .with_context(|| format!("Failed to export table '{}'", table));

        match result {
            Ok(export) => exported.push(export),
            Err(e) => {
                tracing::error!("✗ Export of '{}' failed: {:#}", table, e);
                return Err(e);
            }
        }
    }

    Ok(exported)
}

async fn export_table(
    engine: &mut Engine,
    job: &ExportJob,
    table: &str,
    started: DateTime<Utc>,
) -> Result<TableExport> {
    tracing::info!("Exporting '{}' from '{}'...", table, job.connection);

    let snapshot = engine.read_table(table).await?;
    let path = paths::export_path(&job.dump_path, table, started, Utc::now())?;
    write_staged(&path, &snapshot, job.dump_format)?;

    tracing::info!(
        "✓ Exported {} row(s) of '{}' to {}",
        snapshot.len(),
        table,
        path.display()
    );

    Ok(TableExport {
        table: table.to_string(),
        path,
        rows: snapshot.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sqlite::SqliteEngine;
    use crate::staging::{read_staged, StagingFormat};
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn job(dir: &std::path::Path, tables: &[&str], format: StagingFormat) -> ExportJob {
        ExportJob {
            connection: "src".to_string(),
            tables: tables.iter().map(|t| t.to_string()).collect(),
            dump_path: format!("{}/dump/{{table}}_{{ts}}.{}", dir.display(), format.extension()),
            dump_format: format,
            continue_on_error: None,
        }
    }

    #[tokio::test]
    async fn test_export_writes_one_file_per_table() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("src.db");
        rusqlite::Connection::open(&db)
            .unwrap()
            .execute_batch(
                "CREATE TABLE location (id INTEGER PRIMARY KEY, name TEXT);
                 INSERT INTO location (name) VALUES ('London'), ('Paris');
                 CREATE TABLE current_weather (id INTEGER PRIMARY KEY, location_id INTEGER);",
            )
            .unwrap();

        let mut engine = Engine::Sqlite(SqliteEngine::open(&db).unwrap());
        let started = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let job = job(dir.path(), &["location", "current_weather"], StagingFormat::Parquet);

        let exported = export_tables(&mut engine, &job, started).await.unwrap();

        assert_eq!(exported.len(), 2);
        assert_eq!(exported[0].rows, 2);
        assert_eq!(exported[1].rows, 0);
        for export in &exported {
            assert!(export.path.starts_with(dir.path().join("dump/20250601")));
        }

        let back = read_staged(&exported[0].path, StagingFormat::Parquet).unwrap();
        assert_eq!(back.columns(), &["id".to_string(), "name".to_string()][..]);
        assert_eq!(back.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_table_aborts_remaining_tables() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("src.db");
        rusqlite::Connection::open(&db)
            .unwrap()
            .execute_batch("CREATE TABLE b (id INTEGER PRIMARY KEY);")
            .unwrap();

        let mut engine = Engine::Sqlite(SqliteEngine::open(&db).unwrap());
        let job = job(dir.path(), &["a", "b"], StagingFormat::Json);

        let err = export_tables(&mut engine, &job, Utc::now()).await.unwrap_err();
        assert!(err.to_string().contains("'a'"));
        assert!(!dir.path().join("dump").exists());
    }
}
