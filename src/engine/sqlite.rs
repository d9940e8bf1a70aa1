// ABOUTME: SQLite backend over rusqlite
// ABOUTME: Reads tables into buffers and inserts rows inside one transaction per table

use crate::error::MoverError;
use crate::table::{TabularBuffer, Value};
use crate::utils::{quote_column, quote_ident};
use anyhow::{Context, Result};
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode, OpenFlags, ToSql};
use std::path::{Path, PathBuf};

const QUOTE: char = '"';

pub struct SqliteEngine {
    conn: Connection,
    path: PathBuf,
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Bool(b) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(i64::from(*b))),
            Value::Int(i) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*i)),
            Value::Float(f) => ToSqlOutput::Owned(rusqlite::types::Value::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Bytes(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b.as_slice())),
        })
    }
}

fn from_sqlite(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

impl SqliteEngine {
    /// Open (or create) the database file
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Open a database file that must already exist
    pub fn open_existing(path: &Path) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)
            .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_table(&self, table: &str) -> Result<TabularBuffer> {
        self.read_query(&format!("SELECT * FROM {}", quote_ident(table, QUOTE)))
            .with_context(|| format!("Failed to read table '{}'", table))
    }

    pub fn read_column(&self, table: &str, column: &str) -> Result<Vec<Value>> {
        let sql = format!(
            "SELECT {} FROM {}",
            quote_column(column, QUOTE),
            quote_ident(table, QUOTE)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let values = stmt
            .query_map([], |row| row.get_ref(0).map(from_sqlite))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(values)
    }

    pub fn table_exists(&self, table: &str) -> Result<bool> {
        let name = table.rsplit('.').next().unwrap_or(table);
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
            [name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn read_query(&self, sql: &str) -> Result<TabularBuffer> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let width = columns.len();

        let mut buffer = TabularBuffer::new(columns);
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let values = (0..width)
                .map(|i| row.get_ref(i).map(from_sqlite))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            buffer.push_row(values)?;
        }

        Ok(buffer)
    }

    /// Insert every row in a single transaction; nothing is kept on failure
    pub fn insert_rows(&mut self, table: &str, rows: &TabularBuffer) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let sql = insert_sql(table, rows.columns());
        let tx = self.conn.transaction()?;
        let mut inserted = 0u64;
        {
            let mut stmt = tx
                .prepare(&sql)
                .with_context(|| format!("Failed to prepare insert into '{}'", table))?;
            for (idx, row) in rows.rows().iter().enumerate() {
                stmt.execute(params_from_iter(row.iter()))
                    .map_err(|e| insert_error(table, idx, e))?;
                inserted += 1;
            }
        }
        tx.commit()
            .with_context(|| format!("Failed to commit insert into '{}'", table))?;

        Ok(inserted)
    }

    pub fn close(self) -> Result<()> {
        self.conn
            .close()
            .map_err(|(_, e)| e)
            .with_context(|| format!("Failed to close {}", self.path.display()))
    }
}

fn insert_sql(table: &str, columns: &[String]) -> String {
    if columns.is_empty() {
        return format!("INSERT INTO {} DEFAULT VALUES", quote_ident(table, QUOTE));
    }

    let names: Vec<String> = columns.iter().map(|c| quote_column(c, QUOTE)).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table, QUOTE),
        names.join(", "),
        placeholders.join(", ")
    )
}

fn insert_error(table: &str, row: usize, err: rusqlite::Error) -> anyhow::Error {
    let constraint = matches!(
        &err,
        rusqlite::Error::SqliteFailure(failure, _) if failure.code == ErrorCode::ConstraintViolation
    );

    if constraint {
        MoverError::integrity(table, format!("row {}: {}", row, err)).into()
    } else {
        anyhow::Error::from(err).context(format!("Failed to insert row {} into '{}'", row, table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::tempdir;

    fn engine_with_location() -> (tempfile::TempDir, SqliteEngine) {
        let dir = tempdir().unwrap();
        let engine = SqliteEngine::open(&dir.path().join("t.db")).unwrap();
        engine
            .conn
            .execute_batch(
                "CREATE TABLE location (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     name TEXT NOT NULL UNIQUE,
                     lat REAL,
                     photo BLOB
                 );",
            )
            .unwrap();
        (dir, engine)
    }

    #[test]
    fn test_insert_assigns_ids_and_reads_back() {
        let (_dir, mut engine) = engine_with_location();
        let rows = TabularBuffer::from_rows(
            vec!["name".into(), "lat".into(), "photo".into()],
            vec![
                vec!["London".into(), Value::Float(51.5), Value::Bytes(vec![1, 2])],
                vec!["Paris".into(), Value::Null, Value::Null],
            ],
        )
        .unwrap();

        assert_eq!(engine.insert_rows("location", &rows).unwrap(), 2);

        let back = engine.read_table("location").unwrap();
        assert_eq!(back.columns()[0], "id");
        assert_eq!(back.len(), 2);
        assert_eq!(back.rows()[0][0], Value::Int(1));
        assert_eq!(back.rows()[0][3], Value::Bytes(vec![1, 2]));
        assert_eq!(
            engine.read_column("location", "id").unwrap(),
            vec![Value::Int(1), Value::Int(2)]
        );
    }

    #[test]
    fn test_empty_table_still_has_columns() {
        let (_dir, engine) = engine_with_location();
        let back = engine.read_table("location").unwrap();
        assert!(back.is_empty());
        assert_eq!(back.columns().len(), 4);
    }

    #[test]
    fn test_constraint_violation_rolls_back_whole_table() {
        let (_dir, mut engine) = engine_with_location();
        let rows = TabularBuffer::from_rows(
            vec!["name".into()],
            vec![vec!["Rome".into()], vec!["Rome".into()]],
        )
        .unwrap();

        let err = engine.insert_rows("location", &rows).unwrap_err();
        assert_eq!(MoverError::classify(&err), ErrorKind::Integrity);
        assert!(engine.read_table("location").unwrap().is_empty());
    }

    #[test]
    fn test_table_exists() {
        let (_dir, engine) = engine_with_location();
        assert!(engine.table_exists("location").unwrap());
        assert!(engine.table_exists("main.location").unwrap());
        assert!(!engine.table_exists("weather").unwrap());
    }

    #[test]
    fn test_missing_table_is_an_error() {
        let (_dir, engine) = engine_with_location();
        let err = engine.read_table("weather").unwrap_err();
        assert!(err.to_string().contains("weather"));
    }
}
