// ABOUTME: End-to-end tests for export/import runs against temporary SQLite databases
// ABOUTME: Covers dedup idempotence, identity remapping, orphan filtering and failure policy

use rusqlite::Connection;
use serde_json::{json, Value as Json};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use table_mover::commands::{self, RunReport};
use table_mover::config::JobsFile;
use table_mover::error::{ErrorKind, MoverError};
use tempfile::{tempdir, TempDir};

fn sqlite(path: &Path, sql: &str) {
    Connection::open(path).unwrap().execute_batch(sql).unwrap();
}

fn connection(name: &str, db: &Path) -> Json {
    json!({"name": name, "type": "sqlite", "database": db.display().to_string()})
}

fn template(dir: &TempDir, format: &str) -> String {
    format!("{}/dump/{{table}}_{{ts}}.{}", dir.path().display(), format)
}

async fn run(doc: Json) -> anyhow::Result<RunReport> {
    let file = JobsFile::parse(&doc.to_string(), false)?;
    commands::run(&file).await
}

/// Names of every staged file under `<dir>/dump/<partition>/`
fn staged_files(dir: &TempDir) -> Vec<String> {
    let dump = dir.path().join("dump");
    if !dump.is_dir() {
        return Vec::new();
    }

    let mut names = Vec::new();
    for partition in std::fs::read_dir(&dump).unwrap() {
        for entry in std::fs::read_dir(partition.unwrap().path()).unwrap() {
            names.push(entry.unwrap().file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    names
}

fn query_pairs(db: &Path, sql: &str) -> Vec<(String, f64)> {
    let conn = Connection::open(db).unwrap();
    let mut stmt = conn.prepare(sql).unwrap();
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    rows
}

fn count(db: &Path, table: &str) -> i64 {
    Connection::open(db)
        .unwrap()
        .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
            row.get(0)
        })
        .unwrap()
}

#[tokio::test]
async fn test_export_then_import_location() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src.db");
    let dst = dir.path().join("dst.db");
    sqlite(
        &src,
        "CREATE TABLE location (id INTEGER PRIMARY KEY, name TEXT, lat REAL, lon REAL);
         INSERT INTO location (id, name, lat, lon) VALUES
             (7, 'London', 51.5, -0.12), (9, 'Paris', 48.85, 2.35), (12, 'Oslo', 59.91, 10.75);",
    );
    sqlite(
        &dst,
        "CREATE TABLE location (id INTEGER PRIMARY KEY, name TEXT, lat REAL, lon REAL);",
    );

    let dump_path = template(&dir, "json");
    let report = run(json!({
        "connections": [connection("src", &src), connection("dst", &dst)],
        "jobs": [
            {"type": "export", "connection": "src", "tables": ["location"],
             "dump_path": dump_path, "dump_format": "json"},
            {"type": "import", "connection": "dst", "tables": ["location"],
             "dump_path": dump_path, "dump_format": "json"}
        ]
    }))
    .await
    .unwrap();

    let files = staged_files(&dir);
    assert_eq!(files.len(), 1);
    assert!(files[0].starts_with("location_") && files[0].ends_with(".json"));

    assert_eq!(report.jobs_succeeded, 2);
    assert_eq!(report.rows_inserted(), 3);

    let sql = "SELECT name, lat FROM location ORDER BY name";
    assert_eq!(query_pairs(&src, sql), query_pairs(&dst, sql));

    // target assigned its own ids
    let ids: Vec<i64> = {
        let conn = Connection::open(&dst).unwrap();
        let mut stmt = conn.prepare("SELECT id FROM location ORDER BY id").unwrap();
        let ids = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        ids
    };
    assert_eq!(ids, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_parquet_round_trip_keeps_values() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src.db");
    let dst = dir.path().join("dst.db");
    let schema = "CREATE TABLE reading (
        id INTEGER PRIMARY KEY, station TEXT, value REAL, flags INTEGER, raw BLOB);";
    sqlite(&src, schema);
    sqlite(&dst, schema);

    {
        let conn = Connection::open(&src).unwrap();
        for i in 0..40i64 {
            let station = if i % 7 == 0 {
                None
            } else {
                Some(format!("st-{}", i % 5))
            };
            conn.execute(
                "INSERT INTO reading (station, value, flags, raw) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![station, i as f64 * 0.25, i % 3, vec![i as u8, 0xff]],
            )
            .unwrap();
        }
    }

    let dump_path = template(&dir, "parquet");
    let report = run(json!({
        "connections": [connection("src", &src), connection("dst", &dst)],
        "jobs": [
            {"type": "export", "connection": "src", "tables": ["reading"],
             "dump_path": dump_path, "dump_format": "parquet"},
            {"type": "import", "connection": "dst", "tables": ["reading"],
             "dump_path": dump_path, "dump_format": "parquet"}
        ]
    }))
    .await
    .unwrap();

    assert_eq!(report.exported[0].rows, 40);
    assert_eq!(count(&dst, "reading"), 40);

    type Row = (Option<String>, f64, i64, Vec<u8>);
    let read = |db: &Path| -> Vec<Row> {
        let conn = Connection::open(db).unwrap();
        let mut stmt = conn
            .prepare("SELECT station, value, flags, raw FROM reading ORDER BY value")
            .unwrap();
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
            .unwrap()
            .collect::<Result<Vec<Row>, _>>()
            .unwrap();
        rows
    };
    assert_eq!(read(&src), read(&dst));
}

#[tokio::test]
async fn test_second_import_inserts_nothing() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src.db");
    let dst = dir.path().join("dst.db");
    let schema = "CREATE TABLE location (id INTEGER PRIMARY KEY, name TEXT, country TEXT);
                  CREATE TABLE reading (id INTEGER PRIMARY KEY, station TEXT, value REAL);";
    sqlite(&src, schema);
    sqlite(&dst, schema);
    sqlite(
        &src,
        "INSERT INTO location (name, country) VALUES ('London', 'GB'), ('Paris', 'FR');
         INSERT INTO reading (station, value) VALUES ('a', 1.5), ('b', 2.5), ('a', 1.5);",
    );

    let dump_path = template(&dir, "json");
    let doc = json!({
        "connections": [connection("src", &src), connection("dst", &dst)],
        "jobs": [
            {"type": "export", "connection": "src", "tables": ["location", "reading"],
             "dump_path": dump_path, "dump_format": "json"},
            {"type": "import", "connection": "dst", "tables": ["location", "reading"],
             "dump_path": dump_path, "dump_format": "json"}
        ],
        "dedup_keys": {"location": ["name", "country"]}
    });

    let first = run(doc.clone()).await.unwrap();
    // the repeated reading collapses within the batch
    assert_eq!(first.rows_inserted(), 4);

    let second = run(doc).await.unwrap();
    assert_eq!(second.rows_inserted(), 0);
    assert_eq!(second.rows_deduplicated(), 5);

    assert_eq!(count(&dst, "location"), 2);
    assert_eq!(count(&dst, "reading"), 2);
}

#[tokio::test]
async fn test_child_rows_point_at_target_parent_ids() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src.db");
    let dst = dir.path().join("dst.db");
    let schema = "CREATE TABLE parent (id INTEGER PRIMARY KEY, name TEXT);
                  CREATE TABLE child (id INTEGER PRIMARY KEY, parent_id INTEGER, value REAL);";
    sqlite(&src, schema);
    sqlite(&dst, schema);
    sqlite(
        &src,
        "INSERT INTO parent (id, name) VALUES (100, 'alpha'), (200, 'beta');
         INSERT INTO child (id, parent_id, value) VALUES (1, 100, 1.5), (2, 200, 2.5), (3, 200, 3.5);",
    );
    sqlite(&dst, "INSERT INTO parent (name) VALUES ('gamma');");

    let dump_path = template(&dir, "json");
    let report = run(json!({
        "connections": [connection("src", &src), connection("dst", &dst)],
        "jobs": [
            {"type": "export", "connection": "src", "tables": ["parent", "child"],
             "dump_path": dump_path, "dump_format": "json"},
            {"type": "import", "connection": "dst", "tables": ["parent", "child"],
             "dump_path": dump_path, "dump_format": "json"}
        ],
        "foreign_keys": {"child": [{"column": "parent_id", "references": "parent"}]}
    }))
    .await
    .unwrap();

    assert_eq!(report.orphans_dropped(), 0);
    assert_eq!(
        query_pairs(
            &dst,
            "SELECT p.name, c.value FROM child c JOIN parent p ON p.id = c.parent_id ORDER BY c.value"
        ),
        vec![
            ("alpha".to_string(), 1.5),
            ("beta".to_string(), 2.5),
            ("beta".to_string(), 3.5)
        ]
    );

    let stale: i64 = Connection::open(&dst)
        .unwrap()
        .query_row(
            "SELECT COUNT(*) FROM child WHERE parent_id IN (100, 200)",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(stale, 0);
}

#[tokio::test]
async fn test_orphans_are_dropped_and_counted() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src.db");
    let dst = dir.path().join("dst.db");
    let schema = "CREATE TABLE parent (id INTEGER PRIMARY KEY, name TEXT);
                  CREATE TABLE child (id INTEGER PRIMARY KEY, parent_id INTEGER, value REAL);";
    sqlite(&src, schema);
    sqlite(&dst, schema);
    sqlite(
        &src,
        "INSERT INTO child (id, parent_id, value) VALUES (1, 1, 1.0), (2, 2, 2.0), (3, NULL, 3.0);",
    );
    sqlite(&dst, "INSERT INTO parent (name) VALUES ('only');");

    let dump_path = template(&dir, "json");
    let report = run(json!({
        "connections": [connection("src", &src), connection("dst", &dst)],
        "jobs": [
            {"type": "export", "connection": "src", "tables": ["child"],
             "dump_path": dump_path, "dump_format": "json"},
            {"type": "import", "connection": "dst", "tables": ["child"],
             "dump_path": dump_path, "dump_format": "json"}
        ],
        "foreign_keys": {"child": [{"column": "parent_id", "references": "parent"}]}
    }))
    .await
    .unwrap();

    assert_eq!(report.orphans_dropped(), 1);
    assert_eq!(report.imported[0].orphans_dropped, 1);
    assert_eq!(report.rows_inserted(), 2);
    assert_eq!(count(&dst, "child"), 2);
}

#[tokio::test]
async fn test_fallback_picks_newest_and_missing_tables_are_skipped() {
    let dir = tempdir().unwrap();
    let dst = dir.path().join("dst.db");
    sqlite(&dst, "CREATE TABLE location (id INTEGER PRIMARY KEY, name TEXT);");

    let partition = dir.path().join("dump/20250102");
    std::fs::create_dir_all(&partition).unwrap();
    let older = partition.join("location_20250102T080000000.json");
    let newer = partition.join("location_20250102T170000000.json");
    std::fs::write(&older, r#"[{"id": 1, "name": "stale"}]"#).unwrap();
    std::fs::write(&newer, r#"[{"id": 1, "name": "fresh"}]"#).unwrap();

    let base = SystemTime::now() - Duration::from_secs(3600);
    set_mtime(&older, base);
    set_mtime(&newer, base + Duration::from_secs(60));

    let report = run(json!({
        "connections": [connection("dst", &dst)],
        "jobs": [
            {"type": "import", "connection": "dst", "tables": ["location", "forecast"],
             "dump_path": template(&dir, "json"), "dump_format": "json",
             "as_of": "20250102"}
        ]
    }))
    .await
    .unwrap();

    assert_eq!(report.jobs_succeeded, 1);
    assert_eq!(report.skipped, vec!["forecast".to_string()]);
    assert_eq!(report.imported.len(), 1);
    assert_eq!(report.imported[0].source, newer);

    let name: String = Connection::open(&dst)
        .unwrap()
        .query_row("SELECT name FROM location", [], |row| row.get(0))
        .unwrap();
    assert_eq!(name, "fresh");
}

fn set_mtime(path: &PathBuf, time: SystemTime) {
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(time)
        .unwrap();
}

#[tokio::test]
async fn test_failed_export_continues_and_failed_import_stops() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src.db");
    let dst = dir.path().join("dst.db");
    sqlite(
        &src,
        "CREATE TABLE a (id INTEGER PRIMARY KEY, v TEXT);
         CREATE TABLE c (id INTEGER PRIMARY KEY, v TEXT);
         INSERT INTO a (v) VALUES ('x');
         INSERT INTO c (v) VALUES ('y');",
    );
    // no table `a` on the target, so importing it fails
    sqlite(&dst, "CREATE TABLE c (id INTEGER PRIMARY KEY, v TEXT);");

    let dump_path = template(&dir, "json");
    let err = run(json!({
        "connections": [connection("src", &src), connection("dst", &dst)],
        "jobs": [
            {"type": "export", "connection": "src", "tables": ["a"],
             "dump_path": dump_path, "dump_format": "json"},
            {"type": "export", "connection": "src", "tables": ["b"],
             "dump_path": dump_path, "dump_format": "json"},
            {"type": "export", "connection": "src", "tables": ["c"],
             "dump_path": dump_path, "dump_format": "json"},
            {"type": "import", "connection": "dst", "tables": ["a"],
             "dump_path": dump_path, "dump_format": "json"},
            {"type": "import", "connection": "dst", "tables": ["c"],
             "dump_path": dump_path, "dump_format": "json"}
        ]
    }))
    .await
    .unwrap_err();

    assert!(err.to_string().contains("Job 4"), "unexpected error: {:#}", err);
    assert_ne!(MoverError::classify(&err), ErrorKind::Config);

    let files = staged_files(&dir);
    assert_eq!(files.len(), 2);
    assert!(files[0].starts_with("a_"));
    assert!(files[1].starts_with("c_"));

    // job 5 never ran
    assert_eq!(count(&dst, "c"), 0);
}

#[tokio::test]
async fn test_connection_failure_is_isolated_to_its_export() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src.db");
    sqlite(&src, "CREATE TABLE a (id INTEGER PRIMARY KEY);");

    let dump_path = template(&dir, "json");
    let report = run(json!({
        "connections": [
            connection("src", &src),
            connection("gone", &dir.path().join("no/such/dir/x.db"))
        ],
        "jobs": [
            {"type": "export", "connection": "gone", "tables": ["a"],
             "dump_path": dump_path, "dump_format": "json"},
            {"type": "export", "connection": "src", "tables": ["a"],
             "dump_path": dump_path, "dump_format": "json"}
        ]
    }))
    .await
    .unwrap();

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].connection, "gone");
    assert_eq!(report.jobs_succeeded, 1);
    assert_eq!(staged_files(&dir).len(), 1);
}

#[tokio::test]
async fn test_validate_only_touches_nothing() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src.db");
    let jobs = dir.path().join("jobs.json");
    std::fs::write(
        &jobs,
        json!({
            "connections": [connection("src", &src)],
            "jobs": [{"type": "export", "connection": "src", "tables": ["a"],
                      "dump_path": template(&dir, "json"), "dump_format": "json"}]
        })
        .to_string(),
    )
    .unwrap();

    commands::validate(&jobs).unwrap();
    assert!(!src.exists());
    assert!(staged_files(&dir).is_empty());
}

#[tokio::test]
async fn test_job_level_dedup_key() {
    let dir = tempdir().unwrap();
    let dst = dir.path().join("dst.db");
    sqlite(
        &dst,
        "CREATE TABLE location (id INTEGER PRIMARY KEY, name TEXT, region TEXT);
         INSERT INTO location (name, region) VALUES ('London', 'City of London');",
    );

    let partition = dir.path().join("dump/20250301");
    std::fs::create_dir_all(&partition).unwrap();
    std::fs::write(
        partition.join("location_20250301.json"),
        r#"[{"id": 4, "name": "London", "region": "Greater London"},
            {"id": 5, "name": "Leeds", "region": "West Yorkshire"}]"#,
    )
    .unwrap();

    let report = run(json!({
        "connections": [connection("dst", &dst)],
        "jobs": [
            {"type": "import", "target_connection": "dst", "tables": ["location"],
             "input_path": template(&dir, "json"), "as_of": "20250301",
             "deduplicate_on": ["name"]}
        ]
    }))
    .await
    .unwrap();

    assert_eq!(report.rows_inserted(), 1);
    assert_eq!(report.imported[0].already_present, 1);
    assert_eq!(count(&dst, "location"), 2);
}

#[tokio::test]
async fn test_sibling_table_snapshot_is_not_imported() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src.db");
    let dst = dir.path().join("dst.db");
    let schema = "CREATE TABLE location (id INTEGER PRIMARY KEY, name TEXT);
                  CREATE TABLE location_history (id INTEGER PRIMARY KEY, name TEXT, seen TEXT);";
    sqlite(&src, schema);
    sqlite(&dst, schema);
    sqlite(
        &src,
        "INSERT INTO location_history (name, seen) VALUES ('London', '2025-01-01');",
    );

    let dump_path = template(&dir, "json");
    let report = run(json!({
        "connections": [connection("src", &src), connection("dst", &dst)],
        "jobs": [
            {"type": "export", "connection": "src", "tables": ["location_history"],
             "dump_path": dump_path, "dump_format": "json"},
            {"type": "import", "connection": "dst", "tables": ["location", "location_history"],
             "dump_path": dump_path, "dump_format": "json"}
        ]
    }))
    .await
    .unwrap();

    assert_eq!(report.skipped, vec!["location".to_string()]);
    assert_eq!(count(&dst, "location"), 0);
    assert_eq!(count(&dst, "location_history"), 1);
}

#[tokio::test]
async fn test_export_from_missing_database_leaves_no_file() {
    let dir = tempdir().unwrap();
    let typo = dir.path().join("sorce.db");

    let report = run(json!({
        "connections": [connection("src", &typo)],
        "jobs": [
            {"type": "export", "connection": "src", "tables": ["a"],
             "dump_path": template(&dir, "json"), "dump_format": "json"}
        ]
    }))
    .await
    .unwrap();

    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].error.contains("Connection error for 'src'"));
    assert!(!typo.exists());
    assert!(staged_files(&dir).is_empty());
}
