// ABOUTME: Pre-flight checks for a jobs file before any database is touched
// ABOUTME: Verifies connections, job fields, path templates and import dependency order

use super::{Job, JobsFile};
use crate::error::MoverError;
use crate::migration::identity::ForeignKeySchema;
use crate::staging::paths;
use crate::utils::{sanitize_identifier, validate_table_name};
use anyhow::Result;
use std::collections::HashSet;

/// Validate the whole document; every failure is a `ConfigError`
pub fn validate_jobs_file(file: &JobsFile) -> Result<()> {
    validate_connections(file)?;

    if file.identity_column.trim().is_empty() {
        return Err(MoverError::config("identity_column cannot be empty").into());
    }

    for (idx, job) in file.jobs.iter().enumerate() {
        validate_job(file, idx + 1, job)?;
    }

    for (table, keys) in &file.dedup_keys {
        check_table_name(table, "dedup_keys")?;
        if keys.is_empty() {
            return Err(MoverError::config(format!(
                "dedup_keys for table '{}' is empty; remove the entry to dedup on whole rows",
                sanitize_identifier(table)
            ))
            .into());
        }
    }

    for (table, entries) in &file.foreign_keys {
        check_table_name(table, "foreign_keys")?;
        for entry in entries {
            check_table_name(&entry.references, "foreign_keys")?;
            if entry.column.trim().is_empty() {
                return Err(MoverError::config(format!(
                    "foreign_keys entry for table '{}' has an empty column",
                    sanitize_identifier(table)
                ))
                .into());
            }
        }
    }

    validate_dependency_order(&file.jobs, &file.foreign_key_schema())
}

fn validate_connections(file: &JobsFile) -> Result<()> {
    if file.connections.is_empty() {
        return Err(MoverError::config("No connections configured").into());
    }

    let mut seen = HashSet::new();
    for conn in &file.connections {
        if conn.name.trim().is_empty() {
            return Err(MoverError::config("Connection name cannot be empty").into());
        }
        if !seen.insert(conn.name.as_str()) {
            return Err(MoverError::config(format!(
                "Duplicate connection name '{}'",
                sanitize_identifier(&conn.name)
            ))
            .into());
        }
        if conn.database.trim().is_empty() {
            return Err(MoverError::config(format!(
                "Connection '{}' has no database",
                sanitize_identifier(&conn.name)
            ))
            .into());
        }
    }

    Ok(())
}

fn validate_job(file: &JobsFile, index: usize, job: &Job) -> Result<()> {
    if file.connection(job.connection()).is_none() {
        return Err(MoverError::config(format!(
            "Job {} ({}) references unknown connection '{}'",
            index,
            job.kind(),
            sanitize_identifier(job.connection())
        ))
        .into());
    }

    if job.tables().is_empty() {
        return Err(MoverError::config(format!(
            "Job {} ({}) lists no tables",
            index,
            job.kind()
        ))
        .into());
    }

    for table in job.tables() {
        check_table_name(table, &format!("job {}", index))?;
    }

    paths::validate_template(job.dump_path())
        .map_err(|e| MoverError::config(format!("Job {}: {}", index, e)))?;

    if let Job::Import(import) = job {
        if let Some(as_of) = &import.as_of {
            paths::date_partition_for(as_of)
                .map_err(|e| MoverError::config(format!("Job {}: {}", index, e)))?;
        }
        if let Some(columns) = &import.deduplicate_on {
            if columns.is_empty() || columns.iter().any(|c| c.trim().is_empty()) {
                return Err(MoverError::config(format!(
                    "Job {}: deduplicate_on must list at least one non-empty column",
                    index
                ))
                .into());
            }
        }
    }

    Ok(())
}

fn check_table_name(table: &str, location: &str) -> Result<()> {
    validate_table_name(table)
        .map_err(|e| MoverError::config(format!("{} in {}", e, location)).into())
}

/// Check that no table is imported before a parent it declares a foreign key to
///
/// Imports are flattened into run order (job order, then table order within a
/// job). A child at position `n` is rejected when its parent is imported after
/// `n` and never before it. Parents that are never imported are fine: the
/// importer validates those against the target's live identifiers.
pub fn validate_dependency_order(jobs: &[Job], schema: &ForeignKeySchema) -> Result<()> {
    let imports: Vec<(usize, &str)> = jobs
        .iter()
        .enumerate()
        .filter_map(|(idx, job)| match job {
            Job::Import(import) => Some((idx, import)),
            Job::Export(_) => None,
        })
        .flat_map(|(idx, import)| import.tables.iter().map(move |t| (idx, t.as_str())))
        .collect();

    for (position, (job_idx, table)) in imports.iter().enumerate() {
        let Some(keys) = schema.declared(table) else {
            continue;
        };

        for key in keys {
            if key.references == *table {
                continue;
            }

            if imports[..position]
                .iter()
                .any(|(_, t)| *t == key.references)
            {
                continue;
            }

            let parent_later = imports[position + 1..]
                .iter()
                .find(|(_, t)| *t == key.references);

            if let Some((parent_job, _)) = parent_later {
                return Err(MoverError::config(format!(
                    "Table '{}' (job {}) is imported before its parent '{}' (job {}); \
                     reorder the jobs so '{}' is imported first",
                    table,
                    job_idx + 1,
                    key.references,
                    parent_job + 1,
                    key.references
                ))
                .into());
            }
        }
    }

    Ok(())
}
