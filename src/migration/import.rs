// ABOUTME: Table import: staged file -> identity strip -> FK remap -> dedup -> insert
// ABOUTME: Records each imported table's source-to-target id map for later tables in the run

use super::dedup::DedupPolicy;
use super::identity::{
    build_identity_map, check_foreign_key, ForeignKeySchema, IdentityMap, KeyOrigin, ParentIds,
};
use crate::config::ImportJob;
use crate::engine::Engine;
use crate::error::MoverError;
use crate::staging::{paths, read_staged, StagingFormat};
use crate::table::{TabularBuffer, Value};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Run-wide state the importer reads and extends
pub struct ImportContext<'a> {
    pub policy: &'a DedupPolicy,
    pub schema: &'a ForeignKeySchema,
    pub identity_column: &'a str,
    pub identities: &'a mut IdentityMap,
}

/// What importing one table did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableImport {
    pub table: String,
    pub source: PathBuf,
    pub staged: usize,
    pub inserted: u64,
    pub already_present: usize,
    pub repeated: usize,
    pub orphans_dropped: usize,
    /// Foreign-key values left as-is because the parent's map had no entry
    pub unmapped: usize,
    /// Entries recorded in the identity map; `None` when no map was recorded
    pub mapped_ids: Option<usize>,
}

/// Outcome of one import job
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportResult {
    pub imported: Vec<TableImport>,
    /// Tables with no staged file to import
    pub skipped: Vec<String>,
}

/// Staged rows with their source ids carried alongside
struct StagedRows {
    rows: TabularBuffer,
    source_ids: Option<Vec<Value>>,
}

impl StagedRows {
    fn retain(self, keep: &[bool]) -> Self {
        let source_ids = self.source_ids.map(|ids| {
            ids.into_iter()
                .zip(keep)
                .filter_map(|(id, keep)| keep.then_some(id))
                .collect()
        });
        Self {
            rows: self.rows.retain_mask(keep),
            source_ids,
        }
    }
}

/// Import every table of `job`, in order
///
/// A table with no staged file is skipped with a warning. Any other failure
/// aborts the rest of the job.
pub async fn import_tables(
    engine: &mut Engine,
    job: &ImportJob,
    ctx: &mut ImportContext<'_>,
    today: NaiveDate,
) -> Result<ImportResult> {
    let mut result = ImportResult::default();

    let job_policy = job
        .deduplicate_on
        .as_ref()
        .map(|columns| ctx.policy.with_key_for(&job.tables, columns));
    let mut ctx = ImportContext {
        policy: job_policy.as_ref().unwrap_or(ctx.policy),
        schema: ctx.schema,
        identity_column: ctx.identity_column,
        identities: &mut *ctx.identities,
    };

    for table in &job.tables {
        let location = paths::import_location(&job.dump_path, table, job.as_of.as_deref(), today)
            .map_err(|e| MoverError::config(format!("{:#}", e)))?;

        let source = location
            .resolve()
            .map_err(|e| MoverError::staging_io(&location.date_dir, format!("{:#}", e)))?;

        let Some(source) = source else {
            tracing::warn!(
                "⚠ No staged file for '{}' (looked for {} and matching files under {}), skipping",
                table,
                location.exact.display(),
                location.search_dir().display()
            );
            result.skipped.push(table.clone());
            continue;
        };

        let imported = import_table(engine, table, &source, job.dump_format, &mut ctx)
            .await
            .with_context(|| {
                format!("Failed to import table '{}' from {}", table, source.display())
            });

        match imported {
            Ok(imported) => result.imported.push(imported),
            Err(e) => {
                tracing::error!("✗ Import of '{}' failed: {:#}", table, e);
                return Err(e);
            }
        }
    }

    Ok(result)
}

/// Load one staged file into `table`
pub async fn import_table(
    engine: &mut Engine,
    table: &str,
    source: &Path,
    format: StagingFormat,
    ctx: &mut ImportContext<'_>,
) -> Result<TableImport> {
    tracing::info!("Importing '{}' from {}...", table, source.display());

    let staged = read_staged(source, format)?;
    let mut report = TableImport {
        table: table.to_string(),
        source: source.to_path_buf(),
        staged: staged.len(),
        ..TableImport::default()
    };

    if staged.is_empty() {
        tracing::info!("✓ '{}' has no staged rows, nothing to do", table);
        return Ok(report);
    }

    // the target assigns its own identifiers
    let (rows, source_ids) = staged.split_off_column(ctx.identity_column);
    let mut staged = StagedRows { rows, source_ids };

    for (key, origin) in ctx
        .schema
        .keys_for(table, staged.rows.columns(), ctx.identity_column)
    {
        let parents = match ctx.identities.get(&key.references) {
            Some(mapping) => ParentIds::Mapped(mapping),
            None => {
                if origin == KeyOrigin::Inferred && !engine.table_exists(&key.references).await? {
                    tracing::debug!(
                        "'{}.{}' looks like a reference to '{}', which does not exist; leaving it alone",
                        table,
                        key.column,
                        key.references
                    );
                    continue;
                }
                let live: HashSet<Value> = engine
                    .read_column(&key.references, ctx.identity_column)
                    .await
                    .with_context(|| {
                        format!("Failed to read live ids of parent '{}'", key.references)
                    })?
                    .into_iter()
                    .collect();
                ParentIds::Live(live)
            }
        };

        let (rows, check) = check_foreign_key(staged.rows, &key, &parents);
        staged.rows = rows;

        if check.rewritten > 0 || check.unmapped > 0 {
            tracing::info!(
                "  Remapped {} '{}' value(s) through '{}' ({} without a mapping left unchanged)",
                check.rewritten,
                key.column,
                key.references,
                check.unmapped
            );
        }
        if check.orphans > 0 {
            tracing::warn!(
                "⚠ Dropping {} row(s) of '{}' whose '{}' has no match in '{}'",
                check.orphans,
                table,
                key.column,
                key.references
            );
            staged = staged.retain(&check.keep);
        }

        report.unmapped += check.unmapped;
        report.orphans_dropped += check.orphans;
    }

    if staged.rows.is_empty() {
        tracing::info!("✓ No rows of '{}' left to insert", table);
        return Ok(report);
    }

    let existing = engine.read_table(table).await?;
    let fresh = ctx.policy.dedupe(table, staged.rows.clone(), &existing)?;
    report.already_present = fresh.already_present;
    report.repeated = fresh.repeated;
    report.inserted = engine.insert_rows(table, &fresh.rows).await?;

    if let Some(source_ids) = &staged.source_ids {
        let target = engine
            .read_table(table)
            .await
            .context("Failed to re-read target for identity mapping")?;
        let key = ctx.policy.natural_key(table, &staged.rows);
        let mapping = build_identity_map(
            &staged.rows,
            source_ids,
            &target,
            &key,
            ctx.identity_column,
        )
        .with_context(|| format!("Failed to build identity map for '{}'", table))?;

        report.mapped_ids = Some(mapping.len());
        ctx.identities.record(table, mapping);
    }

    tracing::info!(
        "✓ Imported '{}': {} inserted, {} already present, {} orphan(s) dropped",
        table,
        report.inserted,
        report.already_present + report.repeated,
        report.orphans_dropped
    );

    Ok(report)
}
