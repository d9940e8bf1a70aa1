// ABOUTME: Job runner: executes the jobs of a jobs file in order against their connections
// ABOUTME: Owns the run-wide identity map and decides whether a failed job stops the run

use crate::config::{self, Job, JobKind, JobsFile};
use crate::engine::{self, Engine};
use crate::error::{ErrorKind, MoverError};
use crate::migration::{
    export_tables, import_tables, IdentityMap, ImportContext, TableExport, TableImport,
};
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::Path;

/// A job that failed without stopping the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    /// 1-based position in the jobs file
    pub index: usize,
    pub kind: JobKind,
    pub connection: String,
    pub error: String,
}

/// What a completed run did
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub jobs_succeeded: usize,
    pub failures: Vec<JobFailure>,
    pub exported: Vec<TableExport>,
    pub imported: Vec<TableImport>,
    /// Import tables with no staged file
    pub skipped: Vec<String>,
}

impl RunReport {
    pub fn rows_inserted(&self) -> u64 {
        self.imported.iter().map(|t| t.inserted).sum()
    }

    pub fn rows_deduplicated(&self) -> usize {
        self.imported
            .iter()
            .map(|t| t.already_present + t.repeated)
            .sum()
    }

    pub fn orphans_dropped(&self) -> usize {
        self.imported.iter().map(|t| t.orphans_dropped).sum()
    }

    fn log_summary(&self) {
        tracing::info!("");
        tracing::info!("========================================");
        tracing::info!("Run summary");
        tracing::info!("========================================");
        tracing::info!("  Jobs succeeded:    {}", self.jobs_succeeded);
        tracing::info!("  Jobs failed:       {}", self.failures.len());
        tracing::info!("  Tables exported:   {}", self.exported.len());
        tracing::info!("  Tables imported:   {}", self.imported.len());
        tracing::info!("  Tables skipped:    {}", self.skipped.len());
        tracing::info!("  Rows inserted:     {}", self.rows_inserted());
        tracing::info!("  Rows deduplicated: {}", self.rows_deduplicated());
        tracing::info!("  Orphans dropped:   {}", self.orphans_dropped());

        for failure in &self.failures {
            tracing::warn!(
                "⚠ Job {} ({} on '{}') failed: {}",
                failure.index,
                failure.kind,
                failure.connection,
                failure.error
            );
        }
    }
}

/// Load, validate and run a jobs file
pub async fn run_jobs_file(path: &Path) -> Result<RunReport> {
    let file = config::load_jobs_file(path)?;
    run(&file).await
}

/// Run every job of `file` in order
///
/// A failing job stops the run unless it has `continue_on_error` set;
/// configuration errors stop it regardless.
pub async fn run(file: &JobsFile) -> Result<RunReport> {
    config::validate_jobs_file(file).context("Jobs file failed validation")?;

    tracing::info!(
        "Running {} job(s) over {} connection(s)",
        file.jobs.len(),
        file.connections.len()
    );

    let policy = file.dedup_policy();
    let schema = file.foreign_key_schema();
    let mut identities = IdentityMap::new();
    let mut report = RunReport::default();

    for (idx, job) in file.jobs.iter().enumerate() {
        let index = idx + 1;
        tracing::info!(
            "Job {}/{}: {} {} table(s) via '{}'",
            index,
            file.jobs.len(),
            job.kind(),
            job.tables().len(),
            job.connection()
        );

        let mut ctx = ImportContext {
            policy: &policy,
            schema: &schema,
            identity_column: &file.identity_column,
            identities: &mut identities,
        };

        match run_job(file, job, &mut ctx, &mut report).await {
            Ok(()) => {
                report.jobs_succeeded += 1;
                tracing::info!("✓ Job {} complete", index);
            }
            Err(e) => {
                tracing::error!(
                    "✗ Job {} ({} on '{}') failed: {:#}",
                    index,
                    job.kind(),
                    job.connection(),
                    e
                );

                if MoverError::classify(&e) == ErrorKind::Config || !job.continue_on_error() {
                    report.log_summary();
                    return Err(e.context(format!(
                        "Job {} ({} on '{}') failed",
                        index,
                        job.kind(),
                        job.connection()
                    )));
                }

                report.failures.push(JobFailure {
                    index,
                    kind: job.kind(),
                    connection: job.connection().to_string(),
                    error: format!("{:#}", e),
                });
            }
        }
    }

    report.log_summary();
    if report.failures.is_empty() {
        tracing::info!("✅ All jobs complete");
    }
    Ok(report)
}

async fn run_job(
    file: &JobsFile,
    job: &Job,
    ctx: &mut ImportContext<'_>,
    report: &mut RunReport,
) -> Result<()> {
    let descriptor = file.connection(job.connection()).ok_or_else(|| {
        MoverError::config(format!("Unknown connection '{}'", job.connection()))
    })?;

    let started = Utc::now();
    let mut engine = engine::resolve(descriptor, job.kind()).await?;
    let outcome = dispatch(&mut engine, job, ctx, started, report).await;

    if let Err(e) = engine.close().await {
        tracing::warn!("⚠ Failed to close connection '{}': {:#}", descriptor.name, e);
    }

    outcome
}

async fn dispatch(
    engine: &mut Engine,
    job: &Job,
    ctx: &mut ImportContext<'_>,
    started: chrono::DateTime<Utc>,
    report: &mut RunReport,
) -> Result<()> {
    match job {
        Job::Export(export) => {
            let exported = export_tables(engine, export, started).await?;
            report.exported.extend(exported);
        }
        Job::Import(import) => {
            let result = import_tables(engine, import, ctx, started.date_naive()).await?;
            report.imported.extend(result.imported);
            report.skipped.extend(result.skipped);
        }
    }
    Ok(())
}
