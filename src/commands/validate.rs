// ABOUTME: Pre-flight validation command for a jobs file
// ABOUTME: Checks connections, jobs, templates and import order without opening any database

use crate::config::{self, Job, JobsFile};
use anyhow::{Context, Result};
use std::path::Path;

/// Load and check a jobs file, logging what a run would do
pub fn validate(path: &Path) -> Result<JobsFile> {
    tracing::info!("Validating jobs file {}...", path.display());

    let file = config::load_jobs_file(path)?;
    config::validate_jobs_file(&file)
        .with_context(|| format!("Jobs file {} failed validation", path.display()))?;

    tracing::info!("✓ {} connection(s) defined", file.connections.len());
    for (idx, job) in file.jobs.iter().enumerate() {
        let detail = match job {
            Job::Export(export) => format!("as {}", export.dump_format),
            Job::Import(import) => match &import.as_of {
                Some(as_of) => format!("from {} snapshot {}", import.dump_format, as_of),
                None => format!("from today's {} snapshot", import.dump_format),
            },
        };
        tracing::info!(
            "  {}. {} [{}] via '{}' {}",
            idx + 1,
            job.kind(),
            job.tables().join(", "),
            job.connection(),
            detail
        );
    }

    if file.infer_foreign_keys {
        tracing::info!("  Foreign keys: declared, plus '<table>_id' inference");
    } else if !file.foreign_keys.is_empty() {
        tracing::info!("  Foreign keys: declared for {} table(s)", file.foreign_keys.len());
    }

    tracing::info!("✅ Validation complete - jobs file is ready to run");
    Ok(file)
}
