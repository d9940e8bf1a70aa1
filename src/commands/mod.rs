// ABOUTME: Command implementations behind the CLI
// ABOUTME: Exports the job runner and the pre-flight validate command

pub mod run;
pub mod validate;

pub use run::{run, run_jobs_file, JobFailure, RunReport};
pub use validate::validate;
