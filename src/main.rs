// ABOUTME: CLI entry point for table-mover
// ABOUTME: Parses arguments, sets up logging and runs or validates a jobs file

use clap::Parser;
use std::path::PathBuf;
use table_mover::commands;

#[derive(Parser)]
#[command(name = "table-mover")]
#[command(about = "Export tables to staged files and import them into another database", long_about = None)]
#[command(version)]
struct Cli {
    /// Jobs file (JSON, or TOML when it ends in .toml)
    #[arg(long)]
    jobs_file: PathBuf,
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long)]
    debug: bool,
    /// Check the jobs file and exit without connecting to anything
    #[arg(long)]
    validate_only: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over --debug
    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let result = if cli.validate_only {
        commands::validate(&cli.jobs_file).map(|_| ())
    } else {
        commands::run_jobs_file(&cli.jobs_file).await.map(|_| ())
    };

    if let Err(e) = result {
        tracing::error!("✗ {:#}", e);
        std::process::exit(1);
    }
}
