use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use govner::driver::{self, RunSummary};
use govner::settings::Cli;
use tracing_subscriber::EnvFilter;

const EXIT_PARTIAL_FAILURE: u8 = 2;

fn main() -> ExitCode {
    init_tracing();
    // clap exits with 2 on bad arguments, which would read as a partial run.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if err.use_stderr() => {
            let _ = err.print();
            return ExitCode::FAILURE;
        }
        Err(err) => err.exit(),
    };
    match run(&cli) {
        Ok(summary) if summary.is_success() => ExitCode::SUCCESS,
        Ok(summary) => {
            eprintln!(
                "{} chunk(s) failed: {:?}",
                summary.failed.len(),
                summary.failed_indices()
            );
            ExitCode::from(EXIT_PARTIAL_FAILURE)
        }
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("tracing subscriber already set; skipping re-initialization");
    }
}

fn run(cli: &Cli) -> Result<RunSummary> {
    let config = cli.build_config().context("invalid configuration")?;
    tracing::info!(
        part = %config.run.part,
        model = %config.model.location,
        source = %config.source,
        batch_size = config.engine.batch_size(),
        workers = config.engine.worker_count(),
        chunk_size = config.run.chunk_size,
        date = %config.run.date,
        "starting entity extraction"
    );
    let summary = driver::execute(
        &config.source,
        Arc::new(config.model.clone()),
        config.engine,
        &config.run,
    )
    .with_context(|| format!("extraction of {} aborted", config.run.part))?;
    Ok(summary)
}
