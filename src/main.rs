use std::io::{BufRead, Write};
use std::process::ExitCode;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use haystack::batch::{self, BatchReport};
use haystack::config::Config;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let code = match run() {
        Ok(report) => {
            tracing::info!(
                "done: {} pair(s) checked, {} match(es) written, {} file(s) skipped",
                report.pairs.len(),
                report.match_count(),
                report.skipped.len()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("An error occurred: {e:#}");
            ExitCode::FAILURE
        }
    };

    wait_for_enter();

    code
}

fn run() -> Result<BatchReport> {
    let config = Config::load().context("failed to load configuration")?;

    tracing::info!(
        "needles: {}, haystacks: {}, results: {}",
        config.needles_dir.display(),
        config.haystacks_dir.display(),
        config.results_dir.display()
    );

    batch::run_batch(&config)
}

fn wait_for_enter() {
    print!("Press Enter to exit...");
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);
}
