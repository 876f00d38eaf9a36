//! Telescope conformance runner
//!
//! Usage: `conform_telescope [config.json]`
//!
//! Without a configuration file the run targets Alpaca telescope 0 on the
//! local default port with default settings.

use anyhow::{Context, Result};
use conform_alpaca::{run_conformance, RunnerConfig};
use std::path::Path;
use std::process::ExitCode;
use telescope_conform::TracingReporter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Console logging, plus a daily rolling file when a log directory is configured
fn init_logging(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console_layer = fmt::layer().with_target(false).with_ansi(true);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).with_context(|| format!("creating log directory {}", dir.display()))?;
            let file_appender = tracing_appender::rolling::daily(dir, "conform_telescope.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = fmt::layer().with_target(true).with_ansi(false).with_writer(non_blocking);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .with(file_layer)
                .init();
            tracing::info!("Logging to {}", dir.display());
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry().with(env_filter).with(console_layer).init();
            Ok(None)
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let config = match std::env::args().nth(1) {
        Some(path) => RunnerConfig::load(&path).with_context(|| format!("loading runner configuration {}", path))?,
        None => RunnerConfig::default(),
    };
    let _guard = init_logging(config.log_dir.as_deref())?;

    let device = config.open_device()?;
    let reporter = TracingReporter;
    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_err() {
            // no signal handler available, never cancel
            std::future::pending::<()>().await;
        }
    };

    let summary = run_conformance(device.as_ref(), &config.settings, &reporter, shutdown).await?;

    println!("{}", summary);
    if summary.is_conformant() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
