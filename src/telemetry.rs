//! Tracing subscriber setup for the CLI and server.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::{LogFormat, LoggingConfig};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Filter directive: `RUST_LOG` wins, then `--verbose`, then the configured level.
fn filter(config: &LoggingConfig, verbose: bool) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let level = if verbose { "debug" } else { config.level.as_str() };
    EnvFilter::try_new(level).with_context(|| format!("Invalid log level: {}", level))
}

/// Install the global subscriber. Logs go to stderr so command output on
/// stdout stays clean. When file logging is enabled, a daily rolling JSON log
/// is written under `log_dir`; keep the returned guard alive until exit so
/// buffered lines are flushed.
pub fn init(config: &LoggingConfig, log_dir: &Path, verbose: bool) -> Result<Option<WorkerGuard>> {
    let mut layers: Vec<BoxedLayer> = Vec::new();
    layers.push(match config.format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
    });

    let mut guard = None;
    if config.file {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
        let appender = tracing_appender::rolling::daily(log_dir, "vds.log");
        let (writer, worker) = tracing_appender::non_blocking(appender);
        layers.push(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed(),
        );
        guard = Some(worker);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter(config, verbose)?)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(guard)
}
