//! Tracing subscriber setup

use crate::config::LoggingConfig;
use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// Log file name prefix inside the log directory
const LOG_FILE_PREFIX: &str = "geigerd.log";

/// Install the global subscriber
///
/// `RUST_LOG` takes precedence over `level`. Console output goes to stderr
/// so stdout stays free for command output. When the config names a log
/// directory, a daily rolling JSON file is written there as well; keep the
/// returned guard alive until exit so it gets flushed.
pub fn init_tracing(config: &LoggingConfig, level: &str) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("invalid log level '{level}'"))?,
    };

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    let console = fmt::layer().with_writer(std::io::stderr).with_target(false);
    layers.push(if config.json {
        console.json().boxed()
    } else {
        console.boxed()
    });

    let guard = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(fmt::layer().with_writer(writer).with_ansi(false).json().boxed());
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("tracing already initialised")?;

    Ok(guard)
}
