//! geigerd - Geiger counter polling daemon
//!
//! Loads the TOML configuration, opens the serial link, binds the configured
//! sensors to the log and the readings file, and polls until Ctrl-C.

use anyhow::Context;
use clap::Parser;
use geiger_core::cli::init_tracing;
use geiger_core::config::default_config_path;
use geiger_core::{
    open_serial, AppConfig, FanoutSink, GeigerDriver, LogSink, ReadingFileLogger, SensorSink,
    SystemClock,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// geigerd
#[derive(Parser, Debug)]
#[command(name = "geigerd", version, about = "Geiger counter polling daemon")]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "GEIGERD_CONFIG")]
    config: Option<PathBuf>,

    /// Serial port, overriding the configuration file
    #[arg(short, long)]
    port: Option<String>,

    /// Log filter, overriding the configuration file
    #[arg(short, long)]
    log_level: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AppConfig::load().context("loading default configuration")?,
    };
    if let Some(port) = &args.port {
        config.serial.port.clone_from(port);
    }
    config.validate().context("invalid configuration")?;

    if args.check {
        println!("configuration is valid");
        return Ok(());
    }

    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    let _log_guard = init_tracing(&config.logging, level)?;

    tracing::info!(
        version = geiger_core::VERSION,
        config = %args
            .config
            .clone()
            .or_else(default_config_path)
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        "starting geigerd"
    );

    let mut sink = FanoutSink::new().with(Arc::new(LogSink));
    if let Some(path) = &config.logging.readings_file {
        let logger = ReadingFileLogger::open(path, config.logging.readings_format)
            .with_context(|| format!("opening readings file {}", path.display()))?;
        sink = sink.with(Arc::new(logger));
    }
    let sink: Arc<dyn SensorSink> = Arc::new(sink);
    let sinks = config.sensors.sink_set(&sink);

    let driver_config = config.driver_config();
    let transport = open_serial(&config.serial, driver_config.model.framing())
        .await
        .with_context(|| format!("opening {}", config.serial.describe()))?;

    let mut driver = GeigerDriver::new(driver_config, Box::new(transport), sinks)?;
    if config.device.time_sync {
        driver = driver.with_clock(Arc::new(SystemClock));
    }
    driver.setup().await?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("shutdown requested"),
            Err(e) => tracing::error!(error = %e, "cannot listen for Ctrl-C, stopping"),
        }
        signal_token.cancel();
    });

    let stats = driver.run(shutdown).await;
    tracing::info!(
        cycles = stats.cycles,
        published = stats.published,
        skipped = stats.skipped(),
        sink_failures = stats.sink_failures,
        "geigerd stopped"
    );
    Ok(())
}
