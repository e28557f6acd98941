//! geiger-cli - Command-line tools for GRGC Geiger counters
//!
//! Inspect ports and calibration, decode frames by hand, poll a device once
//! or continuously, and run the driver against a virtual device.

use clap::{Args, Parser, Subcommand};
use geiger_core::cli::{
    format_hex, format_reading, init_tracing, parse_frame_input, print_exit_codes, CliResult,
    ExitCodes, OutputFormat, READING_CSV_HEADER,
};
use geiger_core::config::{default_config_path, LoggingConfig, SensorsConfig};
use geiger_core::core::simulator::ErrorInjectionConfig;
use geiger_core::{
    decode_message, list_ports, open_serial, AppConfig, DeviceMessage, DeviceModel, DriverConfig,
    DriverEvent, GeigerDriver, Reading, SimulatorConfig, SinkSet, StreamTransport, SystemClock,
    TransportType, TubeType, VirtualGeiger,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use humantime_serde::re::humantime::parse_duration;
use tokio_util::sync::CancellationToken;

/// geiger-cli
#[derive(Parser, Debug)]
#[command(
    name = "geiger-cli",
    version,
    about = "Tools for GRGC Geiger counters",
    long_about = None
)]
struct Cli {
    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    format: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, env = "GEIGERD_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Device overrides on top of the configuration file
#[derive(Args, Debug, Clone, Default)]
struct DeviceArgs {
    /// Serial port name (e.g., /dev/ttyUSB0, COM3)
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate
    #[arg(short, long)]
    baud: Option<u32>,

    /// Device model (GRGC1, GRGC2)
    #[arg(short, long)]
    model: Option<DeviceModel>,

    /// Tube type (e.g., SBM20, J305)
    #[arg(short, long)]
    tube: Option<TubeType>,

    /// Poll interval (e.g., 10s, 1m)
    #[arg(short, long, value_parser = parse_duration)]
    interval: Option<Duration>,

    /// Response timeout (e.g., 2s, 500ms)
    #[arg(long, value_parser = parse_duration)]
    timeout: Option<Duration>,
}

impl DeviceArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(port) = &self.port {
            config.serial.port.clone_from(port);
        }
        if let Some(baud) = self.baud {
            config.serial.baud_rate = baud;
        }
        if let Some(model) = self.model {
            config.device.model = model;
        }
        if let Some(tube) = self.tube {
            config.device.tube = tube;
        }
        if let Some(interval) = self.interval {
            config.device.update_interval = interval;
        }
        if let Some(timeout) = self.timeout {
            config.device.response_timeout = timeout;
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available serial ports
    ListPorts {
        /// Show detailed info
        #[arg(short, long)]
        detailed: bool,
    },

    /// Show the tube calibration table
    Tubes,

    /// Decode one frame
    Decode {
        /// Frame: JSON text for GRGC1, hex for GRGC2 (`hex:` forces hex)
        frame: String,

        /// Device model
        #[arg(short, long, default_value = "GRGC1")]
        model: DeviceModel,

        /// Tube used to derive missing values
        #[arg(short, long, default_value = "SBM20")]
        tube: TubeType,

        /// Window the pulse count covers
        #[arg(short, long, default_value = "10s", value_parser = parse_duration)]
        interval: Duration,
    },

    /// Poll a device once
    Read {
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Poll a device continuously
    Monitor {
        #[command(flatten)]
        device: DeviceArgs,

        /// Stop after this many readings
        #[arg(short = 'n', long)]
        count: Option<u64>,
    },

    /// Run the driver against a virtual device
    Simulate {
        /// Device model
        #[arg(short, long, default_value = "GRGC2")]
        model: DeviceModel,

        /// Tube type
        #[arg(short, long, default_value = "SBM20")]
        tube: TubeType,

        /// Mean count rate of the virtual tube
        #[arg(long, default_value = "20")]
        cpm: f64,

        /// Poll interval
        #[arg(short, long, default_value = "1s", value_parser = parse_duration)]
        interval: Duration,

        /// Number of readings
        #[arg(short = 'n', long, default_value = "5")]
        count: u64,

        /// Random seed
        #[arg(long)]
        seed: Option<u64>,

        /// Probability of a dropped response
        #[arg(long, default_value = "0")]
        drop: f64,

        /// Probability of a corrupted response
        #[arg(long, default_value = "0")]
        corrupt: f64,

        /// Probability of line noise before a response
        #[arg(long, default_value = "0")]
        noise: f64,
    },

    /// Show, check or create the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show exit codes
    ExitCodes,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Check the configuration file
    Validate,
    /// Write a default configuration file
    Init {
        /// Output path (defaults to the platform config directory)
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    // CLI runs log to the console only
    let _guard = init_tracing(&LoggingConfig::default(), level);

    let result = match run(&cli).await {
        Ok(result) | Err(result) => result,
    };

    if let Some(msg) = result.message() {
        if result.is_success() {
            println!("{}", msg);
        } else if !cli.quiet {
            eprintln!("Error: {}", msg);
        }
    }
    result.to_exit_code()
}

async fn run(cli: &Cli) -> Result<CliResult, CliResult> {
    match &cli.command {
        Commands::ListPorts { detailed } => list_serial_ports(cli, *detailed),
        Commands::Tubes => {
            print_tubes(cli);
            Ok(CliResult::success())
        }
        Commands::Decode {
            frame,
            model,
            tube,
            interval,
        } => decode_frame(cli, frame, *model, *tube, *interval),
        Commands::Read { device } => read_once(cli, device).await,
        Commands::Monitor { device, count } => monitor(cli, device, *count).await,
        Commands::Simulate {
            model,
            tube,
            cpm,
            interval,
            count,
            seed,
            drop,
            corrupt,
            noise,
        } => {
            let sim = SimulatorConfig {
                model: *model,
                tube: *tube,
                mean_cpm: *cpm,
                window: *interval,
                seed: *seed,
                errors: ErrorInjectionConfig {
                    drop_probability: *drop,
                    corruption_probability: *corrupt,
                    noise_probability: *noise,
                },
                ..SimulatorConfig::default()
            };
            simulate(cli, sim, *count).await
        }
        Commands::Config { action } => config_command(cli, action),
        Commands::ExitCodes => {
            print_exit_codes();
            Ok(CliResult::success())
        }
    }
}

fn load_config(cli: &Cli) -> Result<AppConfig, CliResult> {
    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    Ok(config)
}

fn list_serial_ports(cli: &Cli, detailed: bool) -> Result<CliResult, CliResult> {
    let ports = list_ports()?;

    match cli.format {
        OutputFormat::Json => {
            let json: Vec<serde_json::Value> = ports
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "name": p.port_name,
                        "type": format!("{:?}", p.port_type)
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json).unwrap_or_default());
        }
        OutputFormat::Csv => {
            println!("name,type");
            for port in &ports {
                println!("{},{:?}", port.port_name, port.port_type);
            }
        }
        OutputFormat::Text => {
            if ports.is_empty() && !cli.quiet {
                eprintln!("No serial ports found");
            }
            for port in &ports {
                if detailed {
                    println!("  {} [{:?}]", port.port_name, port.port_type);
                } else {
                    println!("{}", port.port_name);
                }
            }
        }
    }

    Ok(CliResult::success())
}

fn print_tubes(cli: &Cli) {
    let tubes = TubeType::all();
    match cli.format {
        OutputFormat::Json => {
            let json: Vec<serde_json::Value> = tubes
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "tube": t.name(),
                        "code": t.device_code(),
                        "usv_h_per_cpm": t.cpm_factor(),
                        "usv_h_per_cps": t.calibration_factor(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json).unwrap_or_default());
        }
        OutputFormat::Csv => {
            println!("tube,code,usv_h_per_cpm,usv_h_per_cps");
            for t in tubes {
                println!("{},{},{},{}", t.name(), t.device_code(), t.cpm_factor(), t.calibration_factor());
            }
        }
        OutputFormat::Text => {
            println!("{:<8} {:>4} {:>14} {:>14}", "Tube", "Code", "µSv/h per CPM", "µSv/h per CPS");
            println!("{:-<43}", "");
            for t in tubes {
                println!(
                    "{:<8} {:>4} {:>14.6} {:>14.6}",
                    t.name(),
                    t.device_code(),
                    t.cpm_factor(),
                    t.calibration_factor()
                );
            }
        }
    }
}

fn decode_frame(
    cli: &Cli,
    frame: &str,
    model: DeviceModel,
    tube: TubeType,
    interval: Duration,
) -> Result<CliResult, CliResult> {
    let bytes = parse_frame_input(frame, model).map_err(CliResult::invalid_args)?;
    if cli.verbose {
        eprintln!("{} bytes: {}", bytes.len(), format_hex(&bytes));
    }

    match decode_message(&bytes, model)? {
        DeviceMessage::Sample(reading) => {
            let reading = reading.calibrated(model, tube, interval);
            print_reading_header(cli);
            println!("{}", format_reading(&reading, cli.format));
        }
        DeviceMessage::Settings(settings) => match cli.format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string(&settings).unwrap_or_default());
            }
            _ => println!("settings: {:?}", settings),
        },
    }
    Ok(CliResult::success())
}

fn print_reading_header(cli: &Cli) {
    if cli.format == OutputFormat::Csv {
        println!("{}", READING_CSV_HEADER);
    }
}

async fn connect(config: &AppConfig) -> Result<GeigerDriver, CliResult> {
    config.validate()?;
    let driver_config: DriverConfig = config.driver_config();
    let transport = open_serial(&config.serial, driver_config.model.framing()).await?;

    let mut driver = GeigerDriver::new(driver_config, Box::new(transport), SinkSet::new())?;
    if config.device.time_sync {
        driver = driver.with_clock(Arc::new(SystemClock));
    }
    driver.setup().await?;
    Ok(driver)
}

async fn read_once(cli: &Cli, device: &DeviceArgs) -> Result<CliResult, CliResult> {
    let mut config = load_config(cli)?;
    device.apply(&mut config);

    let mut driver = connect(&config).await?;
    let outcome = driver.poll_once().await?;

    print_reading_header(cli);
    println!("{}", format_reading(&outcome.reading, cli.format));
    Ok(CliResult::success())
}

async fn monitor(cli: &Cli, device: &DeviceArgs, count: Option<u64>) -> Result<CliResult, CliResult> {
    let mut config = load_config(cli)?;
    device.apply(&mut config);

    let mut driver = connect(&config).await?;
    if !cli.quiet {
        eprintln!(
            "Polling {} every {:?}. Press Ctrl+C to stop.",
            config.serial.describe(),
            config.device.update_interval
        );
    }
    poll_until_done(cli, &mut driver, count).await
}

async fn simulate(cli: &Cli, sim: SimulatorConfig, count: u64) -> Result<CliResult, CliResult> {
    let shutdown = CancellationToken::new();
    let driver_config = DriverConfig {
        model: sim.model,
        tube: sim.tube,
        update_interval: sim.window,
        response_timeout: sim.window / 2,
        ..DriverConfig::default()
    };

    let device = VirtualGeiger::new(sim);
    let (link, device_task) = device.spawn(shutdown.clone());
    let transport = StreamTransport::new(link, driver_config.model.framing())
        .with_info(TransportType::Stream, format!("virtual {}", driver_config.model));

    let mut driver = GeigerDriver::new(driver_config, Box::new(transport), SinkSet::new())?
        .with_clock(Arc::new(SystemClock));
    driver.setup().await?;

    let result = poll_until_done(cli, &mut driver, Some(count)).await;
    shutdown.cancel();

    match device_task.await {
        Ok(Ok(stats)) if cli.verbose => eprintln!("virtual device: {:?}", stats),
        Ok(Ok(_)) => {}
        Ok(Err(e)) => eprintln!("virtual device failed: {}", e),
        Err(e) => eprintln!("virtual device task failed: {}", e),
    }
    result
}

async fn poll_until_done(
    cli: &Cli,
    driver: &mut GeigerDriver,
    count: Option<u64>,
) -> Result<CliResult, CliResult> {
    let shutdown = CancellationToken::new();
    let ctrlc_token = shutdown.clone();
    ctrlc::set_handler(move || ctrlc_token.cancel())
        .map_err(|e| CliResult::error(ExitCodes::INTERNAL_ERROR, e.to_string()))?;

    let mut events = driver.subscribe();
    let printer_token = shutdown.clone();
    let format = cli.format;
    let verbose = cli.verbose;
    print_reading_header(cli);

    let printer = tokio::spawn(async move {
        let mut printed = 0u64;
        loop {
            let event = tokio::select! {
                _ = printer_token.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(DriverEvent::Published { reading, .. }) => {
                    print_published(&reading, format);
                    printed += 1;
                    if count.is_some_and(|n| printed >= n) {
                        printer_token.cancel();
                        break;
                    }
                }
                Ok(DriverEvent::Skipped { class, error }) if verbose => {
                    eprintln!("skipped ({}): {}", class, error);
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    eprintln!("missed {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
        printed
    });

    let stats = driver.run(shutdown.clone()).await;
    shutdown.cancel();
    let printed = printer.await.unwrap_or_default();

    if verbose {
        eprintln!(
            "{} cycles, {} published, {} skipped",
            stats.cycles,
            stats.published,
            stats.skipped()
        );
    }

    match count {
        Some(n) if printed < n => Ok(CliResult::error(
            ExitCodes::CANCELLED,
            format!("stopped after {} of {} readings", printed, n),
        )),
        _ => Ok(CliResult::success()),
    }
}

fn print_published(reading: &Reading, format: OutputFormat) {
    println!("{}", format_reading(reading, format));
}

fn config_command(cli: &Cli, action: &ConfigAction) -> Result<CliResult, CliResult> {
    match action {
        ConfigAction::Show => {
            let config = load_config(cli)?;
            match cli.format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&config).unwrap_or_default());
                }
                _ => print!("{}", config.to_toml()?),
            }
            Ok(CliResult::success())
        }
        ConfigAction::Validate => {
            let config = load_config(cli)?;
            config.validate()?;
            Ok(CliResult::success_with_message("configuration is valid"))
        }
        ConfigAction::Init { path, force } => {
            let path = match path.clone().or_else(|| cli.config.clone()).or_else(default_config_path) {
                Some(path) => path,
                None => {
                    return Err(CliResult::error(
                        ExitCodes::CONFIG_ERROR,
                        "could not determine config directory",
                    ))
                }
            };
            if path.exists() && !force {
                return Err(CliResult::error(
                    ExitCodes::CONFIG_ERROR,
                    format!("{} exists, use --force to overwrite", path.display()),
                ));
            }

            let mut config = AppConfig::default();
            config.sensors = SensorsConfig::all();
            config.save_to(&path)?;
            Ok(CliResult::success_with_message(format!("wrote {}", path.display())))
        }
    }
}
