//! # geiger_core
//!
//! Polling UART driver for GRGC Geiger counters:
//! - Serial link with JSON-line (GRGC1) and CRC-checked binary (GRGC2) framing
//! - Frame decoding into counts, dose rate and supply voltage
//! - Dose rate derived from a tube calibration table when the device does not report it
//! - Independent optional sinks per measured quantity
//!
//! ## Example
//!
//! ```rust,no_run
//! use geiger_core::{
//!     open_serial, DriverConfig, GeigerDriver, LogSink, SensorKind, SerialConfig, SinkBinding,
//!     SinkSet,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = DriverConfig::default();
//!     let transport = open_serial(&SerialConfig::new("/dev/ttyUSB0", 115200), config.model.framing()).await?;
//!     let sinks = SinkSet::new().with(SinkBinding::new(SensorKind::Dose, Arc::new(LogSink)));
//!
//!     let mut driver = GeigerDriver::new(config, Box::new(transport), sinks)?;
//!     driver.setup().await?;
//!     driver.run(CancellationToken::new()).await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes, OutputFormat};
pub use crate::config::{AppConfig, ConfigError};
pub use crate::core::calibration::TubeType;
pub use crate::core::clock::{Clock, ManualClock, SystemClock};
pub use crate::core::decoder::{decode, decode_message, DecodeError, DeviceMessage, DeviceSettings};
pub use crate::core::driver::{
    CycleError, CycleOutcome, DriverConfig, DriverError, DriverEvent, DriverStats, GeigerDriver,
};
pub use crate::core::logger::{LogFormat, ReadingFileLogger};
pub use crate::core::model::DeviceModel;
pub use crate::core::reading::{DoseSource, Reading, SensorKind};
pub use crate::core::simulator::{SimulatorConfig, VirtualGeiger};
pub use crate::core::sink::{ChannelSink, FanoutSink, LogSink, PublishedValue, SensorSink, SinkBinding, SinkError, SinkSet};
pub use crate::core::state_machine::PollState;
pub use crate::core::transport::{
    list_ports, open_serial, SerialConfig, SerialFlowControl, SerialParity, StreamTransport,
    TransportError, TransportTrait, TransportType,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
