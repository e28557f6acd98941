//! Core module containing the Geiger counter driver
//!
//! This module provides:
//! - Transport layer for the detector link (serial port, in-memory stream)
//! - Frame extraction and CRC checks for both wire formats
//! - Frame decoding into readings and settings reports
//! - Tube calibration table
//! - Poll cycle state machine and the polling driver
//! - Output sinks (structured log, channel, file)
//! - Virtual device simulation

pub mod calibration;
pub mod clock;
pub mod decoder;
pub mod driver;
pub mod logger;
pub mod model;
pub mod protocol;
pub mod reading;
pub mod simulator;
pub mod sink;
pub mod state_machine;
pub mod transport;
