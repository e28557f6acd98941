//! Transport layer for the detector link
//!
//! Supports:
//! - Serial ports (USB-Serial adapters, on-board UARTs)
//! - Any async byte stream (in-memory pipes for simulation and tests)

mod serial;
mod stream;

pub use serial::{list_ports, open_serial, SerialConfig, SerialFlowControl, SerialParity};
pub use stream::StreamTransport;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Transport type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportType {
    /// Serial port
    Serial,
    /// In-memory stream
    Stream,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial => write!(f, "Serial"),
            Self::Stream => write!(f, "Stream"),
        }
    }
}

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// No complete frame before the deadline
    #[error("Timeout after {0:?} waiting for a frame")]
    Timeout(Duration),

    /// Malformed byte sequence on the wire
    #[error("Framing error: {0}")]
    Framing(String),

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Port not found
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Remote end closed the stream
    #[error("Disconnected")]
    Disconnected,
}

impl TransportError {
    /// Whether waiting for the next poll may clear the error
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Framing(_))
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Frames sent
    pub frames_sent: u64,
    /// Complete frames received
    pub frames_received: u64,
    /// Framing errors
    pub framing_errors: u64,
    /// Partial frames dropped by a reset
    pub partial_frames_dropped: u64,
}

/// Transport trait for the detector link
#[async_trait]
pub trait TransportTrait: Send {
    /// Send a request frame
    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read one complete frame, waiting at most `timeout`
    ///
    /// Bytes already buffered from earlier reads are considered first.
    async fn read_frame(&mut self, timeout: Duration) -> Result<Bytes, TransportError>;

    /// Drop any partially received frame
    fn reset_framing(&mut self);

    /// Take everything already received without waiting for more
    ///
    /// Complete frames among the drained bytes are returned so the caller can
    /// still act on unsolicited messages. A trailing partial frame is dropped.
    async fn discard_input(&mut self) -> Result<Vec<Bytes>, TransportError>;

    /// Get transport type
    fn transport_type(&self) -> TransportType;

    /// Get connection info string
    fn connection_info(&self) -> String;

    /// Get statistics
    fn stats(&self) -> TransportStats;
}
