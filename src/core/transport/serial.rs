//! Serial port transport implementation

use super::{StreamTransport, TransportError, TransportType};
use crate::core::protocol::FramingType;
use serde::{Deserialize, Serialize};
use serialport::{DataBits, FlowControl, Parity, StopBits};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Serial port flow control type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialFlowControl {
    /// No flow control
    #[default]
    None,
    /// Hardware flow control (RTS/CTS)
    Hardware,
    /// Software flow control (XON/XOFF)
    Software,
}

/// Serial port parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    /// No parity
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

impl std::str::FromStr for SerialParity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "n" => Ok(Self::None),
            "odd" | "o" => Ok(Self::Odd),
            "even" | "e" => Ok(Self::Even),
            _ => Err(()),
        }
    }
}

/// Serial port configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port name (e.g., COM3, /dev/ttyUSB0)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5, 6, 7, 8)
    pub data_bits: u8,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    /// Parity
    pub parity: SerialParity,
    /// Flow control
    pub flow_control: SerialFlowControl,
}

impl SerialConfig {
    /// Create a new serial configuration with 8N1 and no flow control
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            flow_control: SerialFlowControl::None,
        }
    }

    /// Set data bits
    #[must_use]
    pub fn data_bits(mut self, bits: u8) -> Self {
        self.data_bits = bits;
        self
    }

    /// Set stop bits
    #[must_use]
    pub fn stop_bits(mut self, bits: u8) -> Self {
        self.stop_bits = bits;
        self
    }

    /// Set parity
    #[must_use]
    pub fn parity(mut self, parity: SerialParity) -> Self {
        self.parity = parity;
        self
    }

    /// Set flow control
    #[must_use]
    pub fn flow_control(mut self, flow: SerialFlowControl) -> Self {
        self.flow_control = flow;
        self
    }

    /// Check the line settings
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.port.trim().is_empty() {
            return Err(TransportError::InvalidConfiguration(
                "serial port name is empty".into(),
            ));
        }
        if self.baud_rate == 0 {
            return Err(TransportError::InvalidConfiguration(
                "baud rate must be greater than zero".into(),
            ));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(TransportError::InvalidConfiguration(format!(
                "data bits must be 5-8, got {}",
                self.data_bits
            )));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(TransportError::InvalidConfiguration(format!(
                "stop bits must be 1 or 2, got {}",
                self.stop_bits
            )));
        }
        Ok(())
    }

    /// Short description, e.g. `/dev/ttyUSB0 @ 115200 baud (8N1 No FC)`
    pub fn describe(&self) -> String {
        format!(
            "{} @ {} baud ({}{}{} {})",
            self.port,
            self.baud_rate,
            self.data_bits,
            match self.parity {
                SerialParity::None => "N",
                SerialParity::Odd => "O",
                SerialParity::Even => "E",
            },
            self.stop_bits,
            match self.flow_control {
                SerialFlowControl::None => "No FC",
                SerialFlowControl::Hardware => "HW FC",
                SerialFlowControl::Software => "SW FC",
            }
        )
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::new("/dev/ttyUSB0", 115_200)
    }
}

/// Open the serial port and wrap it in a frame transport
pub async fn open_serial(
    config: &SerialConfig,
    framing: FramingType,
) -> Result<StreamTransport<SerialStream>, TransportError> {
    config.validate()?;

    let data_bits = match config.data_bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    };

    let stop_bits = match config.stop_bits {
        2 => StopBits::Two,
        _ => StopBits::One,
    };

    let parity = match config.parity {
        SerialParity::Odd => Parity::Odd,
        SerialParity::Even => Parity::Even,
        SerialParity::None => Parity::None,
    };

    let flow_control = match config.flow_control {
        SerialFlowControl::Hardware => FlowControl::Hardware,
        SerialFlowControl::Software => FlowControl::Software,
        SerialFlowControl::None => FlowControl::None,
    };

    let port_name = config.port.clone();
    let baud_rate = config.baud_rate;

    // Opening may block on some drivers
    let stream = tokio::task::spawn_blocking(move || {
        tokio_serial::new(&port_name, baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(flow_control)
            .open_native_async()
            .map_err(|e| map_open_error(&port_name, e))
    })
    .await
    .map_err(|e| TransportError::ConnectionFailed(e.to_string()))??;

    tracing::info!(port = %config.port, baud = config.baud_rate, "serial port opened");

    Ok(StreamTransport::new(stream, framing).with_info(TransportType::Serial, config.describe()))
}

fn map_open_error(port: &str, e: serialport::Error) -> TransportError {
    match e.kind() {
        serialport::ErrorKind::NoDevice => TransportError::PortNotFound(port.to_string()),
        serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
            TransportError::PortNotFound(port.to_string())
        }
        serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
            TransportError::PermissionDenied(port.to_string())
        }
        _ => TransportError::ConnectionFailed(e.to_string()),
    }
}

/// List available serial ports
pub fn list_ports() -> Result<Vec<serialport::SerialPortInfo>, TransportError> {
    serialport::available_ports().map_err(|e| TransportError::IoError(e.into()))
}
