//! CLI Exit Codes
//!
//! Standard exit codes for CLI operations and automation.

use crate::config::ConfigError;
use crate::core::decoder::DecodeError;
use crate::core::driver::{CycleError, DriverError};
use crate::core::transport::TransportError;
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Connection failed
    pub const CONNECTION_FAILED: u8 = 3;

    /// No response before the timeout
    pub const TIMEOUT: u8 = 4;

    /// File not found
    pub const FILE_NOT_FOUND: u8 = 6;

    /// Permission denied
    pub const PERMISSION_DENIED: u8 = 7;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// Frame could not be decoded
    pub const PROTOCOL_ERROR: u8 = 9;

    /// User cancelled
    pub const CANCELLED: u8 = 11;

    /// Command not supported by the device model
    pub const UNSUPPORTED: u8 = 13;

    /// Port not found
    pub const PORT_NOT_FOUND: u8 = 14;

    /// Internal error
    pub const INTERNAL_ERROR: u8 = 127;

    /// Every documented code
    pub fn all() -> &'static [u8] {
        &[
            Self::SUCCESS,
            Self::ERROR,
            Self::INVALID_ARGS,
            Self::CONNECTION_FAILED,
            Self::TIMEOUT,
            Self::FILE_NOT_FOUND,
            Self::PERMISSION_DENIED,
            Self::CONFIG_ERROR,
            Self::PROTOCOL_ERROR,
            Self::CANCELLED,
            Self::UNSUPPORTED,
            Self::PORT_NOT_FOUND,
            Self::INTERNAL_ERROR,
        ]
    }
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Plain success
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Success with a message for stdout
    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success(Some(msg.into()))
    }

    /// Error with an explicit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Invalid command-line input
    pub fn invalid_args(msg: impl Into<String>) -> Self {
        Self::Error(ExitCodes::INVALID_ARGS, msg.into())
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) | Self::Error(_, msg) => Some(msg),
            Self::Success(None) => None,
        }
    }

    /// Convert to ExitCode
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl From<std::io::Error> for CliResult {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let code = match err.kind() {
            ErrorKind::NotFound => ExitCodes::FILE_NOT_FOUND,
            ErrorKind::PermissionDenied => ExitCodes::PERMISSION_DENIED,
            ErrorKind::ConnectionRefused | ErrorKind::BrokenPipe => ExitCodes::CONNECTION_FAILED,
            ErrorKind::TimedOut => ExitCodes::TIMEOUT,
            _ => ExitCodes::ERROR,
        };

        Self::Error(code, err.to_string())
    }
}

impl From<TransportError> for CliResult {
    fn from(err: TransportError) -> Self {
        let code = match &err {
            TransportError::Timeout(_) => ExitCodes::TIMEOUT,
            TransportError::Framing(_) => ExitCodes::PROTOCOL_ERROR,
            TransportError::PortNotFound(_) => ExitCodes::PORT_NOT_FOUND,
            TransportError::PermissionDenied(_) => ExitCodes::PERMISSION_DENIED,
            TransportError::InvalidConfiguration(_) => ExitCodes::CONFIG_ERROR,
            TransportError::ConnectionFailed(_) | TransportError::Disconnected => {
                ExitCodes::CONNECTION_FAILED
            }
            TransportError::IoError(_) => ExitCodes::ERROR,
        };
        Self::Error(code, err.to_string())
    }
}

impl From<DecodeError> for CliResult {
    fn from(err: DecodeError) -> Self {
        Self::Error(ExitCodes::PROTOCOL_ERROR, err.to_string())
    }
}

impl From<CycleError> for CliResult {
    fn from(err: CycleError) -> Self {
        match err {
            CycleError::Transport(e) => e.into(),
            CycleError::Decode(e) => e.into(),
            CycleError::Busy(e) => Self::Error(ExitCodes::INTERNAL_ERROR, e.to_string()),
        }
    }
}

impl From<DriverError> for CliResult {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::Transport(e) => e.into(),
            DriverError::InvalidConfig(msg) => Self::Error(ExitCodes::CONFIG_ERROR, msg),
            e @ DriverError::Unsupported { .. } => Self::Error(ExitCodes::UNSUPPORTED, e.to_string()),
            e => Self::Error(ExitCodes::ERROR, e.to_string()),
        }
    }
}

impl From<ConfigError> for CliResult {
    fn from(err: ConfigError) -> Self {
        let code = match &err {
            ConfigError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                ExitCodes::FILE_NOT_FOUND
            }
            _ => ExitCodes::CONFIG_ERROR,
        };
        Self::Error(code, err.to_string())
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments",
        3 => "Connection failed",
        4 => "No response before timeout",
        6 => "File not found",
        7 => "Permission denied",
        8 => "Configuration error",
        9 => "Protocol error",
        11 => "Operation cancelled",
        13 => "Not supported by device model",
        14 => "Port not found",
        127 => "Internal error",
        _ => "Unknown error",
    }
}

/// Print exit code table
pub fn print_exit_codes() {
    println!("Exit Codes:");
    for &code in ExitCodes::all() {
        println!("  {:>3}  {}", code, exit_code_description(code));
    }
}
