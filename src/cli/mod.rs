//! CLI Module
//!
//! Provides command-line support shared by both binaries:
//! - Exit codes for automation
//! - Output formatting for readings and frames
//! - Tracing initialisation

pub mod exit_codes;
pub mod logging;
pub mod output;

pub use exit_codes::{exit_code_description, print_exit_codes, CliResult, ExitCodes};
pub use logging::init_tracing;
pub use output::{format_hex, format_reading, parse_frame_input, OutputFormat, READING_CSV_HEADER};
