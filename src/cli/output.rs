//! Output formatting for readings and raw frames

use crate::core::model::DeviceModel;
use crate::core::reading::Reading;
use serde::{Deserialize, Serialize};

/// Output format of CLI commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human readable
    #[default]
    Text,
    /// One JSON object per line
    Json,
    /// Comma separated values
    Csv,
}

/// Header line for [`OutputFormat::Csv`]
pub const READING_CSV_HEADER: &str =
    "timestamp,cpm,cps,dose_usv_h,voltage,raw_counts,dose_source";

/// Format one reading
pub fn format_reading(reading: &Reading, format: OutputFormat) -> String {
    match format {
        OutputFormat::Text => {
            let stamp = reading
                .captured_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());
            format!("[{}] {}", stamp, reading)
        }
        OutputFormat::Json => serde_json::to_string(reading).unwrap_or_default(),
        OutputFormat::Csv => {
            let field = |v: Option<f64>| v.map(|v| v.to_string()).unwrap_or_default();
            format!(
                "{},{},{},{},{},{},{}",
                reading.captured_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
                field(reading.counts_per_minute),
                field(reading.counts_per_second),
                field(reading.dose_rate),
                field(reading.supply_voltage),
                reading.raw_counts.map(|c| c.to_string()).unwrap_or_default(),
                serde_json::to_value(reading.dose_source)
                    .ok()
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_default(),
            )
        }
    }
}

/// Bytes as space separated upper-case hex
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Turn a frame typed on the command line into bytes
///
/// GRGC2 frames are hex (spaces, `0x` prefixes and commas allowed). GRGC1
/// frames are taken as text unless prefixed with `hex:`.
pub fn parse_frame_input(input: &str, model: DeviceModel) -> Result<Vec<u8>, String> {
    let (is_hex, body) = match input.strip_prefix("hex:") {
        Some(rest) => (true, rest),
        None => (model == DeviceModel::Grgc2, input),
    };

    if !is_hex {
        return Ok(body.trim().as_bytes().to_vec());
    }

    let digits: String = body
        .split(|c: char| c.is_whitespace() || c == ',')
        .map(|part| part.trim_start_matches("0x").trim_start_matches("0X"))
        .collect();
    hex::decode(&digits).map_err(|e| format!("invalid hex frame: {}", e))
}
