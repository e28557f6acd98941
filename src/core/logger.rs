//! Reading file logger
//!
//! Appends every published value to a file as text, CSV or JSON lines.
//! Usable as a [`SensorSink`] on any number of bindings at once.

use super::sink::{PublishedValue, SensorSink, SinkError};
use chrono::Local;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text
    Text,
    /// CSV with timestamp
    #[default]
    Csv,
    /// JSON lines
    #[serde(alias = "jsonl")]
    Json,
}

impl LogFormat {
    /// Get file extension for format
    pub fn extension(&self) -> &'static str {
        match self {
            LogFormat::Text => "txt",
            LogFormat::Csv => "csv",
            LogFormat::Json => "jsonl",
        }
    }

    /// Get all formats
    pub fn all() -> &'static [LogFormat] {
        &[LogFormat::Text, LogFormat::Csv, LogFormat::Json]
    }

    /// Get name
    pub fn name(&self) -> &'static str {
        match self {
            LogFormat::Text => "Text",
            LogFormat::Csv => "CSV",
            LogFormat::Json => "JSON Lines",
        }
    }
}

const CSV_HEADER: &str = "timestamp,sensor,kind,value,unit";

struct LoggerState {
    writer: BufWriter<File>,
    lines: u64,
}

/// File-backed sink
pub struct ReadingFileLogger {
    path: PathBuf,
    format: LogFormat,
    state: Mutex<LoggerState>,
}

impl ReadingFileLogger {
    /// Open `path` for appending
    ///
    /// A CSV header is written when the file is new or empty.
    pub fn open(path: impl AsRef<Path>, format: LogFormat) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let empty = file.metadata()?.len() == 0;
        let mut writer = BufWriter::new(file);

        if format == LogFormat::Csv && empty {
            writeln!(writer, "{CSV_HEADER}")?;
            writer.flush()?;
        }

        tracing::debug!(path = %path.display(), format = format.name(), "reading log opened");
        Ok(Self {
            path,
            format,
            state: Mutex::new(LoggerState { writer, lines: 0 }),
        })
    }

    /// Log path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Log format
    pub fn format(&self) -> LogFormat {
        self.format
    }

    /// Lines written since open
    pub fn lines_logged(&self) -> u64 {
        self.state.lock().lines
    }

    /// Flush buffered lines to disk
    pub fn flush(&self) -> Result<(), SinkError> {
        self.state.lock().writer.flush()?;
        Ok(())
    }

    fn format_line(&self, value: &PublishedValue) -> Result<String, SinkError> {
        let timestamp = value.timestamp.unwrap_or_else(Local::now);
        Ok(match self.format {
            LogFormat::Text => format!(
                "[{}] {}",
                timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                value
            ),
            LogFormat::Csv => format!(
                "{},\"{}\",{},{},{}",
                timestamp.to_rfc3339(),
                value.name.replace('"', "\"\""),
                value.kind,
                value.formatted(),
                value.unit
            ),
            LogFormat::Json => serde_json::to_string(&serde_json::json!({
                "timestamp": timestamp,
                "sensor": value.name,
                "kind": value.kind,
                "value": value.value,
                "unit": value.unit,
            }))
            .map_err(|e| SinkError::Encoding(e.to_string()))?,
        })
    }
}

impl SensorSink for ReadingFileLogger {
    fn publish(&self, value: &PublishedValue) -> Result<(), SinkError> {
        let line = self.format_line(value)?;
        let mut state = self.state.lock();
        writeln!(state.writer, "{line}")?;
        // One reading fans out to several bindings; a flush per line keeps
        // the file readable while the daemon runs.
        state.writer.flush()?;
        state.lines += 1;
        Ok(())
    }
}

impl Drop for ReadingFileLogger {
    fn drop(&mut self) {
        let _ = self.state.get_mut().writer.flush();
    }
}

/// Generate log filename with timestamp
pub fn generate_log_filename(prefix: &str, format: LogFormat) -> String {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    format!("{}_{}.{}", prefix, timestamp, format.extension())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::reading::SensorKind;
    use chrono::TimeZone;

    fn value(kind: SensorKind, v: f64) -> PublishedValue {
        PublishedValue {
            name: kind.default_name().to_string(),
            kind,
            unit: kind.unit(),
            value: v,
            accuracy_decimals: kind.default_accuracy_decimals(),
            timestamp: Local.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).earliest(),
        }
    }

    #[test]
    fn test_csv_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readings.csv");

        {
            let logger = ReadingFileLogger::open(&path, LogFormat::Csv).unwrap();
            logger.publish(&value(SensorKind::Cpm, 360.0)).unwrap();
        }
        {
            let logger = ReadingFileLogger::open(&path, LogFormat::Csv).unwrap();
            logger.publish(&value(SensorKind::Cps, 6.0)).unwrap();
            assert_eq!(logger.lines_logged(), 1);
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER);
        assert!(lines[1].ends_with(",\"Geiger CPM\",cpm,360,cpm"));
        assert!(lines[2].contains(",cps,6,cps"));
    }

    #[test]
    fn test_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("readings.jsonl");
        let logger = ReadingFileLogger::open(&path, LogFormat::Json).unwrap();

        logger.publish(&value(SensorKind::Dose, 0.25)).unwrap();
        logger.flush().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(parsed["kind"], "dose");
        assert_eq!(parsed["value"], 0.25);
        assert_eq!(parsed["unit"], "µSv/h");
    }

    #[test]
    fn test_text_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readings.txt");
        let logger = ReadingFileLogger::open(&path, LogFormat::Text).unwrap();
        logger.publish(&value(SensorKind::Voltage, 401.26)).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("[2024-05-01 12:00:00.000]"));
        assert!(content.contains("Geiger Voltage: 401.3 V"));
    }

    #[test]
    fn test_filename() {
        let name = generate_log_filename("geiger", LogFormat::Json);
        assert!(name.starts_with("geiger_"));
        assert!(name.ends_with(".jsonl"));
    }
}
