//! Application settings

use super::ConfigError;
use crate::core::calibration::TubeType;
use crate::core::driver::DriverConfig;
use crate::core::logger::LogFormat;
use crate::core::model::DeviceModel;
use crate::core::reading::SensorKind;
use crate::core::sink::{SensorSink, SinkBinding, SinkSet};
use crate::core::transport::SerialConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Largest display precision accepted for a sensor
const MAX_ACCURACY_DECIMALS: u8 = 12;

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// UART settings
    pub serial: SerialConfig,
    /// Detector settings
    pub device: DeviceConfig,
    /// Published sensors
    pub sensors: SensorsConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig::new("/dev/ttyUSB0", 115_200),
            device: DeviceConfig::default(),
            sensors: SensorsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load config from the default location
    ///
    /// A missing file yields the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = super::default_config_path().ok_or(ConfigError::NoConfigDir)?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Load config from `path`
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
        Self::from_toml(&content)
    }

    /// Parse config from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = super::default_config_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save config to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::io(parent, e))?;
        }
        std::fs::write(path, self.to_toml()?).map_err(|e| ConfigError::io(path, e))
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check the whole configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.serial
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.driver_config()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        for (kind, sensor) in self.sensors.iter() {
            if sensor.accuracy_decimals.is_some_and(|d| d > MAX_ACCURACY_DECIMALS) {
                return Err(ConfigError::Invalid(format!(
                    "{} sensor accuracy_decimals must be at most {}",
                    kind, MAX_ACCURACY_DECIMALS
                )));
            }
        }
        if self.sensors.is_empty() {
            tracing::warn!("no sensors configured, readings will not be published");
        }
        Ok(())
    }

    /// Resolve the driver configuration
    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            model: self.device.model,
            tube: self.device.tube,
            update_interval: self.device.update_interval,
            response_timeout: self.device.response_timeout,
            sound: self.device.sound,
            host_address: self.device.host_address.clone(),
            time_sync: self.device.time_sync,
        }
    }
}

/// Detector settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device model
    pub model: DeviceModel,
    /// Installed tube
    pub tube: TubeType,
    /// Time between polls
    #[serde(with = "humantime_serde")]
    pub update_interval: Duration,
    /// Wait for the answer to a data request
    #[serde(with = "humantime_serde")]
    pub response_timeout: Duration,
    /// Click sound
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound: Option<bool>,
    /// Address the device reports to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_address: Option<String>,
    /// Set the device clock from the host
    pub time_sync: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let driver = DriverConfig::default();
        Self {
            model: driver.model,
            tube: driver.tube,
            update_interval: driver.update_interval,
            response_timeout: driver.response_timeout,
            sound: None,
            host_address: None,
            time_sync: driver.time_sync,
        }
    }
}

/// One published sensor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Display precision
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy_decimals: Option<u8>,
}

/// Published sensors; an absent entry is not published
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorsConfig {
    /// Counts per minute
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpm: Option<SensorConfig>,
    /// Counts per second
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cps: Option<SensorConfig>,
    /// Dose rate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dose: Option<SensorConfig>,
    /// Supply voltage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voltage: Option<SensorConfig>,
}

impl SensorsConfig {
    /// Every sensor enabled with default name and precision
    pub fn all() -> Self {
        Self {
            cpm: Some(SensorConfig::default()),
            cps: Some(SensorConfig::default()),
            dose: Some(SensorConfig::default()),
            voltage: Some(SensorConfig::default()),
        }
    }

    /// Settings for one kind
    pub fn get(&self, kind: SensorKind) -> Option<&SensorConfig> {
        match kind {
            SensorKind::Cpm => self.cpm.as_ref(),
            SensorKind::Cps => self.cps.as_ref(),
            SensorKind::Dose => self.dose.as_ref(),
            SensorKind::Voltage => self.voltage.as_ref(),
        }
    }

    /// Configured sensors in publish order
    pub fn iter(&self) -> impl Iterator<Item = (SensorKind, &SensorConfig)> {
        SensorKind::all()
            .iter()
            .filter_map(|&kind| self.get(kind).map(|cfg| (kind, cfg)))
    }

    /// Whether no sensor is configured
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Bind every configured sensor to `sink`
    pub fn sink_set(&self, sink: &Arc<dyn SensorSink>) -> SinkSet {
        self.iter().fold(SinkSet::new(), |set, (kind, cfg)| {
            let mut binding = SinkBinding::new(kind, Arc::clone(sink));
            if let Some(name) = &cfg.name {
                binding = binding.name(name.clone());
            }
            if let Some(decimals) = cfg.accuracy_decimals {
                binding = binding.accuracy_decimals(decimals);
            }
            set.with(binding)
        })
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter, overridden by `RUST_LOG`
    pub level: String,
    /// Emit JSON log lines
    pub json: bool,
    /// Directory for daily rolling log files
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    /// File receiving every published value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readings_file: Option<PathBuf>,
    /// Format of `readings_file`
    pub readings_format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            directory: None,
            readings_file: None,
            readings_format: LogFormat::Csv,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::reading::Reading;
    use crate::core::sink::ChannelSink;

    const SAMPLE: &str = r#"
[serial]
port = "/dev/ttyAMA0"
baud_rate = 115200

[device]
model = "grgc2"
tube = "si29bg"
update_interval = "30s"
response_timeout = "1500ms"
sound = true

[sensors.cpm]
name = "Radiation CPM"

[sensors.dose]
accuracy_decimals = 3

[logging]
level = "debug"
readings_format = "json"
"#;

    #[test]
    fn test_parse_sample() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.serial.port, "/dev/ttyAMA0");
        assert_eq!(config.serial.data_bits, 8);
        assert_eq!(config.device.model, DeviceModel::Grgc2);
        assert_eq!(config.device.tube, TubeType::Si29bg);
        assert_eq!(config.device.update_interval, Duration::from_secs(30));
        assert_eq!(config.device.response_timeout, Duration::from_millis(1500));
        assert!(config.sensors.cps.is_none());
        assert_eq!(config.logging.readings_format, LogFormat::Json);
        config.validate().unwrap();

        let driver = config.driver_config();
        assert_eq!(driver.sound, Some(true));
        assert!(driver.host_address.is_none());
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.device.model, DeviceModel::Grgc1);
        assert_eq!(config.device.tube, TubeType::Sbm20);
        assert_eq!(config.device.update_interval, Duration::from_secs(10));
        assert!(config.sensors.is_empty());
    }

    #[test]
    fn test_unknown_tube_is_not_an_error() {
        let config = AppConfig::from_toml("[device]\ntube = \"GM-9000\"\n").unwrap();
        assert_eq!(config.device.tube, TubeType::Unknown);
    }

    #[test]
    fn test_unknown_model_is_rejected() {
        let result = AppConfig::from_toml("[device]\nmodel = \"GRGC9\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_timeout_must_fit_interval() {
        let mut config = AppConfig::default();
        config.device.response_timeout = Duration::from_secs(10);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_precision_bound() {
        let mut config = AppConfig::default();
        config.sensors.dose = Some(SensorConfig {
            name: None,
            accuracy_decimals: Some(40),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geigerd").join("config.toml");

        let mut config = AppConfig::default();
        config.sensors = SensorsConfig::all();
        config.device.host_address = Some("10.1.2.3".into());
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = AppConfig::load_from(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_sink_set_uses_sensor_settings() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();
        let (sink, mut rx) = ChannelSink::new(8);
        let sink: Arc<dyn SensorSink> = Arc::new(sink);
        let sinks = config.sensors.sink_set(&sink);
        assert_eq!(sinks.len(), 2);

        let reading = Reading {
            counts_per_minute: Some(42.0),
            dose_rate: Some(0.265_23),
            ..Reading::default()
        };
        sinks.publish(&reading);

        let cpm = rx.try_recv().unwrap();
        assert_eq!(cpm.name, "Radiation CPM");
        let dose = rx.try_recv().unwrap();
        assert_eq!(dose.accuracy_decimals, 3);
        assert_eq!(dose.formatted(), "0.265");
    }
}
