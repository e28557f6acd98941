//! Radiation readings
//!
//! A [`Reading`] is produced once per poll cycle and is never changed after
//! the cycle completes it.

use super::calibration::{self, TubeType};
use super::model::DeviceModel;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Quantity published by a sensor sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    /// Counts per minute
    Cpm,
    /// Counts per second
    Cps,
    /// Dose rate
    Dose,
    /// Tube supply voltage
    Voltage,
}

impl SensorKind {
    /// Get all kinds in publish order
    pub fn all() -> &'static [SensorKind] {
        &[
            SensorKind::Cpm,
            SensorKind::Cps,
            SensorKind::Dose,
            SensorKind::Voltage,
        ]
    }

    /// Unit of measurement
    pub fn unit(&self) -> &'static str {
        match self {
            SensorKind::Cpm => "cpm",
            SensorKind::Cps => "cps",
            SensorKind::Dose => "µSv/h",
            SensorKind::Voltage => "V",
        }
    }

    /// Decimals shown when nothing else is configured
    pub fn default_accuracy_decimals(&self) -> u8 {
        match self {
            SensorKind::Cpm | SensorKind::Cps => 0,
            SensorKind::Dose => 6,
            SensorKind::Voltage => 1,
        }
    }

    /// Default display name
    pub fn default_name(&self) -> &'static str {
        match self {
            SensorKind::Cpm => "Geiger CPM",
            SensorKind::Cps => "Geiger CPS",
            SensorKind::Dose => "Geiger Dose",
            SensorKind::Voltage => "Geiger Voltage",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorKind::Cpm => write!(f, "cpm"),
            SensorKind::Cps => write!(f, "cps"),
            SensorKind::Dose => write!(f, "dose"),
            SensorKind::Voltage => write!(f, "voltage"),
        }
    }
}

/// Where the dose rate of a reading came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoseSource {
    /// No dose rate available
    #[default]
    None,
    /// Reported by the device
    Reported,
    /// Derived from counts with the tube calibration table
    Calibrated,
}

/// One poll cycle's measurement
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Reading {
    /// Counts per minute
    pub counts_per_minute: Option<f64>,
    /// Counts per second
    pub counts_per_second: Option<f64>,
    /// Dose rate in µSv/h
    pub dose_rate: Option<f64>,
    /// Tube supply voltage in volts
    pub supply_voltage: Option<f64>,
    /// Pulses counted over the poll window, for models that report them
    pub raw_counts: Option<u32>,
    /// Origin of `dose_rate`
    pub dose_source: DoseSource,
    /// When the cycle completed the reading
    pub captured_at: Option<DateTime<Local>>,
}

impl Reading {
    /// Fill the fields the device did not report
    ///
    /// Rates come from this reading's own raw counts over `interval`. Models
    /// that report the dose rate themselves never get a calibrated one; a
    /// frame without `dose` from such a model leaves the dose empty.
    #[must_use]
    pub fn calibrated(mut self, model: DeviceModel, tube: TubeType, interval: Duration) -> Self {
        let seconds = interval.as_secs_f64();
        let derive_dose = !model.reports_dose() && self.dose_rate.is_none();

        if let Some(raw) = self.raw_counts.map(f64::from) {
            if self.counts_per_second.is_none() {
                self.counts_per_second = Some(calibration::counts_per_second(raw, seconds));
            }
            if self.counts_per_minute.is_none() {
                self.counts_per_minute = Some(calibration::counts_per_minute(raw, seconds));
            }
            if derive_dose {
                self.dose_rate = Some(calibration::dose_rate(raw, tube, seconds));
                self.dose_source = DoseSource::Calibrated;
            }
        } else if derive_dose {
            if let Some(cpm) = self.counts_per_minute {
                self.dose_rate = Some(calibration::dose_from_cpm(cpm, tube));
                self.dose_source = DoseSource::Calibrated;
            }
        }

        self
    }

    /// Stamp the capture time
    #[must_use]
    pub fn captured(mut self, at: DateTime<Local>) -> Self {
        self.captured_at = Some(at);
        self
    }

    /// Value published for a sensor kind
    pub fn value(&self, kind: SensorKind) -> Option<f64> {
        match kind {
            SensorKind::Cpm => self.counts_per_minute,
            SensorKind::Cps => self.counts_per_second,
            SensorKind::Dose => self.dose_rate,
            SensorKind::Voltage => self.supply_voltage,
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for &kind in SensorKind::all() {
            if let Some(value) = self.value(kind) {
                if !first {
                    write!(f, ", ")?;
                }
                first = false;
                write!(
                    f,
                    "{}={:.*} {}",
                    kind,
                    usize::from(kind.default_accuracy_decimals()),
                    value,
                    kind.unit()
                )?;
            }
        }
        if first {
            write!(f, "(empty)")?;
        }
        Ok(())
    }
}
