//! Geiger-Müller tube calibration
//!
//! Converts pulse counts into an ambient dose rate. Factors are the
//! manufacturer / community figures for Cs-137 and are stored in µSv/h per
//! count-per-minute, the unit tube datasheets use.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Geiger-Müller tube model
///
/// The discriminant is the code the GRGC1 firmware expects in its `tube`
/// setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
#[repr(u8)]
pub enum TubeType {
    /// Tube not known, uses [`DEFAULT_CPM_FACTOR`]
    Unknown = 0,
    /// SBM-20
    #[default]
    Sbm20 = 1,
    /// SI-29BG
    Si29bg = 2,
    /// SBM-19
    Sbm19 = 3,
    /// LND 712
    Lnd712 = 4,
    /// SBM-20M
    Sbm20m = 5,
    /// SI-22G
    Si22g = 6,
    /// STS-5
    Sts5 = 7,
    /// SI-3BG
    Si3bg = 8,
    /// SBM-21
    Sbm21 = 9,
    /// SBT-9
    Sbt9 = 10,
    /// SI-1G
    Si1g = 11,
    /// J305
    J305 = 12,
    /// M4011
    M4011 = 13,
}

/// Factor used for [`TubeType::Unknown`]: the SBM-20 figure, the most common
/// tube in hobby counters
pub const DEFAULT_CPM_FACTOR: f64 = 0.006315;

/// Fixed calibration table, µSv/h per CPM
const CALIBRATION_TABLE: &[(TubeType, f64)] = &[
    (TubeType::Sbm20, 0.006315),
    (TubeType::Si29bg, 0.010000),
    (TubeType::Sbm19, 0.001500),
    (TubeType::Lnd712, 0.005940),
    (TubeType::Sbm20m, 0.013333),
    (TubeType::Si22g, 0.001714),
    (TubeType::Sts5, 0.006666),
    (TubeType::Si3bg, 0.631578),
    (TubeType::Sbm21, 0.048000),
    (TubeType::Sbt9, 0.010900),
    (TubeType::Si1g, 0.006000),
    (TubeType::J305, 0.008100),
    (TubeType::M4011, 0.006500),
];

impl TubeType {
    /// Get all tube types, `Unknown` first
    pub fn all() -> &'static [TubeType] {
        &[
            TubeType::Unknown,
            TubeType::Sbm20,
            TubeType::Si29bg,
            TubeType::Sbm19,
            TubeType::Lnd712,
            TubeType::Sbm20m,
            TubeType::Si22g,
            TubeType::Sts5,
            TubeType::Si3bg,
            TubeType::Sbm21,
            TubeType::Sbt9,
            TubeType::Si1g,
            TubeType::J305,
            TubeType::M4011,
        ]
    }

    /// Configuration name of the tube
    pub fn name(&self) -> &'static str {
        match self {
            TubeType::Unknown => "Unknown",
            TubeType::Sbm20 => "SBM20",
            TubeType::Si29bg => "SI29BG",
            TubeType::Sbm19 => "SBM19",
            TubeType::Lnd712 => "LND712",
            TubeType::Sbm20m => "SBM20M",
            TubeType::Si22g => "SI22G",
            TubeType::Sts5 => "STS5",
            TubeType::Si3bg => "SI3BG",
            TubeType::Sbm21 => "SBM21",
            TubeType::Sbt9 => "SBT9",
            TubeType::Si1g => "SI1G",
            TubeType::J305 => "J305",
            TubeType::M4011 => "M4011",
        }
    }

    /// Numeric code sent to the device
    pub fn device_code(&self) -> u8 {
        *self as u8
    }

    /// Dose factor in µSv/h per CPM
    pub fn cpm_factor(&self) -> f64 {
        CALIBRATION_TABLE
            .iter()
            .find(|(tube, _)| tube == self)
            .map_or(DEFAULT_CPM_FACTOR, |(_, factor)| *factor)
    }

    /// Dose factor in µSv/h per count-per-second
    pub fn calibration_factor(&self) -> f64 {
        self.cpm_factor() * 60.0
    }
}

impl fmt::Display for TubeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TubeType {
    type Err = std::convert::Infallible;

    /// Unrecognised names resolve to [`TubeType::Unknown`]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, '-' | ' ' | '_'))
            .collect::<String>()
            .to_uppercase();
        Ok(Self::all()
            .iter()
            .copied()
            .find(|tube| tube.name().eq_ignore_ascii_case(&normalized))
            .unwrap_or(TubeType::Unknown))
    }
}

impl From<String> for TubeType {
    fn from(value: String) -> Self {
        match value.parse() {
            Ok(tube) => tube,
            Err(never) => match never {},
        }
    }
}

impl From<TubeType> for String {
    fn from(tube: TubeType) -> Self {
        tube.name().to_string()
    }
}

/// Counts per second over a poll window
pub fn counts_per_second(raw_counts: f64, interval_seconds: f64) -> f64 {
    if interval_seconds > 0.0 {
        raw_counts / interval_seconds
    } else {
        0.0
    }
}

/// Counts per minute over a poll window
pub fn counts_per_minute(raw_counts: f64, interval_seconds: f64) -> f64 {
    counts_per_second(raw_counts, interval_seconds) * 60.0
}

/// Dose rate in µSv/h: `raw_counts / interval_seconds * calibration_factor`
///
/// A non-positive interval yields `0.0`.
pub fn dose_rate(raw_counts: f64, tube: TubeType, interval_seconds: f64) -> f64 {
    counts_per_second(raw_counts, interval_seconds) * tube.calibration_factor()
}

/// Dose rate in µSv/h from a counts-per-minute figure
pub fn dose_from_cpm(cpm: f64, tube: TubeType) -> f64 {
    cpm * tube.cpm_factor()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_sbm20_scenario() {
        // 60 counts in 10 s on an SBM20
        assert!(close(counts_per_minute(60.0, 10.0), 360.0));
        assert!(close(
            dose_rate(60.0, TubeType::Sbm20, 10.0),
            60.0 / 10.0 * TubeType::Sbm20.calibration_factor()
        ));
        assert!(close(dose_rate(60.0, TubeType::Sbm20, 10.0), 360.0 * 0.006315));
    }

    #[test]
    fn test_dose_rate_is_linear_in_counts() {
        for &tube in TubeType::all() {
            for interval in [1.0, 10.0, 60.0] {
                let one = dose_rate(1.0, tube, interval);
                for counts in [0.0, 7.0, 250.0, 10_000.0] {
                    assert!((dose_rate(counts, tube, interval) - counts * one).abs() < 1e-6);
                }
            }
        }
    }

    #[test]
    fn test_unknown_tube_uses_default_factor() {
        assert!(close(TubeType::Unknown.cpm_factor(), DEFAULT_CPM_FACTOR));
        assert_eq!("XYZ-42".parse::<TubeType>(), Ok(TubeType::Unknown));
        assert_eq!(TubeType::from(String::new()), TubeType::Unknown);
    }

    #[test]
    fn test_every_known_tube_has_an_entry() {
        for &tube in &TubeType::all()[1..] {
            assert!(CALIBRATION_TABLE.iter().any(|(t, _)| *t == tube), "{tube}");
        }
    }

    #[test]
    fn test_name_parsing_and_codes() {
        assert_eq!("SBM-20".parse::<TubeType>(), Ok(TubeType::Sbm20));
        assert_eq!("si29bg".parse::<TubeType>(), Ok(TubeType::Si29bg));
        assert_eq!("M4011".parse::<TubeType>(), Ok(TubeType::M4011));
        assert_eq!(TubeType::Unknown.device_code(), 0);
        assert_eq!(TubeType::Sbm20.device_code(), 1);
        assert_eq!(TubeType::M4011.device_code(), 13);
    }

    #[test]
    fn test_zero_interval_does_not_divide() {
        assert!(close(dose_rate(10.0, TubeType::Sbm20, 0.0), 0.0));
    }
}
