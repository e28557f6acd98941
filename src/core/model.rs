//! Supported Geiger counter models
//!
//! The model decides the wire format and which quantities the device reports
//! itself. It is fixed for the lifetime of a driver instance.

use super::calibration::TubeType;
use super::protocol::checksum::append_crc16;
use super::protocol::framing::{FramingType, BINARY_SYNC, MAX_BINARY_PAYLOAD};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// GRGC2 command byte: read and reset the pulse counter
pub const GRGC2_CMD_READ: u8 = 0x01;

/// GRGC1 request for a measurement
pub const GRGC1_GET_DATA: &[u8] = b"{\"get\":\"data\"}\n";

/// GRGC1 request for the device settings
pub const GRGC1_GET_CONFIG: &[u8] = b"{\"get\":\"config\"}\n";

/// Geiger counter model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceModel {
    /// GRGC1: JSON lines, reports cpm/cps/dose/voltage itself
    #[default]
    Grgc1,
    /// GRGC2: binary frames, reports raw pulse counts and supply voltage
    Grgc2,
}

impl DeviceModel {
    /// Get all supported models
    pub fn all() -> &'static [DeviceModel] {
        &[DeviceModel::Grgc1, DeviceModel::Grgc2]
    }

    /// Configuration name of the model
    pub fn name(&self) -> &'static str {
        match self {
            DeviceModel::Grgc1 => "GRGC1",
            DeviceModel::Grgc2 => "GRGC2",
        }
    }

    /// Wire framing used by the model
    pub fn framing(&self) -> FramingType {
        match self {
            DeviceModel::Grgc1 => FramingType::JsonLine,
            DeviceModel::Grgc2 => FramingType::Binary,
        }
    }

    /// Whether the device reports the dose rate itself
    pub fn reports_dose(&self) -> bool {
        matches!(self, DeviceModel::Grgc1)
    }

    /// Whether the device accepts settings and clock pushes
    pub fn accepts_settings(&self) -> bool {
        matches!(self, DeviceModel::Grgc1)
    }

    /// Request that asks the device for one measurement
    pub fn data_request(&self) -> Vec<u8> {
        match self {
            DeviceModel::Grgc1 => GRGC1_GET_DATA.to_vec(),
            DeviceModel::Grgc2 => grgc2_frame(&[GRGC2_CMD_READ]),
        }
    }
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DeviceModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase().replace(' ', "_");
        match normalized.as_str() {
            "GRGC1" => Ok(Self::Grgc1),
            "GRGC2" => Ok(Self::Grgc2),
            _ => Err(format!(
                "unknown geiger model '{}', expected one of: GRGC1, GRGC2",
                s
            )),
        }
    }
}

impl TryFrom<String> for DeviceModel {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceModel> for String {
    fn from(model: DeviceModel) -> Self {
        model.name().to_string()
    }
}

/// Build a GRGC2 frame around `payload`
///
/// The payload must hold 1 to [`MAX_BINARY_PAYLOAD`] bytes, the lengths the
/// framing layer accepts. Debug builds panic on anything else.
pub fn grgc2_frame(payload: &[u8]) -> Vec<u8> {
    debug_assert!(
        (1..=MAX_BINARY_PAYLOAD).contains(&payload.len()),
        "GRGC2 payload of {} bytes outside 1..={MAX_BINARY_PAYLOAD}",
        payload.len()
    );
    let payload = &payload[..payload.len().min(MAX_BINARY_PAYLOAD)];
    let len = u8::try_from(payload.len()).unwrap_or(u8::MAX);
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.push(len);
    frame.extend_from_slice(payload);
    append_crc16(&mut frame);
    frame.insert(0, BINARY_SYNC);
    frame
}

#[derive(Serialize)]
struct SettingsCommand<'a> {
    sound: u8,
    tube: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip: Option<&'a str>,
}

#[derive(Serialize)]
struct ClockCommand {
    date: String,
    time: String,
}

/// GRGC1 command storing sound, tube and reporting address on the device
pub fn grgc1_settings_command(
    sound: bool,
    tube: TubeType,
    ip: Option<&str>,
) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(&SettingsCommand {
        sound: u8::from(sound),
        tube: tube.device_code(),
        ip,
    })?;
    line.push(b'\n');
    Ok(line)
}

/// GRGC1 command setting the device clock
pub fn grgc1_clock_command(time: &DateTime<Local>) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(&ClockCommand {
        date: time.format("%m/%d/%Y").to_string(),
        time: time.format("%H:%M:%S").to_string(),
    })?;
    line.push(b'\n');
    Ok(line)
}
