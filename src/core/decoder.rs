//! Frame decoding
//!
//! Turns one complete frame, as cut by the transport, into a [`Reading`] or a
//! settings report. Decoding depends only on the frame bytes and the model.

use super::model::DeviceModel;
use super::protocol::checksum::{crc16_modbus, stored_crc16, CRC_LEN};
use super::protocol::framing::BINARY_SYNC;
use super::reading::{DoseSource, Reading};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// GRGC2 header: sync byte and length byte
const GRGC2_HEADER_LEN: usize = 2;

/// GRGC2 sample payload: pulses (u32 BE) and supply centivolts (u16 BE)
pub const GRGC2_SAMPLE_PAYLOAD_LEN: usize = 6;

/// Decode error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// CRC trailer does not match the frame
    #[error("Checksum mismatch: frame carries {received:#06x}, computed {computed:#06x}")]
    Checksum {
        /// CRC carried by the frame
        received: u16,
        /// CRC computed over the frame
        computed: u16,
    },

    /// Frame ends before its layout is complete
    #[error("Truncated frame ({len} bytes): {detail}")]
    TruncatedFrame {
        /// Frame length
        len: usize,
        /// What was missing
        detail: String,
    },

    /// Frame is complete but not understood
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Frame is valid but is not a measurement
    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),
}

/// Settings report sent by a GRGC1 in answer to `{"get":"config"}`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Click sound enabled (0/1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound: Option<u8>,
    /// Tube code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tube: Option<u8>,
    /// Address the device was told to report to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Device unit identifier
    #[serde(default, rename = "unitID", skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<u32>,
    /// Wireless network the device joined
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssid: Option<String>,
    /// Device host name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    /// Measurement
    Sample(Reading),
    /// Settings report
    Settings(DeviceSettings),
}

#[derive(Debug, Deserialize)]
struct Grgc1Sample {
    cpm: f64,
    #[serde(default)]
    cps: Option<f64>,
    #[serde(default)]
    dose: Option<f64>,
    #[serde(default)]
    voltage: Option<f64>,
}

/// Decode a frame that must be a measurement
pub fn decode(bytes: &[u8], model: DeviceModel) -> Result<Reading, DecodeError> {
    match decode_message(bytes, model)? {
        DeviceMessage::Sample(reading) => Ok(reading),
        DeviceMessage::Settings(_) => Err(DecodeError::UnexpectedMessage(
            "settings report where a measurement was expected".into(),
        )),
    }
}

/// Decode any frame the model can send
pub fn decode_message(bytes: &[u8], model: DeviceModel) -> Result<DeviceMessage, DecodeError> {
    match model {
        DeviceModel::Grgc1 => decode_grgc1(bytes),
        DeviceModel::Grgc2 => decode_grgc2(bytes),
    }
}

// ============ GRGC1 (JSON lines) ============

fn decode_grgc1(bytes: &[u8]) -> Result<DeviceMessage, DecodeError> {
    let value: serde_json::Value = serde_json::from_slice(bytes).map_err(|e| {
        if e.is_eof() {
            DecodeError::TruncatedFrame {
                len: bytes.len(),
                detail: e.to_string(),
            }
        } else {
            DecodeError::Malformed(e.to_string())
        }
    })?;

    let Some(object) = value.as_object() else {
        return Err(DecodeError::Malformed("expected a JSON object".into()));
    };

    if object.contains_key("cpm") {
        let sample: Grgc1Sample = serde_json::from_value(value)
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let dose_source = if sample.dose.is_some() {
            DoseSource::Reported
        } else {
            DoseSource::None
        };
        Ok(DeviceMessage::Sample(Reading {
            counts_per_minute: Some(sample.cpm),
            counts_per_second: sample.cps,
            dose_rate: sample.dose,
            supply_voltage: sample.voltage,
            raw_counts: None,
            dose_source,
            captured_at: None,
        }))
    } else {
        let settings: DeviceSettings = serde_json::from_value(value)
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;
        Ok(DeviceMessage::Settings(settings))
    }
}

// ============ GRGC2 (binary) ============

fn decode_grgc2(bytes: &[u8]) -> Result<DeviceMessage, DecodeError> {
    if bytes.len() < GRGC2_HEADER_LEN + CRC_LEN {
        return Err(DecodeError::TruncatedFrame {
            len: bytes.len(),
            detail: format!("shorter than header and CRC ({} bytes)", GRGC2_HEADER_LEN + CRC_LEN),
        });
    }
    if bytes[0] != BINARY_SYNC {
        return Err(DecodeError::Malformed(format!(
            "frame starts with {:#04x}, expected sync {:#04x}",
            bytes[0], BINARY_SYNC
        )));
    }

    let len = usize::from(bytes[1]);
    let crc_at = GRGC2_HEADER_LEN + len;
    if bytes.len() < crc_at + CRC_LEN {
        return Err(DecodeError::TruncatedFrame {
            len: bytes.len(),
            detail: format!("length byte announces {} payload bytes", len),
        });
    }
    if bytes.len() > crc_at + CRC_LEN {
        return Err(DecodeError::Malformed(format!(
            "{} trailing bytes after CRC",
            bytes.len() - crc_at - CRC_LEN
        )));
    }

    let computed = crc16_modbus(&bytes[1..crc_at]);
    let received = stored_crc16([bytes[crc_at], bytes[crc_at + 1]]);
    if computed != received {
        return Err(DecodeError::Checksum { received, computed });
    }

    let payload = &bytes[GRGC2_HEADER_LEN..crc_at];
    if payload.len() < GRGC2_SAMPLE_PAYLOAD_LEN {
        return Err(DecodeError::TruncatedFrame {
            len: bytes.len(),
            detail: format!(
                "sample payload needs {} bytes, frame has {}",
                GRGC2_SAMPLE_PAYLOAD_LEN,
                payload.len()
            ),
        });
    }

    let pulses = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let centivolts = u16::from_be_bytes([payload[4], payload[5]]);

    Ok(DeviceMessage::Sample(Reading {
        raw_counts: Some(pulses),
        supply_voltage: Some(f64::from(centivolts) / 100.0),
        ..Reading::default()
    }))
}

/// Encode a GRGC2 sample frame
pub fn encode_grgc2_sample(pulses: u32, supply_voltage: f64) -> Vec<u8> {
    // Saturating float-to-int cast, negative voltages clamp to 0
    let centivolts = (supply_voltage * 100.0).round() as u16;
    let mut payload = Vec::with_capacity(GRGC2_SAMPLE_PAYLOAD_LEN);
    payload.extend_from_slice(&pulses.to_be_bytes());
    payload.extend_from_slice(&centivolts.to_be_bytes());
    super::model::grgc2_frame(&payload)
}
