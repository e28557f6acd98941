//! Wire protocol helpers
//!
//! - Framing (JSON lines, sync + length-prefixed binary)
//! - Checksums (CRC-16/Modbus)

pub mod checksum;
pub mod framing;

pub use checksum::crc16_modbus;
pub use framing::{FramingType, GeigerCodec, BINARY_SYNC, MAX_BINARY_PAYLOAD, MAX_LINE_LEN};
