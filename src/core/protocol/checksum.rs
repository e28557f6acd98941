//! Frame checksums
//!
//! GRGC2 binary frames carry a CRC-16/Modbus trailer, little-endian, computed
//! over the length byte and the payload.

/// Size of the CRC trailer in bytes
pub const CRC_LEN: usize = 2;

/// CRC-16/Modbus
/// Polynomial: 0x8005, Init: 0xFFFF, RefIn: true, RefOut: true, XorOut: 0x0000
pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;

    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }

    crc
}

/// Append the CRC of `frame` to it
pub fn append_crc16(frame: &mut Vec<u8>) {
    let crc = crc16_modbus(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Read the little-endian CRC trailer stored in `trailer`
pub fn stored_crc16(trailer: [u8; CRC_LEN]) -> u16 {
    u16::from_le_bytes(trailer)
}
