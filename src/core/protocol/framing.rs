//! Frame extraction from the serial byte stream
//!
//! Supports: JSON lines (GRGC1), sync-byte + length-prefixed binary (GRGC2)
//!
//! Both decoders hunt for a start marker before accumulating, so after a
//! partial frame is dropped the stream resynchronises on the next frame.

use super::checksum::CRC_LEN;
use crate::core::transport::TransportError;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

/// Framing protocol types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingType {
    /// JSON object per line, LF terminated
    JsonLine,
    /// `A5 LEN PAYLOAD CRC16`
    Binary,
}

impl FramingType {
    /// Get all available framing types
    pub fn all() -> &'static [FramingType] {
        &[FramingType::JsonLine, FramingType::Binary]
    }

    /// Get name of framing type
    pub fn name(&self) -> &'static str {
        match self {
            FramingType::JsonLine => "JSON lines",
            FramingType::Binary => "Binary (sync + length + CRC-16)",
        }
    }
}

// ============ Line Constants ============
const LINE_START: u8 = b'{';
const LINE_END: u8 = b'\n';

/// Longest accepted line, terminator included
pub const MAX_LINE_LEN: usize = 128;

// ============ Binary Constants ============

/// Start-of-frame marker for binary frames
pub const BINARY_SYNC: u8 = 0xA5;

/// Largest payload a binary frame may declare
pub const MAX_BINARY_PAYLOAD: usize = 32;

/// Streaming frame decoder for one model's wire format
#[derive(Debug, Clone, Copy)]
pub struct GeigerCodec {
    framing: FramingType,
}

impl GeigerCodec {
    /// Create new decoder
    pub fn new(framing: FramingType) -> Self {
        Self { framing }
    }

    /// Framing handled by this decoder
    pub fn framing(&self) -> FramingType {
        self.framing
    }
}

impl Decoder for GeigerCodec {
    type Item = Bytes;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, TransportError> {
        match self.framing {
            FramingType::JsonLine => decode_line(src),
            FramingType::Binary => decode_binary(src),
        }
    }
}

// ============ Line-based ============

fn decode_line(src: &mut BytesMut) -> Result<Option<Bytes>, TransportError> {
    match src.iter().position(|&b| b == LINE_START) {
        Some(start) => src.advance(start),
        None => {
            src.clear();
            return Ok(None);
        }
    }

    match src.iter().position(|&b| b == LINE_END) {
        Some(end) if end + 1 > MAX_LINE_LEN => {
            src.advance(end + 1);
            Err(TransportError::Framing(format!(
                "line of {} bytes exceeds {} byte limit",
                end + 1,
                MAX_LINE_LEN
            )))
        }
        Some(end) => {
            let mut line = src.split_to(end + 1);
            line.truncate(end);
            if line.last() == Some(&b'\r') {
                line.truncate(end - 1);
            }
            Ok(Some(line.freeze()))
        }
        None if src.len() >= MAX_LINE_LEN => {
            let dropped = src.len();
            src.clear();
            Err(TransportError::Framing(format!(
                "no line terminator within {} bytes",
                dropped
            )))
        }
        None => Ok(None),
    }
}

// ============ Binary ============

fn decode_binary(src: &mut BytesMut) -> Result<Option<Bytes>, TransportError> {
    match src.iter().position(|&b| b == BINARY_SYNC) {
        Some(start) => src.advance(start),
        None => {
            src.clear();
            return Ok(None);
        }
    }

    if src.len() < 2 {
        return Ok(None);
    }

    let len = usize::from(src[1]);
    if len == 0 || len > MAX_BINARY_PAYLOAD {
        // Drop the sync byte only, the real frame may start right after it
        src.advance(1);
        return Err(TransportError::Framing(format!(
            "bad length prefix {} (expected 1..={})",
            len, MAX_BINARY_PAYLOAD
        )));
    }

    let total = 2 + len + CRC_LEN;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    Ok(Some(src.split_to(total).freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(codec: &mut GeigerCodec, buf: &mut BytesMut, data: &[u8]) -> Vec<Bytes> {
        buf.extend_from_slice(data);
        let mut frames = Vec::new();
        while let Ok(Some(frame)) = codec.decode(buf) {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_line_split_across_reads() {
        let mut codec = GeigerCodec::new(FramingType::JsonLine);
        let mut buf = BytesMut::new();

        assert!(feed(&mut codec, &mut buf, b"{\"cpm\":3").is_empty());
        let frames = feed(&mut codec, &mut buf, b"60}\r\n{\"cp");
        assert_eq!(frames, vec![Bytes::from_static(b"{\"cpm\":360}")]);
        assert_eq!(&buf[..], b"{\"cp");
    }

    #[test]
    fn test_line_skips_garbage_before_start() {
        let mut codec = GeigerCodec::new(FramingType::JsonLine);
        let mut buf = BytesMut::new();

        let frames = feed(&mut codec, &mut buf, b"ose\":0.1}\n\0\0{\"cpm\":1}\n");
        assert_eq!(frames, vec![Bytes::from_static(b"{\"cpm\":1}")]);
    }

    #[test]
    fn test_overlong_line_is_framing_error() {
        let mut codec = GeigerCodec::new(FramingType::JsonLine);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"{");
        buf.extend_from_slice(&[b'x'; MAX_LINE_LEN]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(TransportError::Framing(_))
        ));
        assert!(buf.is_empty());

        buf.extend_from_slice(b"{\"cpm\":2}\n");
        assert_eq!(
            codec.decode(&mut buf).ok().flatten(),
            Some(Bytes::from_static(b"{\"cpm\":2}"))
        );
    }

    #[test]
    fn test_binary_waits_for_complete_frame() {
        let mut codec = GeigerCodec::new(FramingType::Binary);
        let mut buf = BytesMut::new();
        let frame = [0xA5, 0x06, 0, 0, 0, 60, 0x9C, 0x40, 0xD5, 0xFC];

        assert!(feed(&mut codec, &mut buf, &frame[..5]).is_empty());
        let frames = feed(&mut codec, &mut buf, &frame[5..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &frame[..]);
    }

    #[test]
    fn test_binary_bad_length_resyncs() {
        let mut codec = GeigerCodec::new(FramingType::Binary);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x13, 0xA5, 0xFF]);
        buf.extend_from_slice(&[0xA5, 0x06, 0, 0, 0, 60, 0x9C, 0x40, 0xD5, 0xFC]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(TransportError::Framing(_))
        ));
        let frame = codec.decode(&mut buf).ok().flatten();
        assert_eq!(frame.map(|f| f.len()), Some(10));
    }
}
