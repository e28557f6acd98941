//! Frame transport over any async byte stream

use super::{TransportError, TransportStats, TransportTrait, TransportType};
use crate::core::protocol::{FramingType, GeigerCodec};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::codec::Decoder;

const READ_CHUNK: usize = 256;

/// Transport over an `AsyncRead + AsyncWrite` stream
///
/// Received bytes are kept in an internal buffer between reads, so a frame may
/// arrive across several `read_frame` calls. `reset_framing` clears it.
pub struct StreamTransport<S> {
    io: S,
    codec: GeigerCodec,
    rx_buffer: BytesMut,
    stats: TransportStats,
    kind: TransportType,
    info: String,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Create a transport decoding `framing` from `io`
    pub fn new(io: S, framing: FramingType) -> Self {
        Self {
            io,
            codec: GeigerCodec::new(framing),
            rx_buffer: BytesMut::with_capacity(READ_CHUNK),
            stats: TransportStats::default(),
            kind: TransportType::Stream,
            info: format!("stream ({})", framing.name()),
        }
    }

    /// Set the type and description reported for this transport
    #[must_use]
    pub fn with_info(mut self, kind: TransportType, info: impl Into<String>) -> Self {
        self.kind = kind;
        self.info = info.into();
        self
    }

    /// Number of received bytes not yet consumed by a frame
    pub fn buffered(&self) -> usize {
        self.rx_buffer.len()
    }

    /// Give back the underlying stream
    pub fn into_inner(self) -> S {
        self.io
    }
}

#[async_trait]
impl<S> TransportTrait for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.io.write_all(data).await?;
        self.io.flush().await?;

        self.stats.bytes_sent += data.len() as u64;
        self.stats.frames_sent += 1;
        tracing::trace!(bytes = data.len(), "request sent");

        Ok(data.len())
    }

    async fn read_frame(&mut self, timeout: Duration) -> Result<Bytes, TransportError> {
        let deadline = Instant::now() + timeout;

        loop {
            match self.codec.decode(&mut self.rx_buffer) {
                Ok(Some(frame)) => {
                    self.stats.frames_received += 1;
                    tracing::debug!(len = frame.len(), "frame received");
                    return Ok(frame);
                }
                Ok(None) => {}
                Err(e) => {
                    self.stats.framing_errors += 1;
                    return Err(e);
                }
            }

            self.rx_buffer.reserve(READ_CHUNK);
            let read = match tokio::time::timeout_at(
                deadline,
                self.io.read_buf(&mut self.rx_buffer),
            )
            .await
            {
                Ok(result) => result?,
                Err(_) => return Err(TransportError::Timeout(timeout)),
            };

            if read == 0 {
                return Err(TransportError::Disconnected);
            }
            self.stats.bytes_received += read as u64;
        }
    }

    async fn discard_input(&mut self) -> Result<Vec<Bytes>, TransportError> {
        loop {
            self.rx_buffer.reserve(READ_CHUNK);
            // A zero timeout still polls the read once
            match tokio::time::timeout(Duration::ZERO, self.io.read_buf(&mut self.rx_buffer)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(read)) => self.stats.bytes_received += read as u64,
                Ok(Err(e)) => return Err(e.into()),
            }
        }

        let mut frames = Vec::new();
        loop {
            match self.codec.decode(&mut self.rx_buffer) {
                Ok(Some(frame)) => {
                    self.stats.frames_received += 1;
                    frames.push(frame);
                }
                Ok(None) => break,
                Err(e) => {
                    self.stats.framing_errors += 1;
                    tracing::debug!(error = %e, "framing error in stale input");
                }
            }
        }
        self.reset_framing();

        if !frames.is_empty() {
            tracing::debug!(frames = frames.len(), "stale frames drained");
        }
        Ok(frames)
    }

    fn reset_framing(&mut self) {
        if !self.rx_buffer.is_empty() {
            tracing::debug!(bytes = self.rx_buffer.len(), "dropping partial frame");
            self.stats.partial_frames_dropped += 1;
            self.rx_buffer.clear();
        }
    }

    fn transport_type(&self) -> TransportType {
        self.kind
    }

    fn connection_info(&self) -> String {
        self.info.clone()
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_frame_across_writes() -> Result<(), TransportError> {
        let (mut host, device) = tokio::io::duplex(64);
        let mut transport = StreamTransport::new(device, FramingType::JsonLine);

        host.write_all(b"{\"cpm\":").await?;
        let pending = transport.read_frame(Duration::from_millis(20)).await;
        assert!(matches!(pending, Err(TransportError::Timeout(_))));
        assert_eq!(transport.buffered(), 7);

        host.write_all(b"12}\n").await?;
        let frame = transport.read_frame(Duration::from_millis(200)).await?;
        assert_eq!(&frame[..], b"{\"cpm\":12}");
        assert_eq!(transport.stats().frames_received, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_reset_drops_partial_frame() -> Result<(), TransportError> {
        let (mut host, device) = tokio::io::duplex(64);
        let mut transport = StreamTransport::new(device, FramingType::JsonLine);

        host.write_all(b"{\"cpm\":5").await?;
        let _ = transport.read_frame(Duration::from_millis(20)).await;
        transport.reset_framing();
        assert_eq!(transport.buffered(), 0);

        // Tail of the abandoned frame, then a fresh one
        host.write_all(b"0,\"cps\":1}\n{\"cpm\":7}\n").await?;
        let frame = transport.read_frame(Duration::from_millis(200)).await?;
        assert_eq!(&frame[..], b"{\"cpm\":7}");
        assert_eq!(transport.stats().partial_frames_dropped, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_discard_input_drains_without_waiting() -> Result<(), TransportError> {
        let (mut host, device) = tokio::io::duplex(256);
        let mut transport = StreamTransport::new(device, FramingType::JsonLine);

        host.write_all(b"{\"cpm\":1}\n{\"sound\":1}\n{\"cpm\":").await?;
        let frames = tokio::time::timeout(Duration::from_millis(200), transport.discard_input())
            .await
            .map_err(|_| TransportError::Timeout(Duration::from_millis(200)))??;
        assert_eq!(
            frames,
            vec![Bytes::from_static(b"{\"cpm\":1}"), Bytes::from_static(b"{\"sound\":1}")]
        );
        assert_eq!(transport.buffered(), 0);
        assert_eq!(transport.stats().partial_frames_dropped, 1);

        // Nothing pending: returns at once with no frames
        assert!(transport.discard_input().await?.is_empty());

        host.write_all(b"{\"cpm\":2}\n").await?;
        let frame = transport.read_frame(Duration::from_millis(200)).await?;
        assert_eq!(&frame[..], b"{\"cpm\":2}");
        Ok(())
    }

    #[tokio::test]
    async fn test_send_writes_request() -> Result<(), TransportError> {
        let (mut host, device) = tokio::io::duplex(64);
        let mut transport = StreamTransport::new(device, FramingType::JsonLine);

        transport.send(b"{\"get\":\"data\"}\n").await?;
        let mut buf = vec![0u8; 32];
        let n = host.read(&mut buf).await?;
        assert_eq!(&buf[..n], b"{\"get\":\"data\"}\n");
        assert_eq!(transport.stats().bytes_sent, 15);
        Ok(())
    }

    #[tokio::test]
    async fn test_closed_stream_is_disconnect() {
        let (host, device) = tokio::io::duplex(64);
        let mut transport = StreamTransport::new(device, FramingType::Binary);
        drop(host);

        let result = transport.read_frame(Duration::from_millis(200)).await;
        assert!(matches!(result, Err(TransportError::Disconnected)));
    }
}
