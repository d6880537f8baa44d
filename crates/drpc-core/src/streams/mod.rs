//! Stream subsystem.
//!
//! Long-lived byte transfers layered on the message stream.  The producing
//! side registers an outgoing stream and waits for the consumer's
//! `stream_start`; thereafter exactly one chunk is in flight, enforced by a
//! chunk-ack correlated through the pending-request registry.  Small
//! payloads with known length skip all of this and travel inline.

pub(crate) mod incoming;
pub(crate) mod outgoing;

pub use incoming::IncomingHandle;

use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt};

/// A byte source handed to the processor for outbound transfer.
///
/// Wraps any `AsyncRead`; the length, when known, enables inline shipping
/// for small payloads and overrun detection for large ones.
pub struct ByteSource {
    reader: Pin<Box<dyn AsyncRead + Send>>,
    length: Option<u64>,
}

impl ByteSource {
    /// In-memory source with known length.
    pub fn from_bytes(bytes: Vec<u8>) -> ByteSource {
        let length = bytes.len() as u64;
        ByteSource {
            reader: Box::pin(std::io::Cursor::new(bytes)),
            length: Some(length),
        }
    }

    /// Arbitrary reader; pass the total length when it is known up front.
    pub fn from_reader(reader: impl AsyncRead + Send + 'static, length: Option<u64>) -> ByteSource {
        ByteSource {
            reader: Box::pin(reader),
            length,
        }
    }

    pub fn length(&self) -> Option<u64> {
        self.length
    }

    /// Read up to `max` bytes, filling the buffer until full or EOF.
    /// A short (or empty) result means the source is exhausted.
    pub(crate) async fn read_chunk(&mut self, max: usize) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; max];
        let mut filled = 0;
        while filled < max {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Drain the whole source, refusing to grow past `limit`.
    pub(crate) async fn read_all(&mut self, limit: usize) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let chunk = self.read_chunk(8 * 1024).await?;
            if chunk.is_empty() {
                return Ok(out);
            }
            if out.len() + chunk.len() > limit {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("source exceeded inline limit of {limit} bytes"),
                ));
            }
            out.extend_from_slice(&chunk);
        }
    }
}

impl std::fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteSource")
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}
