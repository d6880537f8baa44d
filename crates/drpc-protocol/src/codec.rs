//! Length-prefixed framing for [`WireMessage`] records.
//!
//! Frame layout, in stream order:
//!   1. `u32` little-endian frame length (version byte + body)
//!   2. one serializer-version byte
//!   3. JSON body (the tagged [`WireMessage`] record)
//!
//! The reader enforces `max_message_length` before allocating; an oversize
//! frame is a protocol-fatal condition for the caller.  The writer must only
//! ever be driven by a single consumer; the outgoing queue provides that
//! mutual exclusion.

use crate::WireMessage;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The serializer version this build reads and writes.
pub const SERIALIZER_VERSION: u8 = 1;

/// Frame length prefix size in bytes.
const LENGTH_PREFIX: usize = 4;

/// Errors raised by the codec.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// Frame length exceeds the configured maximum.  Fatal: the stream
    /// position is unrecoverable once a frame is refused.
    #[error("frame of {length} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { length: usize, max: usize },
    #[error("unsupported serializer version {0}")]
    UnsupportedVersion(u8),
    /// The peer closed the stream between frames.
    #[error("stream closed")]
    Closed,
}

impl CodecError {
    /// True when the error is an orderly end-of-stream on a frame boundary.
    /// An EOF inside a frame is a broken frame, not a clean close.
    pub fn is_clean_eof(&self) -> bool {
        matches!(self, CodecError::Closed)
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Reads one framed message at a time from the read half of the link.
pub struct MessageReader<R> {
    inner: R,
    max_message_length: usize,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R, max_message_length: usize) -> Self {
        Self {
            inner,
            max_message_length,
        }
    }

    /// Read exactly one message.
    ///
    /// Returns [`CodecError::Closed`] if the stream ends cleanly on a frame
    /// boundary; an EOF inside a frame surfaces as an I/O error.
    pub async fn read_message(&mut self) -> Result<WireMessage, CodecError> {
        let mut prefix = [0u8; LENGTH_PREFIX];
        match self.inner.read_exact(&mut prefix).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(CodecError::Closed);
            }
            Err(e) => return Err(CodecError::Io(e)),
        }
        let length = u32::from_le_bytes(prefix) as usize;
        if length > self.max_message_length {
            return Err(CodecError::FrameTooLarge {
                length,
                max: self.max_message_length,
            });
        }
        if length == 0 {
            return Err(CodecError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "zero-length frame",
            )));
        }
        let mut frame = vec![0u8; length];
        self.inner.read_exact(&mut frame).await?;
        let version = frame[0];
        if version != SERIALIZER_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        Ok(serde_json::from_slice(&frame[1..])?)
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Writes one framed message at a time to the write half of the link.
///
/// Not internally synchronized; the outgoing queue's single consumer is the
/// only caller.
pub struct MessageWriter<W> {
    inner: W,
    max_message_length: usize,
    flush: bool,
    version: u8,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W, max_message_length: usize, flush: bool) -> Self {
        Self {
            inner,
            max_message_length,
            flush,
            version: SERIALIZER_VERSION,
        }
    }

    /// Stamp frames with a specific serializer version.  A peer that does
    /// not speak it will refuse the first frame.
    pub fn with_serializer_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    /// Encode and write exactly one message, optionally flushing.
    pub async fn write_message(&mut self, message: &WireMessage) -> Result<(), CodecError> {
        let body = serde_json::to_vec(message)?;
        let length = body.len() + 1;
        if length > self.max_message_length {
            return Err(CodecError::FrameTooLarge {
                length,
                max: self.max_message_length,
            });
        }
        let mut frame = Vec::with_capacity(LENGTH_PREFIX + length);
        frame.extend_from_slice(&u32::try_from(length).unwrap_or(u32::MAX).to_le_bytes());
        frame.push(self.version);
        frame.extend_from_slice(&body);
        self.inner.write_all(&frame).await?;
        if self.flush {
            self.inner.flush().await?;
        }
        Ok(())
    }

    /// Flush and shut down the write half, signalling EOF to the peer.
    pub async fn shutdown(&mut self) -> Result<(), CodecError> {
        self.inner.flush().await?;
        self.inner.shutdown().await?;
        Ok(())
    }
}
