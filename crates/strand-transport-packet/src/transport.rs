//! Byte transport traits
//!
//! The packet multiplexer runs over any full-duplex byte channel (TCP,
//! TLS-wrapped TCP, a test pipe). The two halves are separate traits so the
//! receive loop owns its half outright and never starves senders of the
//! send lock.

use async_trait::async_trait;
use bytes::Bytes;
use strand_mux::MuxError;
use thiserror::Error;

/// Byte transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout")]
    Timeout,
}

impl From<TransportError> for MuxError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ProtocolError(msg) => MuxError::ProtocolViolation(msg),
            _ => MuxError::ConnectionLost,
        }
    }
}

/// The sending half of a byte connection
///
/// Each `send` call is one atomic write: packets from different streams
/// interleave only between calls, never inside one.
#[async_trait]
pub trait ByteSink: Send {
    /// Write `data` to the connection
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError>;

    /// Close the connection
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// The receiving half of a byte connection
#[async_trait]
pub trait ByteSource: Send {
    /// Receive the next chunk of bytes, `None` at end of stream
    ///
    /// Chunk boundaries carry no meaning; a frame may arrive split across
    /// any number of chunks.
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError>;
}
