//! Shared error taxonomy for the multiplexing core

use strand_proto::FrameError;
use thiserror::Error;

/// Multiplexer errors
///
/// `Clone` because a fatal connection error fans out to every stream that
/// was still active when it occurred.
#[derive(Debug, Clone, Error)]
pub enum MuxError {
    /// Malformed frame, out-of-order stream id, oversize frame. Fatal to
    /// the connection; every live stream is aborted with it.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The peer aborted this stream. Recoverable at the stream level.
    #[error("Stream reset by peer (code {0})")]
    StreamReset(u64),

    /// The underlying transport went away without a Close frame.
    #[error("Connection lost")]
    ConnectionLost,

    /// The connection was shut down deliberately.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// The operation was canceled by its caller. Constructed by callers
    /// through `MuxStream::abort` when they abandon a pending exchange
    /// (e.g. a request timeout); on the wire, cancellation travels as a
    /// stream reset with `reset_code::CANCELED` instead.
    #[error("Operation canceled")]
    Canceled,

    /// Data was sent after the fin for that direction.
    #[error("Stream direction already finished")]
    StreamFinished,

    /// The peer finished the stream with bytes still owed to the receiver.
    #[error("Stream finished before the requested data arrived")]
    TruncatedStream,

    /// A zero-length message without fin has no wire representation.
    #[error("Zero-length send requires fin")]
    EmptySend,

    /// Invalid configuration values.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<FrameError> for MuxError {
    fn from(err: FrameError) -> Self {
        MuxError::ProtocolViolation(err.to_string())
    }
}
