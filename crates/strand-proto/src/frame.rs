//! Multiplexing frame definitions and codec
//!
//! Every frame starts with a type byte followed by a varint `size` covering
//! the rest of the frame. Stream-typed frames then carry a varint stream id;
//! connection-scoped frames do not.

use crate::varint::{decode_varint, encode_varint, varint_len};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Frame types on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Stream = 1,
    StreamLast = 2,
    StreamReset = 3,
    Initialize = 4,
    Close = 5,
    ValidateConnection = 6,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameType::Stream),
            2 => Ok(FrameType::StreamLast),
            3 => Ok(FrameType::StreamReset),
            4 => Ok(FrameType::Initialize),
            5 => Ok(FrameType::Close),
            6 => Ok(FrameType::ValidateConnection),
            _ => Err(FrameError::InvalidFrameType(value)),
        }
    }
}

/// Frame codec errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Value does not fit in a varint: {0}")]
    VarintOverflow(u64),

    #[error("Malformed frame: {0}")]
    Malformed(&'static str),

    #[error("Close reason is not valid UTF-8")]
    InvalidReason,
}

/// A decoded multiplexing frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Stream data, more to follow
    Stream { stream_id: u64, payload: Bytes },
    /// Final stream data for one direction (the fin signal)
    StreamLast { stream_id: u64, payload: Bytes },
    /// Protocol-level stream abort
    StreamReset { stream_id: u64, error_code: u64 },
    /// Connection setup, sent by each side before any application stream
    Initialize { version: u64 },
    /// Graceful connection shutdown
    Close { error_code: u64, reason: String },
    /// Keep-alive, ignored by the receiver
    ValidateConnection,
}

impl Frame {
    /// Frame type byte for this frame
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Stream { .. } => FrameType::Stream,
            Frame::StreamLast { .. } => FrameType::StreamLast,
            Frame::StreamReset { .. } => FrameType::StreamReset,
            Frame::Initialize { .. } => FrameType::Initialize,
            Frame::Close { .. } => FrameType::Close,
            Frame::ValidateConnection => FrameType::ValidateConnection,
        }
    }

    /// Stream id, for stream-typed frames
    pub fn stream_id(&self) -> Option<u64> {
        match self {
            Frame::Stream { stream_id, .. }
            | Frame::StreamLast { stream_id, .. }
            | Frame::StreamReset { stream_id, .. } => Some(*stream_id),
            _ => None,
        }
    }

    /// Whether this frame carries the fin signal
    pub fn is_fin(&self) -> bool {
        matches!(self, Frame::StreamLast { .. })
    }

    /// Encode the frame to bytes
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let size = match self {
            Frame::Stream { stream_id, payload } | Frame::StreamLast { stream_id, payload } => {
                varint_len(*stream_id) + payload.len()
            }
            Frame::StreamReset {
                stream_id,
                error_code,
            } => varint_len(*stream_id) + varint_len(*error_code),
            Frame::Initialize { version } => varint_len(*version),
            Frame::Close { error_code, reason } => varint_len(*error_code) + reason.len(),
            Frame::ValidateConnection => 0,
        };

        let mut buf = BytesMut::with_capacity(1 + varint_len(size as u64) + size);
        buf.put_u8(self.frame_type() as u8);
        encode_varint(&mut buf, size as u64)?;

        match self {
            Frame::Stream { stream_id, payload } | Frame::StreamLast { stream_id, payload } => {
                encode_varint(&mut buf, *stream_id)?;
                buf.put(payload.clone());
            }
            Frame::StreamReset {
                stream_id,
                error_code,
            } => {
                encode_varint(&mut buf, *stream_id)?;
                encode_varint(&mut buf, *error_code)?;
            }
            Frame::Initialize { version } => {
                encode_varint(&mut buf, *version)?;
            }
            Frame::Close { error_code, reason } => {
                encode_varint(&mut buf, *error_code)?;
                buf.put(reason.as_bytes());
            }
            Frame::ValidateConnection => {}
        }

        Ok(buf.freeze())
    }

    /// Decode one frame from the front of `buf`
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a complete frame;
    /// nothing is consumed in that case. The declared size is checked
    /// against `max_frame_size` before any payload is buffered.
    pub fn decode(buf: &mut BytesMut, max_frame_size: usize) -> Result<Option<Frame>, FrameError> {
        let mut peek: &[u8] = &buf[..];
        if peek.is_empty() {
            return Ok(None);
        }

        let frame_type = FrameType::try_from(peek.get_u8())?;

        let size = match decode_varint(&mut peek)? {
            Some(size) => size as usize,
            None => return Ok(None),
        };
        if size > max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size,
                max: max_frame_size,
            });
        }
        if peek.remaining() < size {
            return Ok(None);
        }

        let header_len = buf.len() - peek.remaining();
        let mut body = buf.split_to(header_len + size);
        body.advance(header_len);
        let mut body = body.freeze();

        let frame = match frame_type {
            FrameType::Stream | FrameType::StreamLast => {
                let stream_id = decode_varint(&mut body)?
                    .ok_or(FrameError::Malformed("stream frame missing stream id"))?;
                if frame_type == FrameType::Stream {
                    Frame::Stream {
                        stream_id,
                        payload: body,
                    }
                } else {
                    Frame::StreamLast {
                        stream_id,
                        payload: body,
                    }
                }
            }
            FrameType::StreamReset => {
                let stream_id = decode_varint(&mut body)?
                    .ok_or(FrameError::Malformed("reset frame missing stream id"))?;
                let error_code = decode_varint(&mut body)?
                    .ok_or(FrameError::Malformed("reset frame missing error code"))?;
                if body.has_remaining() {
                    return Err(FrameError::Malformed("trailing bytes in reset frame"));
                }
                Frame::StreamReset {
                    stream_id,
                    error_code,
                }
            }
            FrameType::Initialize => {
                let version = decode_varint(&mut body)?
                    .ok_or(FrameError::Malformed("initialize frame missing version"))?;
                if body.has_remaining() {
                    return Err(FrameError::Malformed("trailing bytes in initialize frame"));
                }
                Frame::Initialize { version }
            }
            FrameType::Close => {
                let error_code = decode_varint(&mut body)?
                    .ok_or(FrameError::Malformed("close frame missing error code"))?;
                let reason = String::from_utf8(body.to_vec())
                    .map_err(|_| FrameError::InvalidReason)?;
                Frame::Close { error_code, reason }
            }
            FrameType::ValidateConnection => {
                if body.has_remaining() {
                    return Err(FrameError::Malformed("trailing bytes in keep-alive frame"));
                }
                Frame::ValidateConnection
            }
        };

        Ok(Some(frame))
    }
}
