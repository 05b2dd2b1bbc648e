//! Strand Protocol Definitions
//!
//! This crate defines the wire-level pieces of the strand multiplexing
//! protocol: the frame types exchanged over a packet connection, the
//! variable-length integer encoding used for sizes and stream ids, and the
//! protocol constants shared by every transport.

pub mod frame;
pub mod varint;

pub use frame::{Frame, FrameError, FrameType};
pub use varint::{decode_varint, encode_varint, varint_len, MAX_VARINT};

/// Protocol version carried by the `Initialize` frame
pub const PROTOCOL_VERSION: u64 = 1;

/// Default maximum size of a decoded frame (16MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Default maximum payload carried by one packet (16KB)
pub const DEFAULT_MAX_PACKET_SIZE: usize = 16 * 1024;

/// Control stream id used by the client side of a connection
pub const CLIENT_CONTROL_STREAM_ID: u64 = 2;

/// Control stream id used by the server side of a connection
pub const SERVER_CONTROL_STREAM_ID: u64 = 3;

/// Whether `id` is one of the two reserved control stream ids
pub fn is_control_id(id: u64) -> bool {
    id == CLIENT_CONTROL_STREAM_ID || id == SERVER_CONTROL_STREAM_ID
}
