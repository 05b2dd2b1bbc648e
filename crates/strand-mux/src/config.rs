//! Multiplexer configuration

use crate::error::MuxError;
use strand_proto::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_PACKET_SIZE};

/// Per-connection multiplexer configuration
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Maximum payload bytes carried by one packet (bounds fragmentation)
    pub max_packet_size: usize,

    /// Maximum size of one incoming frame (bounds receive allocation)
    pub max_frame_size: usize,

    /// Serialize dispatch: admit at most one active stream per class at a
    /// time, so requests are processed strictly in the order they were sent
    pub serialize_dispatch: bool,
}

impl MuxConfig {
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            serialize_dispatch: false,
        }
    }

    /// Set the maximum packet payload size
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Set the maximum incoming frame size
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Enable or disable serialized dispatch
    pub fn with_serialize_dispatch(mut self, serialize: bool) -> Self {
        self.serialize_dispatch = serialize;
        self
    }

    pub fn validate(&self) -> Result<(), MuxError> {
        if self.max_packet_size == 0 {
            return Err(MuxError::Configuration(
                "max_packet_size must be > 0".to_string(),
            ));
        }
        if self.max_frame_size == 0 {
            return Err(MuxError::Configuration(
                "max_frame_size must be > 0".to_string(),
            ));
        }
        if self.max_packet_size > self.max_frame_size {
            return Err(MuxError::Configuration(
                "max_packet_size cannot exceed max_frame_size".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self::new()
    }
}
