//! Strand multiplexing core
//!
//! This crate holds the transport-agnostic half of the strand stream
//! multiplexer: stream identity and lifecycle, the quad stream-id numbering
//! scheme, the per-connection stream registry, the flow-control admission
//! gate, and the `MuxTransport` trait that the concrete packet and
//! collocated transports implement.
//!
//! A [`MuxStream`] is the unit callers interact with. It is transport
//! agnostic: the concrete multiplexer is injected behind [`MuxTransport`],
//! so the same stream code runs over a real byte connection or an
//! in-process channel pair.

pub mod config;
pub mod error;
pub mod gate;
pub mod id;
pub mod registry;
pub mod stream;

pub use config::MuxConfig;
pub use error::MuxError;
pub use gate::AdmissionGate;
pub use id::{classify, IdDisposition, RemoteIdTracker, StreamClass, StreamId, StreamIdAllocator};
pub use registry::StreamRegistry;
pub use stream::{MuxStream, MuxTransport, StreamEvent, StreamHandle, StreamShared, StreamState};

/// Well-known stream reset error codes
pub mod reset_code {
    /// The caller abandoned the exchange (cancellation)
    pub const CANCELED: u64 = 0;
    /// The stream was torn down without completing
    pub const ABORTED: u64 = 1;
}
