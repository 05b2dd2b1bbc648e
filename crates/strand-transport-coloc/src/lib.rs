//! Collocated transport for the strand multiplexer
//!
//! Connects a client and server living in the same process, bypassing the
//! network stack: whole messages travel as in-memory values over a pair of
//! ordered channels, one per direction. Stream-id allocation, ordering and
//! backpressure follow the same contract as the packet transport, so
//! stream-level code cannot tell the two apart.
//!
//! Flow control works without any bytes crossing a kernel boundary: during
//! setup each side sends its admission gates over its control stream, so
//! the receiving side can release the opener's gate when it finishes with
//! an incoming stream.

pub mod connection;

pub use connection::ColocConnection;
