//! Packet transport for the strand multiplexer
//!
//! Carries many independent streams over one full-duplex byte connection
//! (TCP, TLS-wrapped TCP) by slicing outbound messages into bounded-size
//! packets interleaved with other streams' packets, and demultiplexing
//! inbound packets back to the right stream by id.
//!
//! The byte channel itself stays external: supply the [`ByteSink`] /
//! [`ByteSource`] halves of whatever socket the connection should run over.
//!
//! # Usage
//!
//! ```ignore
//! let conn = PacketConnection::new(sink, source, MuxConfig::new(), true)?;
//! let driver = conn.clone();
//! tokio::spawn(async move { driver.run().await });
//! conn.connect().await?;
//!
//! let mut stream = conn.open_stream(true);
//! stream.send(request, true).await?;
//! ```

pub mod connection;
pub mod transport;

pub use connection::PacketConnection;
pub use transport::{ByteSink, ByteSource, TransportError};
