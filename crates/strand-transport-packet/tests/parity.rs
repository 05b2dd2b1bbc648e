//! The packet and collocated transports must be indistinguishable to
//! stream-level code: same ids, same payloads, same error outcomes.

use async_trait::async_trait;
use bytes::Bytes;
use strand_mux::{MuxConfig, MuxError, MuxStream};
use strand_transport_coloc::ColocConnection;
use strand_transport_packet::{ByteSink, ByteSource, PacketConnection, TransportError};
use tokio::sync::mpsc;

struct ChanSink(mpsc::UnboundedSender<Bytes>);

#[async_trait]
impl ByteSink for ChanSink {
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError> {
        self.0.send(data).map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct ChanSource(mpsc::UnboundedReceiver<Bytes>);

#[async_trait]
impl ByteSource for ChanSource {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.0.recv().await)
    }
}

/// Everything the script observes through the stream API
#[derive(Debug, PartialEq)]
struct Outcome {
    first_bidir_id: u64,
    one_way_id: u64,
    echo: Vec<u8>,
    echo_fin: bool,
    one_way_payload: Vec<u8>,
    reset_code: u64,
}

#[async_trait]
trait Endpoint {
    fn open(&self, bidirectional: bool) -> MuxStream;
    async fn accept_next(&self) -> MuxStream;
}

#[async_trait]
impl Endpoint for PacketConnection {
    fn open(&self, bidirectional: bool) -> MuxStream {
        self.open_stream(bidirectional)
    }

    async fn accept_next(&self) -> MuxStream {
        self.accept().await.unwrap()
    }
}

#[async_trait]
impl Endpoint for ColocConnection {
    fn open(&self, bidirectional: bool) -> MuxStream {
        self.open_stream(bidirectional)
    }

    async fn accept_next(&self) -> MuxStream {
        self.accept().await.unwrap()
    }
}

async fn run_script(opener: &dyn Endpoint, acceptor: &dyn Endpoint) -> Outcome {
    // Round trip over a two-way stream
    let mut stream = opener.open(true);
    stream.send(Bytes::from_static(b"marco"), true).await.unwrap();
    let first_bidir_id = stream.id().unwrap();

    let mut incoming = acceptor.accept_next().await;
    let mut buf = [0u8; 5];
    assert!(incoming.receive(&mut buf).await.unwrap());
    assert_eq!(&buf, b"marco");
    incoming.send(Bytes::from_static(b"polo"), true).await.unwrap();

    let mut echo = vec![0u8; 4];
    let echo_fin = stream.receive(&mut echo).await.unwrap();

    // One-way stream
    let mut one_way = opener.open(false);
    one_way.send(Bytes::from_static(b"fire"), true).await.unwrap();
    let one_way_id = one_way.id().unwrap();
    let mut incoming = acceptor.accept_next().await;
    let mut one_way_payload = vec![0u8; 4];
    assert!(incoming.receive(&mut one_way_payload).await.unwrap());

    // Peer-initiated reset surfaces on the opener's side
    let mut canceled = opener.open(true);
    canceled
        .send(Bytes::from_static(b"partial"), false)
        .await
        .unwrap();
    let mut victim = acceptor.accept_next().await;
    victim.reset(9).await.unwrap();
    let reset_code = match canceled.receive(&mut [0u8; 8]).await {
        Err(MuxError::StreamReset(code)) => code,
        other => panic!("expected reset, got {other:?}"),
    };

    Outcome {
        first_bidir_id,
        one_way_id,
        echo,
        echo_fin,
        one_way_payload,
        reset_code,
    }
}

async fn packet_outcome() -> Outcome {
    let (c2s_tx, c2s_rx) = mpsc::unbounded_channel();
    let (s2c_tx, s2c_rx) = mpsc::unbounded_channel();
    let client = PacketConnection::new(
        Box::new(ChanSink(c2s_tx)),
        Box::new(ChanSource(s2c_rx)),
        MuxConfig::new(),
        true,
    )
    .unwrap();
    let server = PacketConnection::new(
        Box::new(ChanSink(s2c_tx)),
        Box::new(ChanSource(c2s_rx)),
        MuxConfig::new(),
        false,
    )
    .unwrap();

    for conn in [&client, &server] {
        let conn = conn.clone();
        tokio::spawn(async move { conn.run().await });
    }
    let (a, b) = tokio::join!(client.connect(), server.connect());
    a.unwrap();
    b.unwrap();

    run_script(&client, &server).await
}

async fn coloc_outcome() -> Outcome {
    let (client, server) = ColocConnection::pair(MuxConfig::new(), MuxConfig::new()).unwrap();

    for conn in [&client, &server] {
        let conn = conn.clone();
        tokio::spawn(async move { conn.run().await });
    }
    let (a, b) = tokio::join!(client.connect(), server.connect());
    a.unwrap();
    b.unwrap();

    run_script(&client, &server).await
}

#[tokio::test]
async fn test_transports_agree_on_observable_behavior() {
    let packet = packet_outcome().await;
    let coloc = coloc_outcome().await;
    assert_eq!(packet, coloc);
    assert_eq!(packet.first_bidir_id, 0);
    assert_eq!(packet.one_way_id, 6);
    assert_eq!(packet.echo, b"polo");
    assert!(packet.echo_fin);
    assert_eq!(packet.reset_code, 9);
}
