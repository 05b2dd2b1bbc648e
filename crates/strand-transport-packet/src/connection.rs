//! Packet multiplexer over a byte connection
//!
//! Carries many streams over one ordered byte channel by slicing outbound
//! messages into bounded packets interleaved at packet boundaries, and
//! demultiplexing inbound packets back to the right stream by id. One
//! receive-loop task per connection ([`PacketConnection::run`], spawned by
//! the caller) processes each frame to completion before decoding the next.

use crate::transport::{ByteSink, ByteSource, TransportError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::{Arc, Mutex, Weak};
use strand_mux::{
    classify, reset_code, AdmissionGate, IdDisposition, MuxConfig, MuxError, MuxStream,
    MuxTransport, RemoteIdTracker, StreamHandle, StreamId, StreamIdAllocator, StreamRegistry,
    StreamShared,
};
use strand_proto::{is_control_id, Frame, PROTOCOL_VERSION};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

/// A multiplexed connection over a full-duplex byte channel
///
/// Cheap to clone; all clones share the same connection state.
#[derive(Clone)]
pub struct PacketConnection {
    inner: Arc<PacketInner>,
}

struct PacketInner {
    weak_self: Weak<PacketInner>,
    config: MuxConfig,
    client: bool,
    sink: tokio::sync::Mutex<Box<dyn ByteSink>>,
    // Own sync mutex, not folded into the sink lock: the receive loop
    // consults the high-water marks while senders hold the sink
    allocator: Mutex<StreamIdAllocator>,
    source: Mutex<Option<Box<dyn ByteSource>>>,
    registry: StreamRegistry,
    remote: Mutex<RemoteIdTracker>,
    bidi_gate: Option<AdmissionGate>,
    uni_gate: Option<AdmissionGate>,
    local_init: watch::Sender<bool>,
    peer_init: watch::Sender<bool>,
    // Dropped on connection failure so accept() observes the end of stream
    accept_tx: Mutex<Option<mpsc::UnboundedSender<MuxStream>>>,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MuxStream>>,
    closed: Mutex<Option<MuxError>>,
}

impl PacketConnection {
    /// Create a connection over the given byte transport halves
    ///
    /// `client` selects which half of the quad id space this side
    /// allocates from. The connection does nothing until [`run`] is
    /// spawned and [`connect`] has completed on both sides.
    ///
    /// [`run`]: PacketConnection::run
    /// [`connect`]: PacketConnection::connect
    pub fn new(
        sink: Box<dyn ByteSink>,
        source: Box<dyn ByteSource>,
        config: MuxConfig,
        client: bool,
    ) -> Result<Self, MuxError> {
        config.validate()?;

        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let serialize = config.serialize_dispatch;

        let inner = Arc::new_cyclic(|weak| {
            let mut allocator = StreamIdAllocator::new(client);
            // Burn this side's control stream id so application streams can
            // never be assigned it
            let control_id = allocator.allocate(false);
            debug!(control_id, client, "packet connection created");

            PacketInner {
                weak_self: weak.clone(),
                config,
                client,
                sink: tokio::sync::Mutex::new(sink),
                allocator: Mutex::new(allocator),
                source: Mutex::new(Some(source)),
                registry: StreamRegistry::new(),
                remote: Mutex::new(RemoteIdTracker::new(client)),
                bidi_gate: serialize.then(|| AdmissionGate::new(1)),
                uni_gate: serialize.then(|| AdmissionGate::new(1)),
                local_init: watch::channel(false).0,
                peer_init: watch::channel(false).0,
                accept_tx: Mutex::new(Some(accept_tx)),
                accept_rx: tokio::sync::Mutex::new(accept_rx),
                closed: Mutex::new(None),
            }
        });

        Ok(Self { inner })
    }

    /// Complete connection setup
    ///
    /// Sends this side's `Initialize` frame and waits for the peer's.
    /// Application sends stay parked until both have happened.
    pub async fn connect(&self) -> Result<(), MuxError> {
        let frame = Frame::Initialize {
            version: PROTOCOL_VERSION,
        };
        self.inner.write_frame(frame).await?;
        // send_replace stores the value even with no receiver subscribed
        // yet; a plain send would be lost and later waiters would park
        // forever
        self.inner.local_init.send_replace(true);
        debug!("initialize sent, waiting for peer");
        self.inner.wait_flag(&self.inner.peer_init).await
    }

    /// Run the receive loop; processes incoming frames until the
    /// connection closes or fails
    pub async fn run(&self) -> Result<(), MuxError> {
        let mut source = self
            .inner
            .source
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| {
                MuxError::Configuration("receive loop already running".to_string())
            })?;

        debug!("starting receive loop");
        let result = self.inner.receive_loop(source.as_mut()).await;
        match &result {
            Ok(()) => self.inner.fail(self.inner.close_cause()),
            Err(error) => self.inner.fail(error.clone()),
        }
        debug!("receive loop ended");
        result
    }

    /// Allocate a new outgoing stream
    ///
    /// The stream's id is assigned on its first send.
    pub fn open_stream(&self, bidirectional: bool) -> MuxStream {
        let transport: Arc<dyn MuxTransport> = self.inner.clone();
        MuxStream::outgoing(&transport, bidirectional)
    }

    /// Accept the next peer-opened stream
    pub async fn accept(&self) -> Option<MuxStream> {
        let mut rx = self.accept_rx().await;
        rx.recv().await
    }

    async fn accept_rx(&self) -> tokio::sync::MutexGuard<'_, mpsc::UnboundedReceiver<MuxStream>> {
        self.inner.accept_rx.lock().await
    }

    /// Send a keep-alive frame
    pub async fn ping(&self) -> Result<(), MuxError> {
        self.inner.write_frame(Frame::ValidateConnection).await
    }

    /// Gracefully close the connection, aborting every live stream
    pub async fn close(&self, error_code: u64, reason: &str) -> Result<(), MuxError> {
        debug!(error_code, reason, "closing connection");
        let frame = Frame::Close {
            error_code,
            reason: reason.to_string(),
        };
        self.inner.write_frame(frame).await?;
        self.inner
            .fail(MuxError::ConnectionClosed(reason.to_string()));
        let mut sink = self.inner.sink.lock().await;
        let _ = sink.close().await;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.lock().unwrap().is_some()
    }

    /// Number of streams currently registered
    pub fn active_streams(&self) -> usize {
        self.inner.registry.len()
    }
}

impl PacketInner {
    fn check_open(&self) -> Result<(), MuxError> {
        match &*self.closed.lock().unwrap() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn close_cause(&self) -> MuxError {
        self.closed
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(MuxError::ConnectionLost)
    }

    fn gate(&self, bidirectional: bool) -> Option<&AdmissionGate> {
        if bidirectional {
            self.bidi_gate.as_ref()
        } else {
            self.uni_gate.as_ref()
        }
    }

    /// Fail the connection: record the first cause, abort every stream and
    /// wake everything parked on setup or admission
    fn fail(&self, error: MuxError) {
        let cause = {
            let mut closed = self.closed.lock().unwrap();
            if closed.is_none() {
                *closed = Some(error);
            }
            closed.clone().unwrap()
        };
        self.registry.abort_all(cause.clone());
        for gate in [&self.bidi_gate, &self.uni_gate].into_iter().flatten() {
            gate.abort(cause.clone());
        }
        self.local_init.send_replace(true);
        self.peer_init.send_replace(true);
        self.accept_tx.lock().unwrap().take();
    }

    async fn wait_flag(&self, flag: &watch::Sender<bool>) -> Result<(), MuxError> {
        let mut rx = flag.subscribe();
        loop {
            self.check_open()?;
            if *rx.borrow_and_update() {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                return Err(self.close_cause());
            }
        }
    }

    /// Both sides must have exchanged Initialize before application data
    async fn wait_ready(&self) -> Result<(), MuxError> {
        self.wait_flag(&self.local_init).await?;
        self.wait_flag(&self.peer_init).await
    }

    /// A dead sink is fatal: fail the connection so streams parked in
    /// receive are aborted instead of waiting on a peer that cannot answer
    fn sink_failed(&self, error: TransportError) -> MuxError {
        let cause = MuxError::from(error);
        self.fail(cause.clone());
        cause
    }

    async fn write_frame(&self, frame: Frame) -> Result<(), MuxError> {
        self.check_open()?;
        let encoded = frame.encode()?;
        let mut sink = self.sink.lock().await;
        sink.send(encoded)
            .await
            .map_err(|error| self.sink_failed(error))
    }

    /// Slice one outbound message into encoded packets
    ///
    /// Only the final packet carries `StreamLast`, and only when fin was
    /// requested; a zero-byte non-final packet is never produced.
    fn packetize(
        &self,
        id: StreamId,
        payload: &Bytes,
        fin: bool,
    ) -> Result<Vec<Bytes>, MuxError> {
        let max = self.config.max_packet_size;

        if payload.is_empty() {
            // Valid only as an empty fin signal; send() rejects the rest
            let frame = Frame::StreamLast {
                stream_id: id,
                payload: Bytes::new(),
            };
            return Ok(vec![frame.encode()?]);
        }

        let mut packets = Vec::with_capacity(payload.len().div_ceil(max));
        let mut offset = 0;
        while offset < payload.len() {
            let end = (offset + max).min(payload.len());
            let chunk = payload.slice(offset..end);
            let frame = if end == payload.len() && fin {
                Frame::StreamLast {
                    stream_id: id,
                    payload: chunk,
                }
            } else {
                Frame::Stream {
                    stream_id: id,
                    payload: chunk,
                }
            };
            packets.push(frame.encode()?);
            offset = end;
        }
        Ok(packets)
    }

    async fn write_packets(&self, packets: &[Bytes]) -> Result<(), MuxError> {
        for packet in packets {
            self.check_open()?;
            let mut sink = self.sink.lock().await;
            sink.send(packet.clone())
                .await
                .map_err(|error| self.sink_failed(error))?;
        }
        Ok(())
    }

    async fn send_reset_frame(&self, id: StreamId, error_code: u64) -> Result<(), MuxError> {
        self.write_frame(Frame::StreamReset {
            stream_id: id,
            error_code,
        })
        .await
    }

    async fn receive_loop(&self, source: &mut dyn ByteSource) -> Result<(), MuxError> {
        let mut buf = BytesMut::new();
        loop {
            while let Some(frame) = Frame::decode(&mut buf, self.config.max_frame_size)? {
                if self.process_frame(frame)? {
                    return Ok(());
                }
            }

            match source.recv().await {
                Ok(Some(data)) => buf.extend_from_slice(&data),
                Ok(None) => {
                    debug!("byte transport closed");
                    return match self.check_open() {
                        // Already failed or closed deliberately
                        Err(_) => Ok(()),
                        Ok(()) => Err(MuxError::ConnectionLost),
                    };
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Handle one inbound frame; returns true once the connection is done
    fn process_frame(&self, frame: Frame) -> Result<bool, MuxError> {
        trace!(?frame, "processing frame");
        match frame {
            Frame::Initialize { version } => {
                if version != PROTOCOL_VERSION {
                    return Err(MuxError::ProtocolViolation(format!(
                        "unsupported protocol version {version}"
                    )));
                }
                debug!("peer initialize received");
                self.peer_init.send_replace(true);
                Ok(false)
            }
            Frame::ValidateConnection => {
                trace!("keep-alive received");
                Ok(false)
            }
            Frame::Close { error_code, reason } => {
                debug!(error_code, reason, "peer closed connection");
                self.fail(MuxError::ConnectionClosed(reason));
                Ok(true)
            }
            Frame::Stream { stream_id, payload } => {
                self.deliver_data(stream_id, payload, false)?;
                Ok(false)
            }
            Frame::StreamLast { stream_id, payload } => {
                self.deliver_data(stream_id, payload, true)?;
                Ok(false)
            }
            Frame::StreamReset {
                stream_id,
                error_code,
            } => {
                match self.registry.get(stream_id) {
                    Some(handle) => handle.deliver_reset(error_code),
                    // Stream already gone
                    None => trace!(stream_id, "reset for unknown stream ignored"),
                }
                Ok(false)
            }
        }
    }

    fn deliver_data(&self, id: StreamId, payload: Bytes, fin: bool) -> Result<(), MuxError> {
        if is_control_id(id) {
            return Err(MuxError::ProtocolViolation(format!(
                "stream data on control stream id {id}"
            )));
        }

        if let Some(handle) = self.registry.get(id) {
            if !handle.deliver_data(payload, fin) {
                trace!(stream_id = id, "stream disposed, data discarded");
            }
            return Ok(());
        }

        let locally_initiated = classify(id).client_initiated == self.client;
        if locally_initiated {
            // Response data for a stream we opened. If we never allocated
            // the id the peer invented it; if we did, the stream was
            // disposed and the bytes are drained.
            if self.allocator.lock().unwrap().allocated(id) {
                trace!(stream_id = id, "data for disposed stream drained");
                Ok(())
            } else {
                Err(MuxError::ProtocolViolation(format!(
                    "data for stream {id} this side never opened"
                )))
            }
        } else {
            match self.remote.lock().unwrap().admit(id) {
                IdDisposition::New => {
                    if payload.is_empty() && !fin {
                        // Canceled request; the high-water mark advanced so
                        // later frames for this id are drained as stale
                        trace!(stream_id = id, "zero-length first packet ignored");
                        return Ok(());
                    }
                    self.open_incoming(id, payload, fin);
                    Ok(())
                }
                IdDisposition::Replay => {
                    trace!(stream_id = id, "data for stale stream drained");
                    Ok(())
                }
                IdDisposition::OutOfOrder => Err(MuxError::ProtocolViolation(format!(
                    "out-of-order stream id {id}"
                ))),
            }
        }
    }

    fn open_incoming(&self, id: StreamId, payload: Bytes, fin: bool) {
        let inner = match self.weak_self.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        let transport: Arc<dyn MuxTransport> = inner;
        let (stream, handle) = MuxStream::incoming(&transport, id);
        handle.deliver_data(payload, fin);
        self.registry.insert(id, handle);
        debug!(stream_id = id, "incoming stream opened");

        let delivered = match &*self.accept_tx.lock().unwrap() {
            Some(tx) => tx.send(stream).is_ok(),
            None => false,
        };
        if !delivered {
            warn!(stream_id = id, "incoming stream dropped, nobody accepting");
            self.registry.remove(id);
        }
    }
}

#[async_trait]
impl MuxTransport for PacketInner {
    async fn start_stream(
        &self,
        handle: StreamHandle,
        payload: Bytes,
        fin: bool,
    ) -> Result<StreamId, MuxError> {
        self.check_open()?;
        self.wait_ready().await?;

        let bidirectional = handle.shared.bidirectional();
        if let Some(gate) = self.gate(bidirectional) {
            gate.acquire().await?;
            handle.shared.set_gate_held();
        }

        // One critical section reserves the id, registers the stream and
        // writes the first packet, so the peer can never observe a higher
        // id from this class sent earlier.
        let (id, rest) = {
            let mut sink = self.sink.lock().await;
            self.check_open()?;
            let id = self.allocator.lock().unwrap().allocate(bidirectional);
            handle.shared.bind(id);
            self.registry.insert(id, handle.clone());

            let packets = self.packetize(id, &payload, fin)?;
            sink.send(packets[0].clone())
                .await
                .map_err(|error| self.sink_failed(error))?;
            (id, packets[1..].to_vec())
        };

        trace!(stream_id = id, bidirectional, "stream started");
        self.write_packets(&rest).await?;
        Ok(id)
    }

    async fn send(&self, id: StreamId, payload: Bytes, fin: bool) -> Result<(), MuxError> {
        self.check_open()?;
        let packets = self.packetize(id, &payload, fin)?;
        self.write_packets(&packets).await
    }

    async fn reset(&self, id: StreamId, error_code: u64) -> Result<(), MuxError> {
        if self.check_open().is_err() {
            // The peer is gone or every stream is aborted anyway
            return Ok(());
        }
        self.send_reset_frame(id, error_code).await
    }

    fn release(&self, shared: &StreamShared) {
        if let Some(id) = shared.id() {
            if self.registry.remove(id).is_some() {
                trace!(stream_id = id, "stream deregistered");
            }
        }
        if shared.take_gate_held() {
            if let Some(gate) = self.gate(shared.bidirectional()) {
                gate.release();
            }
        }

        // A started stream dropped mid-exchange resets so the peer does
        // not wait forever for more data
        if shared.is_started()
            && !shared.is_completed()
            && shared.terminal_error().is_none()
            && self.check_open().is_ok()
        {
            if let Some(id) = shared.id() {
                shared.mark_reset(reset_code::ABORTED);
                if let (Some(inner), Ok(rt)) =
                    (self.weak_self.upgrade(), tokio::runtime::Handle::try_current())
                {
                    rt.spawn(async move {
                        let _ = inner.send_reset_frame(id, reset_code::ABORTED).await;
                    });
                }
            }
        }
    }
}
