//! In-process multiplexed connection
//!
//! The "wire" is an ordered channel of `(stream id, payload, fin)` elements
//! per direction. A message is one element (no fragmentation); a reset
//! marker in place of a message models `StreamReset`.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex, Weak};
use strand_mux::{
    classify, reset_code, AdmissionGate, IdDisposition, MuxConfig, MuxError, MuxStream,
    MuxTransport, RemoteIdTracker, StreamHandle, StreamId, StreamIdAllocator, StreamRegistry,
    StreamShared,
};
use strand_proto::is_control_id;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

/// One element of the in-process wire
#[derive(Debug)]
struct ColocFrame {
    id: StreamId,
    payload: ColocPayload,
    fin: bool,
}

#[derive(Debug)]
enum ColocPayload {
    /// A whole message
    Data(Bytes),
    /// The reset marker (the `None` of the wire contract)
    Reset(u64),
    /// Capability handshake on the control stream: the sender's gates
    Setup(GateSet),
    /// Graceful connection shutdown, mirroring the packet Close frame
    Close { reason: String },
}

/// The admission gates one side exposes to its peer
///
/// Empty when serialized dispatch is disabled on that side.
#[derive(Debug, Clone, Default)]
struct GateSet {
    bidi: Option<Arc<AdmissionGate>>,
    uni: Option<Arc<AdmissionGate>>,
}

impl GateSet {
    fn serialized(permits: usize) -> Self {
        Self {
            bidi: Some(Arc::new(AdmissionGate::new(permits))),
            uni: Some(Arc::new(AdmissionGate::new(permits))),
        }
    }

    fn gate(&self, bidirectional: bool) -> Option<&Arc<AdmissionGate>> {
        if bidirectional {
            self.bidi.as_ref()
        } else {
            self.uni.as_ref()
        }
    }

    fn abort(&self, error: MuxError) {
        for gate in [&self.bidi, &self.uni].into_iter().flatten() {
            gate.abort(error.clone());
        }
    }
}

/// A multiplexed connection to a collocated peer
///
/// Cheap to clone; all clones share the same connection state.
#[derive(Clone)]
pub struct ColocConnection {
    inner: Arc<ColocInner>,
}

struct SendHalf {
    tx: mpsc::UnboundedSender<ColocFrame>,
    allocator: StreamIdAllocator,
}

struct ColocInner {
    weak_self: Weak<ColocInner>,
    client: bool,
    control_id: StreamId,
    send_half: Mutex<SendHalf>,
    source: Mutex<Option<mpsc::UnboundedReceiver<ColocFrame>>>,
    registry: StreamRegistry,
    remote: Mutex<RemoteIdTracker>,
    own_gates: GateSet,
    peer_gates: Mutex<GateSet>,
    local_setup: watch::Sender<bool>,
    peer_setup: watch::Sender<bool>,
    accept_tx: Mutex<Option<mpsc::UnboundedSender<MuxStream>>>,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MuxStream>>,
    closed: Mutex<Option<MuxError>>,
}

impl ColocConnection {
    /// Create both ends of a collocated connection
    pub fn pair(
        client_config: MuxConfig,
        server_config: MuxConfig,
    ) -> Result<(ColocConnection, ColocConnection), MuxError> {
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        let client = Self::endpoint(client_tx, client_rx, client_config, true)?;
        let server = Self::endpoint(server_tx, server_rx, server_config, false)?;
        Ok((client, server))
    }

    fn endpoint(
        tx: mpsc::UnboundedSender<ColocFrame>,
        rx: mpsc::UnboundedReceiver<ColocFrame>,
        config: MuxConfig,
        client: bool,
    ) -> Result<Self, MuxError> {
        config.validate()?;

        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let serialize = config.serialize_dispatch;

        let inner = Arc::new_cyclic(|weak| {
            let mut allocator = StreamIdAllocator::new(client);
            let control_id = allocator.allocate(false);
            debug!(control_id, client, "collocated endpoint created");

            ColocInner {
                weak_self: weak.clone(),
                client,
                control_id,
                send_half: Mutex::new(SendHalf { tx, allocator }),
                source: Mutex::new(Some(rx)),
                registry: StreamRegistry::new(),
                remote: Mutex::new(RemoteIdTracker::new(client)),
                own_gates: if serialize {
                    GateSet::serialized(1)
                } else {
                    GateSet::default()
                },
                peer_gates: Mutex::new(GateSet::default()),
                local_setup: watch::channel(false).0,
                peer_setup: watch::channel(false).0,
                accept_tx: Mutex::new(Some(accept_tx)),
                accept_rx: tokio::sync::Mutex::new(accept_rx),
                closed: Mutex::new(None),
            }
        });

        Ok(Self { inner })
    }

    /// Complete connection setup
    ///
    /// Exchanges admission gates over the control streams; application
    /// sends stay parked until both sides have done so.
    pub async fn connect(&self) -> Result<(), MuxError> {
        self.inner.send_element(ColocFrame {
            id: self.inner.control_id,
            payload: ColocPayload::Setup(self.inner.own_gates.clone()),
            fin: true,
        })?;
        // send_replace stores the value even with no receiver subscribed
        // yet; a plain send would be lost and later waiters would park
        // forever
        self.inner.local_setup.send_replace(true);
        debug!("setup sent, waiting for peer");
        self.inner.wait_flag(&self.inner.peer_setup).await
    }

    /// Run the receive loop; processes incoming elements until the
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
        let result = self.inner.receive_loop(&mut source).await;
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
        let mut rx = self.inner.accept_rx.lock().await;
        rx.recv().await
    }

    /// Gracefully close the connection, aborting every live stream
    pub fn close(&self, reason: &str) {
        debug!(reason, "closing connection");
        {
            let half = self.inner.send_half.lock().unwrap();
            let _ = half.tx.send(ColocFrame {
                id: self.inner.control_id,
                payload: ColocPayload::Close {
                    reason: reason.to_string(),
                },
                fin: true,
            });
        }
        self.inner
            .fail(MuxError::ConnectionClosed(reason.to_string()));
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.lock().unwrap().is_some()
    }

    /// Number of streams currently registered
    pub fn active_streams(&self) -> usize {
        self.inner.registry.len()
    }
}

impl ColocInner {
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

    fn fail(&self, error: MuxError) {
        let cause = {
            let mut closed = self.closed.lock().unwrap();
            if closed.is_none() {
                *closed = Some(error);
            }
            closed.clone().unwrap()
        };
        self.registry.abort_all(cause.clone());
        self.own_gates.abort(cause.clone());
        self.peer_gates.lock().unwrap().abort(cause);
        self.local_setup.send_replace(true);
        self.peer_setup.send_replace(true);
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

    async fn wait_ready(&self) -> Result<(), MuxError> {
        self.wait_flag(&self.local_setup).await?;
        self.wait_flag(&self.peer_setup).await
    }

    async fn receive_loop(
        &self,
        source: &mut mpsc::UnboundedReceiver<ColocFrame>,
    ) -> Result<(), MuxError> {
        loop {
            match source.recv().await {
                Some(frame) => {
                    if self.process_frame(frame)? {
                        return Ok(());
                    }
                }
                None => {
                    debug!("peer endpoint dropped");
                    return match self.check_open() {
                        Err(_) => Ok(()),
                        Ok(()) => Err(MuxError::ConnectionLost),
                    };
                }
            }
        }
    }

    /// Handle one inbound element; returns true once the connection is done
    fn process_frame(&self, frame: ColocFrame) -> Result<bool, MuxError> {
        trace!(stream_id = frame.id, fin = frame.fin, "processing element");
        match frame.payload {
            ColocPayload::Setup(gates) => {
                if !is_control_id(frame.id) {
                    return Err(MuxError::ProtocolViolation(format!(
                        "setup on non-control stream id {}",
                        frame.id
                    )));
                }
                debug!(stream_id = frame.id, "peer setup received");
                *self.peer_gates.lock().unwrap() = gates;
                self.peer_setup.send_replace(true);
                Ok(false)
            }
            ColocPayload::Close { reason } => {
                debug!(reason, "peer closed connection");
                self.fail(MuxError::ConnectionClosed(reason));
                Ok(true)
            }
            ColocPayload::Data(payload) => {
                self.deliver_data(frame.id, payload, frame.fin)?;
                Ok(false)
            }
            ColocPayload::Reset(error_code) => {
                match self.registry.get(frame.id) {
                    Some(handle) => handle.deliver_reset(error_code),
                    // Stream already gone; a reset marker for an unknown
                    // id is simply ignored
                    None => trace!(stream_id = frame.id, "reset for unknown stream ignored"),
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
                trace!(stream_id = id, "stream disposed, message discarded");
            }
            return Ok(());
        }

        let locally_initiated = classify(id).client_initiated == self.client;
        if locally_initiated {
            let known = self.send_half.lock().unwrap().allocator.allocated(id);
            if known {
                trace!(stream_id = id, "message for disposed stream discarded");
                Ok(())
            } else {
                Err(MuxError::ProtocolViolation(format!(
                    "message for stream {id} this side never opened"
                )))
            }
        } else {
            match self.remote.lock().unwrap().admit(id) {
                IdDisposition::New => {
                    if payload.is_empty() && !fin {
                        trace!(stream_id = id, "zero-length first message ignored");
                        return Ok(());
                    }
                    self.open_incoming(id, payload, fin);
                    Ok(())
                }
                IdDisposition::Replay => {
                    trace!(stream_id = id, "message for stale stream discarded");
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

        // The opener acquired its own gate; this side returns the permit
        // once the incoming stream completes or is dropped
        let bidirectional = classify(id).bidirectional;
        if self
            .peer_gates
            .lock()
            .unwrap()
            .gate(bidirectional)
            .is_some()
        {
            handle.shared.set_gate_held();
        }

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

    fn send_element(&self, frame: ColocFrame) -> Result<(), MuxError> {
        self.check_open()?;
        let sent = self.send_half.lock().unwrap().tx.send(frame).is_ok();
        if sent {
            Ok(())
        } else {
            // The peer endpoint is gone; abort everything still waiting
            self.fail(MuxError::ConnectionLost);
            Err(MuxError::ConnectionLost)
        }
    }
}

#[async_trait]
impl MuxTransport for ColocInner {
    async fn start_stream(
        &self,
        handle: StreamHandle,
        payload: Bytes,
        fin: bool,
    ) -> Result<StreamId, MuxError> {
        self.check_open()?;
        self.wait_ready().await?;

        // Admission: the permit comes back when the peer finishes with the
        // stream, not when this side does, so the flag stays unset here
        let bidirectional = handle.shared.bidirectional();
        if let Some(gate) = self.own_gates.gate(bidirectional) {
            gate.acquire().await?;
        }

        // One critical section reserves the id, registers the stream and
        // posts the first element; sends are synchronous so nothing can
        // reorder inside it
        let (id, sent) = {
            let mut half = self.send_half.lock().unwrap();
            self.check_open()?;
            let id = half.allocator.allocate(bidirectional);
            handle.shared.bind(id);
            self.registry.insert(id, handle.clone());
            let sent = half
                .tx
                .send(ColocFrame {
                    id,
                    payload: ColocPayload::Data(payload),
                    fin,
                })
                .is_ok();
            (id, sent)
        };
        if !sent {
            self.fail(MuxError::ConnectionLost);
            return Err(MuxError::ConnectionLost);
        }

        trace!(stream_id = id, bidirectional, "stream started");
        Ok(id)
    }

    async fn send(&self, id: StreamId, payload: Bytes, fin: bool) -> Result<(), MuxError> {
        self.send_element(ColocFrame {
            id,
            payload: ColocPayload::Data(payload),
            fin,
        })
    }

    async fn reset(&self, id: StreamId, error_code: u64) -> Result<(), MuxError> {
        if self.check_open().is_err() {
            return Ok(());
        }
        self.send_element(ColocFrame {
            id,
            payload: ColocPayload::Reset(error_code),
            fin: false,
        })
    }

    fn release(&self, shared: &StreamShared) {
        if let Some(id) = shared.id() {
            if self.registry.remove(id).is_some() {
                trace!(stream_id = id, "stream deregistered");
            }
        }

        // Return the opener's admission permit for a finished incoming
        // stream; the gate reference was exchanged during setup
        if shared.take_gate_held() && shared.incoming() {
            if let Some(gate) = self
                .peer_gates
                .lock()
                .unwrap()
                .gate(shared.bidirectional())
            {
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
                let half = self.send_half.lock().unwrap();
                let _ = half.tx.send(ColocFrame {
                    id,
                    payload: ColocPayload::Reset(reset_code::ABORTED),
                    fin: false,
                });
            }
        }
    }
}
