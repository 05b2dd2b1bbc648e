//! Stream identity, lifecycle and the transport seam
//!
//! A [`MuxStream`] is one logical, ordered, reliable exchange multiplexed
//! over a shared connection. The concrete multiplexer (packet or collocated)
//! is injected behind the [`MuxTransport`] trait; the stream holds only a
//! weak reference to it, the connection's registry holds the sending half of
//! the stream's event channel, so neither side keeps the other alive.

use crate::error::MuxError;
use crate::id::{classify, StreamId};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tokio::sync::mpsc;
use tracing::trace;

/// Events delivered to a stream's receiver by its owning multiplexer
#[derive(Debug)]
pub enum StreamEvent {
    /// Payload bytes, with `fin` marking the final fragment
    Data { payload: Bytes, fin: bool },
    /// The peer aborted the stream
    Reset { error_code: u64 },
    /// Local teardown (connection failure), no wire effect
    Abort { error: MuxError },
}

/// Observable stream lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No id assigned yet; nothing has been sent
    Unallocated,
    /// Started, both directions open
    Active,
    /// Fin sent, still receiving
    HalfClosedSend,
    /// Fin received, still sending
    HalfClosedRecv,
    /// Both directions finished normally
    Completed,
    /// Protocol-level abort, local or remote
    Reset(u64),
    /// Local abort without wire effect
    Aborted,
}

#[derive(Debug, Clone)]
enum Terminal {
    Completed,
    Reset(u64),
    Aborted(MuxError),
}

#[derive(Debug, Default)]
struct Lifecycle {
    started: bool,
    send_done: bool,
    recv_done: bool,
    terminal: Option<Terminal>,
}

/// State shared between a stream handle, its registry entry and its
/// owning multiplexer
#[derive(Debug)]
pub struct StreamShared {
    id: OnceLock<StreamId>,
    bidirectional: bool,
    incoming: bool,
    state: Mutex<Lifecycle>,
    gate_held: AtomicBool,
}

impl StreamShared {
    pub fn new(bidirectional: bool, incoming: bool) -> Self {
        Self {
            id: OnceLock::new(),
            bidirectional,
            incoming,
            state: Mutex::new(Lifecycle::default()),
            gate_held: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Option<StreamId> {
        self.id.get().copied()
    }

    pub fn bidirectional(&self) -> bool {
        self.bidirectional
    }

    pub fn incoming(&self) -> bool {
        self.incoming
    }

    /// Whether this is one of the two reserved control streams
    pub fn is_control(&self) -> bool {
        self.id().is_some_and(strand_proto::is_control_id)
    }

    /// Assign the id and enter the started state
    ///
    /// Called by the owning multiplexer inside its send-lock critical
    /// section; an id, once bound, never changes.
    pub fn bind(&self, id: StreamId) {
        let already = self.id.set(id).is_err();
        debug_assert!(!already, "stream id bound twice");
        self.state.lock().unwrap().started = true;
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().unwrap().started
    }

    pub fn mark_send_done(&self) {
        let mut state = self.state.lock().unwrap();
        state.send_done = true;
        if state.recv_done && state.terminal.is_none() {
            state.terminal = Some(Terminal::Completed);
        }
    }

    pub fn mark_recv_done(&self) {
        let mut state = self.state.lock().unwrap();
        state.recv_done = true;
        if state.send_done && state.terminal.is_none() {
            state.terminal = Some(Terminal::Completed);
        }
    }

    /// Enter the absorbing reset state, keeping an earlier terminal state
    pub fn mark_reset(&self, error_code: u64) {
        let mut state = self.state.lock().unwrap();
        if state.terminal.is_none() {
            state.terminal = Some(Terminal::Reset(error_code));
        }
    }

    /// Enter the absorbing aborted state, keeping an earlier terminal state
    pub fn mark_aborted(&self, error: MuxError) {
        let mut state = self.state.lock().unwrap();
        if state.terminal.is_none() {
            state.terminal = Some(Terminal::Aborted(error));
        }
    }

    /// The error further send/receive calls fail with, if any
    pub fn terminal_error(&self) -> Option<MuxError> {
        match &self.state.lock().unwrap().terminal {
            Some(Terminal::Reset(code)) => Some(MuxError::StreamReset(*code)),
            Some(Terminal::Aborted(error)) => Some(error.clone()),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(
            self.state.lock().unwrap().terminal,
            Some(Terminal::Completed)
        )
    }

    pub fn state(&self) -> StreamState {
        let state = self.state.lock().unwrap();
        match &state.terminal {
            Some(Terminal::Completed) => StreamState::Completed,
            Some(Terminal::Reset(code)) => StreamState::Reset(*code),
            Some(Terminal::Aborted(_)) => StreamState::Aborted,
            None if !state.started => StreamState::Unallocated,
            None if state.send_done => StreamState::HalfClosedSend,
            None if state.recv_done => StreamState::HalfClosedRecv,
            None => StreamState::Active,
        }
    }

    /// Record that this stream holds an admission permit
    pub fn set_gate_held(&self) {
        self.gate_held.store(true, Ordering::Release);
    }

    /// Take the admission permit marker, at most once
    pub fn take_gate_held(&self) -> bool {
        self.gate_held.swap(false, Ordering::AcqRel)
    }
}

/// The registry's view of a stream: shared state plus the event sender
#[derive(Debug, Clone)]
pub struct StreamHandle {
    pub shared: Arc<StreamShared>,
    events: mpsc::UnboundedSender<StreamEvent>,
}

impl StreamHandle {
    pub fn new(shared: Arc<StreamShared>, events: mpsc::UnboundedSender<StreamEvent>) -> Self {
        Self { shared, events }
    }

    /// Hand payload bytes to the stream's receiver
    ///
    /// Returns false when the receiver is gone (the stream was disposed);
    /// the caller discards the data and carries on with the next frame.
    pub fn deliver_data(&self, payload: Bytes, fin: bool) -> bool {
        if fin {
            // The receive side is done even if the bytes are never read
            self.shared.mark_recv_done();
        }
        self.events
            .send(StreamEvent::Data { payload, fin })
            .is_ok()
    }

    /// Deliver a peer reset; later sends on this stream fail with it
    pub fn deliver_reset(&self, error_code: u64) {
        self.shared.mark_reset(error_code);
        let _ = self.events.send(StreamEvent::Reset { error_code });
    }

    /// Fail the stream locally without wire effect
    pub fn deliver_abort(&self, error: MuxError) {
        self.shared.mark_aborted(error.clone());
        let _ = self.events.send(StreamEvent::Abort { error });
    }
}

/// The operations a concrete multiplexer provides to its streams
#[async_trait]
pub trait MuxTransport: Send + Sync + 'static {
    /// Atomically reserve the next id for the handle's class, register the
    /// stream and transmit the first payload
    async fn start_stream(
        &self,
        handle: StreamHandle,
        payload: Bytes,
        fin: bool,
    ) -> Result<StreamId, MuxError>;

    /// Transmit a payload for an already started stream
    async fn send(&self, id: StreamId, payload: Bytes, fin: bool) -> Result<(), MuxError>;

    /// Send a protocol-level stream abort to the peer
    async fn reset(&self, id: StreamId, error_code: u64) -> Result<(), MuxError>;

    /// Release the stream's connection resources (registry slot, admission
    /// permit, best-effort reset of an abandoned exchange). Idempotent;
    /// called on completion and again on drop.
    fn release(&self, shared: &StreamShared);
}

/// One logical, ordered exchange multiplexed over a shared connection
pub struct MuxStream {
    shared: Arc<StreamShared>,
    transport: Weak<dyn MuxTransport>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    events_tx: mpsc::UnboundedSender<StreamEvent>,
    pending: BytesMut,
    recv_fin: bool,
    send_fin: bool,
}

impl MuxStream {
    /// A not-yet-started outgoing stream; the id is assigned on first send
    pub fn outgoing(transport: &Arc<dyn MuxTransport>, bidirectional: bool) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let shared = Arc::new(StreamShared::new(bidirectional, false));
        if !bidirectional {
            // Nothing will ever arrive on an outgoing unidirectional stream
            shared.mark_recv_done();
        }
        Self {
            shared,
            transport: Arc::downgrade(transport),
            events,
            events_tx,
            pending: BytesMut::new(),
            recv_fin: !bidirectional,
            send_fin: false,
        }
    }

    /// A started incoming stream for a peer-opened id, plus the handle the
    /// multiplexer registers to route further frames to it
    pub fn incoming(transport: &Arc<dyn MuxTransport>, id: StreamId) -> (Self, StreamHandle) {
        let bidirectional = classify(id).bidirectional;
        let shared = Arc::new(StreamShared::new(bidirectional, true));
        shared.bind(id);
        if !bidirectional {
            shared.mark_send_done();
        }
        let (events_tx, events) = mpsc::unbounded_channel();
        let handle = StreamHandle::new(shared.clone(), events_tx.clone());
        let stream = Self {
            shared,
            transport: Arc::downgrade(transport),
            events,
            events_tx,
            pending: BytesMut::new(),
            recv_fin: false,
            send_fin: !bidirectional,
        };
        (stream, handle)
    }

    pub fn id(&self) -> Option<StreamId> {
        self.shared.id()
    }

    pub fn bidirectional(&self) -> bool {
        self.shared.bidirectional()
    }

    pub fn is_incoming(&self) -> bool {
        self.shared.incoming()
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// Transmit `payload`; `fin` marks the last data for this direction
    ///
    /// The first send on an outgoing stream assigns its id and registers it
    /// with the owning multiplexer as one atomic unit, so the peer observes
    /// ids in the order sending began.
    pub async fn send(&mut self, payload: Bytes, fin: bool) -> Result<(), MuxError> {
        if let Some(error) = self.shared.terminal_error() {
            return Err(error);
        }
        if self.send_fin {
            return Err(MuxError::StreamFinished);
        }
        if payload.is_empty() && !fin {
            return Err(MuxError::EmptySend);
        }

        let transport = self.transport()?;
        match self.shared.id() {
            Some(id) => transport.send(id, payload, fin).await?,
            None => {
                let handle = StreamHandle::new(self.shared.clone(), self.events_tx.clone());
                let id = transport.start_stream(handle, payload, fin).await?;
                trace!(stream_id = id, "stream started");
            }
        }

        if fin {
            self.send_fin = true;
            self.shared.mark_send_done();
            self.maybe_finish();
        }
        Ok(())
    }

    /// Fill `buf` completely, suspending until enough data has arrived
    ///
    /// Returns whether the last byte written was the end of the stream.
    /// Receive calls are strictly sequential over the stream's life; this
    /// is enforced by the `&mut self` receiver.
    pub async fn receive(&mut self, buf: &mut [u8]) -> Result<bool, MuxError> {
        if let Some(error) = self.shared.terminal_error() {
            return Err(error);
        }

        let mut filled = 0;
        loop {
            if !self.pending.is_empty() && filled < buf.len() {
                let n = self.pending.len().min(buf.len() - filled);
                buf[filled..filled + n].copy_from_slice(&self.pending.split_to(n));
                filled += n;
            }
            if filled == buf.len() {
                let fin = self.recv_fin && self.pending.is_empty();
                if fin {
                    self.maybe_finish();
                }
                return Ok(fin);
            }
            if self.recv_fin {
                return Err(MuxError::TruncatedStream);
            }

            match self.events.recv().await {
                Some(StreamEvent::Data { payload, fin }) => {
                    self.pending.extend_from_slice(&payload);
                    if fin {
                        self.recv_fin = true;
                    }
                }
                Some(StreamEvent::Reset { error_code }) => {
                    return Err(MuxError::StreamReset(error_code));
                }
                Some(StreamEvent::Abort { error }) => return Err(error),
                None => {
                    return Err(self
                        .shared
                        .terminal_error()
                        .unwrap_or(MuxError::ConnectionLost));
                }
            }
        }
    }

    /// Abort the exchange at the protocol level
    ///
    /// Sends a reset to the peer if the stream was already started and
    /// transitions to the absorbing reset state. This is also what a caller
    /// uses when canceling a pending exchange, so the peer does not wait
    /// forever for more data.
    pub async fn reset(&mut self, error_code: u64) -> Result<(), MuxError> {
        if self.shared.terminal_error().is_some() || self.shared.is_completed() {
            return Ok(());
        }
        if let Some(id) = self.shared.id() {
            self.transport()?.reset(id, error_code).await?;
        }
        self.shared.mark_reset(error_code);
        Ok(())
    }

    /// Forcibly fail this stream with `error`, without wire effect
    ///
    /// Used for local teardown; further send/receive calls fail with the
    /// same error.
    pub fn abort(&mut self, error: MuxError) {
        self.shared.mark_aborted(error);
    }

    fn transport(&self) -> Result<Arc<dyn MuxTransport>, MuxError> {
        self.transport.upgrade().ok_or(MuxError::ConnectionLost)
    }

    fn maybe_finish(&self) {
        if self.shared.is_completed() {
            if let Some(transport) = self.transport.upgrade() {
                transport.release(&self.shared);
            }
        }
    }
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("id", &self.shared.id())
            .field("state", &self.shared.state())
            .field("bidirectional", &self.shared.bidirectional())
            .field("incoming", &self.shared.incoming())
            .finish()
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        if let Some(transport) = self.transport.upgrade() {
            transport.release(&self.shared);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::StreamIdAllocator;
    use std::collections::HashMap;

    /// Records every transport call; allocates ids like a client connection
    struct MockTransport {
        allocator: Mutex<StreamIdAllocator>,
        handles: Mutex<HashMap<StreamId, StreamHandle>>,
        sent: Mutex<Vec<(StreamId, Bytes, bool)>>,
        resets: Mutex<Vec<(StreamId, u64)>>,
        released: Mutex<Vec<Option<StreamId>>>,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                allocator: Mutex::new(StreamIdAllocator::new(true)),
                handles: Mutex::new(HashMap::new()),
                sent: Mutex::new(Vec::new()),
                resets: Mutex::new(Vec::new()),
                released: Mutex::new(Vec::new()),
            })
        }

        fn handle(&self, id: StreamId) -> StreamHandle {
            self.handles.lock().unwrap().get(&id).unwrap().clone()
        }
    }

    #[async_trait]
    impl MuxTransport for MockTransport {
        async fn start_stream(
            &self,
            handle: StreamHandle,
            payload: Bytes,
            fin: bool,
        ) -> Result<StreamId, MuxError> {
            let id = self
                .allocator
                .lock()
                .unwrap()
                .allocate(handle.shared.bidirectional());
            handle.shared.bind(id);
            self.handles.lock().unwrap().insert(id, handle);
            self.sent.lock().unwrap().push((id, payload, fin));
            Ok(id)
        }

        async fn send(&self, id: StreamId, payload: Bytes, fin: bool) -> Result<(), MuxError> {
            self.sent.lock().unwrap().push((id, payload, fin));
            Ok(())
        }

        async fn reset(&self, id: StreamId, error_code: u64) -> Result<(), MuxError> {
            self.resets.lock().unwrap().push((id, error_code));
            Ok(())
        }

        fn release(&self, shared: &StreamShared) {
            self.released.lock().unwrap().push(shared.id());
            if let Some(id) = shared.id() {
                self.handles.lock().unwrap().remove(&id);
            }
        }
    }

    fn as_dyn(mock: &Arc<MockTransport>) -> Arc<dyn MuxTransport> {
        mock.clone()
    }

    #[tokio::test]
    async fn test_first_send_starts_stream() {
        let mock = MockTransport::new();
        let mut stream = MuxStream::outgoing(&as_dyn(&mock), true);
        assert_eq!(stream.state(), StreamState::Unallocated);
        assert_eq!(stream.id(), None);

        stream.send(Bytes::from_static(b"req"), false).await.unwrap();
        assert_eq!(stream.id(), Some(0));
        assert_eq!(stream.state(), StreamState::Active);

        stream.send(Bytes::from_static(b"uest"), true).await.unwrap();
        assert_eq!(stream.state(), StreamState::HalfClosedSend);

        let sent = mock.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(!sent[0].2);
        assert!(sent[1].2);
    }

    #[tokio::test]
    async fn test_send_after_fin_fails() {
        let mock = MockTransport::new();
        let mut stream = MuxStream::outgoing(&as_dyn(&mock), true);
        stream.send(Bytes::from_static(b"x"), true).await.unwrap();

        assert!(matches!(
            stream.send(Bytes::from_static(b"y"), false).await,
            Err(MuxError::StreamFinished)
        ));
    }

    #[tokio::test]
    async fn test_zero_length_send_requires_fin() {
        let mock = MockTransport::new();
        let mut stream = MuxStream::outgoing(&as_dyn(&mock), true);
        assert!(matches!(
            stream.send(Bytes::new(), false).await,
            Err(MuxError::EmptySend)
        ));
        // Empty fin is a valid end-of-direction signal
        stream.send(Bytes::new(), true).await.unwrap();
    }

    #[tokio::test]
    async fn test_receive_assembles_fragments() {
        let mock = MockTransport::new();
        let mut stream = MuxStream::outgoing(&as_dyn(&mock), true);
        stream.send(Bytes::from_static(b"go"), true).await.unwrap();
        let handle = mock.handle(0);

        assert!(handle.deliver_data(Bytes::from_static(b"hel"), false));
        assert!(handle.deliver_data(Bytes::from_static(b"lo!"), true));

        let mut buf = [0u8; 4];
        let fin = stream.receive(&mut buf).await.unwrap();
        assert!(!fin);
        assert_eq!(&buf, b"hell");

        let mut rest = [0u8; 2];
        let fin = stream.receive(&mut rest).await.unwrap();
        assert!(fin);
        assert_eq!(&rest, b"o!");
        assert_eq!(stream.state(), StreamState::Completed);
    }

    #[tokio::test]
    async fn test_receive_truncated_stream() {
        let mock = MockTransport::new();
        let mut stream = MuxStream::outgoing(&as_dyn(&mock), true);
        stream.send(Bytes::from_static(b"go"), true).await.unwrap();
        mock.handle(0).deliver_data(Bytes::from_static(b"ab"), true);

        let mut buf = [0u8; 5];
        assert!(matches!(
            stream.receive(&mut buf).await,
            Err(MuxError::TruncatedStream)
        ));
    }

    #[tokio::test]
    async fn test_peer_reset_fails_receive_and_send() {
        let mock = MockTransport::new();
        let mut stream = MuxStream::outgoing(&as_dyn(&mock), true);
        stream.send(Bytes::from_static(b"go"), false).await.unwrap();
        mock.handle(0).deliver_reset(42);

        let mut buf = [0u8; 1];
        assert!(matches!(
            stream.receive(&mut buf).await,
            Err(MuxError::StreamReset(42))
        ));
        assert!(matches!(
            stream.send(Bytes::from_static(b"x"), false).await,
            Err(MuxError::StreamReset(42))
        ));
        assert_eq!(stream.state(), StreamState::Reset(42));
    }

    #[tokio::test]
    async fn test_local_reset_sends_wire_reset() {
        let mock = MockTransport::new();
        let mut stream = MuxStream::outgoing(&as_dyn(&mock), true);
        stream.send(Bytes::from_static(b"go"), false).await.unwrap();

        stream.reset(7).await.unwrap();
        assert_eq!(*mock.resets.lock().unwrap(), vec![(0, 7)]);
        assert_eq!(stream.state(), StreamState::Reset(7));
    }

    #[tokio::test]
    async fn test_reset_before_start_has_no_wire_effect() {
        let mock = MockTransport::new();
        let mut stream = MuxStream::outgoing(&as_dyn(&mock), true);
        stream.reset(7).await.unwrap();
        assert!(mock.resets.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abort_fails_in_flight_receive() {
        let mock = MockTransport::new();
        let mut stream = MuxStream::outgoing(&as_dyn(&mock), true);
        stream.send(Bytes::from_static(b"go"), false).await.unwrap();

        mock.handle(0)
            .deliver_abort(MuxError::ConnectionClosed("bye".to_string()));

        let mut buf = [0u8; 1];
        assert!(matches!(
            stream.receive(&mut buf).await,
            Err(MuxError::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_caller_cancellation_via_abort() {
        let mock = MockTransport::new();
        let mut stream = MuxStream::outgoing(&as_dyn(&mock), true);
        stream.send(Bytes::from_static(b"go"), false).await.unwrap();

        // A caller abandoning the exchange (e.g. on timeout) marks the
        // stream canceled locally; no wire traffic is produced by this
        stream.abort(MuxError::Canceled);
        assert!(mock.resets.lock().unwrap().is_empty());

        let mut buf = [0u8; 1];
        assert!(matches!(
            stream.receive(&mut buf).await,
            Err(MuxError::Canceled)
        ));
        assert!(matches!(
            stream.send(Bytes::from_static(b"x"), false).await,
            Err(MuxError::Canceled)
        ));
        assert_eq!(stream.state(), StreamState::Aborted);
    }

    #[tokio::test]
    async fn test_drop_releases_stream() {
        let mock = MockTransport::new();
        let mut stream = MuxStream::outgoing(&as_dyn(&mock), true);
        stream.send(Bytes::from_static(b"go"), false).await.unwrap();
        drop(stream);

        assert_eq!(*mock.released.lock().unwrap(), vec![Some(0)]);
    }

    #[tokio::test]
    async fn test_unidirectional_directions() {
        let mock = MockTransport::new();
        let mut out = MuxStream::outgoing(&as_dyn(&mock), false);
        out.send(Bytes::from_static(b"one-way"), true).await.unwrap();
        // Outgoing unidirectional stream completes once the fin is sent
        assert_eq!(out.state(), StreamState::Completed);

        let (mut inc, _handle) = MuxStream::incoming(&as_dyn(&mock), 7);
        assert!(matches!(
            inc.send(Bytes::from_static(b"x"), false).await,
            Err(MuxError::StreamFinished)
        ));
    }
}
