//! Stream-id allocation: the quad numbering scheme
//!
//! `id % 4` determines directionality and the initiating side:
//!
//! | id % 4 | initiator | kind           |
//! |--------|-----------|----------------|
//! | 0      | client    | bidirectional  |
//! | 1      | server    | bidirectional  |
//! | 2      | client    | unidirectional |
//! | 3      | server    | unidirectional |
//!
//! Ids 2 and 3 themselves are each side's control stream; the first
//! application unidirectional ids are 6 and 7. Ids are never reused and
//! strictly increase by 4 within a class.

use strand_proto::is_control_id;

/// Stream identifier
pub type StreamId = u64;

/// The directionality class a stream id belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamClass {
    pub bidirectional: bool,
    pub client_initiated: bool,
}

/// Classify a stream id by the quad scheme
pub fn classify(id: StreamId) -> StreamClass {
    StreamClass {
        bidirectional: id % 4 < 2,
        client_initiated: id % 2 == 0,
    }
}

/// Allocates the next outgoing stream id for each class
///
/// Allocation must happen inside the connection's send critical section
/// so id assignment is atomic with the first send for that stream;
/// `allocated` is safe to consult from any task at any time.
#[derive(Debug)]
pub struct StreamIdAllocator {
    next_bidi: StreamId,
    next_uni: StreamId,
}

impl StreamIdAllocator {
    pub fn new(client: bool) -> Self {
        Self {
            next_bidi: if client { 0 } else { 1 },
            next_uni: if client { 2 } else { 3 },
        }
    }

    /// Take the next id for the given class
    pub fn allocate(&mut self, bidirectional: bool) -> StreamId {
        let slot = if bidirectional {
            &mut self.next_bidi
        } else {
            &mut self.next_uni
        };
        let id = *slot;
        *slot += 4;
        id
    }

    /// The id the next `allocate` call for this class would return
    pub fn peek(&self, bidirectional: bool) -> StreamId {
        if bidirectional {
            self.next_bidi
        } else {
            self.next_uni
        }
    }

    /// Whether `id` was already handed out for its class
    pub fn allocated(&self, id: StreamId) -> bool {
        id < self.peek(classify(id).bidirectional)
    }
}

/// What to do with an incoming frame's stream id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdDisposition {
    /// The next expected id for its class: a new incoming stream
    New,
    /// Below the high-water mark: an already seen (possibly disposed) stream
    Replay,
    /// A gap in the sequence: the peer violated id monotonicity
    OutOfOrder,
}

/// Tracks the ids the peer has opened, per class
///
/// Receivers must observe peer-initiated ids in strictly increasing order;
/// a gap means frames were reordered or forged and the connection can no
/// longer be trusted.
#[derive(Debug)]
pub struct RemoteIdTracker {
    next_bidi: StreamId,
    next_uni: StreamId,
}

impl RemoteIdTracker {
    pub fn new(local_is_client: bool) -> Self {
        // Peer classes; the peer's first unidirectional id is its control
        // stream, which never appears as an application stream frame.
        Self {
            next_bidi: if local_is_client { 1 } else { 0 },
            next_uni: if local_is_client { 7 } else { 6 },
        }
    }

    /// Admit an id from a peer-initiated class
    pub fn admit(&mut self, id: StreamId) -> IdDisposition {
        let slot = if classify(id).bidirectional {
            &mut self.next_bidi
        } else {
            &mut self.next_uni
        };

        if id == *slot {
            *slot += 4;
            IdDisposition::New
        } else if id < *slot {
            IdDisposition::Replay
        } else {
            IdDisposition::OutOfOrder
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quad_allocation_sequences() {
        let mut client = StreamIdAllocator::new(true);
        assert_eq!(client.allocate(true), 0);
        assert_eq!(client.allocate(true), 4);
        assert_eq!(client.allocate(true), 8);
        assert_eq!(client.allocate(false), 2);
        assert_eq!(client.allocate(false), 6);

        let mut server = StreamIdAllocator::new(false);
        assert_eq!(server.allocate(true), 1);
        assert_eq!(server.allocate(true), 5);
        assert_eq!(server.allocate(false), 3);
        assert_eq!(server.allocate(false), 7);
    }

    #[test]
    fn test_control_ids_reserved() {
        // The first unidirectional allocation on each side is the control
        // stream, taken by the connection itself during setup; application
        // code can never be handed id 2 or 3 afterwards.
        let mut client = StreamIdAllocator::new(true);
        let control = client.allocate(false);
        assert!(is_control_id(control));
        for _ in 0..100 {
            assert!(!is_control_id(client.allocate(false)));
            assert!(!is_control_id(client.allocate(true)));
        }

        let mut server = StreamIdAllocator::new(false);
        let control = server.allocate(false);
        assert!(is_control_id(control));
        for _ in 0..100 {
            assert!(!is_control_id(server.allocate(false)));
            assert!(!is_control_id(server.allocate(true)));
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(0),
            StreamClass {
                bidirectional: true,
                client_initiated: true
            }
        );
        assert_eq!(
            classify(1),
            StreamClass {
                bidirectional: true,
                client_initiated: false
            }
        );
        assert_eq!(
            classify(6),
            StreamClass {
                bidirectional: false,
                client_initiated: true
            }
        );
        assert_eq!(
            classify(7),
            StreamClass {
                bidirectional: false,
                client_initiated: false
            }
        );
    }

    #[test]
    fn test_remote_tracker_in_order() {
        // Server side observing client bidirectional ids
        let mut tracker = RemoteIdTracker::new(false);
        assert_eq!(tracker.admit(0), IdDisposition::New);
        assert_eq!(tracker.admit(4), IdDisposition::New);
        assert_eq!(tracker.admit(8), IdDisposition::New);
    }

    #[test]
    fn test_remote_tracker_replay_and_gap() {
        let mut tracker = RemoteIdTracker::new(false);
        assert_eq!(tracker.admit(0), IdDisposition::New);
        // Data for an already admitted id is a replay, not a new stream
        assert_eq!(tracker.admit(0), IdDisposition::Replay);
        // Skipping ahead is a protocol violation
        assert_eq!(tracker.admit(8), IdDisposition::OutOfOrder);
        // Unidirectional class is tracked independently
        assert_eq!(tracker.admit(6), IdDisposition::New);
        assert_eq!(tracker.admit(4), IdDisposition::New);
    }
}
