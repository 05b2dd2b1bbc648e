//! Per-connection stream registry

use crate::error::MuxError;
use crate::id::StreamId;
use crate::stream::StreamHandle;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Maps stream id to the handle the receive loop routes frames through
///
/// Owned exclusively by the connection; a sync mutex so streams can
/// deregister themselves from `Drop`.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: Mutex<HashMap<StreamId, StreamHandle>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: StreamId, handle: StreamHandle) {
        if self.streams.lock().unwrap().insert(id, handle).is_some() {
            warn!(stream_id = id, "stream id registered twice");
        }
    }

    pub fn get(&self, id: StreamId) -> Option<StreamHandle> {
        self.streams.lock().unwrap().get(&id).cloned()
    }

    pub fn remove(&self, id: StreamId) -> Option<StreamHandle> {
        self.streams.lock().unwrap().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.lock().unwrap().is_empty()
    }

    /// Fail every registered stream with `error` and empty the registry
    ///
    /// A fatal connection error surfaces identically to every stream that
    /// was still active.
    pub fn abort_all(&self, error: MuxError) {
        let streams: Vec<_> = {
            let mut map = self.streams.lock().unwrap();
            map.drain().collect()
        };
        if !streams.is_empty() {
            debug!(count = streams.len(), %error, "aborting all streams");
        }
        for (_, handle) in streams {
            handle.deliver_abort(error.clone());
        }
    }
}
