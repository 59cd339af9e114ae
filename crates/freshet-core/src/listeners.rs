//! Per-stream listener bookkeeping.
//!
//! Listener lists are ordered, may contain the same callback more than once,
//! and support one-shot registrations. Callbacks are identified by `Arc`
//! pointer, the way an event emitter identifies listeners by function
//! reference.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::entry::StreamData;

/// Callback invoked once per dispatched entry with the field map, the entry
/// id, and the stream name.
pub type StreamCallback = Arc<dyn Fn(&StreamData, &str, &str) + Send + Sync>;

/// Counter for registration ids; unique across all tables in the process.
static REGISTRATION_COUNTER: AtomicU64 = AtomicU64::new(0);

struct Registration {
    id: u64,
    callback: StreamCallback,
    once: bool,
}

/// One dispatchable listener, cloned out of the table so the table lock is
/// not held while callbacks run.
pub(crate) struct ListenerHandle {
    pub(crate) id: u64,
    pub(crate) callback: StreamCallback,
    pub(crate) once: bool,
}

/// Ordered listener lists keyed by stream name.
///
/// A stream with zero listeners has no map entry at all, so emptiness checks
/// line up with registry membership.
#[derive(Default)]
pub(crate) struct ListenerTable {
    streams: HashMap<String, Vec<Registration>>,
}

impl ListenerTable {
    pub(crate) fn new() -> Self {
        Self {
            streams: HashMap::new(),
        }
    }

    /// Append (or prepend) a callback for `stream`; returns its registration
    /// id.
    pub(crate) fn insert(
        &mut self,
        stream: &str,
        callback: StreamCallback,
        once: bool,
        prepend: bool,
    ) -> u64 {
        let id = REGISTRATION_COUNTER.fetch_add(1, Ordering::Relaxed);
        let registration = Registration { id, callback, once };
        let list = self.streams.entry(stream.to_string()).or_default();
        if prepend {
            list.insert(0, registration);
        } else {
            list.push(registration);
        }
        id
    }

    /// Detach the most recently added occurrence of `callback` on `stream`.
    ///
    /// Returns `true` if something was removed; unknown callbacks and unknown
    /// streams are a no-op.
    pub(crate) fn remove_callback(&mut self, stream: &str, callback: &StreamCallback) -> bool {
        let Some(list) = self.streams.get_mut(stream) else {
            return false;
        };
        let position = list
            .iter()
            .rposition(|registration| Arc::ptr_eq(&registration.callback, callback));
        let removed = match position {
            Some(index) => {
                list.remove(index);
                true
            }
            None => false,
        };
        if list.is_empty() {
            self.streams.remove(stream);
        }
        removed
    }

    /// Detach one registration by id (one-shot retirement).
    pub(crate) fn remove_id(&mut self, stream: &str, id: u64) -> bool {
        let Some(list) = self.streams.get_mut(stream) else {
            return false;
        };
        let position = list.iter().position(|registration| registration.id == id);
        let removed = match position {
            Some(index) => {
                list.remove(index);
                true
            }
            None => false,
        };
        if list.is_empty() {
            self.streams.remove(stream);
        }
        removed
    }

    /// Drop every listener for `stream`; returns how many were attached.
    pub(crate) fn remove_stream(&mut self, stream: &str) -> usize {
        self.streams.remove(stream).map_or(0, |list| list.len())
    }

    pub(crate) fn count(&self, stream: &str) -> usize {
        self.streams.get(stream).map_or(0, Vec::len)
    }

    /// Listeners for `stream` in invocation order, cloned for dispatch.
    pub(crate) fn snapshot(&self, stream: &str) -> Vec<ListenerHandle> {
        self.streams.get(stream).map_or_else(Vec::new, |list| {
            list.iter()
                .map(|registration| ListenerHandle {
                    id: registration.id,
                    callback: Arc::clone(&registration.callback),
                    once: registration.once,
                })
                .collect()
        })
    }

    /// Drop every listener for every stream.
    pub(crate) fn clear(&mut self) {
        self.streams.clear();
    }
}
