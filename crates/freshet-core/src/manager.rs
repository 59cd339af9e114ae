//! The stream manager: subscription facade and consumption loop.
//!
//! [`StreamManager`] tracks streams in a registry, fans entries out to
//! listeners, and drives a single background task that drains every tracked
//! stream with one blocking multi-stream read per round-trip. The lifecycle
//! is implicit: adding the first stream starts the loop, removing the last
//! one stops it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::entry::{StreamBatch, StreamSpec};
use crate::listeners::{ListenerHandle, ListenerTable, StreamCallback};
use crate::reader::{ReadError, StreamReader};
use crate::registry::StreamRegistry;

/// Usage errors raised synchronously by the subscription API.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// `add()` or `remove()` was called without any stream argument.
    #[error("{op}() expects at least one stream")]
    NoStreams {
        /// The offending operation.
        op: &'static str,
    },
}

/// Consumption loop configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// How long one blocking read may wait for new entries.
    pub block_timeout: Duration,
    /// Upper bound on entries returned per stream per read; unbounded when
    /// `None`.
    pub count: Option<usize>,
    /// Backoff before retrying after a closed connection.
    pub retry_delay: Duration,
    /// Capacity of the fatal-error broadcast channel.
    pub error_capacity: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            block_timeout: Duration::from_millis(10_000),
            count: None,
            retry_delay: Duration::from_secs(5),
            error_capacity: 16,
        }
    }
}

/// Registry and listener tables, mutated together under one lock.
///
/// The lock is only ever held for plain map work: never across an `.await`
/// and never while a listener callback runs, so callbacks may reentrantly
/// call any manager method.
#[derive(Default)]
struct State {
    registry: StreamRegistry,
    listeners: ListenerTable,
}

/// Handle to the current consumption task generation.
#[derive(Default)]
struct TaskSlot {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

struct Inner<R> {
    reader: R,
    config: ConsumerConfig,
    state: Mutex<State>,
    started: AtomicBool,
    task: Mutex<TaskSlot>,
    errors: broadcast::Sender<Arc<ReadError>>,
}

/// Continuous consumer for server-held append-only streams.
///
/// A cheaply cloneable handle; clones share one registry, listener table, and
/// consumption task. Listener registration (`on`, `once`, …) implicitly
/// tracks the stream and starts the loop; dropping the last listener of a
/// stream untracks it, and an empty registry stops the loop.
///
/// `stop()` is cooperative: the loop observes it at its next iteration
/// boundary, so stop latency is bounded by [`ConsumerConfig::block_timeout`].
/// The background task holds a handle to the shared state, so call
/// [`stop`](Self::stop) (or [`shutdown`](Self::shutdown)) when the consumer
/// is no longer wanted.
///
/// Fatal read failures terminate the loop and are delivered on the channel
/// returned by [`errors`](Self::errors); when nobody is subscribed there,
/// they are logged at ERROR level instead of being dropped silently.
pub struct StreamManager<R> {
    inner: Arc<Inner<R>>,
}

impl<R> Clone for StreamManager<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R> std::fmt::Debug for StreamManager<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager").finish_non_exhaustive()
    }
}

impl<R: StreamReader> StreamManager<R> {
    /// Create a manager over `reader` with the default configuration.
    #[must_use]
    pub fn new(reader: R) -> Self {
        Self::with_config(reader, ConsumerConfig::default())
    }

    /// Create a manager over `reader` with an explicit configuration.
    #[must_use]
    pub fn with_config(reader: R, config: ConsumerConfig) -> Self {
        let (errors, _) = broadcast::channel(config.error_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                reader,
                config,
                state: Mutex::new(State::default()),
                started: AtomicBool::new(false),
                task: Mutex::new(TaskSlot::default()),
                errors,
            }),
        }
    }

    /// Whether a consumption task is actively looping.
    #[must_use]
    pub fn started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Number of tracked streams.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.state.lock().registry.len()
    }

    /// Whether no stream is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().registry.is_empty()
    }

    /// Whether `stream` is tracked.
    #[must_use]
    pub fn has(&self, stream: &str) -> bool {
        self.inner.state.lock().registry.contains(stream)
    }

    /// Current cursor for `stream`: the id of the last dispatched entry, or
    /// [`FROM_NOW`](crate::FROM_NOW) before anything arrived.
    #[must_use]
    pub fn cursor(&self, stream: &str) -> Option<String> {
        self.inner
            .state
            .lock()
            .registry
            .cursor(stream)
            .map(str::to_owned)
    }

    /// Number of listeners currently attached to `stream`.
    #[must_use]
    pub fn listener_count(&self, stream: &str) -> usize {
        self.inner.state.lock().listeners.count(stream)
    }

    /// Subscribe to fatal consumption-loop failures.
    ///
    /// Each fatal error is delivered once to every receiver that existed when
    /// the loop failed.
    #[must_use]
    pub fn errors(&self) -> broadcast::Receiver<Arc<ReadError>> {
        self.inner.errors.subscribe()
    }

    /// Start the consumption loop.
    ///
    /// No-op while already started or while no stream is tracked. Must be
    /// called from within a tokio runtime. Listener registration and
    /// [`add`](Self::add) call this implicitly; an explicit call is only
    /// needed to restart after a fatal read error.
    pub fn start(&self) {
        self.inner.ensure_started();
    }

    /// Stop the consumption loop.
    ///
    /// Cooperative: takes effect at the loop's next iteration boundary; an
    /// in-flight blocking read is never cancelled mid-call.
    pub fn stop(&self) {
        self.inner.halt();
    }

    /// Stop the consumption loop and wait for its task to finish.
    ///
    /// Waits at most one [`ConsumerConfig::block_timeout`] for an in-flight
    /// read to resolve.
    pub async fn shutdown(&self) {
        self.inner.halt();
        let handle = self.inner.task.lock().handle.take();
        if let Some(handle) = handle {
            if handle.await.is_err() {
                error!("Consumption task panicked during shutdown");
            }
        }
    }

    /// Track one or more streams and start the loop if needed.
    ///
    /// Each item is a bare name (subscribe from now on) or a
    /// `(name, cursor)` pair; see [`StreamSpec`]. Re-adding a tracked stream
    /// keeps its current cursor.
    ///
    /// # Errors
    ///
    /// [`ManagerError::NoStreams`] when `streams` is empty.
    pub fn add<I, S>(&self, streams: I) -> Result<&Self, ManagerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<StreamSpec>,
    {
        let specs: Vec<StreamSpec> = streams.into_iter().map(Into::into).collect();
        if specs.is_empty() {
            return Err(ManagerError::NoStreams { op: "add" });
        }
        {
            let mut state = self.inner.state.lock();
            for spec in specs {
                state.registry.add(&spec.name, spec.cursor.as_deref());
            }
        }
        self.inner.ensure_started();
        Ok(self)
    }

    /// Untrack one or more streams, dropping all their listeners; stops the
    /// loop when the registry becomes empty.
    ///
    /// # Errors
    ///
    /// [`ManagerError::NoStreams`] when `streams` is empty.
    pub fn remove<I, S>(&self, streams: I) -> Result<&Self, ManagerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names: Vec<String> = streams
            .into_iter()
            .map(|name| name.as_ref().to_string())
            .collect();
        if names.is_empty() {
            return Err(ManagerError::NoStreams { op: "remove" });
        }
        {
            let mut state = self.inner.state.lock();
            for name in &names {
                state.registry.remove(name);
                state.listeners.remove_stream(name);
            }
            self.inner.stop_if_empty(&state);
        }
        Ok(self)
    }

    /// Attach a listener to `stream`, tracking the stream (from now on) and
    /// starting the loop if needed.
    pub fn add_listener(&self, stream: &str, callback: StreamCallback) -> &Self {
        self.attach(stream, callback, false, false)
    }

    /// Alias for [`add_listener`](Self::add_listener).
    pub fn on(&self, stream: &str, callback: StreamCallback) -> &Self {
        self.add_listener(stream, callback)
    }

    /// Attach several listeners to `stream` in order. Empty input is a no-op.
    pub fn add_listeners(&self, stream: &str, callbacks: &[StreamCallback]) -> &Self {
        if callbacks.is_empty() {
            return self;
        }
        {
            let mut state = self.inner.state.lock();
            for callback in callbacks {
                state
                    .listeners
                    .insert(stream, Arc::clone(callback), false, false);
            }
            state.registry.add(stream, None);
        }
        self.inner.ensure_started();
        self
    }

    /// Attach a listener ahead of the existing ones for `stream`.
    pub fn prepend_listener(&self, stream: &str, callback: StreamCallback) -> &Self {
        self.attach(stream, callback, false, true)
    }

    /// Attach several listeners ahead of the existing ones, preserving their
    /// relative order. Empty input is a no-op.
    pub fn prepend_listeners(&self, stream: &str, callbacks: &[StreamCallback]) -> &Self {
        if callbacks.is_empty() {
            return self;
        }
        {
            let mut state = self.inner.state.lock();
            for callback in callbacks.iter().rev() {
                state
                    .listeners
                    .insert(stream, Arc::clone(callback), false, true);
            }
            state.registry.add(stream, None);
        }
        self.inner.ensure_started();
        self
    }

    /// Attach a one-shot listener: after its single invocation it detaches
    /// itself, and if it was the stream's last listener the stream is
    /// untracked before the callback body runs.
    pub fn once(&self, stream: &str, callback: StreamCallback) -> &Self {
        self.attach(stream, callback, true, false)
    }

    /// One-shot variant of [`prepend_listener`](Self::prepend_listener).
    pub fn prepend_once_listener(&self, stream: &str, callback: StreamCallback) -> &Self {
        self.attach(stream, callback, true, true)
    }

    /// Detach the most recently added occurrence of `callback` from `stream`;
    /// untracks the stream when its listener count reaches zero.
    ///
    /// Detaching an unknown callback or stream is a no-op for everything
    /// else.
    pub fn remove_listener(&self, stream: &str, callback: &StreamCallback) -> &Self {
        let mut state = self.inner.state.lock();
        state.listeners.remove_callback(stream, callback);
        if state.listeners.count(stream) == 0 {
            state.registry.remove(stream);
            self.inner.stop_if_empty(&state);
        }
        drop(state);
        self
    }

    /// Alias for [`remove_listener`](Self::remove_listener).
    pub fn off(&self, stream: &str, callback: &StreamCallback) -> &Self {
        self.remove_listener(stream, callback)
    }

    /// Detach several listeners from `stream`.
    pub fn remove_listeners(&self, stream: &str, callbacks: &[StreamCallback]) -> &Self {
        let mut state = self.inner.state.lock();
        for callback in callbacks {
            state.listeners.remove_callback(stream, callback);
        }
        if state.listeners.count(stream) == 0 {
            state.registry.remove(stream);
            self.inner.stop_if_empty(&state);
        }
        drop(state);
        self
    }

    /// Drop listeners and stop tracking.
    ///
    /// With an empty `streams` iterator this clears every stream and every
    /// listener (a full stop); with names it removes those streams and all
    /// their listeners.
    pub fn remove_all_listeners<I, S>(&self, streams: I) -> &Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names: Vec<String> = streams
            .into_iter()
            .map(|name| name.as_ref().to_string())
            .collect();
        let mut state = self.inner.state.lock();
        if names.is_empty() {
            state.listeners.clear();
            state.registry.clear();
        } else {
            for name in &names {
                state.listeners.remove_stream(name);
                state.registry.remove(name);
            }
        }
        self.inner.stop_if_empty(&state);
        drop(state);
        self
    }

    fn attach(&self, stream: &str, callback: StreamCallback, once: bool, prepend: bool) -> &Self {
        {
            let mut state = self.inner.state.lock();
            state.listeners.insert(stream, callback, once, prepend);
            state.registry.add(stream, None);
        }
        self.inner.ensure_started();
        self
    }
}

impl<R: StreamReader> Inner<R> {
    /// The one place the "started ⇔ registry non-empty" rule flips the flag
    /// on: spawns a fresh task generation unless one is already running.
    fn ensure_started(self: &Arc<Self>) {
        let empty = self.state.lock().registry.is_empty();
        if empty {
            return;
        }
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        debug!("Starting consumption loop");
        let token = CancellationToken::new();
        let previous = {
            let mut slot = self.task.lock();
            slot.token = token.clone();
            slot.handle.take()
        };
        let handle = tokio::spawn(Arc::clone(self).consume(token, previous));
        self.task.lock().handle = Some(handle);
    }

    /// The one place the flag flips off.
    fn halt(&self) {
        if self.started.swap(false, Ordering::SeqCst) {
            debug!("Stopping consumption loop");
        }
        self.task.lock().token.cancel();
    }

    fn stop_if_empty(&self, state: &State) {
        if state.registry.is_empty() {
            self.halt();
        }
    }

    async fn consume(
        self: Arc<Self>,
        token: CancellationToken,
        previous: Option<JoinHandle<()>>,
    ) {
        // At most one blocking read in flight: a restarted loop waits for the
        // previous task generation to wind down first.
        if let Some(previous) = previous {
            let _ = previous.await;
        }
        debug!("Consumption loop running");
        loop {
            if token.is_cancelled() || !self.started.load(Ordering::SeqCst) {
                break;
            }
            let cursors = self.state.lock().registry.snapshot();
            if cursors.is_empty() {
                self.started.store(false, Ordering::SeqCst);
                break;
            }
            match self
                .reader
                .read(&cursors, self.config.block_timeout, self.config.count)
                .await
            {
                Ok(None) => continue,
                Ok(Some(batches)) => self.dispatch(batches),
                Err(err) if err.is_transient() => {
                    warn!(
                        retry_in = ?self.config.retry_delay,
                        "Connection closed during blocking read, retrying"
                    );
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.config.retry_delay) => {}
                    }
                }
                Err(err) => {
                    self.started.store(false, Ordering::SeqCst);
                    self.report_fatal(err);
                    break;
                }
            }
        }
        debug!("Consumption loop stopped");
    }

    fn dispatch(&self, batches: Vec<StreamBatch>) {
        for batch in batches {
            let StreamBatch { stream, entries } = batch;
            for entry in entries {
                let Some(listeners) = self.begin_entry(&stream, &entry.id) else {
                    trace!(stream = %stream, id = %entry.id, "Stream untracked mid-batch, skipping entry");
                    continue;
                };
                let (id, data) = entry.into_parts();
                trace!(stream = %stream, id = %id, listeners = listeners.len(), "Dispatching entry");
                for listener in listeners {
                    if listener.once {
                        self.retire_once(&stream, listener.id);
                    }
                    (listener.callback)(&data, &id, &stream);
                }
            }
        }
    }

    /// Advance the cursor for one entry and snapshot its listeners.
    ///
    /// `None` when the stream left the registry since the read was issued;
    /// the entry is then skipped. The cursor is advanced before any listener
    /// runs, so callbacks observe it already at the entry being delivered.
    fn begin_entry(&self, stream: &str, id: &str) -> Option<Vec<ListenerHandle>> {
        let mut state = self.state.lock();
        if !state.registry.advance(stream, id) {
            return None;
        }
        Some(state.listeners.snapshot(stream))
    }

    /// Detach a one-shot registration; untracks the stream when it was the
    /// last listener.
    fn retire_once(&self, stream: &str, registration: u64) {
        let mut state = self.state.lock();
        if state.listeners.remove_id(stream, registration) && state.listeners.count(stream) == 0 {
            state.registry.remove(stream);
            self.stop_if_empty(&state);
        }
    }

    fn report_fatal(&self, err: ReadError) {
        let err = Arc::new(err);
        if self.errors.send(Arc::clone(&err)).is_ok() {
            error!(error = %err, "Consumption loop failed");
        } else {
            error!(error = %err, "Consumption loop failed with nobody on the error channel");
        }
    }
}
