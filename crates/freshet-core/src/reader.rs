//! Reader abstraction over the external log server.
//!
//! The consumption loop only needs one primitive: a blocking multi-stream
//! read. Implementations wrap a concrete client (`freshet-redis` provides the
//! Redis Streams one); tests script the trait directly.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::entry::StreamBatch;

/// Read errors.
#[derive(Debug, Error)]
pub enum ReadError {
    /// The client's connection was closed underneath a blocking read, e.g.
    /// during a graceful disconnect. Transient: the loop backs off and
    /// retries.
    #[error("connection closed")]
    ConnectionClosed,

    /// I/O failure talking to the log server.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other failure reported by the log server or client.
    #[error("log source error: {0}")]
    Source(String),
}

impl ReadError {
    /// Whether the consumption loop may retry after this error.
    ///
    /// Only [`ReadError::ConnectionClosed`] is retried; everything else stops
    /// the loop and is surfaced on the manager's error channel.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, ReadError::ConnectionClosed)
    }
}

/// A blocking multi-stream read against the external log server.
///
/// One call covers every tracked stream at its own cursor, so the server does
/// the waiting and the loop costs one round-trip per wakeup.
#[async_trait]
pub trait StreamReader: Send + Sync + 'static {
    /// Wait up to `block` for new entries on any of `cursors`.
    ///
    /// `cursors` holds ordered `(stream, cursor)` pairs; `count` bounds the
    /// number of entries returned per stream when set. Returns `Ok(None)`
    /// when the timeout elapsed with no data, which is not an error, and
    /// otherwise one [`StreamBatch`] per stream that has data, entries in
    /// ascending id order.
    ///
    /// # Errors
    ///
    /// [`ReadError::ConnectionClosed`] when the connection was torn down
    /// mid-read; any other [`ReadError`] is fatal to the loop.
    async fn read(
        &self,
        cursors: &[(String, String)],
        block: Duration,
        count: Option<usize>,
    ) -> Result<Option<Vec<StreamBatch>>, ReadError>;
}
