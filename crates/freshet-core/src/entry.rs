//! Value types flowing through the consumption loop.
//!
//! Entries are transient: one blocking read produces [`StreamBatch`]es, each
//! entry is folded into a [`StreamData`] map, dispatched, and discarded.

use std::collections::HashMap;

/// Cursor sentinel meaning "only entries appended after this moment".
///
/// Matches the log server's own "latest" marker, so a registry snapshot can be
/// passed to the reader verbatim.
pub const FROM_NOW: &str = "$";

/// Field/value mapping handed to listeners, one per dispatched entry.
pub type StreamData = HashMap<String, String>;

/// One record read from a stream: an entry id plus its flat field/value pairs.
///
/// Ids are assigned by the log server and increase monotonically within a
/// stream; readers must return entries in ascending id order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Server-assigned entry id (e.g. `"1526919030474-0"`).
    pub id: String,
    /// Ordered field/value pairs as stored in the log.
    pub fields: Vec<(String, String)>,
}

impl StreamEntry {
    /// Create a new entry.
    #[must_use]
    pub fn new(id: impl Into<String>, fields: Vec<(String, String)>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Split the entry into its id and a field map.
    ///
    /// A field repeated in the flat pair list overwrites left-to-right, so the
    /// later duplicate wins.
    #[must_use]
    pub fn into_parts(self) -> (String, StreamData) {
        let mut data = StreamData::with_capacity(self.fields.len());
        for (key, value) in self.fields {
            data.insert(key, value);
        }
        (self.id, data)
    }
}

/// All entries returned for one stream by a single read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamBatch {
    /// Originating stream name.
    pub stream: String,
    /// Entries in ascending id order.
    pub entries: Vec<StreamEntry>,
}

impl StreamBatch {
    /// Create a new batch.
    #[must_use]
    pub fn new(stream: impl Into<String>, entries: Vec<StreamEntry>) -> Self {
        Self {
            stream: stream.into(),
            entries,
        }
    }
}

/// Argument to [`StreamManager::add`](crate::StreamManager::add): a stream
/// name with an optional initial cursor.
///
/// A bare name subscribes from now on; a `(name, cursor)` pair replays
/// everything after `cursor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    /// Stream name (unique key in the registry).
    pub name: String,
    /// Initial cursor; `None` means [`FROM_NOW`].
    pub cursor: Option<String>,
}

impl StreamSpec {
    /// Subscribe to `name` from now on.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cursor: None,
        }
    }

    /// Subscribe to `name` starting after `cursor`.
    #[must_use]
    pub fn with_cursor(name: impl Into<String>, cursor: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cursor: Some(cursor.into()),
        }
    }
}

impl From<&str> for StreamSpec {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for StreamSpec {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl From<(&str, &str)> for StreamSpec {
    fn from((name, cursor): (&str, &str)) -> Self {
        Self::with_cursor(name, cursor)
    }
}

impl From<(String, String)> for StreamSpec {
    fn from((name, cursor): (String, String)) -> Self {
        Self::with_cursor(name, cursor)
    }
}
