//! Registry of tracked streams and their read cursors.
//!
//! An insertion-ordered map from stream name to the id of the last dispatched
//! entry (or [`FROM_NOW`] before anything arrived). The manager owns the only
//! instance and guards it with its state lock; the registry itself is plain
//! data.

use indexmap::IndexMap;
use tracing::debug;

use crate::entry::FROM_NOW;

/// Ordered stream name → cursor map.
#[derive(Debug, Default)]
pub(crate) struct StreamRegistry {
    streams: IndexMap<String, String>,
}

impl StreamRegistry {
    pub(crate) fn new() -> Self {
        Self {
            streams: IndexMap::new(),
        }
    }

    /// Track `name` starting at `cursor` (or [`FROM_NOW`] when `None`).
    ///
    /// Idempotent: re-adding an existing stream keeps its current cursor.
    /// Returns `true` if the stream was newly inserted.
    pub(crate) fn add(&mut self, name: &str, cursor: Option<&str>) -> bool {
        if self.streams.contains_key(name) {
            return false;
        }
        let cursor = cursor.unwrap_or(FROM_NOW);
        debug!(stream = %name, cursor = %cursor, "Tracking stream");
        self.streams.insert(name.to_string(), cursor.to_string());
        true
    }

    /// Stop tracking `name`. Returns `true` if it was tracked.
    pub(crate) fn remove(&mut self, name: &str) -> bool {
        let removed = self.streams.shift_remove(name).is_some();
        if removed {
            debug!(stream = %name, "Dropped stream");
        }
        removed
    }

    /// Current cursor for `name`.
    pub(crate) fn cursor(&self, name: &str) -> Option<&str> {
        self.streams.get(name).map(String::as_str)
    }

    /// Move the cursor for `name` forward to `id`.
    ///
    /// No-op (returns `false`) when the stream is no longer tracked, so a
    /// concurrent unsubscribe cannot resurrect a stream mid-batch.
    pub(crate) fn advance(&mut self, name: &str, id: &str) -> bool {
        match self.streams.get_mut(name) {
            Some(cursor) => {
                id.clone_into(cursor);
                true
            }
            None => false,
        }
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.streams.contains_key(name)
    }

    pub(crate) fn len(&self) -> usize {
        self.streams.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Ordered `(name, cursor)` pairs for building one read request.
    pub(crate) fn snapshot(&self) -> Vec<(String, String)> {
        self.streams
            .iter()
            .map(|(name, cursor)| (name.clone(), cursor.clone()))
            .collect()
    }

    /// Drop every tracked stream.
    pub(crate) fn clear(&mut self) {
        self.streams.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_defaults_to_from_now() {
        let mut registry = StreamRegistry::new();
        assert!(registry.add("orders", None));
        assert_eq!(registry.cursor("orders"), Some(FROM_NOW));
    }

    #[test]
    fn test_re_add_keeps_cursor() {
        let mut registry = StreamRegistry::new();
        registry.add("orders", Some("5-0"));
        assert!(!registry.add("orders", None));
        assert!(!registry.add("orders", Some("9-0")));
        assert_eq!(registry.cursor("orders"), Some("5-0"));
    }

    #[test]
    fn test_advance_requires_membership() {
        let mut registry = StreamRegistry::new();
        registry.add("orders", None);
        assert!(registry.advance("orders", "5-0"));
        assert_eq!(registry.cursor("orders"), Some("5-0"));

        assert!(!registry.advance("ghost", "1-0"));
        assert!(!registry.contains("ghost"));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut registry = StreamRegistry::new();
        registry.add("orders", None);
        assert!(registry.remove("orders"));
        assert!(!registry.remove("orders"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_preserves_insertion_order() {
        let mut registry = StreamRegistry::new();
        registry.add("a", None);
        registry.add("b", Some("3-0"));
        registry.add("c", None);
        registry.remove("a");

        let snapshot = registry.snapshot();
        assert_eq!(
            snapshot,
            vec![
                ("b".to_string(), "3-0".to_string()),
                ("c".to_string(), FROM_NOW.to_string()),
            ]
        );
        assert_eq!(registry.len(), 2);
    }
}
