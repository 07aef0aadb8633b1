//! Attribute index over sessions.
//!
//! [`GenericIndex`] answers "which session ids currently have field F set
//! to value V" in O(1). It keeps a forward map (`field → value → sids`)
//! and a reverse map (`sid → [(field, value)]`) that are mutated together
//! under one writer lock, so the two views never disagree.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

/// Shared, read-only set of session ids returned by lookups.
pub type SidSet = Arc<HashSet<String>>;

#[derive(Default)]
struct IndexInner {
    forward: HashMap<String, HashMap<String, SidSet>>,
    reverse: HashMap<String, Vec<(String, String)>>,
}

/// Concurrent forward/reverse index of session attributes.
#[derive(Default)]
pub struct GenericIndex {
    inner: RwLock<IndexInner>,
}

impl GenericIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Map `(field, value)` to `sid`, replacing any previous value the
    /// session had for the same field.
    pub fn add(&self, sid: &str, field: &str, value: &str) {
        let mut inner = self.inner.write();

        let history = inner.reverse.entry(sid.to_string()).or_default();
        let mut known_field = false;
        let mut stale: Option<String> = None;
        for entry in history.iter_mut() {
            if entry.0 == field {
                known_field = true;
                if entry.1 == value {
                    return; // unchanged
                }
                stale = Some(std::mem::replace(&mut entry.1, value.to_string()));
            }
        }
        if !known_field {
            history.push((field.to_string(), value.to_string()));
        }

        if let Some(old_value) = stale {
            Self::erase_forward(&mut inner.forward, sid, field, &old_value);
        }

        let slot = inner
            .forward
            .entry(field.to_string())
            .or_default()
            .entry(value.to_string())
            .or_insert_with(|| Arc::new(HashSet::new()));
        Arc::make_mut(slot).insert(sid.to_string());
    }

    /// Drop every mapping recorded for `sid`.
    pub fn remove(&self, sid: &str) {
        let mut inner = self.inner.write();
        let Some(history) = inner.reverse.remove(sid) else {
            return;
        };
        for (field, value) in &history {
            Self::erase_forward(&mut inner.forward, sid, field, value);
        }
    }

    /// Session ids currently mapped to `(field, value)`.
    ///
    /// The returned handle is a snapshot; concurrent mutations produce new
    /// sets and never alter one already handed out.
    #[must_use]
    pub fn find(&self, field: &str, value: &str) -> Option<SidSet> {
        let inner = self.inner.read();
        inner
            .forward
            .get(field)
            .and_then(|values| values.get(value))
            .cloned()
    }

    fn erase_forward(
        forward: &mut HashMap<String, HashMap<String, SidSet>>,
        sid: &str,
        field: &str,
        value: &str,
    ) {
        let Some(values) = forward.get_mut(field) else {
            return;
        };
        let mut value_empty = false;
        if let Some(set) = values.get_mut(value) {
            Arc::make_mut(set).remove(sid);
            value_empty = set.is_empty();
        }
        if value_empty {
            values.remove(value);
        }
        if values.is_empty() {
            forward.remove(field);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_find() {
        let idx = GenericIndex::new();
        idx.add("S1", "room", "lobby");
        let hit = idx.find("room", "lobby").unwrap();
        assert!(hit.contains("S1"));
        assert_eq!(hit.len(), 1);
    }

    #[test]
    fn add_replaces_previous_value_for_same_field() {
        let idx = GenericIndex::new();
        idx.add("S1", "room", "lobby");
        idx.add("S1", "room", "garden");
        assert!(idx.find("room", "lobby").is_none());
        assert!(idx.find("room", "garden").unwrap().contains("S1"));
    }

    #[test]
    fn distinct_fields_coexist() {
        let idx = GenericIndex::new();
        idx.add("S1", "room", "lobby");
        idx.add("S1", "role", "admin");
        assert!(idx.find("room", "lobby").unwrap().contains("S1"));
        assert!(idx.find("role", "admin").unwrap().contains("S1"));
    }

    #[test]
    fn remove_erases_all_mappings() {
        let idx = GenericIndex::new();
        idx.add("S1", "room", "lobby");
        idx.add("S1", "role", "admin");
        idx.add("S2", "room", "lobby");
        idx.remove("S1");
        let lobby = idx.find("room", "lobby").unwrap();
        assert!(!lobby.contains("S1"));
        assert!(lobby.contains("S2"));
        assert!(idx.find("role", "admin").is_none());
    }

    #[test]
    fn snapshot_is_unaffected_by_later_writes() {
        let idx = GenericIndex::new();
        idx.add("S1", "room", "lobby");
        let before = idx.find("room", "lobby").unwrap();
        idx.add("S2", "room", "lobby");
        assert_eq!(before.len(), 1);
        assert_eq!(idx.find("room", "lobby").unwrap().len(), 2);
    }

    #[test]
    fn remove_unknown_sid_is_a_noop() {
        let idx = GenericIndex::new();
        idx.add("S1", "room", "lobby");
        idx.remove("S9");
        assert!(idx.find("room", "lobby").unwrap().contains("S1"));
    }
}
