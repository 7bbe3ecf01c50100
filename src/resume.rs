//! The resume state boundary (§6): an optional key-value store mapping a
//! torrent identifier to the set of block indices already downloaded.
//!
//! This crate defines only the trait and an in-memory reference
//! implementation used by tests; a persistent implementation (e.g. backed
//! by a file or embedded database) is left to an application built on top
//! of this crate. Absence of a store must never prevent downloading.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

/// A pluggable store of already-downloaded block indices, keyed by an
/// application-chosen torrent identifier (commonly the info hash, hex
/// encoded, or a user-facing torrent name).
pub trait ResumeStore: Send + Sync {
    /// Returns the set of global block indices already known to be
    /// downloaded for `torrent_id`. An empty set (including for an unknown
    /// id) is always a safe answer.
    fn load(&self, torrent_id: &str) -> HashSet<usize>;

    /// Records that `block` has been downloaded for `torrent_id`.
    fn save(&self, torrent_id: &str, block: usize);
}

/// An in-memory `ResumeStore`, useful for tests and for short-lived
/// processes that don't need resume to survive a restart.
#[derive(Default)]
pub struct InMemoryResumeStore {
    blocks: Mutex<HashMap<String, HashSet<usize>>>,
}

impl InMemoryResumeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResumeStore for InMemoryResumeStore {
    fn load(&self, torrent_id: &str) -> HashSet<usize> {
        self.blocks
            .lock()
            .unwrap()
            .get(torrent_id)
            .cloned()
            .unwrap_or_default()
    }

    fn save(&self, torrent_id: &str, block: usize) {
        self.blocks
            .lock()
            .unwrap()
            .entry(torrent_id.to_string())
            .or_insert_with(HashSet::new)
            .insert(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_torrent_yields_empty_hint() {
        let store = InMemoryResumeStore::new();
        assert!(store.load("unknown").is_empty());
    }

    #[test]
    fn saved_blocks_are_loaded_back() {
        let store = InMemoryResumeStore::new();
        store.save("abc", 0);
        store.save("abc", 5);
        let hint = store.load("abc");
        assert_eq!(hint.len(), 2);
        assert!(hint.contains(&0));
        assert!(hint.contains(&5));
    }
}
