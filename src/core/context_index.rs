//! Recency index of cached contexts.
//!
//! Entries are kept oldest first. Serialized form is an array of
//! `[contextHash, timestampMillis]` pairs in the same order.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, Result, SyncError};

/// One cached context and when it was last made active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry(pub String, pub i64);

impl IndexEntry {
    pub fn context_id(&self) -> &str {
        &self.0
    }

    pub fn timestamp(&self) -> i64 {
        self.1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextIndex {
    entries: Vec<IndexEntry>,
}

impl ContextIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<IndexEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, context_id: &str) -> bool {
        self.entries.iter().any(|e| e.0 == context_id)
    }

    /// Record `context_id` as used at `timestamp`, moving it to the end.
    pub fn update_timestamp(&mut self, context_id: &str, timestamp: i64) -> &mut Self {
        self.entries.retain(|e| e.0 != context_id);
        self.entries.push(IndexEntry(context_id.to_string(), timestamp));
        self
    }

    /// Drop the oldest entries until at most `max_entries` remain.
    ///
    /// Returns the removed context ids. A negative limit means unbounded.
    pub fn prune(&mut self, max_entries: i32) -> Vec<String> {
        if max_entries < 0 || self.entries.len() <= max_entries as usize {
            return Vec::new();
        }
        self.entries.sort_by_key(|e| e.1);
        let excess = self.entries.len() - max_entries as usize;
        self.entries
            .drain(..excess)
            .map(|IndexEntry(id, _)| id)
            .collect()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            SyncError::with_source(ErrorCode::IndexMalformed, "Malformed context index", e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_constructor() {
        let index = ContextIndex::new();
        assert!(index.is_empty());
        assert_eq!(index.to_json().unwrap(), "[]");
    }

    #[test]
    fn test_update_timestamp_for_existing_entry() {
        let mut index = ContextIndex::from_entries(vec![
            IndexEntry("user1".into(), 1000),
            IndexEntry("user2".into(), 2000),
        ]);
        index.update_timestamp("user1", 2001);
        assert_eq!(
            index.entries(),
            &[
                IndexEntry("user2".into(), 2000),
                IndexEntry("user1".into(), 2001)
            ]
        );
    }

    #[test]
    fn test_update_timestamp_for_new_entry() {
        let mut index = ContextIndex::new();
        index.update_timestamp("user1", 1000).update_timestamp("user2", 2000);
        assert_eq!(index.len(), 2);
        assert_eq!(index.entries()[1].context_id(), "user2");
    }

    #[test]
    fn test_prune_removes_oldest() {
        let mut index = ContextIndex::from_entries(vec![
            IndexEntry("user1".into(), 1000),
            IndexEntry("user2".into(), 2000),
            IndexEntry("user3".into(), 1111),
            IndexEntry("user4".into(), 3000),
            IndexEntry("user5".into(), 4000),
        ]);
        let mut removed = index.prune(3);
        removed.sort();
        assert_eq!(removed, vec!["user1".to_string(), "user3".to_string()]);
        assert_eq!(
            index.entries(),
            &[
                IndexEntry("user2".into(), 2000),
                IndexEntry("user4".into(), 3000),
                IndexEntry("user5".into(), 4000),
            ]
        );
    }

    #[test]
    fn test_prune_within_limit_is_noop() {
        let mut index = ContextIndex::from_entries(vec![
            IndexEntry("user1".into(), 2000),
            IndexEntry("user2".into(), 1000),
        ]);
        assert!(index.prune(2).is_empty());
        assert!(index.prune(-1).is_empty());
        assert_eq!(index.entries()[0].context_id(), "user1");
    }

    #[test]
    fn test_prune_to_zero() {
        let mut index = ContextIndex::from_entries(vec![IndexEntry("user1".into(), 1)]);
        assert_eq!(index.prune(0), vec!["user1".to_string()]);
        assert!(index.is_empty());
    }

    #[test]
    fn test_json_round_trip() {
        let index = ContextIndex::from_entries(vec![
            IndexEntry("user1".into(), 1000),
            IndexEntry("user2".into(), 2000),
        ]);
        let json = index.to_json().unwrap();
        assert_eq!(json, r#"[["user1",1000],["user2",2000]]"#);
        assert_eq!(ContextIndex::from_json(&json).unwrap(), index);
    }

    #[test]
    fn test_malformed_json() {
        for json in [
            "",
            "{}",
            "[\"user1\"]",
            "[[\"user1\"]]",
            "[[\"user1\",1000,\"extra\"]]",
            "[[1000,\"user1\"]]",
            "[[\"user1\",\"1000\"]]",
        ] {
            let err = ContextIndex::from_json(json).unwrap_err();
            assert_eq!(err.code, ErrorCode::IndexMalformed, "input: {}", json);
        }
    }
}
