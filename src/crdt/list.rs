//! List nodes: children ordered by fractional position keys.
//!
//! A list child's parent key is its position (see [`crate::crdt::pos`]).
//! Entries are kept sorted by (position, child id); the id tiebreak makes
//! sibling order deterministic when concurrent inserts land on the same
//! position.

use crate::crdt::{NodeCore, NodeRef};
use crate::protocol::NodeId;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ListEntry {
    pub key: String,
    pub id: NodeId,
    pub node: NodeRef,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LiveList {
    pub(crate) core: NodeCore,
    entries: Vec<ListEntry>,
}

impl LiveList {
    pub fn new() -> Self {
        Self { core: NodeCore::new(), entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<NodeRef> {
        self.entries.get(index).map(|e| e.node)
    }

    /// The position key of the child at `index`.
    pub fn key_at(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(|e| e.key.as_str())
    }

    pub fn index_of(&self, child: NodeRef) -> Option<usize> {
        self.entries.iter().position(|e| e.node == child)
    }

    pub(crate) fn insert_entry(&mut self, key: impl Into<String>, id: NodeId, node: NodeRef) {
        let entry = ListEntry { key: key.into(), id, node };
        let at = self
            .entries
            .partition_point(|e| (e.key.as_str(), e.id.as_str()) < (entry.key.as_str(), entry.id.as_str()));
        self.entries.insert(at, entry);
    }

    pub(crate) fn remove_child(&mut self, child: NodeRef) -> Option<ListEntry> {
        let index = self.index_of(child)?;
        Some(self.entries.remove(index))
    }

    /// Move a child to a new position key, returning the old key.
    pub(crate) fn rekey_child(&mut self, child: NodeRef, new_key: impl Into<String>) -> Option<String> {
        let entry = self.remove_child(child)?;
        let old_key = entry.key;
        self.insert_entry(new_key, entry.id, entry.node);
        Some(old_key)
    }

    pub(crate) fn child_refs(&self) -> Vec<(String, NodeRef)> {
        self.entries.iter().map(|e| (e.key.clone(), e.node)).collect()
    }
}
