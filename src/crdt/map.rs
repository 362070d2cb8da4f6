//! Map nodes: string keys, every value is a child node.

use std::collections::BTreeMap;

use crate::crdt::{NodeCore, NodeRef};

/// A dictionary node. Unlike an object, a map's values are always
/// nodes: plain values are wrapped in registers by the document layer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LiveMap {
    pub(crate) core: NodeCore,
    entries: BTreeMap<String, NodeRef>,
}

impl LiveMap {
    pub fn new() -> Self {
        Self { core: NodeCore::new(), entries: BTreeMap::new() }
    }

    pub fn get(&self, key: &str) -> Option<NodeRef> {
        self.entries.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Place a child under a key, returning the displaced child if any.
    pub(crate) fn place_child(&mut self, key: impl Into<String>, child: NodeRef) -> Option<NodeRef> {
        self.entries.insert(key.into(), child)
    }

    pub(crate) fn remove_key(&mut self, key: &str) -> Option<NodeRef> {
        self.entries.remove(key)
    }

    pub(crate) fn key_of_child(&self, child: NodeRef) -> Option<&str> {
        self.entries.iter().find(|(_, r)| **r == child).map(|(k, _)| k.as_str())
    }

    pub(crate) fn child_refs(&self) -> Vec<(String, NodeRef)> {
        self.entries.iter().map(|(k, r)| (k.clone(), *r)).collect()
    }
}
