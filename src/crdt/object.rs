//! Object nodes: named fields holding plain JSON or child nodes.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::crdt::{Lson, NodeCore, NodeRef};
use crate::protocol::JsonObject;

/// A record-like node. Fields are ordered by name so serialization and
/// comparisons are deterministic.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LiveObject {
    pub(crate) core: NodeCore,
    fields: BTreeMap<String, Lson>,
}

impl LiveObject {
    pub fn new(data: JsonObject) -> Self {
        Self {
            core: NodeCore::new(),
            fields: data.into_iter().map(|(k, v)| (k, Lson::Data(v))).collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Lson> {
        self.fields.get(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Set a plain-data field, returning what it displaced.
    pub(crate) fn set_data(&mut self, key: impl Into<String>, value: Value) -> Option<Lson> {
        self.fields.insert(key.into(), Lson::Data(value))
    }

    /// Place a child node under a field, returning what it displaced.
    pub(crate) fn place_child(&mut self, key: impl Into<String>, child: NodeRef) -> Option<Lson> {
        self.fields.insert(key.into(), Lson::Node(child))
    }

    pub(crate) fn remove_field(&mut self, key: &str) -> Option<Lson> {
        self.fields.remove(key)
    }

    /// The key a child node sits under, if it is a field of this object.
    pub(crate) fn key_of_child(&self, child: NodeRef) -> Option<&str> {
        self.fields
            .iter()
            .find(|(_, v)| matches!(v, Lson::Node(r) if *r == child))
            .map(|(k, _)| k.as_str())
    }

    /// Plain-data fields only, as a JSON object.
    pub(crate) fn data_snapshot(&self) -> JsonObject {
        self.fields
            .iter()
            .filter_map(|(k, v)| match v {
                Lson::Data(value) => Some((k.clone(), value.clone())),
                Lson::Node(_) => None,
            })
            .collect()
    }

    pub(crate) fn child_refs(&self) -> Vec<(String, NodeRef)> {
        self.fields
            .iter()
            .filter_map(|(k, v)| match v {
                Lson::Node(r) => Some((k.clone(), *r)),
                Lson::Data(_) => None,
            })
            .collect()
    }
}
