//! Register nodes: immutable JSON leaves.
//!
//! A register's value never changes in place; replacing it means
//! creating a new register at the same parent key.

use serde_json::Value;

use crate::crdt::NodeCore;

#[derive(Debug, Clone, PartialEq)]
pub struct LiveRegister {
    pub(crate) core: NodeCore,
    data: Value,
}

impl LiveRegister {
    pub fn new(data: Value) -> Self {
        Self { core: NodeCore::new(), data }
    }

    pub fn data(&self) -> &Value {
        &self.data
    }
}
