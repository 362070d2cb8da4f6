//! The replicated document tree: node abstraction and concrete variants.
//!
//! A document is a tree of nodes — objects, lists, maps, and leaf
//! registers — owned by a single arena ([`NodePool`]). Handles are slot
//! indices ([`NodeRef`]); the id→node registry lives in the owning
//! document. A node can sit in the pool without being registered: that
//! is the detached state a node is born in and returns to on delete.
//!
//! ```text
//! created ──_attach──► attached ──set_parent_link──► child
//!    ▲                    │
//!    └──── (never) ◄──────┘ detach: unregisters, keeps the id,
//!                           parent link becomes Orphaned{old_key}
//! ```
//!
//! The orphaned parent state is deliberate: a just-detached node must
//! remember the key it was attached under, because the reverse op that
//! recreates it is derived from that key.
//!
//! Mutations are expressed as ops ([`crate::protocol::Op`]); applying an
//! op yields the reverse ops that undo it plus a description of the
//! storage change, or an explicit not-modified result.

pub mod list;
pub mod map;
pub mod object;
pub mod pos;
pub mod register;

pub use list::LiveList;
pub use map::LiveMap;
pub use object::LiveObject;
pub use register::LiveRegister;

use serde_json::Value;

use crate::protocol::{NodeId, Op};

// ───────────────────────────────────────────────────────────────────
// Handles and shared node state
// ───────────────────────────────────────────────────────────────────

/// Handle to a node slot in a [`NodePool`]. Stable for the lifetime of
/// the node, including across detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef(pub(crate) usize);

/// The three possible states of a node's parent pointers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentInfo {
    /// A normal child: parent node and the key it sits under.
    HasParent { node: NodeRef, key: String },
    /// The root, or a node that has never been placed under a parent.
    NoParent,
    /// Detached from its parent, but still remembering the last key for
    /// reverse-op derivation.
    Orphaned { old_key: String },
}

/// Fields shared by every node variant.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeCore {
    id: Option<NodeId>,
    parent: ParentInfo,
    attached: bool,
}

impl Default for NodeCore {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeCore {
    pub fn new() -> Self {
        Self { id: None, parent: ParentInfo::NoParent, attached: false }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Whether the node is registered in a document.
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn parent_info(&self) -> &ParentInfo {
        &self.parent
    }

    pub fn parent_node(&self) -> Option<NodeRef> {
        match &self.parent {
            ParentInfo::HasParent { node, .. } => Some(*node),
            ParentInfo::NoParent | ParentInfo::Orphaned { .. } => None,
        }
    }

    /// The key this node sits (or last sat) under.
    pub fn parent_key(&self) -> Option<&str> {
        match &self.parent {
            ParentInfo::HasParent { key, .. } => Some(key),
            ParentInfo::Orphaned { old_key } => Some(old_key),
            ParentInfo::NoParent => None,
        }
    }

    /// Record the parent link. Re-linking under the same parent is a
    /// harmless overwrite (the key may change); linking under a
    /// different parent while one exists is a programmer error.
    pub(crate) fn set_parent_link(&mut self, node: NodeRef, key: impl Into<String>) {
        if let ParentInfo::HasParent { node: existing, .. } = &self.parent {
            if *existing != node {
                panic!("cannot set parent link: node already has a different parent");
            }
        }
        self.parent = ParentInfo::HasParent { node, key: key.into() };
    }

    /// Assign the id and mark the node as registered. The id and the
    /// document registration are set together, exactly once.
    pub(crate) fn mark_attached(&mut self, id: NodeId) {
        if self.id.is_some() || self.attached {
            panic!("cannot attach a node that is already attached");
        }
        self.id = Some(id);
        self.attached = true;
    }

    /// Clear the registration but keep the id, and demote the parent
    /// link to the orphaned memento. Detaching an unparented or
    /// already-orphaned node is tolerated as a no-op.
    pub(crate) fn mark_detached(&mut self) {
        self.attached = false;
        self.parent = match std::mem::replace(&mut self.parent, ParentInfo::NoParent) {
            ParentInfo::HasParent { key, .. } => ParentInfo::Orphaned { old_key: key },
            keep @ (ParentInfo::NoParent | ParentInfo::Orphaned { .. }) => keep,
        };
    }
}

// ───────────────────────────────────────────────────────────────────
// Node variants
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Object,
    List,
    Map,
    Register,
}

/// A value held in an object field: plain JSON, or a child node.
#[derive(Debug, Clone, PartialEq)]
pub enum Lson {
    Data(Value),
    Node(NodeRef),
}

/// The closed set of node variants. Behavior that needs tree-wide
/// access (attach/detach of children, serialization) lives on the
/// document, dispatched by exhaustive matches over this enum.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveNode {
    Object(LiveObject),
    List(LiveList),
    Map(LiveMap),
    Register(LiveRegister),
}

impl LiveNode {
    pub fn core(&self) -> &NodeCore {
        match self {
            LiveNode::Object(n) => &n.core,
            LiveNode::List(n) => &n.core,
            LiveNode::Map(n) => &n.core,
            LiveNode::Register(n) => &n.core,
        }
    }

    pub fn core_mut(&mut self) -> &mut NodeCore {
        match self {
            LiveNode::Object(n) => &mut n.core,
            LiveNode::List(n) => &mut n.core,
            LiveNode::Map(n) => &mut n.core,
            LiveNode::Register(n) => &mut n.core,
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            LiveNode::Object(_) => NodeKind::Object,
            LiveNode::List(_) => NodeKind::List,
            LiveNode::Map(_) => NodeKind::Map,
            LiveNode::Register(_) => NodeKind::Register,
        }
    }

    /// Direct children, in deterministic (key) order.
    pub(crate) fn child_refs(&self) -> Vec<(String, NodeRef)> {
        match self {
            LiveNode::Object(n) => n.child_refs(),
            LiveNode::List(n) => n.child_refs(),
            LiveNode::Map(n) => n.child_refs(),
            LiveNode::Register(_) => Vec::new(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Apply results
// ───────────────────────────────────────────────────────────────────

/// Description of an observable storage change, delivered synchronously
/// to in-process subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageUpdate {
    Object { node_id: NodeId, updated_keys: Vec<String> },
    Map { node_id: NodeId, updated_keys: Vec<String> },
    List { node_id: NodeId },
}

impl StorageUpdate {
    pub fn node_id(&self) -> &str {
        match self {
            StorageUpdate::Object { node_id, .. }
            | StorageUpdate::Map { node_id, .. }
            | StorageUpdate::List { node_id } => node_id,
        }
    }
}

/// The result of applying one op: the reverse ops sufficient to undo it
/// plus the storage change, or an explicit no-op.
#[derive(Debug)]
pub enum ApplyResult {
    Modified { reverse: Vec<Op>, update: StorageUpdate },
    NotModified,
}

impl ApplyResult {
    pub fn is_modified(&self) -> bool {
        matches!(self, ApplyResult::Modified { .. })
    }
}

// ───────────────────────────────────────────────────────────────────
// Node pool
// ───────────────────────────────────────────────────────────────────

/// Slab of nodes owned by a document. Slots are never reused within a
/// document's lifetime, so a [`NodeRef`] can never silently point at a
/// different node.
#[derive(Debug, Default)]
pub struct NodePool {
    slots: Vec<Option<LiveNode>>,
}

impl NodePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: LiveNode) -> NodeRef {
        self.slots.push(Some(node));
        NodeRef(self.slots.len() - 1)
    }

    pub fn get(&self, node: NodeRef) -> &LiveNode {
        self.slots[node.0].as_ref().expect("stale node handle")
    }

    pub fn get_mut(&mut self, node: NodeRef) -> &mut LiveNode {
        self.slots[node.0].as_mut().expect("stale node handle")
    }

    pub fn remove(&mut self, node: NodeRef) -> LiveNode {
        self.slots[node.0].take().expect("stale node handle")
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_core_lifecycle() {
        let mut core = NodeCore::new();
        assert_eq!(core.id(), None);
        assert!(!core.is_attached());
        assert_eq!(core.parent_info(), &ParentInfo::NoParent);

        core.mark_attached("1:0".to_string());
        assert_eq!(core.id(), Some("1:0"));
        assert!(core.is_attached());

        core.set_parent_link(NodeRef(3), "layer");
        assert_eq!(core.parent_node(), Some(NodeRef(3)));
        assert_eq!(core.parent_key(), Some("layer"));

        core.mark_detached();
        assert!(!core.is_attached());
        assert_eq!(core.id(), Some("1:0")); // the id survives detach
        assert_eq!(core.parent_info(), &ParentInfo::Orphaned { old_key: "layer".to_string() });
        assert_eq!(core.parent_key(), Some("layer"));
        assert_eq!(core.parent_node(), None);
    }

    #[test]
    #[should_panic(expected = "already attached")]
    fn test_reattach_panics() {
        let mut core = NodeCore::new();
        core.mark_attached("1:0".to_string());
        core.mark_attached("1:1".to_string());
    }

    #[test]
    #[should_panic(expected = "already attached")]
    fn test_reattach_after_detach_panics() {
        // Detach keeps the id, so a detached node can never re-attach
        let mut core = NodeCore::new();
        core.mark_attached("1:0".to_string());
        core.mark_detached();
        core.mark_attached("1:1".to_string());
    }

    #[test]
    fn test_same_parent_relink_is_harmless() {
        let mut core = NodeCore::new();
        core.set_parent_link(NodeRef(1), "a");
        core.set_parent_link(NodeRef(1), "b"); // same parent, new key
        assert_eq!(core.parent_key(), Some("b"));
    }

    #[test]
    #[should_panic(expected = "different parent")]
    fn test_conflicting_parent_link_panics() {
        let mut core = NodeCore::new();
        core.set_parent_link(NodeRef(1), "a");
        core.set_parent_link(NodeRef(2), "a");
    }

    #[test]
    fn test_detach_of_unparented_node_is_a_noop() {
        let mut core = NodeCore::new();
        core.mark_detached();
        assert_eq!(core.parent_info(), &ParentInfo::NoParent);

        // Detaching twice keeps the orphan memento intact
        let mut core = NodeCore::new();
        core.set_parent_link(NodeRef(1), "k");
        core.mark_detached();
        core.mark_detached();
        assert_eq!(core.parent_info(), &ParentInfo::Orphaned { old_key: "k".to_string() });
    }

    #[test]
    fn test_relink_after_orphaned() {
        let mut core = NodeCore::new();
        core.set_parent_link(NodeRef(1), "k");
        core.mark_detached();
        // An orphaned node may be re-parented (undo re-creates links)
        core.set_parent_link(NodeRef(2), "j");
        assert_eq!(core.parent_node(), Some(NodeRef(2)));
        assert_eq!(core.parent_key(), Some("j"));
    }

    #[test]
    fn test_pool_handles() {
        let mut pool = NodePool::new();
        let a = pool.insert(LiveNode::Register(LiveRegister::new(json!(1))));
        let b = pool.insert(LiveNode::Register(LiveRegister::new(json!(2))));
        assert_ne!(a, b);
        assert_eq!(pool.live_count(), 2);

        match pool.get(a) {
            LiveNode::Register(r) => assert_eq!(r.data(), &json!(1)),
            other => panic!("unexpected node: {other:?}"),
        }

        pool.remove(a);
        assert_eq!(pool.live_count(), 1);
    }

    #[test]
    #[should_panic(expected = "stale node handle")]
    fn test_stale_handle_panics() {
        let mut pool = NodePool::new();
        let a = pool.insert(LiveNode::Register(LiveRegister::new(json!(1))));
        pool.remove(a);
        pool.get(a);
    }
}
