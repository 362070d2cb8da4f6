//! The document: node registry, op application, and the dispatch boundary.
//!
//! All nodes live in the document's pool; the registry maps node ids to
//! handles. Every mutation — local, remote, ack, or undo/redo replay —
//! flows through [`Document::apply`], which returns the reverse ops that
//! undo it plus a description of the storage change.
//!
//! Provenance discipline: a local mutation is applied optimistically and
//! dispatched (network + undo stack + subscriber notify, indivisibly);
//! remote, ack, and undo/redo replays are applied without touching the
//! undo stack again.
//!
//! ```text
//! local mutation ──apply(Local)──► dispatch(ops, reverse, updates)
//!                                     ├─► transport sink (network)
//!                                     ├─► undo stack (redo cleared)
//!                                     └─► storage subscribers (sync)
//! remote ops ──apply(Remote)──► notify subscribers only
//! ```

use std::collections::HashMap;

use serde_json::Value;

use crate::crdt::pos::pos_between;
use crate::crdt::{
    ApplyResult, LiveList, LiveMap, LiveNode, LiveObject, LiveRegister, Lson, NodePool, NodeRef,
    StorageUpdate,
};
use crate::protocol::{ConnectionId, JsonObject, NodeId, Op, OpId, OpSource, SerializedNode};

/// Id of the root object, present in every document from birth.
pub const ROOT_ID: &str = "root";

/// Bounded undo/redo history depth.
const MAX_HISTORY: usize = 50;

/// The document-level collaborator contract consumed by the node layer:
/// id generation, the id→node registry, and the dispatch boundary.
///
/// Dispatching has three responsibilities, indivisible from the caller's
/// perspective:
/// - forward the ops to the network layer,
/// - push the reverse ops onto the undo/redo stack,
/// - synchronously notify in-process subscribers of the storage updates.
pub trait NodeRegistry {
    fn generate_id(&mut self) -> NodeId;
    fn generate_op_id(&mut self) -> OpId;
    fn get_item(&self, id: &str) -> Option<NodeRef>;
    fn add_item(&mut self, id: NodeId, node: NodeRef);
    fn delete_item(&mut self, id: &str);
    fn dispatch(&mut self, ops: Vec<Op>, reverse_ops: Vec<Op>, storage_updates: Vec<StorageUpdate>);
}

/// Description of a new child subtree for local mutations.
#[derive(Debug, Clone)]
pub enum NodeInit {
    Object(JsonObject),
    List,
    Map,
    Register(Value),
}

type TransportSink = Box<dyn FnMut(&[Op]) + Send>;
type StorageSubscriber = Box<dyn FnMut(&[StorageUpdate]) + Send>;

pub struct Document {
    pool: NodePool,
    items: HashMap<NodeId, NodeRef>,
    root: NodeRef,
    actor: ConnectionId,
    next_id: u64,
    undo_stack: Vec<Vec<Op>>,
    redo_stack: Vec<Vec<Op>>,
    transport: Option<TransportSink>,
    subscribers: Vec<StorageSubscriber>,
}

impl Document {
    /// A fresh document holding an empty root object with id `"root"`.
    /// `actor` namespaces generated node/op ids.
    pub fn new(actor: ConnectionId) -> Self {
        let mut pool = NodePool::new();
        let root = pool.insert(LiveNode::Object(LiveObject::new(JsonObject::new())));
        pool.get_mut(root).core_mut().mark_attached(ROOT_ID.to_string());
        let mut items = HashMap::new();
        items.insert(ROOT_ID.to_string(), root);

        Self {
            pool,
            items,
            root,
            actor,
            next_id: 0,
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            transport: None,
            subscribers: Vec::new(),
        }
    }

    pub fn root(&self) -> NodeRef {
        self.root
    }

    pub fn get_node(&self, node: NodeRef) -> &LiveNode {
        self.pool.get(node)
    }

    /// The id of an attached node.
    pub fn node_id(&self, node: NodeRef) -> &str {
        self.pool.get(node).core().id().expect("node is not attached")
    }

    /// Install the network sink dispatched ops are forwarded to.
    pub fn set_transport(&mut self, sink: impl FnMut(&[Op]) + Send + 'static) {
        self.transport = Some(Box::new(sink));
    }

    /// Subscribe to storage updates. Subscribers are notified
    /// synchronously from every dispatch and remote application.
    pub fn subscribe_storage(&mut self, subscriber: impl FnMut(&[StorageUpdate]) + Send + 'static) {
        self.subscribers.push(Box::new(subscriber));
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }

    // ── Local mutations ──────────────────────────────────────────

    /// Set plain JSON fields on an object node.
    pub fn update_object(&mut self, object: NodeRef, data: JsonObject) {
        let id = self.node_id(object).to_string();
        let op_id = self.generate_op_id();
        self.apply_local(vec![Op::UpdateObject { id, op_id, data }]);
    }

    /// Remove a single field from an object node.
    pub fn delete_object_key(&mut self, object: NodeRef, key: &str) {
        let id = self.node_id(object).to_string();
        let op_id = self.generate_op_id();
        self.apply_local(vec![Op::DeleteObjectKey { id, op_id, key: key.to_string() }]);
    }

    /// Create a new child under an object field or map key, replacing
    /// whatever occupied it. Returns the new node's handle.
    pub fn set_child(&mut self, parent: NodeRef, key: &str, init: NodeInit) -> NodeRef {
        let parent_id = self.node_id(parent).to_string();
        let op = self.build_create_op(parent_id, key.to_string(), init);
        let new_id = op.target_id().to_string();
        self.apply_local(vec![op]);
        self.get_item(&new_id).expect("create op was applied")
    }

    /// Delete a map entry (and its subtree).
    pub fn map_delete(&mut self, map: NodeRef, key: &str) {
        let child = match self.pool.get(map) {
            LiveNode::Map(m) => m.get(key),
            _ => panic!("node is not a map"),
        };
        if let Some(child) = child {
            self.delete_node(child);
        }
    }

    /// Insert a new child at `index` (clamped to the list length).
    pub fn list_insert(&mut self, list: NodeRef, index: usize, init: NodeInit) -> NodeRef {
        let (parent_id, key) = {
            let LiveNode::List(l) = self.pool.get(list) else { panic!("node is not a list") };
            let index = index.min(l.len());
            let lo = if index == 0 { None } else { l.key_at(index - 1).map(String::from) };
            let hi = l.key_at(index).map(String::from);
            (self.node_id(list).to_string(), pos_between(lo.as_deref(), hi.as_deref()))
        };
        let op = self.build_create_op(parent_id, key, init);
        let new_id = op.target_id().to_string();
        self.apply_local(vec![op]);
        self.get_item(&new_id).expect("create op was applied")
    }

    pub fn list_push(&mut self, list: NodeRef, init: NodeInit) -> NodeRef {
        let len = match self.pool.get(list) {
            LiveNode::List(l) => l.len(),
            _ => panic!("node is not a list"),
        };
        self.list_insert(list, len, init)
    }

    pub fn list_delete(&mut self, list: NodeRef, index: usize) {
        let child = match self.pool.get(list) {
            LiveNode::List(l) => l.get(index),
            _ => panic!("node is not a list"),
        };
        let Some(child) = child else { panic!("list index out of bounds") };
        self.delete_node(child);
    }

    /// Reposition a list child from `from` to `to` (indices before the
    /// move; `to` is clamped).
    pub fn list_move(&mut self, list: NodeRef, from: usize, to: usize) {
        let (child_id, new_key) = {
            let LiveNode::List(l) = self.pool.get(list) else { panic!("node is not a list") };
            let child = l.get(from).expect("list index out of bounds");
            let keys: Vec<String> = (0..l.len())
                .filter(|i| *i != from)
                .filter_map(|i| l.key_at(i).map(String::from))
                .collect();
            let to = to.min(keys.len());
            let lo = if to == 0 { None } else { Some(keys[to - 1].clone()) };
            let hi = keys.get(to).cloned();
            (self.node_id(child).to_string(), pos_between(lo.as_deref(), hi.as_deref()))
        };
        let op_id = self.generate_op_id();
        self.apply_local(vec![Op::SetParentKey { id: child_id, op_id, parent_key: new_key }]);
    }

    /// Delete a node (and its subtree) from the tree.
    pub fn delete_node(&mut self, node: NodeRef) {
        let id = self.node_id(node).to_string();
        let op_id = self.generate_op_id();
        self.apply_local(vec![Op::DeleteCrdt { id, op_id }]);
    }

    /// Undo the most recent local change, dispatching the replayed ops
    /// to the network. Returns whether anything was undone.
    pub fn undo(&mut self) -> bool {
        let Some(ops) = self.undo_stack.pop() else { return false };
        let (applied, reverse, updates) = self.apply_batch(&ops, OpSource::UndoRedo);
        self.redo_stack.push(reverse);
        if let Some(transport) = &mut self.transport {
            transport(&applied);
        }
        self.notify_subscribers(&updates);
        true
    }

    /// Redo the most recently undone change.
    pub fn redo(&mut self) -> bool {
        let Some(ops) = self.redo_stack.pop() else { return false };
        let (applied, reverse, updates) = self.apply_batch(&ops, OpSource::UndoRedo);
        if self.undo_stack.len() >= MAX_HISTORY {
            self.undo_stack.remove(0);
        }
        self.undo_stack.push(reverse);
        if let Some(transport) = &mut self.transport {
            transport(&applied);
        }
        self.notify_subscribers(&updates);
        true
    }

    // ── Remote application ───────────────────────────────────────

    /// Apply ops from a remote peer. Subscribers are notified; the undo
    /// stack is untouched.
    pub fn apply_remote(&mut self, ops: &[Op]) -> Vec<StorageUpdate> {
        let (_, _, updates) = self.apply_batch(ops, OpSource::Remote);
        self.notify_subscribers(&updates);
        updates
    }

    /// Apply a server echo of our own ops. Normally a no-op thanks to
    /// idempotent creates; divergences are repaired silently.
    pub fn apply_ack(&mut self, ops: &[Op]) -> Vec<StorageUpdate> {
        let (_, _, updates) = self.apply_batch(ops, OpSource::Ack);
        self.notify_subscribers(&updates);
        updates
    }

    // ── Apply core ───────────────────────────────────────────────

    /// Apply one op. Yields the reverse ops sufficient to undo it plus
    /// the storage change, or an explicit no-op result.
    pub fn apply(&mut self, op: &Op, source: OpSource) -> ApplyResult {
        log::trace!("apply {:?} (source {source:?})", op.op_id());
        match op {
            Op::CreateObject { .. }
            | Op::CreateList { .. }
            | Op::CreateMap { .. }
            | Op::CreateRegister { .. } => self.apply_create(op, source),
            Op::DeleteCrdt { id, .. } => self.apply_delete(id),
            Op::UpdateObject { id, data, .. } => self.apply_update_object(id, data),
            Op::DeleteObjectKey { id, key, .. } => self.apply_delete_object_key(id, key),
            Op::SetParentKey { id, parent_key, .. } => self.apply_set_parent_key(id, parent_key),
        }
    }

    fn apply_local(&mut self, ops: Vec<Op>) {
        let (applied, reverse, updates) = self.apply_batch(&ops, OpSource::Local);
        if applied.is_empty() {
            return;
        }
        self.dispatch(applied, reverse, updates);
    }

    /// Apply a batch in program order, collecting the applied ops, the
    /// flattened reverse sequence (in undo order), and the updates.
    fn apply_batch(&mut self, ops: &[Op], source: OpSource) -> (Vec<Op>, Vec<Op>, Vec<StorageUpdate>) {
        let mut applied = Vec::new();
        let mut reverse_groups: Vec<Vec<Op>> = Vec::new();
        let mut updates = Vec::new();

        for op in ops {
            match self.apply(op, source) {
                ApplyResult::Modified { reverse, update } => {
                    applied.push(op.clone());
                    reverse_groups.push(reverse);
                    updates.push(update);
                }
                ApplyResult::NotModified => {}
            }
        }

        let reverse = reverse_groups.into_iter().rev().flatten().collect();
        (applied, reverse, updates)
    }

    fn apply_create(&mut self, op: &Op, source: OpSource) -> ApplyResult {
        let (id, parent_id, parent_key) = match op {
            Op::CreateObject { id, parent_id, parent_key, .. }
            | Op::CreateList { id, parent_id, parent_key, .. }
            | Op::CreateMap { id, parent_id, parent_key, .. }
            | Op::CreateRegister { id, parent_id, parent_key, .. } => {
                (id.clone(), parent_id.clone(), parent_key.clone())
            }
            _ => return ApplyResult::NotModified,
        };

        // Creates are idempotent: an ack echo or redundant replay of an
        // already-known node changes nothing.
        if self.items.contains_key(&id) {
            log::debug!("ignoring create for existing node {id} (source {source:?})");
            return ApplyResult::NotModified;
        }
        let Some(parent) = self.get_item(&parent_id) else {
            log::warn!("create {id} targets unknown parent {parent_id}");
            return ApplyResult::NotModified;
        };

        enum Occupant {
            Empty,
            Data(Value),
            Child(NodeRef),
        }

        let occupant = match self.pool.get(parent) {
            LiveNode::Object(obj) => match obj.get(&parent_key) {
                Some(Lson::Data(v)) => Occupant::Data(v.clone()),
                Some(Lson::Node(r)) => Occupant::Child(*r),
                None => Occupant::Empty,
            },
            LiveNode::Map(map) => match map.get(&parent_key) {
                Some(r) => Occupant::Child(r),
                None => Occupant::Empty,
            },
            LiveNode::List(_) => Occupant::Empty,
            LiveNode::Register(_) => {
                log::warn!("create {id} targets register parent {parent_id}");
                return ApplyResult::NotModified;
            }
        };

        let mut reverse = vec![Op::DeleteCrdt { id: id.clone(), op_id: self.generate_op_id() }];
        match occupant {
            Occupant::Empty => {}
            Occupant::Data(old) => {
                let op_id = self.generate_op_id();
                let mut restore = JsonObject::new();
                restore.insert(parent_key.clone(), old);
                reverse.push(Op::UpdateObject { id: parent_id.clone(), op_id, data: restore });
            }
            Occupant::Child(old_child) => {
                // Serialize the displaced subtree before dropping it,
                // so the reverse ops can bring it back
                let recreate = self.serialize_subtree_ops(old_child, &parent_id, &parent_key);
                match self.pool.get_mut(parent) {
                    LiveNode::Object(obj) => {
                        obj.remove_field(&parent_key);
                    }
                    LiveNode::Map(map) => {
                        map.remove_key(&parent_key);
                    }
                    _ => {}
                }
                self.detach_subtree(old_child);
                reverse.extend(recreate);
            }
        }

        let node = match op {
            Op::CreateObject { data, .. } => LiveNode::Object(LiveObject::new(data.clone())),
            Op::CreateList { .. } => LiveNode::List(LiveList::new()),
            Op::CreateMap { .. } => LiveNode::Map(LiveMap::new()),
            Op::CreateRegister { data, .. } => LiveNode::Register(LiveRegister::new(data.clone())),
            _ => return ApplyResult::NotModified,
        };
        let child = self.pool.insert(node);
        self.add_item(id.clone(), child);
        {
            let core = self.pool.get_mut(child).core_mut();
            core.mark_attached(id.clone());
            core.set_parent_link(parent, parent_key.clone());
        }

        let update = match self.pool.get_mut(parent) {
            LiveNode::Object(obj) => {
                obj.place_child(parent_key.clone(), child);
                StorageUpdate::Object { node_id: parent_id, updated_keys: vec![parent_key] }
            }
            LiveNode::Map(map) => {
                map.place_child(parent_key.clone(), child);
                StorageUpdate::Map { node_id: parent_id, updated_keys: vec![parent_key] }
            }
            LiveNode::List(list) => {
                list.insert_entry(parent_key, id, child);
                StorageUpdate::List { node_id: parent_id }
            }
            LiveNode::Register(_) => unreachable!("register parents are rejected above"),
        };

        ApplyResult::Modified { reverse, update }
    }

    fn apply_delete(&mut self, id: &str) -> ApplyResult {
        let Some(node) = self.get_item(id) else { return ApplyResult::NotModified };
        // A node without a parent link (the root, or an already-detached
        // node) has nothing to reverse: benign no-op
        let Some(parent) = self.pool.get(node).core().parent_node() else {
            return ApplyResult::NotModified;
        };
        self.detach_child(parent, node)
    }

    /// Remove a child reference from its parent container, detach the
    /// subtree, and return the ops that recreate it.
    fn detach_child(&mut self, parent: NodeRef, child: NodeRef) -> ApplyResult {
        let parent_id = self.node_id(parent).to_string();
        let key = match self.pool.get(parent) {
            LiveNode::Object(obj) => obj.key_of_child(child).map(String::from),
            LiveNode::Map(map) => map.key_of_child(child).map(String::from),
            LiveNode::List(list) => {
                list.index_of(child).and_then(|i| list.key_at(i)).map(String::from)
            }
            LiveNode::Register(_) => None,
        };
        let Some(key) = key else { return ApplyResult::NotModified };

        let reverse = self.serialize_subtree_ops(child, &parent_id, &key);

        let update = match self.pool.get_mut(parent) {
            LiveNode::Object(obj) => {
                obj.remove_field(&key);
                StorageUpdate::Object { node_id: parent_id, updated_keys: vec![key] }
            }
            LiveNode::Map(map) => {
                map.remove_key(&key);
                StorageUpdate::Map { node_id: parent_id, updated_keys: vec![key] }
            }
            LiveNode::List(list) => {
                list.remove_child(child);
                StorageUpdate::List { node_id: parent_id }
            }
            LiveNode::Register(_) => return ApplyResult::NotModified,
        };
        self.detach_subtree(child);

        ApplyResult::Modified { reverse, update }
    }

    fn apply_update_object(&mut self, id: &str, data: &JsonObject) -> ApplyResult {
        let Some(node) = self.get_item(id) else { return ApplyResult::NotModified };

        enum Prev {
            Absent,
            Data(Value),
            Child(NodeRef),
        }

        let mut changes: Vec<(String, Value, Prev)> = Vec::new();
        {
            let LiveNode::Object(obj) = self.pool.get(node) else {
                return ApplyResult::NotModified;
            };
            for (key, value) in data {
                match obj.get(key) {
                    Some(Lson::Data(old)) if old == value => {}
                    Some(Lson::Data(old)) => {
                        changes.push((key.clone(), value.clone(), Prev::Data(old.clone())));
                    }
                    Some(Lson::Node(child)) => {
                        changes.push((key.clone(), value.clone(), Prev::Child(*child)));
                    }
                    None => changes.push((key.clone(), value.clone(), Prev::Absent)),
                }
            }
        }
        if changes.is_empty() {
            return ApplyResult::NotModified;
        }

        let mut restore = JsonObject::new();
        let mut reverse_tail: Vec<Op> = Vec::new();
        for (key, _, prev) in &changes {
            match prev {
                Prev::Data(old) => {
                    restore.insert(key.clone(), old.clone());
                }
                Prev::Absent => {
                    let op_id = self.generate_op_id();
                    reverse_tail.push(Op::DeleteObjectKey {
                        id: id.to_string(),
                        op_id,
                        key: key.clone(),
                    });
                }
                Prev::Child(child) => {
                    let recreate = self.serialize_subtree_ops(*child, id, key);
                    self.detach_subtree(*child);
                    reverse_tail.extend(recreate);
                }
            }
        }

        let mut updated_keys = Vec::new();
        {
            let LiveNode::Object(obj) = self.pool.get_mut(node) else {
                unreachable!("kind checked above")
            };
            for (key, value, _) in changes {
                obj.set_data(key.clone(), value);
                updated_keys.push(key);
            }
        }

        let mut reverse = Vec::new();
        if !restore.is_empty() {
            let op_id = self.generate_op_id();
            reverse.push(Op::UpdateObject { id: id.to_string(), op_id, data: restore });
        }
        reverse.extend(reverse_tail);

        ApplyResult::Modified {
            reverse,
            update: StorageUpdate::Object { node_id: id.to_string(), updated_keys },
        }
    }

    fn apply_delete_object_key(&mut self, id: &str, key: &str) -> ApplyResult {
        let Some(node) = self.get_item(id) else { return ApplyResult::NotModified };

        enum Prev {
            Data(Value),
            Child(NodeRef),
        }

        let prev = {
            let LiveNode::Object(obj) = self.pool.get(node) else {
                return ApplyResult::NotModified;
            };
            match obj.get(key) {
                None => return ApplyResult::NotModified,
                Some(Lson::Data(v)) => Prev::Data(v.clone()),
                Some(Lson::Node(r)) => Prev::Child(*r),
            }
        };

        let (reverse, dropped_child) = match prev {
            Prev::Data(old) => {
                let op_id = self.generate_op_id();
                let mut restore = JsonObject::new();
                restore.insert(key.to_string(), old);
                (vec![Op::UpdateObject { id: id.to_string(), op_id, data: restore }], None)
            }
            Prev::Child(child) => (self.serialize_subtree_ops(child, id, key), Some(child)),
        };

        match self.pool.get_mut(node) {
            LiveNode::Object(obj) => {
                obj.remove_field(key);
            }
            _ => unreachable!("kind checked above"),
        }
        if let Some(child) = dropped_child {
            self.detach_subtree(child);
        }

        ApplyResult::Modified {
            reverse,
            update: StorageUpdate::Object {
                node_id: id.to_string(),
                updated_keys: vec![key.to_string()],
            },
        }
    }

    fn apply_set_parent_key(&mut self, id: &str, new_key: &str) -> ApplyResult {
        let Some(node) = self.get_item(id) else { return ApplyResult::NotModified };
        let Some(parent) = self.pool.get(node).core().parent_node() else {
            return ApplyResult::NotModified;
        };
        let parent_id = self.node_id(parent).to_string();

        let old_key = {
            let LiveNode::List(list) = self.pool.get_mut(parent) else {
                return ApplyResult::NotModified;
            };
            let Some(index) = list.index_of(node) else { return ApplyResult::NotModified };
            if list.key_at(index) == Some(new_key) {
                return ApplyResult::NotModified;
            }
            list.rekey_child(node, new_key).expect("child is present")
        };
        self.pool.get_mut(node).core_mut().set_parent_link(parent, new_key);

        let op_id = self.generate_op_id();
        ApplyResult::Modified {
            reverse: vec![Op::SetParentKey { id: id.to_string(), op_id, parent_key: old_key }],
            update: StorageUpdate::List { node_id: parent_id },
        }
    }

    // ── Subtree helpers ──────────────────────────────────────────

    /// The op sequence that recreates `node` (and its subtree) under
    /// the given parent and key, in creation order.
    pub fn serialize_subtree_ops(
        &mut self,
        node: NodeRef,
        parent_id: &str,
        parent_key: &str,
    ) -> Vec<Op> {
        enum Shape {
            Object(JsonObject),
            List,
            Map,
            Register(Value),
        }

        let (shape, children, id) = {
            let n = self.pool.get(node);
            let id = n.core().id().expect("cannot serialize an unattached node").to_string();
            let shape = match n {
                LiveNode::Object(obj) => Shape::Object(obj.data_snapshot()),
                LiveNode::List(_) => Shape::List,
                LiveNode::Map(_) => Shape::Map,
                LiveNode::Register(reg) => Shape::Register(reg.data().clone()),
            };
            (shape, n.child_refs(), id)
        };

        let op_id = self.generate_op_id();
        let parent_id = parent_id.to_string();
        let parent_key = parent_key.to_string();
        let create = match shape {
            Shape::Object(data) => {
                Op::CreateObject { id: id.clone(), op_id, parent_id, parent_key, data }
            }
            Shape::List => Op::CreateList { id: id.clone(), op_id, parent_id, parent_key },
            Shape::Map => Op::CreateMap { id: id.clone(), op_id, parent_id, parent_key },
            Shape::Register(data) => {
                Op::CreateRegister { id: id.clone(), op_id, parent_id, parent_key, data }
            }
        };

        let mut ops = vec![create];
        for (key, child) in children {
            ops.extend(self.serialize_subtree_ops(child, &id, &key));
        }
        ops
    }

    /// The op sequence that recreates the whole document under an empty
    /// root: root field updates first, then every subtree.
    pub fn serialize_document(&mut self) -> Vec<Op> {
        let root = self.root;
        let (data, children) = match self.pool.get(root) {
            LiveNode::Object(obj) => (obj.data_snapshot(), obj.child_refs()),
            _ => unreachable!("the root is always an object"),
        };

        let mut ops = Vec::new();
        if !data.is_empty() {
            let op_id = self.generate_op_id();
            ops.push(Op::UpdateObject { id: ROOT_ID.to_string(), op_id, data });
        }
        for (key, child) in children {
            ops.extend(self.serialize_subtree_ops(child, ROOT_ID, &key));
        }
        ops
    }

    /// The node's own persisted representation.
    pub fn to_serialized(&self, node: NodeRef) -> SerializedNode {
        let n = self.pool.get(node);
        let parent_id = n.core().parent_node().map(|p| self.node_id(p).to_string());
        let parent_key = n.core().parent_key().map(String::from);
        match n {
            LiveNode::Object(obj) => {
                SerializedNode::Object { parent_id, parent_key, data: obj.data_snapshot() }
            }
            LiveNode::List(_) => SerializedNode::List { parent_id, parent_key },
            LiveNode::Map(_) => SerializedNode::Map { parent_id, parent_key },
            LiveNode::Register(reg) => {
                SerializedNode::Register { parent_id, parent_key, data: reg.data().clone() }
            }
        }
    }

    /// Plain JSON rendering of a subtree (for reads and tests).
    pub fn to_json(&self, node: NodeRef) -> Value {
        match self.pool.get(node) {
            LiveNode::Object(obj) => {
                let mut out = obj.data_snapshot();
                for (key, child) in obj.child_refs() {
                    out.insert(key, self.to_json(child));
                }
                Value::Object(out)
            }
            LiveNode::Map(map) => {
                let mut out = JsonObject::new();
                for (key, child) in map.child_refs() {
                    out.insert(key, self.to_json(child));
                }
                Value::Object(out)
            }
            LiveNode::List(list) => {
                Value::Array(list.child_refs().into_iter().map(|(_, c)| self.to_json(c)).collect())
            }
            LiveNode::Register(reg) => reg.data().clone(),
        }
    }

    pub fn root_json(&self) -> Value {
        self.to_json(self.root)
    }

    /// Unregister and drop a subtree, children first. Handles into the
    /// subtree become stale.
    fn detach_subtree(&mut self, node: NodeRef) {
        for (_, child) in self.pool.get(node).child_refs() {
            self.detach_subtree(child);
        }
        if let Some(id) = self.pool.get(node).core().id().map(String::from) {
            self.delete_item(&id);
        }
        self.pool.get_mut(node).core_mut().mark_detached();
        self.pool.remove(node);
    }

    fn build_create_op(&mut self, parent_id: String, parent_key: String, init: NodeInit) -> Op {
        let id = self.generate_id();
        let op_id = self.generate_op_id();
        match init {
            NodeInit::Object(data) => Op::CreateObject { id, op_id, parent_id, parent_key, data },
            NodeInit::List => Op::CreateList { id, op_id, parent_id, parent_key },
            NodeInit::Map => Op::CreateMap { id, op_id, parent_id, parent_key },
            NodeInit::Register(data) => {
                Op::CreateRegister { id, op_id, parent_id, parent_key, data }
            }
        }
    }

    fn notify_subscribers(&mut self, updates: &[StorageUpdate]) {
        if updates.is_empty() {
            return;
        }
        for subscriber in self.subscribers.iter_mut() {
            subscriber(updates);
        }
    }
}

impl NodeRegistry for Document {
    fn generate_id(&mut self) -> NodeId {
        self.next_id += 1;
        format!("{}:{}", self.actor, self.next_id)
    }

    fn generate_op_id(&mut self) -> OpId {
        self.next_id += 1;
        format!("{}:{}", self.actor, self.next_id)
    }

    fn get_item(&self, id: &str) -> Option<NodeRef> {
        self.items.get(id).copied()
    }

    fn add_item(&mut self, id: NodeId, node: NodeRef) {
        self.items.insert(id, node);
    }

    fn delete_item(&mut self, id: &str) {
        self.items.remove(id);
    }

    fn dispatch(&mut self, ops: Vec<Op>, reverse_ops: Vec<Op>, storage_updates: Vec<StorageUpdate>) {
        if let Some(transport) = &mut self.transport {
            transport(&ops);
        }
        if !reverse_ops.is_empty() {
            self.redo_stack.clear();
            if self.undo_stack.len() >= MAX_HISTORY {
                self.undo_stack.remove(0);
            }
            self.undo_stack.push(reverse_ops);
        }
        self.notify_subscribers(&storage_updates);
    }
}

// ===================================================================
// Tests
// ===================================================================
