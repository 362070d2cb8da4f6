//! # syncdoc — client-side replica engine for collaborative documents
//!
//! Keeps a locally-mutable, tree-shaped shared document synchronized
//! with remote peers through an ordered operation log, tracks transient
//! per-connection presence, and drives the connection lifecycle through
//! a hierarchical state machine that governs when operations may flow,
//! retry, or roll back.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌────────────────────────────────────────┐
//!                 │              RoomEngine                │
//!                 │  lifecycle FSM · outbox · frame I/O    │
//!                 └──────┬──────────────┬──────────┬───────┘
//!                        │              │          │
//!                        ▼              ▼          ▼
//!                 ┌────────────┐ ┌────────────┐ ┌──────────┐
//!                 │  Document  │ │ MyPresence │ │  Others  │
//!                 │ CRDT tree, │ │   ("me")   │ │ Presence │
//!                 │ undo/redo  │ └─────┬──────┘ └────┬─────┘
//!                 └──────┬─────┘       │             │
//!                        │             ▼             ▼
//!                        │      ┌──────────────────────────┐
//!                        │      │ snapshot caches (lazy,   │
//!                        └─────►│ invalidation-driven)     │
//!                               └──────────────────────────┘
//! ```
//!
//! Local mutations are applied optimistically; every applied op yields
//! the reverse ops that undo it, feeding the undo stack. Remote and
//! acknowledged ops are applied with a different provenance tag so they
//! never double up on the undo stack. Consumers read lazily-cached
//! immutable snapshots that invalidate on any underlying mutation.
//!
//! ## Modules
//!
//! - [`protocol`] — storage ops, provenance, and the binary wire envelope
//! - [`crdt`] — the replicated tree: node variants, pool, apply results
//! - [`doc`] — document registry, op application, undo/redo, dispatch
//! - [`fsm`] — generic hierarchical finite state machine
//! - [`presence`] — "me" and "others" presence tracking
//! - [`snapshot`] — lazy invalidation-driven immutable views
//! - [`room`] — the engine tying lifecycle, storage, and presence together

pub mod crdt;
pub mod doc;
pub mod fsm;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod snapshot;

// Re-exports for convenience
pub use crdt::{
    ApplyResult, LiveList, LiveMap, LiveNode, LiveObject, LiveRegister, Lson, NodeCore, NodeKind,
    NodePool, NodeRef, ParentInfo, StorageUpdate,
};
pub use doc::{Document, NodeInit, NodeRegistry, ROOT_ID};
pub use fsm::{
    distance, patterns, BuiltinEvent, CleanupFn, Fsm, FsmError, FsmEvent, Target, TargetSpec,
    TimedDelay,
};
pub use presence::{MyPresence, OthersPresence, User};
pub use protocol::{
    ConnectionId, Frame, JsonObject, MessageType, NodeId, Op, OpId, OpSource, ProtocolError,
    SerializedNode,
};
pub use room::{ConnContext, ConnEvent, OpQueue, RoomConfig, RoomEngine};
pub use snapshot::{compact, merge, DerivedRef, EventSource, SnapshotCache, ValueRef};
