//! Presence tracking for the local user ("me") and remote peers ("others").
//!
//! Presence is per-connection ephemeral state, distinct from the persisted
//! document. Both trackers share the same patch semantics (`null` deletes
//! a key, unchanged patches keep the previous snapshot pointer) but differ
//! in partial-information handling:
//!
//! ```text
//! local patch ──► MyPresence ──► me()           (compacted, cached)
//!
//! ConnectionJoined ──► set_connection ─┐
//! PresenceFull     ──► set_other      ─┼─► others()   a connection is
//! PresencePatch    ──► patch_other    ─┤              visible only once
//! ConnectionLeft   ──► remove_connection              BOTH maps have it
//! ```
//!
//! A presence patch that arrives before the first full snapshot for that
//! connection is dropped: deltas cannot be applied to unknown state.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::protocol::{ConnectionId, JsonObject};
use crate::snapshot::{compact, merge, EventSource, SnapshotCache};

// ───────────────────────────────────────────────────────────────────
// Local presence ("me")
// ───────────────────────────────────────────────────────────────────

/// The local user's presence, exposed as a compacted read-only snapshot.
pub struct MyPresence {
    me: Arc<JsonObject>,
    cache: SnapshotCache<Arc<JsonObject>>,
}

impl MyPresence {
    /// Explicit-null keys in the initial object are stripped, not stored.
    pub fn new(initial: JsonObject) -> Self {
        Self { me: Arc::new(compact(initial)), cache: SnapshotCache::new() }
    }

    pub fn did_invalidate(&self) -> &EventSource {
        self.cache.did_invalidate()
    }

    /// The current presence snapshot. Stable across reads: the same
    /// `Arc` is returned until a patch actually changes something.
    pub fn me(&mut self) -> Arc<JsonObject> {
        let me = self.me.clone();
        self.cache.current_with(|| me).clone()
    }

    /// Merge fields into "me". A `null` field deletes the key; fields
    /// not mentioned are untouched. A patch with no observable effect
    /// leaves the cached snapshot (and its pointer identity) alone.
    pub fn patch_me(&mut self, patch: &JsonObject) {
        if let Some(next) = merge(&self.me, patch) {
            self.me = Arc::new(next);
            self.cache.invalidate();
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Remote presence ("others")
// ───────────────────────────────────────────────────────────────────

/// Connection metadata, as announced by the server when a peer joins.
#[derive(Debug, Clone, PartialEq)]
struct Connection {
    connection_id: ConnectionId,
    user_id: String,
    user_info: Option<Value>,
    is_read_only: bool,
}

/// A visible remote user: connection metadata joined with presence data.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub connection_id: ConnectionId,
    pub id: String,
    pub info: Option<Value>,
    pub is_read_only: bool,
    pub presence: Arc<JsonObject>,
}

/// Remote presence tracker.
///
/// Two maps keyed by connection id — metadata and presence — arrive on
/// independent messages, possibly out of order. Per-user snapshots are
/// memoized and invalidated precisely by mutations touching that id.
pub struct OthersPresence {
    connections: HashMap<ConnectionId, Connection>,
    presences: HashMap<ConnectionId, Arc<JsonObject>>,
    users: HashMap<ConnectionId, Arc<User>>,
    cache: SnapshotCache<Arc<Vec<Arc<User>>>>,
}

impl Default for OthersPresence {
    fn default() -> Self {
        Self::new()
    }
}

impl OthersPresence {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
            presences: HashMap::new(),
            users: HashMap::new(),
            cache: SnapshotCache::new(),
        }
    }

    pub fn did_invalidate(&self) -> &EventSource {
        self.cache.did_invalidate()
    }

    /// All visible remote users, ordered by connection id.
    ///
    /// A connection appears only once both its metadata and its presence
    /// are known. Stable across reads until a mutation changes something.
    pub fn others(&mut self) -> Arc<Vec<Arc<User>>> {
        if let Some(cached) = self.cache.cached() {
            return cached.clone();
        }

        let mut ids: Vec<ConnectionId> = self.presences.keys().copied().collect();
        ids.sort_unstable();
        let mut users = Vec::new();
        for id in ids {
            if let Some(user) = self.get_user(id) {
                users.push(user);
            }
        }
        self.cache.fill(Arc::new(users)).clone()
    }

    /// The snapshot for one connection, memoized per id. `None` until
    /// both metadata and presence exist.
    pub fn get_user(&mut self, connection_id: ConnectionId) -> Option<Arc<User>> {
        if let Some(user) = self.users.get(&connection_id) {
            return Some(user.clone());
        }

        let conn = self.connections.get(&connection_id)?;
        let presence = self.presences.get(&connection_id)?;
        let user = Arc::new(User {
            connection_id: conn.connection_id,
            id: conn.user_id.clone(),
            info: conn.user_info.clone(),
            is_read_only: conn.is_read_only,
            presence: presence.clone(),
        });
        self.users.insert(connection_id, user.clone());
        Some(user)
    }

    /// Record (or replace) a known connection's metadata.
    pub fn set_connection(
        &mut self,
        connection_id: ConnectionId,
        user_id: impl Into<String>,
        user_info: Option<Value>,
        is_read_only: bool,
    ) {
        self.connections.insert(
            connection_id,
            Connection { connection_id, user_id: user_id.into(), user_info, is_read_only },
        );
        if self.presences.contains_key(&connection_id) {
            self.invalidate_user(connection_id);
        }
    }

    /// Overwrite the presence for a connection from a full snapshot.
    /// Explicit-null keys are stripped.
    pub fn set_other(&mut self, connection_id: ConnectionId, presence: JsonObject) {
        self.presences.insert(connection_id, Arc::new(compact(presence)));
        if self.connections.contains_key(&connection_id) {
            self.invalidate_user(connection_id);
        }
    }

    /// Merge a presence delta for a connection. Dropped silently if no
    /// full snapshot has been recorded for that id yet.
    pub fn patch_other(&mut self, connection_id: ConnectionId, patch: &JsonObject) {
        let Some(old) = self.presences.get(&connection_id) else {
            log::debug!("dropping presence patch for unknown connection {connection_id}");
            return;
        };
        if let Some(next) = merge(old, patch) {
            self.presences.insert(connection_id, Arc::new(next));
            self.invalidate_user(connection_id);
        }
    }

    /// Forget a connection entirely (metadata and presence).
    pub fn remove_connection(&mut self, connection_id: ConnectionId) {
        self.connections.remove(&connection_id);
        self.presences.remove(&connection_id);
        self.invalidate_user(connection_id);
    }

    /// Drop every known peer. Used when a session is torn down and the
    /// server will re-announce the room membership.
    pub fn clear_others(&mut self) {
        self.connections.clear();
        self.presences.clear();
        self.users.clear();
        self.cache.invalidate();
    }

    fn invalidate_user(&mut self, connection_id: ConnectionId) {
        self.users.remove(&connection_id);
        self.cache.invalidate();
    }
}

// ===================================================================
// Tests
// ===================================================================
