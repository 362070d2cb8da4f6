//! The room engine: connection lifecycle driving the replica.
//!
//! Owns the document, both presence trackers, and the lifecycle state
//! machine. The machine decides when operations may flow: local
//! mutations are always applied optimistically, but the resulting ops
//! sit in the outbox until the machine is in `connected`.
//!
//! ```text
//!        CONNECT            auth ok             OPEN
//! idle ─────────► connecting.authorizing ──► connecting.opening ──► connected
//!                      ▲      │ auth err                │ DISCONNECT     │
//!                      │      ▼                         ▼               │
//!                      │  recovering.backoff ◄──────────┘◄──────────────┘
//!                      └──────┘ (timer, exponential backoff)
//! ```
//!
//! The engine is transport-agnostic (sans-io): outgoing frames queue up
//! for the host to drain with [`RoomEngine::poll_outgoing`]; incoming
//! frames are handed to [`RoomEngine::handle_frame`]. The host reports
//! socket lifecycle via `transport_opened` / `transport_closed`.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::doc::Document;
use crate::fsm::{BuiltinEvent, Fsm, FsmEvent, Target, TimedDelay};
use crate::presence::{MyPresence, OthersPresence, User};
use crate::protocol::{
    ConnectionId, Frame, JsonObject, MessageType, Op, ProtocolError, StorageOpsBody,
};
use crate::snapshot::EventSource;

// ───────────────────────────────────────────────────────────────────
// Lifecycle machine
// ───────────────────────────────────────────────────────────────────

/// External events fed into the lifecycle machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEvent {
    /// The application asked to connect.
    Connect,
    /// The host opened the wire transport.
    Open,
    /// The wire transport dropped.
    Disconnect,
    /// The application is leaving the room for good.
    Close,
}

impl FsmEvent for ConnEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ConnEvent::Connect => "CONNECT",
            ConnEvent::Open => "OPEN",
            ConnEvent::Disconnect => "DISCONNECT",
            ConnEvent::Close => "CLOSE",
        }
    }
}

/// Lifecycle context carried across transitions.
#[derive(Debug, Clone, Default)]
pub struct ConnContext {
    pub retry_count: u32,
    pub token: Option<String>,
}

fn backoff_delay(ctx: &ConnContext) -> Duration {
    // 500ms, 1s, 2s, ... capped at 15s
    Duration::from_millis((500u64 << ctx.retry_count.min(5)).min(15_000))
}

type AuthFn = Box<dyn Fn(&ConnContext) -> BoxFuture<'static, Result<Value, String>> + Send>;

fn build_lifecycle(auth: AuthFn) -> Fsm<ConnContext, ConnEvent> {
    let mut fsm = Fsm::new(ConnContext::default());
    fsm.add_state("idle")
        .add_state("connecting.authorizing")
        .add_state("connecting.opening")
        .add_state("connected")
        .add_state("recovering.backoff")
        .add_state("closed");

    fsm.add_transitions("idle", [("CONNECT", Target::state("connecting.authorizing"))]);
    fsm.add_transitions(
        "connecting.opening",
        [
            (
                "OPEN",
                Target::with_assign("connected", |ctx: &ConnContext, _: &ConnEvent| ConnContext {
                    retry_count: 0,
                    token: ctx.token.clone(),
                }),
            ),
            (
                "DISCONNECT",
                Target::with_assign("recovering.backoff", |ctx: &ConnContext, _: &ConnEvent| {
                    ConnContext { retry_count: ctx.retry_count + 1, token: ctx.token.clone() }
                }),
            ),
        ],
    );
    fsm.add_transitions(
        "connected",
        [(
            "DISCONNECT",
            Target::with_assign("recovering.backoff", |ctx: &ConnContext, _: &ConnEvent| {
                ConnContext { retry_count: ctx.retry_count + 1, token: ctx.token.clone() }
            }),
        )],
    );
    fsm.add_transitions("*", [("CLOSE", Target::state("closed"))]);

    fsm.on_enter_async(
        "connecting.authorizing",
        move |ctx| auth(ctx),
        Target::with_assign("connecting.opening", |ctx: &ConnContext, event: &BuiltinEvent| {
            let token = match event {
                BuiltinEvent::AsyncOk(value) => {
                    value.get("token").and_then(|t| t.as_str()).map(String::from)
                }
                _ => None,
            };
            ConnContext { retry_count: ctx.retry_count, token }
        }),
        Target::with_assign("recovering.backoff", |ctx: &ConnContext, _: &BuiltinEvent| {
            ConnContext { retry_count: ctx.retry_count + 1, token: None }
        }),
    );

    fsm.add_timed_transition(
        "recovering.backoff",
        TimedDelay::FromContext(Box::new(backoff_delay)),
        Target::state("connecting.authorizing"),
    );

    fsm.start();
    fsm
}

// ───────────────────────────────────────────────────────────────────
// Outbox
// ───────────────────────────────────────────────────────────────────

/// Bounded queue for ops produced while the engine may not emit.
/// Drained and replayed when the machine (re)enters `connected`.
pub struct OpQueue {
    queue: VecDeque<Op>,
    max_size: usize,
}

impl OpQueue {
    pub fn new(max_size: usize) -> Self {
        Self { queue: VecDeque::with_capacity(max_size.min(1024)), max_size }
    }

    /// Queue an op for later emission. Returns false when full.
    pub fn enqueue(&mut self, op: Op) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(op);
        true
    }

    pub fn drain(&mut self) -> Vec<Op> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

// ───────────────────────────────────────────────────────────────────
// Room engine
// ───────────────────────────────────────────────────────────────────

pub struct RoomConfig {
    pub doc_id: Uuid,
    /// Our connection id, as assigned by the server at join time.
    pub actor: ConnectionId,
    pub initial_presence: JsonObject,
    /// Outbox capacity; ops beyond it are dropped with a warning.
    pub outbox_capacity: usize,
}

impl RoomConfig {
    pub fn new(doc_id: Uuid, actor: ConnectionId) -> Self {
        Self { doc_id, actor, initial_presence: JsonObject::new(), outbox_capacity: 10_000 }
    }
}

pub struct RoomEngine {
    doc_id: Uuid,
    actor: ConnectionId,
    fsm: Fsm<ConnContext, ConnEvent>,
    doc: Document,
    me: MyPresence,
    others: OthersPresence,
    outbox: Arc<Mutex<OpQueue>>,
    /// Ops sent but not yet acknowledged; re-sent after a reconnect.
    in_flight: Vec<Op>,
    outgoing: VecDeque<Frame>,
    seq: u64,
    last_state: String,
    storage_event: EventSource,
}

impl RoomEngine {
    /// An engine with anonymous (always-succeeding) authorization.
    pub fn new(config: RoomConfig) -> Self {
        Self::with_auth(config, |_| async move { Ok(json!({ "token": "anonymous" })) }.boxed())
    }

    /// An engine whose connect path runs the given authorization future
    /// before opening the transport.
    pub fn with_auth(
        config: RoomConfig,
        auth: impl Fn(&ConnContext) -> BoxFuture<'static, Result<Value, String>> + Send + 'static,
    ) -> Self {
        let fsm = build_lifecycle(Box::new(auth));
        let outbox = Arc::new(Mutex::new(OpQueue::new(config.outbox_capacity)));

        let mut doc = Document::new(config.actor);
        let sink = outbox.clone();
        doc.set_transport(move |ops| {
            let mut queue = sink.lock().unwrap();
            for op in ops {
                if !queue.enqueue(op.clone()) {
                    log::warn!("outbox full, dropping op {}", op.op_id());
                }
            }
        });
        let storage_event = EventSource::new();
        let event = storage_event.clone();
        doc.subscribe_storage(move |_| event.notify());

        let last_state = fsm.current_state().to_string();
        Self {
            doc_id: config.doc_id,
            actor: config.actor,
            fsm,
            doc,
            me: MyPresence::new(config.initial_presence),
            others: OthersPresence::new(),
            outbox,
            in_flight: Vec::new(),
            outgoing: VecDeque::new(),
            seq: 0,
            last_state,
            storage_event,
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────

    pub fn status(&self) -> &str {
        self.fsm.current_state()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == "connected"
    }

    /// Ask the engine to connect. No-op unless idle.
    pub fn connect(&mut self) {
        let _ = self.fsm.send_if_possible(ConnEvent::Connect);
        self.sync_state();
    }

    /// The host opened the wire transport.
    pub fn transport_opened(&mut self) {
        let _ = self.fsm.send_if_possible(ConnEvent::Open);
        self.sync_state();
    }

    /// The host lost the wire transport.
    pub fn transport_closed(&mut self) {
        let _ = self.fsm.send_if_possible(ConnEvent::Disconnect);
        self.sync_state();
    }

    /// Leave the room permanently.
    pub fn close(&mut self) {
        let _ = self.fsm.send_if_possible(ConnEvent::Close);
        self.sync_state();
    }

    /// Deliver pending timer/async outcomes (backoff expiry, finished
    /// authorization) and react to any state change.
    pub fn tick(&mut self) {
        self.fsm.pump();
        self.sync_state();
    }

    /// Await the next timer/async outcome, deliver it, and react.
    pub async fn drive(&mut self) {
        self.fsm.wait().await;
        self.sync_state();
    }

    // ── Presence ─────────────────────────────────────────────────

    pub fn me(&mut self) -> Arc<JsonObject> {
        self.me.me()
    }

    /// Patch the local presence and broadcast the delta if connected.
    pub fn update_presence(&mut self, patch: &JsonObject) {
        self.me.patch_me(patch);
        if self.is_connected() {
            let seq = self.next_seq();
            let frame = Frame::presence_patch(self.doc_id, self.actor, seq, patch);
            self.push_frame(frame);
        }
    }

    pub fn others(&mut self) -> Arc<Vec<Arc<User>>> {
        self.others.others()
    }

    pub fn get_user(&mut self, connection_id: ConnectionId) -> Option<Arc<User>> {
        self.others.get_user(connection_id)
    }

    /// Invalidation event of the local presence snapshot.
    pub fn me_event(&self) -> &EventSource {
        self.me.did_invalidate()
    }

    /// Invalidation event of the remote presence snapshot.
    pub fn others_event(&self) -> &EventSource {
        self.others.did_invalidate()
    }

    /// Fires on every applied storage change (local, remote, or replay).
    pub fn storage_event(&self) -> &EventSource {
        &self.storage_event
    }

    // ── Storage ──────────────────────────────────────────────────

    pub fn document(&self) -> &Document {
        &self.doc
    }

    /// Mutate the document, then flush whatever ops the mutations
    /// produced (if connected; they stay queued otherwise).
    pub fn with_document<R>(&mut self, f: impl FnOnce(&mut Document) -> R) -> R {
        let result = f(&mut self.doc);
        self.flush_storage();
        result
    }

    pub fn undo(&mut self) -> bool {
        let undone = self.doc.undo();
        self.flush_storage();
        undone
    }

    pub fn redo(&mut self) -> bool {
        let redone = self.doc.redo();
        self.flush_storage();
        redone
    }

    /// Ops applied locally but not yet emitted.
    pub fn queued_ops(&self) -> usize {
        self.outbox.lock().unwrap().len()
    }

    /// Ops emitted but not yet acknowledged.
    pub fn in_flight_ops(&self) -> usize {
        self.in_flight.len()
    }

    // ── Wire I/O ─────────────────────────────────────────────────

    /// Next outgoing frame for the host to put on the wire.
    pub fn poll_outgoing(&mut self) -> Option<Frame> {
        self.outgoing.pop_front()
    }

    /// Route one incoming frame.
    pub fn handle_frame(&mut self, frame: &Frame) {
        match frame.msg_type {
            MessageType::PresenceFull => {
                if frame.actor == self.actor {
                    return;
                }
                match frame.presence() {
                    Ok(body) => self.others.set_other(frame.actor, body.data),
                    Err(e) => log::warn!("bad presence payload from {}: {e}", frame.actor),
                }
            }
            MessageType::PresencePatch => {
                if frame.actor == self.actor {
                    return;
                }
                match frame.presence() {
                    Ok(body) => self.others.patch_other(frame.actor, &body.data),
                    Err(e) => log::warn!("bad presence payload from {}: {e}", frame.actor),
                }
            }
            MessageType::ConnectionJoined => match frame.connection() {
                Ok(body) => {
                    if body.connection_id != self.actor {
                        self.others.set_connection(
                            body.connection_id,
                            body.user_id,
                            body.user_info,
                            body.is_read_only,
                        );
                        // Introduce ourselves to the newcomer
                        if self.is_connected() {
                            let me = self.me.me();
                            let seq = self.next_seq();
                            let frame = Frame::presence_full(self.doc_id, self.actor, seq, &me);
                            self.push_frame(frame);
                        }
                    }
                }
                Err(e) => log::warn!("bad connection payload: {e}"),
            },
            MessageType::ConnectionLeft => {
                self.others.remove_connection(frame.actor);
            }
            MessageType::StorageOps => match frame.ops() {
                Ok(body) => {
                    if body.origin == Some(self.actor) {
                        // Our own ops echoed back: idempotent re-apply
                        self.doc.apply_ack(&body.ops);
                    } else {
                        self.doc.apply_remote(&body.ops);
                    }
                }
                Err(e) => log::warn!("bad storage payload: {e}"),
            },
            MessageType::StorageAck => match frame.ack() {
                Ok(body) => {
                    self.in_flight.retain(|op| !body.op_ids.iter().any(|id| id == op.op_id()));
                }
                Err(e) => log::warn!("bad ack payload: {e}"),
            },
            MessageType::Ping => {
                self.outgoing.push_back(Frame::pong(self.doc_id, self.actor));
            }
            MessageType::Pong => {}
        }
    }

    // ── Internals ────────────────────────────────────────────────

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn push_frame(&mut self, frame: Result<Frame, ProtocolError>) {
        match frame {
            Ok(frame) => self.outgoing.push_back(frame),
            Err(e) => log::error!("failed to encode frame: {e}"),
        }
    }

    /// React to lifecycle state edges.
    fn sync_state(&mut self) {
        let state = self.fsm.current_state().to_string();
        if state == self.last_state {
            return;
        }
        log::info!("room {}: {} -> {}", self.doc_id, self.last_state, state);
        let was_connected = self.last_state == "connected";
        self.last_state = state.clone();

        if state == "connected" {
            self.on_connected();
        } else if was_connected {
            // Membership will be re-announced by the server on reconnect
            self.others.clear_others();
        }
    }

    fn on_connected(&mut self) {
        // Announce full presence first, then replay unacknowledged and
        // queued ops in their original program order
        let me = self.me.me();
        let seq = self.next_seq();
        let frame = Frame::presence_full(self.doc_id, self.actor, seq, &me);
        self.push_frame(frame);

        let mut ops = std::mem::take(&mut self.in_flight);
        ops.extend(self.outbox.lock().unwrap().drain());
        if !ops.is_empty() {
            log::info!("replaying {} queued ops", ops.len());
            self.send_ops(ops);
        }
    }

    fn flush_storage(&mut self) {
        if !self.is_connected() {
            return;
        }
        let ops = self.outbox.lock().unwrap().drain();
        if ops.is_empty() {
            return;
        }
        self.send_ops(ops);
    }

    fn send_ops(&mut self, ops: Vec<Op>) {
        let body = StorageOpsBody { origin: Some(self.actor), ops: ops.clone() };
        let seq = self.next_seq();
        let frame = Frame::storage_ops(self.doc_id, self.actor, seq, &body);
        self.push_frame(frame);
        self.in_flight.extend(ops);
    }
}

// ===================================================================
// Tests
// ===================================================================
