//! A generic hierarchical finite state machine.
//!
//! State names are dotted paths (`"connecting.backoff"`); transitions,
//! enter handlers, and the built-in timed/async transitions can be
//! registered against exact names or wildcard patterns (`"group.*"`,
//! bare `"*"`). Exit behavior is expressed as cleanup closures returned
//! by enter handlers, kept on a stack with one slot per hierarchy level:
//!
//! ```text
//! state "foo.bar.qux"          cleanup stack (top = most specific)
//!                              ┌──────────────┐
//!                              │ foo.bar.qux  │  ← popped when exiting 1 level
//!                              │ foo.bar.*    │
//!                              │ foo.*        │
//!                              │ *            │  ← popped only on stop()
//!                              └──────────────┘
//! ```
//!
//! A transition exits only the levels not shared with the target state
//! and enters only the levels below the shared prefix, so moving between
//! siblings never disturbs group-scoped work (timers, in-flight futures).
//!
//! Timed and async transitions spawn a tokio task guarded by a
//! cancellation flag owned by the state's cleanup slot. The task reports
//! through an internal channel; `pump()` (or `wait()`) delivers the
//! completions as transitions. A completion whose flag was set by a state
//! exit is a guaranteed no-op, even if the task already fired.
//!
//! Configuration mistakes (unknown patterns, duplicate handlers,
//! configuring after start, transitions to unregistered states) are
//! programmer errors and panic. Runtime protocol errors (unknown event,
//! event not allowed in the current state) are returned as `FsmError`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

// ───────────────────────────────────────────────────────────────────
// Events and targets
// ───────────────────────────────────────────────────────────────────

/// User-defined machine events. The event type string keys the
/// transition tables.
pub trait FsmEvent {
    fn event_type(&self) -> &'static str;
}

/// Events produced by the built-in timed and async transitions.
#[derive(Debug, Clone)]
pub enum BuiltinEvent {
    Timer,
    AsyncOk(Value),
    AsyncError(String),
}

type AssignFn<C, Ev> = Arc<dyn Fn(&C, &Ev) -> C + Send + Sync>;

/// A resolved transition target: the next state plus an optional context
/// replacement computed from the old context and the event.
pub struct TargetSpec<C, Ev> {
    target: String,
    assign: Option<AssignFn<C, Ev>>,
}

impl<C, Ev> TargetSpec<C, Ev> {
    pub fn to(target: impl Into<String>) -> Self {
        Self { target: target.into(), assign: None }
    }

    pub fn with_assign(
        target: impl Into<String>,
        assign: impl Fn(&C, &Ev) -> C + Send + Sync + 'static,
    ) -> Self {
        Self { target: target.into(), assign: Some(Arc::new(assign)) }
    }
}

/// An outgoing edge: a literal next-state name, or a function of the
/// event and context producing one (optionally with a context patch).
pub struct Target<C, Ev> {
    resolve: Box<dyn Fn(&Ev, &C) -> TargetSpec<C, Ev> + Send + Sync>,
}

impl<C: 'static, Ev: 'static> Target<C, Ev> {
    /// A static target state.
    pub fn state(name: impl Into<String>) -> Self {
        let name = name.into();
        Self { resolve: Box::new(move |_, _| TargetSpec::to(name.clone())) }
    }

    /// A static target state with a context replacement.
    pub fn with_assign(
        name: impl Into<String>,
        assign: impl Fn(&C, &Ev) -> C + Send + Sync + 'static,
    ) -> Self {
        let name = name.into();
        let assign: AssignFn<C, Ev> = Arc::new(assign);
        Self {
            resolve: Box::new(move |_, _| TargetSpec {
                target: name.clone(),
                assign: Some(assign.clone()),
            }),
        }
    }

    /// A target computed from the event and the current context.
    pub fn dynamic(f: impl Fn(&Ev, &C) -> TargetSpec<C, Ev> + Send + Sync + 'static) -> Self {
        Self { resolve: Box::new(f) }
    }
}

/// Runtime protocol errors surfaced by [`Fsm::send`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsmError {
    #[error("unknown event {0:?}")]
    UnknownEvent(&'static str),
    #[error("event {event:?} is not allowed from state {state:?}")]
    EventNotAllowed { event: &'static str, state: String },
}

// ───────────────────────────────────────────────────────────────────
// Hierarchy helpers
// ───────────────────────────────────────────────────────────────────

/// Hierarchical distance between two state names, as (up, down): the
/// number of levels to exit from `from`, and to enter toward `to`,
/// relative to their shared dotted prefix.
pub fn distance(from: &str, to: &str) -> (usize, usize) {
    if from == to {
        return (0, 0);
    }

    let from_parts: Vec<&str> = from.split('.').collect();
    let to_parts: Vec<&str> = to.split('.').collect();
    let min_len = from_parts.len().min(to_parts.len());
    let mut shared = 0;
    while shared < min_len && from_parts[shared] == to_parts[shared] {
        shared += 1;
    }

    (from_parts.len() - shared, to_parts.len() - shared)
}

/// The patterns matching `state` at its deepest `levels` levels, most
/// general first. With `levels == segments + 1` the list starts at `"*"`.
pub fn patterns(state: &str, levels: usize) -> Vec<String> {
    let parts: Vec<&str> = state.split('.').collect();
    if levels < 1 || levels > parts.len() + 1 {
        panic!("invalid number of levels");
    }

    let mut result = Vec::with_capacity(levels);
    if levels > parts.len() {
        result.push("*".to_string());
    }

    let start = (parts.len() + 1).saturating_sub(levels).max(1);
    for i in start..parts.len() {
        result.push(format!("{}.*", parts[..i].join(".")));
    }

    result.push(state.to_string());
    result
}

// ───────────────────────────────────────────────────────────────────
// The machine
// ───────────────────────────────────────────────────────────────────

/// Cleanup closure returned by an enter handler, run when the matching
/// hierarchy level is exited.
pub type CleanupFn = Box<dyn FnOnce() + Send>;

type EnterFn<C> = Box<dyn FnMut(&C) -> Option<CleanupFn> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    NotStarted,
    Started,
    Stopped,
}

struct TimedSpec<C> {
    target: Arc<Target<C, BuiltinEvent>>,
}

struct AsyncSpec<C> {
    on_ok: Arc<Target<C, BuiltinEvent>>,
    on_error: Arc<Target<C, BuiltinEvent>>,
}

enum CompletionKind {
    Timer { spec_id: usize },
    AsyncOk { spec_id: usize, result: Value },
    AsyncError { spec_id: usize, error: String },
}

struct Completion {
    cancelled: Arc<AtomicBool>,
    kind: CompletionKind,
}

/// Delay for a timed transition: fixed, or computed from the context at
/// state entry.
pub enum TimedDelay<C> {
    Fixed(Duration),
    FromContext(Box<dyn Fn(&C) -> Duration + Send>),
}

impl<C> From<Duration> for TimedDelay<C> {
    fn from(duration: Duration) -> Self {
        TimedDelay::Fixed(duration)
    }
}

pub struct Fsm<C, E> {
    run_state: RunState,
    context: C,

    /// Registration order; the first state is the initial state.
    states: Vec<String>,
    state_set: HashSet<String>,
    current: Option<String>,

    transitions: HashMap<String, HashMap<&'static str, Arc<Target<C, E>>>>,
    known_events: HashSet<&'static str>,
    enter_fns: HashMap<String, EnterFn<C>>,

    /// One slot per hierarchy level of the current state, most specific
    /// on top. Always `current.split('.').count() + 1` entries while
    /// started.
    cleanup_stack: Vec<Option<CleanupFn>>,

    timed_specs: Vec<TimedSpec<C>>,
    async_specs: Vec<AsyncSpec<C>>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
}

impl<C: 'static, E: FsmEvent> Fsm<C, E> {
    pub fn new(initial_context: C) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            run_state: RunState::NotStarted,
            context: initial_context,
            states: Vec::new(),
            state_set: HashSet::new(),
            current: None,
            transitions: HashMap::new(),
            known_events: HashSet::new(),
            enter_fns: HashMap::new(),
            cleanup_stack: Vec::new(),
            timed_specs: Vec::new(),
            async_specs: Vec::new(),
            completions_tx,
            completions_rx,
        }
    }

    fn assert_not_started(&self) {
        if self.run_state != RunState::NotStarted {
            panic!("already started");
        }
    }

    // ── Configuration (before start) ─────────────────────────────

    /// Register an explicit state. The first state ever registered is
    /// the initial state.
    pub fn add_state(&mut self, state: impl Into<String>) -> &mut Self {
        self.assert_not_started();
        let state = state.into();
        if self.state_set.insert(state.clone()) {
            self.states.push(state);
        }
        self
    }

    fn get_matches(&self, pattern: &str) -> Vec<String> {
        let matches: Vec<String> = if pattern == "*" {
            self.states.clone()
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            // "group.*" matches descendants of "group", not "group" itself
            self.states.iter().filter(|s| s.starts_with(prefix)).cloned().collect()
        } else {
            self.states.iter().filter(|s| s.as_str() == pattern).cloned().collect()
        };

        if matches.is_empty() {
            panic!("no states match {pattern:?}");
        }
        matches
    }

    /// Attach outgoing edges to every state matched by `pattern`.
    pub fn add_transitions(
        &mut self,
        pattern: &str,
        entries: impl IntoIterator<Item = (&'static str, Target<C, E>)>,
    ) -> &mut Self {
        self.assert_not_started();
        let matches = self.get_matches(pattern);
        let entries: Vec<(&'static str, Arc<Target<C, E>>)> =
            entries.into_iter().map(|(t, target)| (t, Arc::new(target))).collect();

        for (event_type, _) in &entries {
            self.known_events.insert(event_type);
        }
        for state in matches {
            let map = self.transitions.entry(state).or_default();
            for (event_type, target) in &entries {
                map.insert(event_type, target.clone());
            }
        }
        self
    }

    /// Attach an entry handler to a state or pattern. The handler may
    /// return a cleanup closure, executed when the matching level is
    /// exited. At most one handler per exact pattern.
    pub fn on_enter(
        &mut self,
        pattern: &str,
        enter_fn: impl FnMut(&C) -> Option<CleanupFn> + Send + 'static,
    ) -> &mut Self {
        self.assert_not_started();
        if self.enter_fns.contains_key(pattern) {
            panic!("enter handler for {pattern:?} already exists");
        }
        self.enter_fns.insert(pattern.to_string(), Box::new(enter_fn));
        self
    }

    /// On entry, start `future_fn(context)`. If it resolves while the
    /// state (scope) is still active, transition to `on_ok` with the
    /// result, or to `on_error` with the error. Exiting the scope first
    /// cancels the outcome.
    pub fn on_enter_async<F>(
        &mut self,
        pattern: &str,
        future_fn: F,
        on_ok: Target<C, BuiltinEvent>,
        on_error: Target<C, BuiltinEvent>,
    ) -> &mut Self
    where
        F: Fn(&C) -> BoxFuture<'static, Result<Value, String>> + Send + 'static,
    {
        let spec_id = self.async_specs.len();
        self.async_specs.push(AsyncSpec { on_ok: Arc::new(on_ok), on_error: Arc::new(on_error) });
        let tx = self.completions_tx.clone();

        self.on_enter(pattern, move |context| {
            let cancelled = Arc::new(AtomicBool::new(false));
            let future = future_fn(context);
            let flag = cancelled.clone();
            let tx = tx.clone();
            let handle = tokio::spawn(async move {
                let kind = match future.await {
                    Ok(result) => CompletionKind::AsyncOk { spec_id, result },
                    Err(error) => CompletionKind::AsyncError { spec_id, error },
                };
                let _ = tx.send(Completion { cancelled: flag, kind });
            });
            Some(Box::new(move || {
                cancelled.store(true, Ordering::SeqCst);
                handle.abort();
            }) as CleanupFn)
        })
    }

    /// On entry, schedule an anonymous transition to `target` after
    /// `delay`. Exiting the pattern's scope cancels the timer; moving
    /// between states inside the scope does not.
    pub fn add_timed_transition(
        &mut self,
        pattern: &str,
        delay: impl Into<TimedDelay<C>>,
        target: Target<C, BuiltinEvent>,
    ) -> &mut Self {
        let spec_id = self.timed_specs.len();
        self.timed_specs.push(TimedSpec { target: Arc::new(target) });
        let delay = delay.into();
        let tx = self.completions_tx.clone();

        self.on_enter(pattern, move |context| {
            let duration = match &delay {
                TimedDelay::Fixed(d) => *d,
                TimedDelay::FromContext(f) => f(context),
            };
            let cancelled = Arc::new(AtomicBool::new(false));
            let flag = cancelled.clone();
            let tx = tx.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                let _ =
                    tx.send(Completion { cancelled: flag, kind: CompletionKind::Timer { spec_id } });
            });
            Some(Box::new(move || {
                cancelled.store(true, Ordering::SeqCst);
                handle.abort();
            }) as CleanupFn)
        })
    }

    // ── Running ──────────────────────────────────────────────────

    /// Enter the initial state, running every matching entry handler
    /// from the most general wildcard down to the exact state name.
    pub fn start(&mut self) -> &mut Self {
        if self.run_state != RunState::NotStarted {
            panic!("state machine has already started");
        }
        if self.states.is_empty() {
            panic!("no states defined yet");
        }
        self.run_state = RunState::Started;
        self.current = Some(self.states[0].clone());
        self.enter(None);
        self
    }

    /// Run all remaining cleanups (exits every level) and clear the
    /// current state. A stopped machine cannot be restarted.
    pub fn stop(&mut self) {
        if self.run_state != RunState::Started {
            panic!("cannot stop a state machine that isn't started");
        }
        self.run_state = RunState::Stopped;
        self.exit(None);
        self.current = None;
    }

    /// The current state name. Only defined while the machine is started.
    pub fn current_state(&self) -> &str {
        self.current.as_deref().expect("not started yet")
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    /// Whether the current state declares a transition for `event_type`.
    pub fn can(&self, event_type: &str) -> bool {
        self.transitions
            .get(self.current_state())
            .is_some_and(|map| map.contains_key(event_type))
    }

    /// Send an event, possibly transitioning. Errors if the event type
    /// is unknown to the whole machine, or known but not allowed from
    /// the current state.
    pub fn send(&mut self, event: E) -> Result<(), FsmError> {
        let current = self.current.clone().expect("not started yet");
        let event_type = event.event_type();
        let target = self
            .transitions
            .get(current.as_str())
            .and_then(|map| map.get(event_type))
            .cloned();

        match target {
            Some(target) => {
                self.transition(&event, &target);
                Ok(())
            }
            None if self.known_events.contains(event_type) => {
                Err(FsmError::EventNotAllowed { event: event_type, state: current })
            }
            None => Err(FsmError::UnknownEvent(event_type)),
        }
    }

    /// Like [`Fsm::send`], but an event that is merely not allowed from
    /// the current state is silently ignored (a normal runtime race).
    /// Unknown event types still error, and a target resolving to an
    /// unregistered state still panics: both signal misconfiguration.
    pub fn send_if_possible(&mut self, event: E) -> Result<(), FsmError> {
        match self.send(event) {
            Err(FsmError::EventNotAllowed { .. }) => Ok(()),
            other => other,
        }
    }

    /// Deliver all pending timer/async completions, taking their
    /// transitions. Returns the number of transitions taken.
    pub fn pump(&mut self) -> usize {
        let mut delivered = 0;
        while let Ok(completion) = self.completions_rx.try_recv() {
            if self.deliver(completion) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Await the next completion and deliver it. Returns whether a
    /// transition was taken.
    pub async fn wait(&mut self) -> bool {
        match self.completions_rx.recv().await {
            Some(completion) => self.deliver(completion),
            None => false,
        }
    }

    // ── Internals ────────────────────────────────────────────────

    fn deliver(&mut self, completion: Completion) -> bool {
        // The flag is the sole cancellation mechanism: once the cleanup
        // for the originating state ran, the continuation must not
        // produce a transition, even if the task already fired.
        if completion.cancelled.load(Ordering::SeqCst) {
            return false;
        }
        if self.run_state != RunState::Started {
            return false;
        }

        match completion.kind {
            CompletionKind::Timer { spec_id } => {
                let target = self.timed_specs[spec_id].target.clone();
                self.transition(&BuiltinEvent::Timer, &target);
            }
            CompletionKind::AsyncOk { spec_id, result } => {
                let target = self.async_specs[spec_id].on_ok.clone();
                self.transition(&BuiltinEvent::AsyncOk(result), &target);
            }
            CompletionKind::AsyncError { spec_id, error } => {
                let target = self.async_specs[spec_id].on_error.clone();
                self.transition(&BuiltinEvent::AsyncError(error), &target);
            }
        }
        true
    }

    fn transition<Ev>(&mut self, event: &Ev, target: &Target<C, Ev>) {
        let spec = (target.resolve)(event, &self.context);
        if !self.state_set.contains(&spec.target) {
            panic!("invalid next state name: {:?}", spec.target);
        }

        let current = self.current.clone().expect("not started yet");
        let (up, down) = distance(&current, &spec.target);

        // An explicit self-transition has distance (0, 0): no handler
        // runs, even when the transition carries a context patch.
        if up > 0 {
            self.exit(Some(up));
        }
        self.current = Some(spec.target.clone());
        if let Some(assign) = &spec.assign {
            self.context = assign(&self.context, event);
        }
        if down > 0 {
            self.enter(Some(down));
        }
    }

    /// Pop and run `levels` cleanup slots, innermost first.
    fn exit(&mut self, levels: Option<usize>) {
        let levels = levels.unwrap_or(self.cleanup_stack.len());
        for _ in 0..levels {
            if let Some(Some(cleanup)) = self.cleanup_stack.pop() {
                cleanup();
            }
        }
    }

    /// Run matching entry handlers for the deepest `levels` levels of
    /// the current state (most general first), pushing one cleanup slot
    /// per level.
    fn enter(&mut self, levels: Option<usize>) {
        let current = self.current.clone().expect("not started yet");
        let levels = levels.unwrap_or(current.split('.').count() + 1);

        for pattern in patterns(&current, levels) {
            let cleanup = match self.enter_fns.get_mut(&pattern) {
                Some(enter_fn) => enter_fn(&self.context),
                None => None,
            };
            self.cleanup_stack.push(cleanup);
        }
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use serde_json::json;
    use std::sync::Mutex;

    /// Minimal event for tests: the wrapped string is the event type.
    #[derive(Debug, Clone)]
    struct Ev(&'static str);

    impl FsmEvent for Ev {
        fn event_type(&self) -> &'static str {
            self.0
        }
    }

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn log_entry(log: &Log, entry: &'static str) {
        log.lock().unwrap().push(entry);
    }

    fn drain(log: &Log) -> Vec<&'static str> {
        std::mem::take(&mut *log.lock().unwrap())
    }

    // ── Helpers ──────────────────────────────────────────────────

    #[test]
    fn test_distance() {
        assert_eq!(distance("foo.bar.baz", "foo.bar.baz"), (0, 0));
        assert_eq!(distance("foo.bar.baz", "foo.bar.qux"), (1, 1));
        assert_eq!(distance("foo.bar.baz", "foo.bar.qux.bla"), (1, 2));
        assert_eq!(distance("foo.bar.baz", "foo.baz"), (2, 1));
        assert_eq!(distance("foo.bar.baz", "yo"), (3, 1));
        assert_eq!(distance("yo", "foo.bar.baz"), (1, 3));
        assert_eq!(distance("yo", "hey"), (1, 1));
    }

    #[test]
    fn test_patterns() {
        assert_eq!(patterns("initial", 1), vec!["initial"]);
        assert_eq!(patterns("foo.bar.baz", 1), vec!["foo.bar.baz"]);
        assert_eq!(patterns("foo.bar.baz", 2), vec!["foo.bar.*", "foo.bar.baz"]);
        assert_eq!(patterns("foo.bar.baz", 3), vec!["foo.*", "foo.bar.*", "foo.bar.baz"]);
        assert_eq!(patterns("foo.bar.baz", 4), vec!["*", "foo.*", "foo.bar.*", "foo.bar.baz"]);
        assert_eq!(
            patterns("a.b.c.d.e.f", 3),
            vec!["a.b.c.d.*", "a.b.c.d.e.*", "a.b.c.d.e.f"]
        );
    }

    #[test]
    #[should_panic(expected = "invalid number of levels")]
    fn test_patterns_zero_levels_panics() {
        patterns("foo.bar.baz", 0);
    }

    #[test]
    #[should_panic(expected = "invalid number of levels")]
    fn test_patterns_too_many_levels_panics() {
        patterns("foo.bar.baz", 5);
    }

    // ── Configuration errors ─────────────────────────────────────

    #[test]
    #[should_panic(expected = "no states defined yet")]
    fn test_cannot_start_without_states() {
        Fsm::<(), Ev>::new(()).start();
    }

    #[test]
    #[should_panic(expected = "not started yet")]
    fn test_cannot_send_before_start() {
        let mut fsm = Fsm::<(), Ev>::new(());
        fsm.add_state("red");
        let _ = fsm.send(Ev("SOME_EVENT"));
    }

    #[test]
    #[should_panic(expected = "not started yet")]
    fn test_cannot_read_current_state_before_start() {
        let mut fsm = Fsm::<(), Ev>::new(());
        fsm.add_state("red").add_state("yellow").add_state("green");
        let _ = fsm.current_state();
    }

    #[test]
    #[should_panic(expected = "no states match")]
    fn test_transition_pattern_matching_no_state_panics() {
        let mut fsm = Fsm::<(), Ev>::new(());
        fsm.add_transitions("foo", [("X", Target::state("foo"))]);
    }

    #[test]
    #[should_panic(expected = "no states match")]
    fn test_wildcard_pattern_matching_no_state_panics() {
        let mut fsm = Fsm::<(), Ev>::new(());
        fsm.add_state("initial");
        fsm.add_transitions("initial.*", [("X", Target::state("initial"))]);
    }

    #[test]
    #[should_panic(expected = "already exists")]
    fn test_duplicate_enter_handler_panics() {
        let mut fsm = Fsm::<(), Ev>::new(());
        fsm.add_state("red");
        fsm.on_enter("red", |_| None);
        fsm.on_enter("red", |_| None);
    }

    #[test]
    #[should_panic(expected = "already started")]
    fn test_cannot_configure_after_start() {
        let mut fsm = Fsm::<(), Ev>::new(());
        fsm.add_state("red");
        fsm.start();
        fsm.add_state("green");
    }

    #[test]
    #[should_panic(expected = "invalid next state name")]
    fn test_invalid_target_state_panics() {
        let mut fsm = Fsm::<(), Ev>::new(());
        fsm.add_state("initial");
        fsm.add_transitions("initial", [("SOME_EVENT", Target::state("not-a-state"))]);
        fsm.start();
        let _ = fsm.send(Ev("SOME_EVENT"));
    }

    // ── Basic transitions ────────────────────────────────────────

    #[test]
    fn test_initial_state_is_first_added() {
        let mut fsm = Fsm::<(), Ev>::new(());
        fsm.add_state("red").add_state("yellow").add_state("green");
        fsm.start();
        assert_eq!(fsm.current_state(), "red");
    }

    #[test]
    fn test_send_errors() {
        let mut fsm = Fsm::<(), Ev>::new(());
        fsm.add_state("red").add_state("green");
        fsm.add_transitions("red", [("ONLY_WHEN_RED", Target::state("green"))]);
        fsm.add_transitions("green", [("ONLY_WHEN_GREEN", Target::state("red"))]);
        fsm.start();

        assert_eq!(fsm.send(Ev("UNKNOWN_EVENT")), Err(FsmError::UnknownEvent("UNKNOWN_EVENT")));
        assert_eq!(
            fsm.send(Ev("ONLY_WHEN_GREEN")),
            Err(FsmError::EventNotAllowed {
                event: "ONLY_WHEN_GREEN",
                state: "red".to_string()
            })
        );
        assert_eq!(fsm.current_state(), "red");
    }

    #[test]
    fn test_send_if_possible_swallows_disallowed_only() {
        let mut fsm = Fsm::<(), Ev>::new(());
        fsm.add_state("red").add_state("green");
        fsm.add_transitions("red", [("ONLY_WHEN_RED", Target::state("green"))]);
        fsm.add_transitions("green", [("ONLY_WHEN_GREEN", Target::state("red"))]);
        fsm.start();

        // Disallowed from this state: silently ignored
        assert_eq!(fsm.send_if_possible(Ev("ONLY_WHEN_GREEN")), Ok(()));
        assert_eq!(fsm.current_state(), "red");

        // Unknown event type: still an error
        assert!(fsm.send_if_possible(Ev("NO_SUCH_EVENT")).is_err());

        // Allowed: acts like send
        assert_eq!(fsm.send_if_possible(Ev("ONLY_WHEN_RED")), Ok(()));
        assert_eq!(fsm.current_state(), "green");
    }

    #[test]
    #[should_panic(expected = "invalid next state name")]
    fn test_send_if_possible_still_panics_on_invalid_target() {
        let mut fsm = Fsm::<(), Ev>::new(());
        fsm.add_state("red");
        fsm.add_transitions("red", [("INVALID", Target::state("not-a-state"))]);
        fsm.start();
        let _ = fsm.send_if_possible(Ev("INVALID"));
    }

    #[test]
    fn test_traffic_light_scenario() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        let mut fsm = Fsm::<(), Ev>::new(());
        fsm.add_state("red").add_state("yellow").add_state("green");

        for (state, enter, exit) in [
            ("red", "entered red", "exited red"),
            ("yellow", "entered yellow", "exited yellow"),
            ("green", "entered green", "exited green"),
        ] {
            let log = log.clone();
            fsm.on_enter(state, move |_| {
                log_entry(&log, enter);
                let log = log.clone();
                Some(Box::new(move || log_entry(&log, exit)) as CleanupFn)
            });
        }

        fsm.add_transitions(
            "green",
            [
                ("STAY_GREEN_LONGER", Target::state("green")),
                ("BE_CAREFUL", Target::state("yellow")),
            ],
        );
        fsm.add_transitions("red", [("TO_GREEN", Target::state("green"))]);
        fsm.start();

        assert_eq!(fsm.current_state(), "red");
        assert_eq!(drain(&log), vec!["entered red"]);

        fsm.send(Ev("TO_GREEN")).unwrap();
        assert_eq!(fsm.current_state(), "green");
        assert_eq!(drain(&log), vec!["exited red", "entered green"]);

        // Explicit self-transitions run no enter/exit handlers
        fsm.send(Ev("STAY_GREEN_LONGER")).unwrap();
        fsm.send(Ev("STAY_GREEN_LONGER")).unwrap();
        assert_eq!(fsm.current_state(), "green");
        assert!(drain(&log).is_empty());

        assert!(!fsm.can("TO_GREEN"));
        assert!(fsm.can("BE_CAREFUL"));

        fsm.send(Ev("BE_CAREFUL")).unwrap();
        assert_eq!(fsm.current_state(), "yellow");
        assert_eq!(drain(&log), vec!["exited green", "entered yellow"]);
    }

    #[test]
    fn test_self_transition_with_context_patch_runs_no_handlers() {
        #[derive(Clone)]
        struct Ctx {
            count: u32,
        }

        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let mut fsm = Fsm::<Ctx, Ev>::new(Ctx { count: 0 });
        fsm.add_state("green");
        {
            let log = log.clone();
            fsm.on_enter("green", move |_| {
                log_entry(&log, "entered green");
                let log = log.clone();
                Some(Box::new(move || log_entry(&log, "exited green")) as CleanupFn)
            });
        }
        fsm.add_transitions(
            "green",
            [(
                "BUMP",
                Target::with_assign("green", |ctx: &Ctx, _: &Ev| Ctx { count: ctx.count + 1 }),
            )],
        );
        fsm.start();
        assert_eq!(drain(&log), vec!["entered green"]);

        fsm.send(Ev("BUMP")).unwrap();
        fsm.send(Ev("BUMP")).unwrap();
        assert_eq!(fsm.context().count, 2);
        assert!(drain(&log).is_empty()); // context changed, no handlers ran
    }

    #[test]
    fn test_stop_runs_all_cleanups() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let mut fsm = Fsm::<(), Ev>::new(());
        fsm.add_state("off").add_state("on");
        {
            let log = log.clone();
            fsm.on_enter("on", move |_| {
                log_entry(&log, "light!");
                let log = log.clone();
                Some(Box::new(move || log_entry(&log, "darkness!")) as CleanupFn)
            });
        }
        fsm.add_transitions("on", [("TOGGLE", Target::state("off"))]);
        fsm.add_transitions("off", [("TOGGLE", Target::state("on"))]);
        fsm.start();

        assert_eq!(fsm.current_state(), "off");
        assert!(drain(&log).is_empty());

        fsm.send(Ev("TOGGLE")).unwrap();
        assert_eq!(drain(&log), vec!["light!"]);
        fsm.send(Ev("TOGGLE")).unwrap();
        assert_eq!(drain(&log), vec!["darkness!"]);
        fsm.send(Ev("TOGGLE")).unwrap();
        assert_eq!(drain(&log), vec!["light!"]);

        fsm.stop();
        assert_eq!(drain(&log), vec!["darkness!"]);
    }

    // ── Hierarchy ────────────────────────────────────────────────

    fn group_fsm(log: &Log) -> Fsm<(), Ev> {
        let mut fsm = Fsm::<(), Ev>::new(());
        fsm.add_state("initial")
            .add_state("group.red")
            .add_state("group.yellow")
            .add_state("group.green")
            .add_state("error");

        fsm.add_transitions("*", [("ERROR", Target::state("error"))]);
        fsm.add_transitions("initial", [("START", Target::state("group.red"))]);
        fsm.add_transitions("group.red", [("NEXT", Target::state("group.yellow"))]);
        fsm.add_transitions("group.yellow", [("NEXT", Target::state("group.green"))]);
        fsm.add_transitions("group.green", [("NEXT", Target::state("group.red"))]);

        for (pattern, enter, exit) in [
            ("*", "entered machine", "exited machine"),
            ("group.*", "entered group", "exited group"),
            ("group.red", "entered red", "exited red"),
        ] {
            let log = log.clone();
            fsm.on_enter(pattern, move |_| {
                log_entry(&log, enter);
                let log = log.clone();
                Some(Box::new(move || log_entry(&log, exit)) as CleanupFn)
            });
        }
        fsm
    }

    #[test]
    fn test_group_scoped_enter_exit_handlers() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let mut fsm = group_fsm(&log);

        fsm.start();
        assert_eq!(fsm.current_state(), "initial");
        assert_eq!(drain(&log), vec!["entered machine"]);

        fsm.send(Ev("START")).unwrap();
        assert_eq!(fsm.current_state(), "group.red");
        assert_eq!(drain(&log), vec!["entered group", "entered red"]);

        fsm.send(Ev("NEXT")).unwrap();
        assert_eq!(fsm.current_state(), "group.yellow");
        assert_eq!(drain(&log), vec!["exited red"]);

        fsm.send(Ev("NEXT")).unwrap();
        assert!(drain(&log).is_empty()); // yellow → green stays inside the group

        fsm.send(Ev("NEXT")).unwrap();
        assert_eq!(drain(&log), vec!["entered red"]);

        fsm.send(Ev("ERROR")).unwrap();
        assert_eq!(drain(&log), vec!["exited red", "exited group"]);

        fsm.stop();
        assert_eq!(drain(&log), vec!["exited machine"]);
    }

    #[test]
    fn test_wildcard_transitions() {
        let mut fsm = Fsm::<(), Ev>::new(());
        fsm.add_state("foo.one").add_state("foo.two").add_state("bar.three");
        fsm.add_transitions("*", [("FROM_ANYWHERE", Target::state("foo.two"))]);
        fsm.add_transitions("foo.*", [("FROM_FOO_ONLY", Target::state("bar.three"))]);
        fsm.start();

        assert_eq!(fsm.current_state(), "foo.one");
        fsm.send(Ev("FROM_ANYWHERE")).unwrap();
        assert_eq!(fsm.current_state(), "foo.two");
        fsm.send(Ev("FROM_ANYWHERE")).unwrap();
        assert_eq!(fsm.current_state(), "foo.two");
        fsm.send(Ev("FROM_FOO_ONLY")).unwrap();
        assert_eq!(fsm.current_state(), "bar.three");
        assert_eq!(
            fsm.send(Ev("FROM_FOO_ONLY")),
            Err(FsmError::EventNotAllowed {
                event: "FROM_FOO_ONLY",
                state: "bar.three".to_string()
            })
        );
        fsm.send(Ev("FROM_ANYWHERE")).unwrap();
        assert_eq!(fsm.current_state(), "foo.two");
    }

    // ── Timed transitions ────────────────────────────────────────

    fn timed_fsm() -> Fsm<(), Ev> {
        let mut fsm = Fsm::<(), Ev>::new(());
        fsm.add_state("start.one").add_state("start.two").add_state("end").add_state("timed-out");
        fsm.add_transitions("start.one", [("GO", Target::state("start.two"))]);
        fsm.add_transitions("start.two", [("GO", Target::state("start.one"))]);
        fsm.add_transitions("start.*", [("END", Target::state("end"))]);
        fsm.add_timed_transition(
            "start.*",
            Duration::from_millis(10_000),
            Target::state("timed-out"),
        );
        fsm
    }

    async fn settle() {
        // Let spawned timer/future tasks run and report
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_transition_fires() {
        let mut fsm = timed_fsm();
        fsm.start();

        // Moving between siblings does not reset the group-scoped timer
        assert_eq!(fsm.current_state(), "start.one");
        fsm.send(Ev("GO")).unwrap();
        fsm.send(Ev("GO")).unwrap();
        fsm.send(Ev("GO")).unwrap();
        assert_eq!(fsm.current_state(), "start.two");

        tokio::time::advance(Duration::from_millis(10_000)).await;
        settle().await;
        assert_eq!(fsm.pump(), 1);
        assert_eq!(fsm.current_state(), "timed-out");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_transition_cancelled_by_leaving_scope() {
        let mut fsm = timed_fsm();
        fsm.start();

        tokio::time::advance(Duration::from_millis(5_000)).await;
        settle().await;
        assert_eq!(fsm.pump(), 0); // not far enough yet
        assert_eq!(fsm.current_state(), "start.one");

        fsm.send(Ev("END")).unwrap();
        assert_eq!(fsm.current_state(), "end");

        tokio::time::advance(Duration::from_millis(60_000)).await;
        settle().await;
        assert_eq!(fsm.pump(), 0);
        assert_eq!(fsm.current_state(), "end"); // timer was cancelled on exit
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_delay_from_context() {
        #[derive(Clone)]
        struct Ctx {
            backoff_ms: u64,
        }

        let mut fsm = Fsm::<Ctx, Ev>::new(Ctx { backoff_ms: 1_000 });
        fsm.add_state("waiting").add_state("done");
        fsm.add_timed_transition(
            "waiting",
            TimedDelay::FromContext(Box::new(|ctx: &Ctx| Duration::from_millis(ctx.backoff_ms))),
            Target::state("done"),
        );
        fsm.start();

        tokio::time::advance(Duration::from_millis(999)).await;
        settle().await;
        assert_eq!(fsm.pump(), 0);

        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(fsm.pump(), 1);
        assert_eq!(fsm.current_state(), "done");
    }

    // ── Async transitions ────────────────────────────────────────

    fn async_fsm(fail: bool) -> Fsm<(), Ev> {
        let mut fsm = Fsm::<(), Ev>::new(());
        fsm.add_state("waiting.one").add_state("waiting.two").add_state("good").add_state("bad");
        fsm.add_transitions(
            "waiting.*",
            [("OK", Target::state("good")), ("FAIL", Target::state("bad"))],
        );
        fsm.add_transitions("waiting.one", [("JUMP", Target::state("waiting.two"))]);
        fsm.add_transitions("waiting.two", [("JUMP", Target::state("waiting.one"))]);
        fsm.on_enter_async(
            "waiting.*",
            move |_| {
                async move {
                    tokio::time::sleep(Duration::from_millis(2_000)).await;
                    if fail {
                        Err("failed".to_string())
                    } else {
                        Ok(json!(42))
                    }
                }
                .boxed()
            },
            Target::state("good"),
            Target::state("bad"),
        );
        fsm
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_transition_on_success() {
        let mut fsm = async_fsm(false);
        fsm.start();

        assert_eq!(fsm.current_state(), "waiting.one");
        tokio::time::advance(Duration::from_millis(1_000)).await;
        settle().await;
        assert_eq!(fsm.pump(), 0);
        assert_eq!(fsm.current_state(), "waiting.one");

        tokio::time::advance(Duration::from_millis(1_000)).await;
        settle().await;
        assert_eq!(fsm.pump(), 1);
        assert_eq!(fsm.current_state(), "good");
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_transition_on_failure() {
        let mut fsm = async_fsm(true);
        fsm.start();

        tokio::time::advance(Duration::from_millis(2_000)).await;
        settle().await;
        fsm.pump();
        assert_eq!(fsm.current_state(), "bad");
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_transition_cancelled_by_manual_exit() {
        let mut fsm = async_fsm(false);
        fsm.start();

        tokio::time::advance(Duration::from_millis(1_000)).await;
        settle().await;
        fsm.pump();
        fsm.send(Ev("FAIL")).unwrap(); // leave the scope before the future settles
        assert_eq!(fsm.current_state(), "bad");

        tokio::time::advance(Duration::from_millis(10_000)).await;
        settle().await;
        assert_eq!(fsm.pump(), 0);
        assert_eq!(fsm.current_state(), "bad"); // late resolution was a no-op
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_transition_survives_moves_within_group() {
        let mut fsm = async_fsm(true);
        fsm.start();

        fsm.send(Ev("JUMP")).unwrap();
        fsm.send(Ev("JUMP")).unwrap();
        tokio::time::advance(Duration::from_millis(1_000)).await;
        settle().await;
        assert_eq!(fsm.pump(), 0);
        fsm.send(Ev("JUMP")).unwrap();
        assert_eq!(fsm.current_state(), "waiting.two");

        tokio::time::advance(Duration::from_millis(1_000)).await;
        settle().await;
        assert_eq!(fsm.pump(), 1);
        assert_eq!(fsm.current_state(), "bad");
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_result_reaches_context_patch() {
        #[derive(Clone, Debug, PartialEq)]
        struct Ctx {
            token: Option<String>,
        }

        let mut fsm = Fsm::<Ctx, Ev>::new(Ctx { token: None });
        fsm.add_state("authorizing").add_state("ready").add_state("failed");
        fsm.on_enter_async(
            "authorizing",
            |_| async move { Ok(json!({"token": "tok-1"})) }.boxed(),
            Target::with_assign("ready", |_: &Ctx, event: &BuiltinEvent| {
                let token = match event {
                    BuiltinEvent::AsyncOk(value) => {
                        value.get("token").and_then(|t| t.as_str()).map(String::from)
                    }
                    _ => None,
                };
                Ctx { token }
            }),
            Target::state("failed"),
        );
        fsm.start();

        settle().await;
        assert_eq!(fsm.pump(), 1);
        assert_eq!(fsm.current_state(), "ready");
        assert_eq!(fsm.context().token.as_deref(), Some("tok-1"));
    }
}
