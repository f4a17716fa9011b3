//! Per-game state (spec.md §4.7): the action table, the pending-instance
//! map, and the operations that mutate them. Grounded throughout on
//! `original_source/src/gary/registry.py`'s `Game` class.
//!
//! `Game` splits into two disjoint pieces so [`Game::run`] can hand the
//! scheduler a dispatch closure without fighting the borrow checker: the
//! [`Scheduler`] (queue, timers, mute state) and [`GameState`] (everything
//! dispatch actually touches). `Game::run` takes `&mut self.scheduler` and
//! `&mut self.state` as two disjoint field borrows and wires them together.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::warn;

use protocol::{Action, ActionResultData, ForceActionData, GatewayMessage, ProtocolVersion};

use crate::connection::Connection;
use crate::context::ContextLog;
use crate::decider::Decider;
use crate::generator::{filter_schema, validate_filtered_schema, Role};
use crate::scheduler::{DispatchOutcome, EventQueue, Scheduler, SchedulerEvent, StopHandle};

/// An in-flight action: created when the decider chooses one, destroyed
/// when the matching `action/result` arrives (or silently abandoned on
/// disconnect, per spec.md §3).
#[derive(Debug, Clone)]
pub struct ActionInstance {
    pub id: String,
    pub name: String,
    pub data: Option<String>,
    pub force_origin: Option<ForceActionData>,
}

/// Seconds of simulated TTS pacing per character of a `say` message
/// (spec.md §4.6 "Say-induced sleep").
const SAY_SLEEP_SECONDS_PER_CHAR: f64 = 0.1;

/// Shared between `Game` and `GameState`: the registry (§4.8) swaps this
/// on reconnect/conflict resolution from outside the worker, while the
/// worker only ever reads it to send outbound messages. An `RwLock`
/// around just the connection identity is the one exception to "game-local
/// state needs no lock" (spec.md §5) - everything else here is
/// worker-exclusive.
pub type ConnectionSlot = Arc<RwLock<Option<Arc<dyn Connection>>>>;

/// Everything a game's single worker mutates. No field but `connection`
/// is behind a lock.
pub struct GameState {
    pub name: String,
    pub version: ProtocolVersion,
    actions: HashMap<String, Action>,
    pending: HashMap<String, ActionInstance>,
    /// v1 only: stores the force message that produced a given action id,
    /// so a failed result can re-trigger it (§4.7 `process_result`).
    pending_forces: HashMap<String, ForceActionData>,
    context: ContextLog,
    decider: Decider,
    connection: ConnectionSlot,
    queue: Arc<EventQueue>,
    system_prompt: String,
    /// Mirrors `pending.len()`/`actions.len()` so [`GameHandle`] can report
    /// them to the registry (`GET /games`) without reaching into state
    /// that's owned by the running worker task.
    pending_count: Arc<AtomicUsize>,
    action_count: Arc<AtomicUsize>,
    /// Action names already warned about unsupported schema keywords
    /// (spec.md §7 "warn once per action name").
    warned_schema_actions: HashSet<String>,
}

impl GameState {
    fn send_outbound(&self, msg: GatewayMessage) {
        let connection = Arc::clone(&self.connection);
        tokio::spawn(async move {
            let guard = connection.read().await;
            if let Some(conn) = guard.as_ref() {
                if let Err(err) = conn.send(&msg).await {
                    warn!(?err, "failed to send outbound message");
                }
            }
        });
    }

    /// Re-establishes the system prompt if a full reset (triggered deep
    /// inside a decider call via `ContextLog::ensure_room`) dropped it.
    /// Mirrors the original's `LLM.reset()` calling `self.system_prompt()`
    /// right after clearing the engine.
    fn ensure_system_prompt(&mut self) {
        let has_system = self
            .context
            .messages()
            .first()
            .map(|m| m.role == Role::System)
            .unwrap_or(false);
        if !has_system {
            self.context.append(Role::System, &self.system_prompt, true);
        }
    }

    /// Enqueues a `Context` event and, if not silent, a follow-up
    /// `TryAction` - both at enqueue time, matching
    /// `registry.py::Game.send_context`. Neither mutates state directly;
    /// the actual append happens when the `Context` event is dispatched.
    pub fn send_context(&self, text: impl Into<String>, silent: bool, ephemeral: bool, persistent: bool) {
        let text = text.into();
        self.queue.push(SchedulerEvent::Context {
            text,
            silent,
            ephemeral,
            persistent,
            notify: true,
        });
        if !silent {
            self.queue
                .push(SchedulerEvent::TryAction { allow_yapping: None });
        }
    }

    /// `register_actions(list)` (spec.md §4.7): v1 keeps the existing
    /// entry on a name clash, v2 overwrites. Object schemas get
    /// `additionalProperties: false` injected.
    fn register_actions(&mut self, actions: Vec<Action>) {
        for mut action in actions {
            if self.actions.contains_key(&action.name) {
                let drop_incoming = self.version == ProtocolVersion::V1;
                warn!(
                    action = %action.name,
                    version = %self.version,
                    drop_incoming,
                    "action name conflict"
                );
                if drop_incoming {
                    continue;
                }
            }
            if let Some(schema) = &mut action.schema {
                let (mut filtered, unsupported) = filter_schema(schema);
                if !unsupported.is_empty() && self.warned_schema_actions.insert(action.name.clone()) {
                    warn!(
                        action = %action.name,
                        keywords = %unsupported.join(", "),
                        "action schema uses unsupported keywords, filtering"
                    );
                }
                if filtered.get("type").and_then(|t| t.as_str()) == Some("object") {
                    filtered
                        .as_object_mut()
                        .expect("object-typed schema is a JSON object")
                        .insert("additionalProperties".to_string(), serde_json::Value::Bool(false));
                }
                validate_filtered_schema(&action.name, &filtered);
                *schema = filtered;
            }
            self.actions.insert(action.name.clone(), action);
        }
        self.action_count.store(self.actions.len(), AtomicOrdering::Relaxed);
    }

    /// `unregister_actions(names)`: unknown names are dropped silently.
    fn unregister_actions(&mut self, names: Vec<String>) {
        for name in names {
            self.actions.remove(&name);
        }
        self.action_count.store(self.actions.len(), AtomicOrdering::Relaxed);
    }

    /// `execute_action(name, data, origin_force?)`: the context line must
    /// land before the outbound send (spec.md §3 invariant), so this
    /// appends directly rather than going through the queue.
    fn execute_action(&mut self, name: String, data: Option<String>, force_origin: Option<ForceActionData>) -> DispatchOutcome {
        if !self.actions.contains_key(&name) {
            warn!(action = %name, "executing unregistered action");
        }
        let id = protocol::new_action_id();
        let data_repr = data.as_deref().unwrap_or("null");
        let ctx = format!("Executing action '{name}' with {{id: \"{}\", data: {data_repr}}}", &id[..6]);

        self.pending.insert(
            id.clone(),
            ActionInstance {
                id: id.clone(),
                name: name.clone(),
                data: data.clone(),
                force_origin: force_origin.clone(),
            },
        );
        if self.version == ProtocolVersion::V1 {
            if let Some(force) = force_origin {
                self.pending_forces.insert(id.clone(), force);
            }
        }

        self.pending_count.store(self.pending.len(), AtomicOrdering::Relaxed);
        self.ensure_system_prompt();
        self.context.append(Role::User, &ctx, false);

        self.send_outbound(GatewayMessage::Action {
            data: protocol::ActionData {
                id,
                name,
                data,
            },
        });
        DispatchOutcome::ActionSent
    }

    /// `process_result(result)`: unknown ids are logged but still
    /// processed (resolves spec.md §9's first open question). On v1, a
    /// failed result with a stored force replays it at priority 0 - ahead
    /// of the priority-1 failure context line pushed right after, the
    /// documented ordering quirk spec.md §4.7 calls out.
    fn process_result(&mut self, result: ActionResultData) -> DispatchOutcome {
        let existed = self.pending.remove(&result.id).is_some();
        self.pending_count.store(self.pending.len(), AtomicOrdering::Relaxed);
        if !existed {
            warn!(id = %result.id, "received result for unknown action id");
        }

        let short_id = &result.id[..result.id.len().min(6)];
        let status = if result.success { "Performing" } else { "Failure" };
        let message = result.message.as_deref().unwrap_or("no message");
        let ctx = format!("Result for action {short_id}: {status} ({message})");

        if self.version == ProtocolVersion::V1 && !result.success {
            if let Some(force) = self.pending_forces.remove(&result.id) {
                self.queue.push(SchedulerEvent::Force {
                    force_message: Some(force),
                });
            }
        }

        self.send_context(ctx, result.success, false, false);
        DispatchOutcome::None
    }

    async fn dispatch_force(&mut self, force_message: Option<ForceActionData>) -> DispatchOutcome {
        self.ensure_system_prompt();
        let choice = match &force_message {
            Some(msg) => {
                let any_registered = msg.action_names.iter().any(|n| self.actions.contains_key(n));
                if !any_registered {
                    warn!("force_action had no valid actions after filtering");
                    return DispatchOutcome::None;
                }
                self.decider
                    .force_action(
                        &mut self.context,
                        msg.state.as_deref(),
                        &msg.query,
                        msg.ephemeral_context.unwrap_or(false),
                        &msg.action_names,
                        &self.actions,
                    )
                    .await
            }
            None => {
                if self.actions.is_empty() {
                    warn!("nothing to force: no actions registered");
                    return DispatchOutcome::None;
                }
                let names: Vec<String> = self.actions.keys().cloned().collect();
                self.decider
                    .force_action(
                        &mut self.context,
                        None,
                        "Decide on an action.",
                        false,
                        &names,
                        &self.actions,
                    )
                    .await
            }
        };

        match choice {
            Some(choice) => self.execute_action(choice.name, choice.data, force_message),
            None => DispatchOutcome::None,
        }
    }

    async fn dispatch_try_action(&mut self, allow_yapping: Option<bool>) -> DispatchOutcome {
        self.ensure_system_prompt();
        let actions: Vec<&Action> = self.actions.values().collect();
        let allow_say = allow_yapping.unwrap_or(true);
        let choice = self.decider.try_action(&mut self.context, &actions, allow_say).await;
        match choice {
            Some(choice) => self.execute_action(choice.name, choice.data, None),
            None => DispatchOutcome::None,
        }
    }

    async fn dispatch_say(&mut self, message: Option<String>) -> DispatchOutcome {
        self.ensure_system_prompt();
        let text = self.decider.say(&mut self.context, message).await;
        if !text.is_empty() {
            let seconds = text.chars().count() as f64 * SAY_SLEEP_SECONDS_PER_CHAR;
            self.queue.push(SchedulerEvent::Sleep {
                duration: Duration::from_secs_f64(seconds),
            });
        }
        DispatchOutcome::None
    }

    fn dispatch_context(&mut self, text: String, ephemeral: bool, persistent: bool) -> DispatchOutcome {
        self.ensure_system_prompt();
        if ephemeral {
            let checkpoint = self.context.checkpoint();
            self.context.append(Role::User, &text, persistent);
            self.context.restore(checkpoint);
        } else {
            self.context.append(Role::User, &text, persistent);
        }
        DispatchOutcome::ContextAppended
    }

    /// The dispatcher handed to `Scheduler::run`. Mutates only fields of
    /// `GameState`, never `Scheduler`.
    pub async fn dispatch(&mut self, event: SchedulerEvent) -> DispatchOutcome {
        match event {
            SchedulerEvent::Force { force_message } => self.dispatch_force(force_message).await,
            SchedulerEvent::RegisterActions(actions) => {
                self.register_actions(actions);
                DispatchOutcome::None
            }
            SchedulerEvent::UnregisterActions(names) => {
                self.unregister_actions(names);
                DispatchOutcome::None
            }
            SchedulerEvent::ActionResult(result) => self.process_result(result),
            SchedulerEvent::Context {
                text,
                ephemeral,
                persistent,
                ..
            } => self.dispatch_context(text, ephemeral, persistent),
            SchedulerEvent::TryAction { allow_yapping } => self.dispatch_try_action(allow_yapping).await,
            SchedulerEvent::Say { message } => self.dispatch_say(message).await,
            SchedulerEvent::Sleep { duration } => DispatchOutcome::Sleep(duration),
            SchedulerEvent::ClearContext => {
                self.context.full_reset();
                self.ensure_system_prompt();
                DispatchOutcome::None
            }
            // Mute/Unmute are handled by the scheduler itself before
            // dispatch runs (see Scheduler::apply_mute_transition); no
            // game-state work to do here.
            SchedulerEvent::Mute | SchedulerEvent::Unmute => DispatchOutcome::None,
        }
    }
}

/// A cheaply cloneable, lock-respecting handle to a running [`Game`].
///
/// The worker task owns the `Game` itself (moved into `Game::run`); the
/// registry only ever needs to enqueue events, swap the connection, or read
/// a couple of counters for `GET /games` - all of which are safe to do from
/// outside the worker because they go through the same `Arc`-shared queue
/// and connection slot the worker reads from.
#[derive(Clone)]
pub struct GameHandle {
    pub name: String,
    pub version: ProtocolVersion,
    queue: Arc<EventQueue>,
    connection: ConnectionSlot,
    pending_count: Arc<AtomicUsize>,
    action_count: Arc<AtomicUsize>,
    stop: StopHandle,
}

impl GameHandle {
    pub fn enqueue(&self, event: SchedulerEvent) {
        self.queue.push(event);
    }

    /// Asks this game's worker task to stop after its current dispatch.
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn pending_count(&self) -> usize {
        self.pending_count.load(AtomicOrdering::Relaxed)
    }

    pub fn action_count(&self) -> usize {
        self.action_count.load(AtomicOrdering::Relaxed)
    }

    /// Swaps in a new connection (registry-driven, outside the worker).
    pub async fn set_connection(&self, connection: Arc<dyn Connection>) {
        self.replace_connection(connection).await;
    }

    /// Swaps in a new connection, returning whatever was there before -
    /// so the caller can close it (e.g. `drop_existing` conflict policy).
    pub async fn replace_connection(&self, connection: Arc<dyn Connection>) -> Option<Arc<dyn Connection>> {
        self.connection.write().await.replace(connection)
    }

    /// Clears the connection on disconnect, leaving the game in place for
    /// a future reconnect (spec.md §4.8).
    pub async fn clear_connection(&self) {
        *self.connection.write().await = None;
    }

    pub async fn is_connected(&self) -> bool {
        self.connection
            .read()
            .await
            .as_ref()
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }
}

/// A single game: its scheduler and its state, kept as disjoint fields so
/// `run` can lend both out at once without a lock (spec.md §5).
pub struct Game {
    pub scheduler: Scheduler,
    pub state: GameState,
    handle: GameHandle,
}

impl Game {
    pub fn new(
        name: impl Into<String>,
        version: ProtocolVersion,
        context: ContextLog,
        decider: Decider,
        system_prompt: impl Into<String>,
        idle_try: Duration,
        idle_force: Duration,
    ) -> Self {
        let scheduler = Scheduler::new(idle_try, idle_force);
        let queue = scheduler.queue();
        let connection: ConnectionSlot = Arc::new(RwLock::new(None));
        let pending_count = Arc::new(AtomicUsize::new(0));
        let action_count = Arc::new(AtomicUsize::new(0));
        let name = name.into();
        let mut state = GameState {
            name: name.clone(),
            version,
            actions: HashMap::new(),
            pending: HashMap::new(),
            pending_forces: HashMap::new(),
            context,
            decider,
            connection: Arc::clone(&connection),
            queue: Arc::clone(&queue),
            system_prompt: system_prompt.into(),
            pending_count: Arc::clone(&pending_count),
            action_count: Arc::clone(&action_count),
            warned_schema_actions: HashSet::new(),
        };
        state.ensure_system_prompt();
        let stop = scheduler.stop_handle();
        let handle = GameHandle {
            name,
            version,
            queue,
            connection,
            pending_count,
            action_count,
            stop,
        };
        Self {
            scheduler,
            state,
            handle,
        }
    }

    pub fn handle(&self) -> GameHandle {
        self.handle.clone()
    }

    pub fn enqueue(&self, event: SchedulerEvent) {
        self.scheduler.enqueue(event);
    }

    pub fn pending_count(&self) -> usize {
        self.state.pending.len()
    }

    /// Swaps in a new connection (registry-driven, outside the worker).
    pub async fn set_connection(&self, connection: Arc<dyn Connection>) {
        self.handle.set_connection(connection).await;
    }

    /// Clears the connection on disconnect, leaving the game in place for
    /// a future reconnect (spec.md §4.8).
    pub async fn clear_connection(&self) {
        self.handle.clear_connection().await;
    }

    pub async fn is_connected(&self) -> bool {
        self.handle.is_connected().await
    }

    /// Runs this game's worker loop until `scheduler.stop()` is called.
    pub async fn run(&mut self) {
        let Game { scheduler, state, .. } = self;
        scheduler.run(|event| state.dispatch(event)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::RecordingConnection;
    use crate::generator::MockGenerator;

    fn new_game(version: ProtocolVersion) -> Game {
        let context = ContextLog::new(Box::new(MockGenerator::new()), 2000);
        let decider = Decider::new(true, true, 0.7, 64);
        Game::new(
            "tic-tac-toe",
            version,
            context,
            decider,
            "you are a game-playing assistant",
            Duration::from_secs(0),
            Duration::from_secs(0),
        )
    }

    #[test]
    fn system_prompt_present_on_creation() {
        let game = new_game(ProtocolVersion::V1);
        assert_eq!(game.state.context.messages()[0].role, Role::System);
    }

    #[tokio::test]
    async fn register_actions_v1_keeps_existing_on_conflict() {
        let mut game = new_game(ProtocolVersion::V1);
        game.state.register_actions(vec![Action {
            name: "wave".into(),
            description: "first".into(),
            schema: None,
        }]);
        game.state.register_actions(vec![Action {
            name: "wave".into(),
            description: "second".into(),
            schema: None,
        }]);
        assert_eq!(game.state.actions.get("wave").unwrap().description, "first");
    }

    #[tokio::test]
    async fn register_actions_v2_overwrites_on_conflict() {
        let mut game = new_game(ProtocolVersion::V2);
        game.state.register_actions(vec![Action {
            name: "wave".into(),
            description: "first".into(),
            schema: None,
        }]);
        game.state.register_actions(vec![Action {
            name: "wave".into(),
            description: "second".into(),
            schema: None,
        }]);
        assert_eq!(game.state.actions.get("wave").unwrap().description, "second");
    }

    #[tokio::test]
    async fn register_actions_injects_additional_properties_false() {
        let mut game = new_game(ProtocolVersion::V1);
        game.state.register_actions(vec![Action {
            name: "wave".into(),
            description: "".into(),
            schema: Some(serde_json::json!({"type": "object", "properties": {}})),
        }]);
        let schema = game.state.actions.get("wave").unwrap().schema.as_ref().unwrap();
        assert_eq!(schema.get("additionalProperties"), Some(&serde_json::Value::Bool(false)));
    }

    #[tokio::test]
    async fn execute_action_appends_context_before_send() {
        let mut game = new_game(ProtocolVersion::V1);
        let conn = Arc::new(RecordingConnection::new());
        game.set_connection(conn.clone()).await;
        game.state.register_actions(vec![Action {
            name: "wave".into(),
            description: "".into(),
            schema: Some(serde_json::json!({"type": "object"})),
        }]);
        let outcome = game.state.execute_action("wave".to_string(), Some("{}".to_string()), None);
        assert!(matches!(outcome, DispatchOutcome::ActionSent));
        assert_eq!(game.state.pending.len(), 1);
        let last = game.state.context.messages().last().unwrap();
        assert!(last.text.starts_with("Executing action 'wave'"));
    }

    #[tokio::test]
    async fn process_result_on_unknown_id_still_applies_context() {
        let mut game = new_game(ProtocolVersion::V2);
        let outcome = game.state.process_result(ActionResultData {
            id: "deadbeefdeadbeefdeadbeefdeadbeef".into(),
            success: true,
            message: None,
        });
        assert!(matches!(outcome, DispatchOutcome::None));
        // The context append itself is deferred to the enqueued Context
        // event, not applied synchronously by process_result.
        assert!(!game.scheduler.queue().is_empty());
    }

    #[tokio::test]
    async fn process_result_v1_failure_replays_stored_force() {
        let mut game = new_game(ProtocolVersion::V1);
        game.state.register_actions(vec![Action {
            name: "wave".into(),
            description: "".into(),
            schema: Some(serde_json::json!({"type": "object"})),
        }]);
        let force = ForceActionData {
            state: None,
            query: "do it".into(),
            ephemeral_context: None,
            action_names: vec!["wave".into()],
        };
        let DispatchOutcome::ActionSent = game.state.execute_action("wave".to_string(), Some("{}".to_string()), Some(force)) else {
            panic!("expected action sent");
        };
        let id = game.state.pending.keys().next().unwrap().clone();
        assert!(game.state.pending_forces.contains_key(&id));

        game.state.process_result(ActionResultData {
            id,
            success: false,
            message: Some("bad move".into()),
        });
        assert!(!game.scheduler.queue().is_empty());
    }
}
