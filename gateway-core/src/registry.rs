//! Process-wide game registry (spec.md §4.8).
//!
//! Grounded on two sources at once: the teacher's `AppState { rooms:
//! Mutex<HashMap<...>> }` (`relay-server/src/lobby.rs`) for the "one
//! process-wide map behind a `Mutex`" shape, generalized from fixed
//! server/client roles to N named games each running their own worker
//! task; and `original_source/src/gary/registry.py::Registry`/`Game` for
//! what actually has to happen on connect/disconnect/reconnect - lazy
//! creation on first sight, conflict resolution per
//! `existing_connection_policy`, and unconditional connect/disconnect
//! context lines.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use protocol::{self, GameMessage, ProtocolVersion};

use crate::connection::Connection;
use crate::context::ContextLog;
use crate::decider::Decider;
use crate::error::{GatewayError, Result};
use crate::game::{Game, GameHandle};
use crate::generator::Generator;
use crate::scheduler::SchedulerEvent;

/// Which side loses when a game already has an active connection and a
/// second one shows up (`original_source/registry.py::Game.set_connection`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Close the connection that just arrived, leave the existing one be.
    DropIncoming,
    /// Disconnect the existing connection and adopt the new one.
    DropExisting,
}

/// Parameters applied to every game the registry creates. Mirrors the
/// `[gary]`/`[scheduler]` sections of `original_source/util/config.py`.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub existing_connection_policy: ConflictPolicy,
    pub idle_timeout_try: Duration,
    pub idle_timeout_force: Duration,
    pub allow_yapping: bool,
    pub enforce_schema: bool,
    pub token_limit: usize,
    pub temperature: f32,
    pub max_tokens: usize,
}

/// Builds a fresh generator for a newly created game. Boxed so the
/// registry stays agnostic to which concrete backend - opaque hosted API
/// or a transparent-KV local model - the single LLM inference backend
/// actually is; `gateway-server` supplies the real one at startup.
pub type GeneratorFactory = Arc<dyn Fn() -> Box<dyn Generator> + Send + Sync>;

/// A JSON-serializable snapshot of one game, for `GET /games`.
#[derive(Debug, Clone, Serialize)]
pub struct GameSummary {
    pub name: String,
    pub version: ProtocolVersion,
    pub connected: bool,
    pub action_count: usize,
    pub pending_count: usize,
}

struct GameSlot {
    handle: GameHandle,
    worker: JoinHandle<()>,
}

/// The system prompt every new game starts with, grounded verbatim on
/// `original_source/src/gary/llm/llm.py::LLM.system_prompt`. `rules` is the
/// optional per-game custom-rules text (§9's "custom rules file" note),
/// appended as a silent, persistent message.
fn build_system_prompt(allow_yapping: bool) -> String {
    let mut prompt = String::from(
        "You are Gary, an expert gamer AI. Your main purpose is playing games. \
         You perform in-game actions via sending JSON to a special software \
         integration system.\nYou are goal-oriented but curious. You aim to \
         keep your actions varied and entertaining.",
    );
    if allow_yapping {
        prompt.push_str(
            "\nYou can choose to 'say' something, whether to communicate with \
             the human running your software or just to think out loud.",
        );
        prompt.push_str(
            "\nRemember that your only means of interacting with the game is \
             'action'. In-game characters cannot hear you.",
        );
    }
    prompt
}

/// Process-wide `name -> Game` map. Each game runs its own worker task
/// (spawned on first connect); the registry only ever touches a
/// [`GameHandle`], never the `Game` itself, so the single-worker invariant
/// (spec.md §5) holds even though many connections share this registry.
pub struct Registry {
    games: Mutex<HashMap<String, GameSlot>>,
    config: RegistryConfig,
    generator_factory: GeneratorFactory,
}

impl Registry {
    pub fn new(config: RegistryConfig, generator_factory: GeneratorFactory) -> Self {
        Self {
            games: Mutex::new(HashMap::new()),
            config,
            generator_factory,
        }
    }

    /// `Registry.initiate` (registry.py): binds `conn` to the named game,
    /// lazily spawning the game's worker on first sight, resolving any
    /// connection conflict per `existing_connection_policy`, and raising
    /// the unconditional connect context line (`LLM.gaming`).
    pub async fn connect(
        &self,
        name: &str,
        version: ProtocolVersion,
        conn: Arc<dyn Connection>,
        rules: Option<String>,
    ) -> Result<GameHandle> {
        let handle = {
            let mut games = self.games.lock().await;
            match games.get(name) {
                Some(slot) => slot.handle.clone(),
                None => {
                    info!(game = name, %version, "creating game");
                    let context = ContextLog::new((self.generator_factory)(), self.config.token_limit);
                    let decider = Decider::new(
                        self.config.allow_yapping,
                        self.config.enforce_schema,
                        self.config.temperature,
                        self.config.max_tokens,
                    );
                    let mut game = Game::new(
                        name.to_string(),
                        version,
                        context,
                        decider,
                        build_system_prompt(self.config.allow_yapping),
                        self.config.idle_timeout_try,
                        self.config.idle_timeout_force,
                    );
                    let handle = game.handle();
                    let worker = tokio::spawn(async move {
                        game.run().await;
                    });
                    games.insert(name.to_string(), GameSlot { handle: handle.clone(), worker });
                    if let Some(rules) = rules {
                        handle.enqueue(SchedulerEvent::Context {
                            text: rules,
                            silent: true,
                            ephemeral: false,
                            persistent: true,
                            notify: false,
                        });
                    }
                    handle
                }
            }
        };

        if handle.version != version {
            return Err(GatewayError::Protocol(format!(
                "game '{name}' is registered as {}, but this connection speaks {version}",
                handle.version
            )));
        }

        if handle.is_connected().await {
            warn!(game = name, "already has an active connection; applying conflict policy");
            match self.config.existing_connection_policy {
                ConflictPolicy::DropIncoming => {
                    conn.close(protocol::close_code::PROTOCOL_ERROR, "Multiple connections are not allowed")
                        .await;
                    return Err(GatewayError::Policy(format!(
                        "game '{name}' already has an active connection"
                    )));
                }
                ConflictPolicy::DropExisting => {
                    if let Some(previous) = handle.replace_connection(conn).await {
                        previous.close(protocol::close_code::REPLACED, "Changing connections").await;
                    }
                    self.raise_connected(&handle).await;
                    return Ok(handle);
                }
            }
        }

        handle.set_connection(conn).await;
        self.raise_connected(&handle).await;
        Ok(handle)
    }

    async fn raise_connected(&self, handle: &GameHandle) {
        handle.enqueue(SchedulerEvent::Context {
            text: format!("Connected. You are now playing {}", handle.name),
            silent: true,
            ephemeral: false,
            persistent: false,
            notify: true,
        });
    }

    /// `Registry.disconnect` + `LLM.not_gaming`: clears the connection but
    /// leaves the game (and its context/actions) alive for a reconnect.
    pub async fn disconnect(&self, name: &str) {
        let games = self.games.lock().await;
        if let Some(slot) = games.get(name) {
            slot.handle.clear_connection().await;
            slot.handle.enqueue(SchedulerEvent::Context {
                text: "Disconnected.".to_string(),
                silent: true,
                ephemeral: false,
                persistent: false,
                notify: true,
            });
        }
    }

    /// Routes one already-decoded wire message to its game's queue.
    /// `Startup` is not handled here - the transport layer calls
    /// [`Registry::connect`] directly for it, since binding a connection
    /// to a game is a connection-lifecycle event, not a queued one.
    pub fn dispatch(&self, handle: &GameHandle, msg: GameMessage) {
        match msg {
            GameMessage::Startup { .. } => {
                warn!(game = %handle.name, "ignoring startup after initial bind");
            }
            GameMessage::Context { data, .. } => {
                handle.enqueue(SchedulerEvent::Context {
                    text: data.message,
                    silent: data.silent,
                    ephemeral: false,
                    persistent: false,
                    notify: true,
                });
                if !data.silent {
                    handle.enqueue(SchedulerEvent::TryAction { allow_yapping: None });
                }
            }
            GameMessage::RegisterActions { data, .. } => {
                handle.enqueue(SchedulerEvent::RegisterActions(data.actions));
            }
            GameMessage::UnregisterActions { data, .. } => {
                handle.enqueue(SchedulerEvent::UnregisterActions(data.action_names));
            }
            GameMessage::ForceAction { data, .. } => {
                handle.enqueue(SchedulerEvent::Force {
                    force_message: Some(data),
                });
            }
            GameMessage::ActionResult { data, .. } => {
                handle.enqueue(SchedulerEvent::ActionResult(data));
            }
            GameMessage::Mute => handle.enqueue(SchedulerEvent::Mute),
            GameMessage::Unmute => handle.enqueue(SchedulerEvent::Unmute),
            GameMessage::ShutdownReady => {
                debug!(game = %handle.name, "shutdown/ready acknowledged");
            }
        }
    }

    pub async fn get(&self, name: &str) -> Option<GameHandle> {
        self.games.lock().await.get(name).map(|slot| slot.handle.clone())
    }

    /// `GET /games` (spec.md §6, new status endpoint).
    pub async fn list_games(&self) -> Vec<GameSummary> {
        let games = self.games.lock().await;
        let mut out = Vec::with_capacity(games.len());
        for slot in games.values() {
            out.push(GameSummary {
                name: slot.handle.name.clone(),
                version: slot.handle.version,
                connected: slot.handle.is_connected().await,
                action_count: slot.handle.action_count(),
                pending_count: slot.handle.pending_count(),
            });
        }
        out
    }

    /// Stops every game's worker and closes its connection, if any.
    /// `Registry.destroy`.
    pub async fn shutdown(&self) {
        let mut games = self.games.lock().await;
        for (name, slot) in games.drain() {
            debug!(game = %name, "stopping game worker");
            slot.handle.stop();
            let _ = slot.worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::connection::test_support::RecordingConnection;
    use crate::generator::MockGenerator;

    use super::*;

    fn test_registry(policy: ConflictPolicy) -> Registry {
        Registry::new(
            RegistryConfig {
                existing_connection_policy: policy,
                idle_timeout_try: Duration::from_secs(0),
                idle_timeout_force: Duration::from_secs(0),
                allow_yapping: true,
                enforce_schema: true,
                token_limit: 2000,
                temperature: 0.7,
                max_tokens: 64,
            },
            Arc::new(|| Box::new(MockGenerator::new())),
        )
    }

    #[tokio::test]
    async fn connect_creates_game_lazily() {
        let registry = test_registry(ConflictPolicy::DropIncoming);
        let conn = Arc::new(RecordingConnection::new());
        let handle = registry
            .connect("tic-tac-toe", ProtocolVersion::V1, conn, None)
            .await
            .unwrap();
        assert_eq!(handle.name, "tic-tac-toe");
        assert!(handle.is_connected().await);
        assert_eq!(registry.list_games().await.len(), 1);
    }

    #[tokio::test]
    async fn drop_incoming_rejects_second_connection() {
        let registry = test_registry(ConflictPolicy::DropIncoming);
        let first = Arc::new(RecordingConnection::new());
        registry
            .connect("ttt", ProtocolVersion::V1, first.clone(), None)
            .await
            .unwrap();

        let second = Arc::new(RecordingConnection::new());
        let result = registry.connect("ttt", ProtocolVersion::V1, second.clone(), None).await;
        assert!(result.is_err());
        assert!(second.closed.lock().unwrap().is_some());
        assert!(first.closed.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn drop_existing_replaces_connection() {
        let registry = test_registry(ConflictPolicy::DropExisting);
        let first = Arc::new(RecordingConnection::new());
        let handle = registry
            .connect("ttt", ProtocolVersion::V1, first.clone(), None)
            .await
            .unwrap();

        let second = Arc::new(RecordingConnection::new());
        registry.connect("ttt", ProtocolVersion::V1, second.clone(), None).await.unwrap();

        assert!(first.closed.lock().unwrap().is_some());
        assert!(second.closed.lock().unwrap().is_none());
        assert!(handle.is_connected().await);
    }

    #[tokio::test]
    async fn disconnect_clears_connection() {
        let registry = test_registry(ConflictPolicy::DropIncoming);
        let conn = Arc::new(RecordingConnection::new());
        let handle = registry
            .connect("ttt", ProtocolVersion::V1, conn, None)
            .await
            .unwrap();
        registry.disconnect("ttt").await;
        assert!(!handle.is_connected().await);
    }

    #[tokio::test]
    async fn version_mismatch_is_rejected() {
        let registry = test_registry(ConflictPolicy::DropIncoming);
        let conn = Arc::new(RecordingConnection::new());
        registry
            .connect("ttt", ProtocolVersion::V1, conn, None)
            .await
            .unwrap();

        let other = Arc::new(RecordingConnection::new());
        let result = registry.connect("ttt", ProtocolVersion::V2, other, None).await;
        assert!(result.is_err());
    }
}
