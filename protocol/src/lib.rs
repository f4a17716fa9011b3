//! The wire protocol spoken between games and the gateway.
//!
//! Two tagged unions keyed on a JSON string `command` field: [`GameMessage`]
//! flows game -> gateway, [`GatewayMessage`] flows gateway -> game. Each
//! message carries a typed `data` payload where the command needs one.
//! Decoding is strict: an unknown `command`, or a `data` shape that doesn't
//! match, is a protocol error for the caller to turn into a close code 1002 -
//! this crate only describes the shape, it doesn't know about websockets.
//!
//! The two protocol versions ([`ProtocolVersion`]) share almost all of this
//! enum. `startup` only exists on v1 (v2 binds a game name at connection
//! time instead); `mute`/`unmute`/`shutdown/ready` only exist on v2.

use serde::{Deserialize, Serialize};

/// Which dialect of the protocol a connection speaks.
///
/// v1 connections announce their game with a `startup` message and receive
/// `actions/reregister_all` on every connect (including reconnects). v2
/// connections bind their game name at URL parse time (`/v2/<name>` or
/// `?game=<name>`) and gain `mute`/`unmute`/`shutdown/ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    V1,
    V2,
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolVersion::V1 => write!(f, "v1"),
            ProtocolVersion::V2 => write!(f, "v2"),
        }
    }
}

/// A named, schema-described operation a game exposes for the model to invoke.
///
/// Identity is `name` within a game. `schema` is stored verbatim except that
/// object schemas get `additionalProperties: false` injected before storage
/// (done by the game state, not here - this type is just the wire shape).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "schema", default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
}

/// Game -> Gateway messages, discriminated by `command`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command")]
pub enum GameMessage {
    /// v1 only: announces which game this connection is for.
    #[serde(rename = "startup")]
    Startup { game: String },

    #[serde(rename = "context")]
    Context { game: String, data: ContextData },

    #[serde(rename = "actions/register")]
    RegisterActions {
        game: String,
        data: RegisterActionsData,
    },

    #[serde(rename = "actions/unregister")]
    UnregisterActions {
        game: String,
        data: UnregisterActionsData,
    },

    #[serde(rename = "actions/force")]
    ForceAction { game: String, data: ForceActionData },

    #[serde(rename = "action/result")]
    ActionResult {
        game: String,
        data: ActionResultData,
    },

    /// v2 only.
    #[serde(rename = "mute")]
    Mute,

    /// v2 only.
    #[serde(rename = "unmute")]
    Unmute,

    /// v2 only.
    #[serde(rename = "shutdown/ready")]
    ShutdownReady,
}

impl GameMessage {
    /// The game name this message pertains to, if the command carries one.
    ///
    /// v2-administrative commands (`mute`, `unmute`, `shutdown/ready`) carry
    /// no `game` field on the wire - the connection already knows its game.
    pub fn game(&self) -> Option<&str> {
        match self {
            GameMessage::Startup { game }
            | GameMessage::Context { game, .. }
            | GameMessage::RegisterActions { game, .. }
            | GameMessage::UnregisterActions { game, .. }
            | GameMessage::ForceAction { game, .. }
            | GameMessage::ActionResult { game, .. } => Some(game),
            GameMessage::Mute | GameMessage::Unmute | GameMessage::ShutdownReady => None,
        }
    }

    /// The `command` string as it appears on the wire, for logging.
    pub fn command(&self) -> &'static str {
        match self {
            GameMessage::Startup { .. } => "startup",
            GameMessage::Context { .. } => "context",
            GameMessage::RegisterActions { .. } => "actions/register",
            GameMessage::UnregisterActions { .. } => "actions/unregister",
            GameMessage::ForceAction { .. } => "actions/force",
            GameMessage::ActionResult { .. } => "action/result",
            GameMessage::Mute => "mute",
            GameMessage::Unmute => "unmute",
            GameMessage::ShutdownReady => "shutdown/ready",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextData {
    pub message: String,
    pub silent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterActionsData {
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnregisterActionsData {
    pub action_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForceActionData {
    #[serde(default)]
    pub state: Option<String>,
    pub query: String,
    #[serde(default)]
    pub ephemeral_context: Option<bool>,
    pub action_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionResultData {
    pub id: String,
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// Gateway -> Game messages, discriminated by `command`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command")]
pub enum GatewayMessage {
    #[serde(rename = "action")]
    Action { data: ActionData },

    /// v1 only, sent on every `connect` including reconnects.
    #[serde(rename = "actions/reregister_all")]
    ReregisterAll,

    /// v2 only.
    #[serde(rename = "shutdown/graceful")]
    GracefulShutdown { data: GracefulShutdownData },

    /// v2 only.
    #[serde(rename = "shutdown/immediate")]
    ImmediateShutdown,
}

/// `id` is a 32-character lowercase hex UUIDv4 with no dashes.
///
/// `data` is a JSON-encoded string (not an inline value) whose content
/// conforms to the action's stored schema, modulo filter warnings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionData {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GracefulShutdownData {
    pub wants_shutdown: bool,
}

/// Generates a fresh action id: a 32-character lowercase hex UUIDv4, no dashes.
pub fn new_action_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Close codes used by the gateway, per the wire spec.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const SERVER_SHUTDOWN: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const REPLACED: u16 = 1012;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_context_v1() {
        let msg = GameMessage::Context {
            game: "tic-tac-toe".into(),
            data: ContextData {
                message: "hello".into(),
                silent: true,
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: GameMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn round_trips_all_game_variants() {
        let samples = vec![
            GameMessage::Startup {
                game: "g".into(),
            },
            GameMessage::RegisterActions {
                game: "g".into(),
                data: RegisterActionsData {
                    actions: vec![Action {
                        name: "wave".into(),
                        description: "".into(),
                        schema: None,
                    }],
                },
            },
            GameMessage::UnregisterActions {
                game: "g".into(),
                data: UnregisterActionsData {
                    action_names: vec!["wave".into()],
                },
            },
            GameMessage::ForceAction {
                game: "g".into(),
                data: ForceActionData {
                    state: None,
                    query: "do it".into(),
                    ephemeral_context: None,
                    action_names: vec!["wave".into()],
                },
            },
            GameMessage::ActionResult {
                game: "g".into(),
                data: ActionResultData {
                    id: new_action_id(),
                    success: true,
                    message: None,
                },
            },
            GameMessage::Mute,
            GameMessage::Unmute,
            GameMessage::ShutdownReady,
        ];
        for msg in samples {
            let json = serde_json::to_string(&msg).unwrap();
            let back: GameMessage = serde_json::from_str(&json).unwrap();
            assert_eq!(msg, back);
        }
    }

    #[test]
    fn round_trips_gateway_variants() {
        let samples = vec![
            GatewayMessage::Action {
                data: ActionData {
                    id: new_action_id(),
                    name: "wave".into(),
                    data: Some("{}".into()),
                },
            },
            GatewayMessage::ReregisterAll,
            GatewayMessage::GracefulShutdown {
                data: GracefulShutdownData {
                    wants_shutdown: true,
                },
            },
            GatewayMessage::ImmediateShutdown,
        ];
        for msg in samples {
            let json = serde_json::to_string(&msg).unwrap();
            let back: GatewayMessage = serde_json::from_str(&json).unwrap();
            assert_eq!(msg, back);
        }
    }

    #[test]
    fn unknown_command_fails_to_decode() {
        let raw = r#"{"command":"actions/frobnicate","game":"g"}"#;
        assert!(serde_json::from_str::<GameMessage>(raw).is_err());
    }

    #[test]
    fn action_id_is_32_lowercase_hex_chars() {
        let id = new_action_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
