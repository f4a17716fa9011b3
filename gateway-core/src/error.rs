//! Error taxonomy for the gateway core.
//!
//! Follows spec.md §7: protocol and policy errors are fatal to the
//! connection (the caller closes with the given code); generator and engine
//! errors degrade or reset but keep the game alive; logic errors are logged
//! and the event still proceeds.

use thiserror::Error;

/// Errors the gateway core can produce.
///
/// [`GatewayError::close_code`] tells a transport layer (e.g. the axum
/// websocket handler) what to do with the connection, if anything.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed JSON, unknown `command`, or a type mismatch in `data`.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A connection conflict was rejected per `existing_connection_policy`.
    #[error("policy error: {0}")]
    Policy(String),

    /// The generator adapter failed to produce output (unsupported grammar,
    /// engine call failure, etc).
    #[error("generator error: {0}")]
    Generator(String),

    /// Transport-level failure (send/receive on a closed or broken socket).
    #[error("transport error: {0}")]
    Transport(String),
}

impl GatewayError {
    /// The websocket close code a transport layer should use, if the error
    /// is connection-fatal. Generator errors are not fatal - the caller
    /// degrades and continues the current event.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            GatewayError::Protocol(_) => Some(protocol::close_code::PROTOCOL_ERROR),
            GatewayError::Policy(_) => Some(protocol::close_code::PROTOCOL_ERROR),
            GatewayError::Generator(_) => None,
            GatewayError::Transport(_) => Some(protocol::close_code::INTERNAL_ERROR),
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
