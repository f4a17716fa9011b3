//! The connection abstraction (spec.md §4.2).
//!
//! Grounded on the shape of `examples/Carbonfreezer-multiplayer/relay-server/src/hand_shake.rs`'s
//! lifecycle functions, generalized from "one relay connection" to "one
//! event-subscribing WebSocket per game". The concrete websocket
//! implementation (axum, text frames, JSON (de)serialization) lives in the
//! `gateway-server` binary crate; this crate only describes the interface
//! the core needs: send a message, ask if still connected, close with a
//! reason. `Game` (§4.7) holds connections behind this trait so the core
//! never depends on an HTTP framework.

use async_trait::async_trait;

use protocol::GatewayMessage;

use crate::error::Result;

#[async_trait]
pub trait Connection: Send + Sync {
    /// Sends a gateway -> game message. Errors are transport failures
    /// (closed/broken socket); the caller treats them per spec.md §7.
    async fn send(&self, msg: &GatewayMessage) -> Result<()>;

    /// Whether this connection is still open from the core's point of view.
    fn is_connected(&self) -> bool;

    /// Closes the connection with a websocket close code and reason.
    async fn close(&self, code: u16, reason: &str);
}

#[cfg(test)]
pub mod test_support {
    use std::sync::Mutex;

    use super::*;

    /// Records every message sent to it instead of touching a real socket.
    /// Shared across `game.rs`/`registry.rs` unit tests.
    pub struct RecordingConnection {
        pub sent: Mutex<Vec<GatewayMessage>>,
        pub closed: Mutex<Option<(u16, String)>>,
        pub connected: Mutex<bool>,
    }

    impl RecordingConnection {
        pub fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                closed: Mutex::new(None),
                connected: Mutex::new(true),
            }
        }
    }

    impl Default for RecordingConnection {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl Connection for RecordingConnection {
        async fn send(&self, msg: &GatewayMessage) -> Result<()> {
            self.sent.lock().unwrap().push(msg.clone());
            Ok(())
        }

        fn is_connected(&self) -> bool {
            *self.connected.lock().unwrap()
        }

        async fn close(&self, code: u16, reason: &str) {
            *self.closed.lock().unwrap() = Some((code, reason.to_string()));
            *self.connected.lock().unwrap() = false;
        }
    }
}
