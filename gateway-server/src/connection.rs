//! The axum WebSocket implementation of `gateway_core::connection::Connection`.
//!
//! Grounded on the teacher's `wrapped_sender = Arc::new(Mutex::new(sender))`
//! pattern in `relay-server/src/main.rs`: `axum`'s `SplitSink` needs `&mut
//! self` to send, but `Connection::send` takes `&self` (many producers -
//! timers, the scheduler worker, the registry - all need to send without
//! coordinating), so the sink is wrapped in a `tokio::sync::Mutex`.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::sync::Mutex;

use gateway_core::connection::Connection;
use gateway_core::{GatewayError, Result};
use protocol::GatewayMessage;

pub struct WsConnection {
    sender: Mutex<SplitSink<WebSocket, Message>>,
    connected: AtomicBool,
}

impl WsConnection {
    pub fn new(sender: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sender: Mutex::new(sender),
            connected: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&self, msg: &GatewayMessage) -> Result<()> {
        let text = serde_json::to_string(msg).map_err(|e| GatewayError::Transport(e.to_string()))?;
        let mut sender = self.sender.lock().await;
        sender.send(Message::Text(text.into())).await.map_err(|e| {
            self.connected.store(false, Ordering::SeqCst);
            GatewayError::Transport(e.to_string())
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self, code: u16, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        let mut sender = self.sender.lock().await;
        let _ = sender
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.to_owned().into(),
            })))
            .await;
    }
}
