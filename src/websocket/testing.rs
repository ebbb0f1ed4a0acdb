//! Outbound doubles shared by the websocket unit tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::connection::{ConnectionId, ConnectionRecord, Outbound};
use crate::error::WebSocketError;

pub struct ChannelOutbound {
    tx: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Outbound for ChannelOutbound {
    async fn send_text(&mut self, payload: &str) -> Result<(), WebSocketError> {
        self.tx
            .send(payload.to_owned())
            .map_err(|e| WebSocketError::SendError(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), WebSocketError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub fn channel_record() -> (ConnectionRecord, mpsc::UnboundedReceiver<String>, Arc<AtomicBool>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    let outbound = ChannelOutbound {
        tx,
        closed: closed.clone(),
    };
    (ConnectionRecord::new(ConnectionId::generate(), outbound), rx, closed)
}

pub struct FailingOutbound;

#[async_trait]
impl Outbound for FailingOutbound {
    async fn send_text(&mut self, _payload: &str) -> Result<(), WebSocketError> {
        Err(WebSocketError::SendError("broken pipe".to_string()))
    }

    async fn close(&mut self) -> Result<(), WebSocketError> {
        Ok(())
    }
}

/// Never completes a write, like a peer that stopped reading.
pub struct StalledOutbound {
    pub closed: Arc<AtomicBool>,
}

#[async_trait]
impl Outbound for StalledOutbound {
    async fn send_text(&mut self, _payload: &str) -> Result<(), WebSocketError> {
        std::future::pending().await
    }

    async fn close(&mut self) -> Result<(), WebSocketError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
