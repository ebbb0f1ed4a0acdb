//! Per-connection read loop: decode, persist, hand off to the hub.

use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, warn};

use crate::db::{MessageStore, NewMessage, StoredMessage};
use crate::error::{AppError, DatabaseError, WebSocketError};
use crate::websocket::connection::{ConnectionId, ConnectionRecord};
use crate::websocket::hub::{BroadcastEnvelope, HubHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Active,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Closed is terminal and nothing re-enters Active.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (New, Active) | (New, Closing) | (Active, Closing) | (Closing, Closed)
        )
    }
}

/// Held for as long as the connection is registered. Dropping it submits
/// the unregister, whichever way the loop ends.
struct Registration {
    id: ConnectionId,
    hub: HubHandle,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Err(e) = self.hub.unregister(self.id) {
            warn!(connection_id = %self.id, error = %e, "Could not unregister connection");
        }
    }
}

/// Decode, persist, broadcast. Borrowed across awaits, so it must stay `Sync`.
struct Pipeline {
    id: ConnectionId,
    hub: HubHandle,
    store: Arc<dyn MessageStore>,
    persist_timeout: Duration,
}

impl Pipeline {
    async fn ingest(&self, payload: &[u8]) -> Result<StoredMessage, AppError> {
        let message: NewMessage = serde_json::from_slice(payload).map_err(WebSocketError::from)?;

        let stored = match timeout(self.persist_timeout, self.store.persist_message(message)).await {
            Ok(result) => result?,
            Err(_) => return Err(DatabaseError::Timeout(self.persist_timeout).into()),
        };

        self.hub.broadcast(BroadcastEnvelope::from_message(&stored)?)?;
        debug!(connection_id = %self.id, message_id = %stored.id, "Message accepted");
        Ok(stored)
    }
}

pub struct IngestSession<S> {
    id: ConnectionId,
    record: Option<ConnectionRecord>,
    frames: S,
    released: oneshot::Receiver<()>,
    pipeline: Pipeline,
    state: ConnectionState,
}

impl<S> IngestSession<S>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin + Send,
{
    pub fn new(
        mut record: ConnectionRecord,
        frames: S,
        hub: HubHandle,
        store: Arc<dyn MessageStore>,
        persist_timeout: Duration,
    ) -> Self {
        let id = record.id();
        let released = record.released();
        Self {
            id,
            record: Some(record),
            frames,
            released,
            pipeline: Pipeline {
                id,
                hub,
                store,
                persist_timeout,
            },
            state: ConnectionState::New,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn transition(&mut self, next: ConnectionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(connection_id = %self.id, from = ?self.state, to = ?next, "Connection state change");
        self.state = next;
    }

    fn activate(&mut self) -> Result<Registration, WebSocketError> {
        let record = self.record.take().ok_or(WebSocketError::HubUnavailable)?;
        self.pipeline.hub.register(record)?;
        self.transition(ConnectionState::Active);
        Ok(Registration {
            id: self.id,
            hub: self.pipeline.hub.clone(),
        })
    }

    /// Registers the connection, then reads frames until the peer goes away,
    /// the transport errors or the hub evicts it. The read half is released
    /// and the hub told to unregister (closing the write half) on every exit
    /// path.
    pub async fn run(mut self) -> ConnectionState {
        let registration = match self.activate() {
            Ok(registration) => registration,
            Err(e) => {
                error!(connection_id = %self.id, error = %e, "Failed to register connection");
                self.transition(ConnectionState::Closing);
                self.transition(ConnectionState::Closed);
                return self.state;
            }
        };

        loop {
            let frame = tokio::select! {
                frame = self.frames.next() => frame,
                _ = &mut self.released => {
                    info!(connection_id = %self.id, "Connection evicted by hub");
                    break;
                }
            };
            let Some(frame) = frame else {
                break;
            };

            let payload = match frame {
                Ok(Message::Text(text)) => text.into_bytes(),
                Ok(Message::Binary(bytes)) => bytes,
                Ok(Message::Close(reason)) => {
                    info!(connection_id = %self.id, ?reason, "Client closed connection");
                    break;
                }
                // Ping/pong replies are queued by the transport itself.
                Ok(_) => continue,
                Err(e) => {
                    warn!(connection_id = %self.id, error = %e, "Error reading from client");
                    break;
                }
            };

            if let Err(e) = self.pipeline.ingest(&payload).await {
                warn!(connection_id = %self.id, error = %e, "Dropping inbound message");
            }
        }

        self.transition(ConnectionState::Closing);
        drop(registration);
        self.transition(ConnectionState::Closed);
        self.state
    }
}
