//! The connection registry and its dispatch loop.
//!
//! `Hub` owns the registry outright and is driven by a single task. Every
//! other component talks to it through a cloneable `HubHandle`, which only
//! enqueues commands. All commands from all producers land on one queue,
//! so register, unregister and broadcast are applied one at a time in a
//! single arrival order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::db::StoredMessage;
use crate::error::WebSocketError;
use crate::websocket::connection::{ConnectionId, ConnectionRecord};

/// A wire-ready payload. The hub never looks inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastEnvelope(Arc<str>);

impl BroadcastEnvelope {
    pub fn new(payload: impl Into<Arc<str>>) -> Self {
        Self(payload.into())
    }

    pub fn from_message(message: &StoredMessage) -> Result<Self, WebSocketError> {
        Ok(Self::new(serde_json::to_string(message)?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug)]
pub enum HubCommand {
    Register(ConnectionRecord),
    Unregister(ConnectionId),
    Broadcast(BroadcastEnvelope),
    /// Read-only; answered in queue order so it reflects every earlier command.
    ConnectionCount(oneshot::Sender<usize>),
}

#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    fn submit(&self, command: HubCommand) -> Result<(), WebSocketError> {
        self.tx
            .send(command)
            .map_err(|_| WebSocketError::HubUnavailable)
    }

    pub fn register(&self, record: ConnectionRecord) -> Result<(), WebSocketError> {
        self.submit(HubCommand::Register(record))
    }

    pub fn unregister(&self, id: ConnectionId) -> Result<(), WebSocketError> {
        self.submit(HubCommand::Unregister(id))
    }

    pub fn broadcast(&self, envelope: BroadcastEnvelope) -> Result<(), WebSocketError> {
        self.submit(HubCommand::Broadcast(envelope))
    }

    pub async fn connection_count(&self) -> Result<usize, WebSocketError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(HubCommand::ConnectionCount(reply_tx))?;
        reply_rx.await.map_err(|_| WebSocketError::HubUnavailable)
    }
}

pub struct Hub {
    connections: HashMap<ConnectionId, ConnectionRecord>,
    commands: mpsc::UnboundedReceiver<HubCommand>,
    write_timeout: Duration,
}

impl Hub {
    /// `write_timeout` bounds every per-member write and close during a
    /// broadcast. A member that exceeds it is evicted like a failed write.
    pub fn new(write_timeout: Duration) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = Self {
            connections: HashMap::new(),
            commands: rx,
            write_timeout,
        };
        (hub, HubHandle { tx })
    }

    pub fn spawn(write_timeout: Duration) -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new(write_timeout);
        (handle, tokio::spawn(hub.run()))
    }

    /// Runs until every `HubHandle` has been dropped.
    pub async fn run(mut self) {
        info!("Hub started");
        while let Some(command) = self.commands.recv().await {
            self.apply(command).await;
        }
        for (_, mut record) in self.connections.drain() {
            close_record(self.write_timeout, &mut record).await;
        }
        info!("Hub stopped");
    }

    async fn apply(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register(record) => self.register(record),
            HubCommand::Unregister(id) => self.unregister(id).await,
            HubCommand::Broadcast(envelope) => self.broadcast(&envelope).await,
            HubCommand::ConnectionCount(reply) => {
                let _ = reply.send(self.connections.len());
            }
        }
    }

    fn register(&mut self, record: ConnectionRecord) {
        let id = record.id();
        self.connections.insert(id, record);
        info!(connection_id = %id, connections = self.connections.len(), "Client connected");
    }

    async fn unregister(&mut self, id: ConnectionId) {
        match self.connections.remove(&id) {
            Some(mut record) => {
                close_record(self.write_timeout, &mut record).await;
                info!(connection_id = %id, connections = self.connections.len(), "Client disconnected");
            }
            None => {
                debug!(connection_id = %id, "Unregister for unknown connection ignored");
            }
        }
    }

    async fn broadcast(&mut self, envelope: &BroadcastEnvelope) {
        let members: Vec<ConnectionId> = self.connections.keys().copied().collect();
        let mut delivered = 0usize;

        for id in members {
            let Some(record) = self.connections.get_mut(&id) else {
                continue;
            };

            let result = match timeout(self.write_timeout, record.write(envelope.as_str())).await {
                Ok(result) => result,
                Err(_) => Err(WebSocketError::Timeout(self.write_timeout)),
            };

            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(connection_id = %id, error = %e, "Broadcast write failed, evicting client");
                    // Dropping the record also releases its ingest session.
                    if let Some(mut record) = self.connections.remove(&id) {
                        close_record(self.write_timeout, &mut record).await;
                    }
                    info!(connection_id = %id, connections = self.connections.len(), "Client evicted");
                }
            }
        }

        debug!(delivered, connections = self.connections.len(), "Broadcast complete");
    }
}

async fn close_record(write_timeout: Duration, record: &mut ConnectionRecord) {
    match timeout(write_timeout, record.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(connection_id = %record.id(), error = %e, "Error closing client transport"),
        Err(_) => debug!(connection_id = %record.id(), "Timed out closing client transport"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::testing::{channel_record, FailingOutbound, StalledOutbound};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;
    use tokio_test::assert_ok;

    const WRITE_TIMEOUT: Duration = Duration::from_millis(100);

    #[test_log::test(tokio::test)]
    async fn test_broadcast_after_unregister_skips_removed_client() {
        let (hub, _task) = Hub::spawn(WRITE_TIMEOUT);
        let (c1, mut rx1, closed1) = channel_record();
        let (c2, mut rx2, _) = channel_record();
        let c1_id = c1.id();

        assert_ok!(hub.register(c1));
        assert_ok!(hub.register(c2));
        assert_ok!(hub.broadcast(BroadcastEnvelope::new("hello")));

        assert_eq!(rx1.recv().await.as_deref(), Some("hello"));
        assert_eq!(rx2.recv().await.as_deref(), Some("hello"));

        assert_ok!(hub.unregister(c1_id));
        assert_ok!(hub.broadcast(BroadcastEnvelope::new("world")));
        assert_eq!(hub.connection_count().await.unwrap(), 1);

        assert_eq!(rx2.recv().await.as_deref(), Some("world"));
        assert!(closed1.load(Ordering::SeqCst));
        // c1's outbound was dropped on removal, so its channel is closed and empty.
        assert_eq!(rx1.recv().await, None);
    }

    #[test_log::test(tokio::test)]
    async fn test_payload_delivered_unmodified() {
        let (hub, _task) = Hub::spawn(WRITE_TIMEOUT);
        let (c1, mut rx1, _) = channel_record();
        assert_ok!(hub.register(c1));

        let payload = "{\"text\":\"h\u{e9}llo \\\"quoted\\\"\",\"sender\":\"\u{1f980}\"}";
        assert_ok!(hub.broadcast(BroadcastEnvelope::new(payload)));
        assert_eq!(rx1.recv().await.as_deref(), Some(payload));
    }

    #[test_log::test(tokio::test)]
    async fn test_failed_write_evicts_only_that_member() {
        let (hub, _task) = Hub::spawn(WRITE_TIMEOUT);
        let (good, mut good_rx, _) = channel_record();
        let bad = ConnectionRecord::new(ConnectionId::generate(), FailingOutbound);

        assert_ok!(hub.register(bad));
        assert_ok!(hub.register(good));
        assert_eq!(hub.connection_count().await.unwrap(), 2);

        assert_ok!(hub.broadcast(BroadcastEnvelope::new("first")));
        assert_eq!(good_rx.recv().await.as_deref(), Some("first"));
        assert_eq!(hub.connection_count().await.unwrap(), 1);

        assert_ok!(hub.broadcast(BroadcastEnvelope::new("second")));
        assert_eq!(good_rx.recv().await.as_deref(), Some("second"));
        assert_eq!(hub.connection_count().await.unwrap(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_stalled_member_is_evicted_after_write_timeout() {
        let (hub, _task) = Hub::spawn(WRITE_TIMEOUT);
        let stalled_closed = Arc::new(AtomicBool::new(false));
        let stalled = ConnectionRecord::new(
            ConnectionId::generate(),
            StalledOutbound { closed: stalled_closed.clone() },
        );
        let (good, mut good_rx, _) = channel_record();

        assert_ok!(hub.register(stalled));
        assert_ok!(hub.register(good));

        let started = Instant::now();
        assert_ok!(hub.broadcast(BroadcastEnvelope::new("ping")));
        assert_eq!(good_rx.recv().await.as_deref(), Some("ping"));
        assert_eq!(hub.connection_count().await.unwrap(), 1);

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(stalled_closed.load(Ordering::SeqCst));
    }

    #[test_log::test(tokio::test)]
    async fn test_unregister_unknown_id_is_noop() {
        let (hub, _task) = Hub::spawn(WRITE_TIMEOUT);
        let (c1, mut rx1, closed1) = channel_record();
        let c1_id = c1.id();

        assert_ok!(hub.register(c1));
        assert_ok!(hub.unregister(ConnectionId::generate()));
        assert_eq!(hub.connection_count().await.unwrap(), 1);

        assert_ok!(hub.unregister(c1_id));
        assert_ok!(hub.unregister(c1_id));
        assert_eq!(hub.connection_count().await.unwrap(), 0);
        assert!(closed1.load(Ordering::SeqCst));

        assert_ok!(hub.broadcast(BroadcastEnvelope::new("nobody")));
        assert_eq!(hub.connection_count().await.unwrap(), 0);
        assert_eq!(rx1.recv().await, None);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_concurrent_producers_apply_every_command_once() {
        let (hub, _task) = Hub::spawn(WRITE_TIMEOUT);
        let mut producers = Vec::new();

        for _ in 0..8 {
            let hub = hub.clone();
            producers.push(tokio::spawn(async move {
                let mut kept = Vec::new();
                for i in 0..20 {
                    let (record, rx, _) = channel_record();
                    let id = record.id();
                    hub.register(record).unwrap();
                    hub.broadcast(BroadcastEnvelope::new(format!("msg-{}", i))).unwrap();
                    if i % 2 == 0 {
                        hub.unregister(id).unwrap();
                        hub.unregister(id).unwrap();
                    } else {
                        kept.push(rx);
                    }
                    tokio::task::yield_now().await;
                }
                kept
            }));
        }

        let mut receivers = Vec::new();
        for producer in producers {
            receivers.extend(producer.await.unwrap());
        }

        assert_eq!(hub.connection_count().await.unwrap(), 8 * 10);

        // Every surviving member registered before its producer's own next
        // broadcast, so it saw at least that one.
        for mut rx in receivers {
            assert!(rx.try_recv().is_ok());
        }
    }

    #[tokio::test]
    async fn test_handle_reports_stopped_hub() {
        let (hub, handle) = Hub::new(WRITE_TIMEOUT);
        drop(hub);

        let (record, _, _) = channel_record();
        assert!(matches!(handle.register(record), Err(WebSocketError::HubUnavailable)));
        assert!(matches!(handle.connection_count().await, Err(WebSocketError::HubUnavailable)));
    }

    #[tokio::test]
    async fn test_run_exits_and_closes_members_when_handles_dropped() {
        let (hub, handle) = Hub::new(WRITE_TIMEOUT);
        let task = tokio::spawn(hub.run());
        let (record, _rx, closed) = channel_record();

        handle.register(record).unwrap();
        assert_eq!(handle.connection_count().await.unwrap(), 1);
        drop(handle);

        task.await.unwrap();
        assert!(closed.load(Ordering::SeqCst));
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_run_future_can_be_spawned() {
        let (hub, _handle) = Hub::new(WRITE_TIMEOUT);
        let run = hub.run();
        assert_send(&run);
    }

    #[test_log::test(tokio::test)]
    async fn test_evicted_member_is_released() {
        let (hub, _task) = Hub::spawn(WRITE_TIMEOUT);
        let mut bad = ConnectionRecord::new(ConnectionId::generate(), FailingOutbound);
        let released = bad.released();
        let (mut good, _good_rx, _) = channel_record();
        let mut good_released = good.released();

        assert_ok!(hub.register(bad));
        assert_ok!(hub.register(good));
        assert_ok!(hub.broadcast(BroadcastEnvelope::new("ping")));

        let signal = tokio::time::timeout(Duration::from_secs(1), released).await;
        assert!(signal.is_ok(), "evicted member was never released");
        assert_eq!(hub.connection_count().await.unwrap(), 1);
        assert!(good_released.try_recv().is_err());
    }

    #[test]
    fn test_envelope_from_message_is_json() {
        let message = StoredMessage {
            id: "m1".to_string(),
            text: "hi".to_string(),
            sender: "alice".to_string(),
            timestamp: chrono::Utc::now(),
        };
        let envelope = BroadcastEnvelope::from_message(&message).unwrap();
        let decoded: StoredMessage = serde_json::from_str(envelope.as_str()).unwrap();
        assert_eq!(decoded, message);
    }
}
