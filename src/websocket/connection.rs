use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::SinkExt;
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::error::WebSocketError;

/// Server-assigned identity of one live connection. Minted fresh for every
/// registration and never reused; only used as a registry key and in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Write side of a transport, as seen by the hub.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send_text(&mut self, payload: &str) -> Result<(), WebSocketError>;

    async fn close(&mut self) -> Result<(), WebSocketError>;
}

#[async_trait]
impl<S> Outbound for SplitSink<WebSocketStream<S>, Message>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_text(&mut self, payload: &str) -> Result<(), WebSocketError> {
        self.send(Message::Text(payload.to_owned())).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), WebSocketError> {
        SinkExt::close(self).await?;
        Ok(())
    }
}

pub struct ConnectionRecord {
    id: ConnectionId,
    outbound: Box<dyn Outbound>,
    released: Option<oneshot::Sender<()>>,
}

impl ConnectionRecord {
    pub fn new(id: ConnectionId, outbound: impl Outbound + 'static) -> Self {
        Self {
            id,
            outbound: Box::new(outbound),
            released: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Resolves once the record is dropped, i.e. when the hub unregisters,
    /// evicts or shuts down with it. Only the latest receiver is notified.
    pub fn released(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.released = Some(tx);
        rx
    }

    pub(crate) async fn write(&mut self, payload: &str) -> Result<(), WebSocketError> {
        self.outbound.send_text(payload).await
    }

    pub(crate) async fn close(&mut self) -> Result<(), WebSocketError> {
        self.outbound.close().await
    }
}

impl fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
