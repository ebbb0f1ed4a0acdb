use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{error, info, warn};

use crate::db::MessageStore;
use crate::error::WebSocketError;
use crate::websocket::connection::{ConnectionId, ConnectionRecord};
use crate::websocket::hub::HubHandle;
use crate::websocket::ingest::IngestSession;

/// Accepts realtime connections and gives each one its own ingest session.
pub struct RealtimeServer {
    hub: HubHandle,
    store: Arc<dyn MessageStore>,
    ws_path: String,
    persist_timeout: Duration,
}

impl RealtimeServer {
    pub fn new(
        hub: HubHandle,
        store: Arc<dyn MessageStore>,
        ws_path: impl Into<String>,
        persist_timeout: Duration,
    ) -> Self {
        Self {
            hub,
            store,
            ws_path: ws_path.into(),
            persist_timeout,
        }
    }

    /// Accept loop. Runs until the listener fails to accept.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!("Realtime server listening at ws://{}{}", addr, self.ws_path);
        }

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream, addr).await;
                    });
                }
                Err(e) => {
                    error!("Error accepting realtime connection: {}", e);
                    break;
                }
            }
        }
    }

    pub async fn handle_connection(self: Arc<Self>, raw_stream: TcpStream, addr: SocketAddr) {
        info!("New WebSocket connection from: {}", addr);

        let ws_path = self.ws_path.as_str();
        let check_path = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            if req.uri().path() == ws_path {
                Ok(resp)
            } else {
                let mut not_found = ErrorResponse::new(Some("Not Found".to_string()));
                *not_found.status_mut() = StatusCode::NOT_FOUND;
                Err(not_found)
            }
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(raw_stream, check_path).await {
            Ok(ws) => ws,
            Err(e) => {
                let e = WebSocketError::HandshakeError(e.to_string());
                warn!("Rejected connection from {}: {}", addr, e);
                return;
            }
        };

        let (ws_sink, ws_stream) = ws_stream.split();
        let id = ConnectionId::generate();
        let record = ConnectionRecord::new(id, ws_sink);

        let state = IngestSession::new(
            record,
            ws_stream,
            self.hub.clone(),
            self.store.clone(),
            self.persist_timeout,
        )
        .run()
        .await;

        info!("Connection {} from {} finished in state {:?}", id, addr, state);
    }
}
