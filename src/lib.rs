pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod websocket;

use actix_cors::Cors;
use actix_web::http::Method;
use actix_web::{web, HttpResponse};
use std::sync::Arc;

pub use error::AppError;
pub type Result<T> = std::result::Result<T, AppError>;
pub use crate::config::Settings;

pub use db::{MemoryStore, MessageStore, PgStore, UserStore};
pub use websocket::{Hub, HubHandle, RealtimeServer};

use crate::config::{CorsConfig, StorageBackend};

/// Health check endpoint handler
/// Returns server status, timestamp and the number of live realtime connections
pub async fn health_check(state: web::Data<AppState>) -> Result<HttpResponse> {
    let connections = state.hub.connection_count().await?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "connections": connections,
    })))
}

/// Application state shared across all components
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub hub: HubHandle,
    pub messages: Arc<dyn MessageStore>,
    pub users: Arc<dyn UserStore>,
}

impl AppState {
    /// Opens the configured store. An unreachable Postgres is an error here
    /// and aborts startup.
    pub async fn new(config: Settings, hub: HubHandle) -> Result<Self> {
        match config.storage.backend {
            StorageBackend::Postgres => {
                let store = PgStore::connect(
                    &config.database.url,
                    config.database.max_connections,
                    config.database.connect_timeout(),
                    config.hub.persist_timeout(),
                )
                .await?;
                Ok(Self::with_store(config, hub, store))
            }
            StorageBackend::Memory => {
                tracing::warn!("Using in-memory storage, messages will not survive a restart");
                Ok(Self::with_store(config, hub, MemoryStore::new()))
            }
        }
    }

    pub fn with_store<S>(config: Settings, hub: HubHandle, store: S) -> Self
    where
        S: MessageStore + UserStore + 'static,
    {
        let store = Arc::new(store);
        Self {
            config: Arc::new(config),
            hub,
            messages: store.clone(),
            users: store,
        }
    }
}

pub fn cors(config: &CorsConfig) -> Cors {
    let cors = if config.allow_any_origin {
        Cors::default()
            .allow_any_origin()
            .send_wildcard()
    } else {
        Cors::default()
            .allowed_origin("http://localhost:3000")
            .allowed_origin("http://127.0.0.1:3000")
    };

    cors.allowed_methods(vec!["GET", "POST", "OPTIONS"])
        .allowed_header(actix_web::http::header::CONTENT_TYPE)
        .max_age(config.max_age as usize)
}

/// Registers the HTTP API on an actix `App`.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/messages", web::get().to(api::list_messages))
        .service(
            web::resource("/users")
                .route(web::post().to(api::create_user))
                .route(web::method(Method::OPTIONS).to(api::preflight))
                .default_service(web::to(api::method_not_allowed)),
        );
}
