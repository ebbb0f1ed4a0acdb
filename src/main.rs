use actix_web::{web, App, HttpServer};
use chat_hub_server::{configure_routes, cors, AppError, AppState, Hub, RealtimeServer, Settings};
use dotenv::dotenv;
use std::net::TcpListener;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[actix_web::main]
async fn main() -> chat_hub_server::Result<()> {
    // Load environment variables
    dotenv().ok();

    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let config = Settings::new()?;
    info!("Configuration loaded successfully ({})", config.environment);

    let (hub, hub_task) = Hub::spawn(config.hub.write_timeout());

    let state = match AppState::new(config.clone(), hub.clone()).await {
        Ok(state) => state,
        Err(e) => {
            error!("Could not connect to storage: {}", e);
            return Err(e);
        }
    };

    let realtime = Arc::new(RealtimeServer::new(
        hub,
        state.messages.clone(),
        config.server.ws_path.clone(),
        config.hub.persist_timeout(),
    ));
    let ws_listener = tokio::net::TcpListener::bind(config.ws_addr()).await?;
    let realtime_task = tokio::spawn(realtime.serve(ws_listener));

    let state = web::Data::new(state);
    let listener = TcpListener::bind(config.http_addr())?;
    info!("HTTP API listening at http://{}", config.http_addr());

    let cors_config = config.cors.clone();
    HttpServer::new(move || {
        App::new()
            .wrap(cors(&cors_config))
            .app_data(state.clone())
            .configure(configure_routes)
    })
    .listen(listener)?
    .workers(config.server.workers as usize)
    .run()
    .await
    .map_err(|e| AppError::InternalError(e.to_string()))?;

    realtime_task.abort();
    hub_task.abort();
    info!("Server stopped");
    Ok(())
}
