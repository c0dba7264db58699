mod config;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use huddle_api::auth::AppStateInner;
use huddle_api::blobs;
use huddle_db::Database;
use huddle_gateway::auth::user_id_from_token;
use huddle_gateway::blob::LocalBlobStore;
use huddle_gateway::connection;
use huddle_gateway::notify::{LogSink, NotificationSink, WebhookSink};
use huddle_gateway::ChatService;

use crate::config::Config;

#[derive(Clone)]
struct GatewayState {
    service: ChatService,
    jwt_secret: Arc<str>,
}

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug,huddle_gateway=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Storage and collaborators
    let db = Arc::new(Database::open(&config.db_path)?);
    let blobs = Arc::new(LocalBlobStore::new(config.blob_dir.clone()).await?);
    let notifier: Arc<dyn NotificationSink> = match &config.notify_webhook {
        Some(url) => {
            info!("Offline notifications go to {}", url);
            Arc::new(WebhookSink::new(url.clone())?)
        }
        None => Arc::new(LogSink),
    };

    let service = ChatService::new(db, blobs, notifier, config.service());
    let jwt_secret: Arc<str> = Arc::from(config.jwt_secret.as_str());

    // Presence and typing sweep
    tokio::spawn(run_sweep_loop(service.clone(), config.sweep_interval));

    let gateway = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(GatewayState {
            service: service.clone(),
            jwt_secret: jwt_secret.clone(),
        });

    let app = Router::new()
        .route("/health", get(blobs::health))
        .merge(huddle_api::routes(AppStateInner::new(service, jwt_secret)))
        .merge(gateway)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("Huddle server listening on {}", config.addr);
    info!(
        "Presence window {:?}, typing timeout {:?}",
        config.presence_window, config.typing_timeout
    );

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Tokens may ride on the upgrade request; otherwise the client identifies
/// over the socket.
async fn ws_upgrade(
    State(state): State<GatewayState>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let user_id = match upgrade_user(query.token.as_deref(), &state.jwt_secret) {
        Ok(user_id) => user_id,
        Err(status) => {
            warn!("Gateway upgrade refused: invalid token");
            return status.into_response();
        }
    };

    ws.on_upgrade(move |socket| connection::handle_connection(socket, state.service, state.jwt_secret, user_id))
        .into_response()
}

/// `Ok(None)` when no token was offered; a token that fails verification
/// refuses the upgrade.
fn upgrade_user(token: Option<&str>, secret: &str) -> Result<Option<Uuid>, StatusCode> {
    match token {
        None => Ok(None),
        Some(token) => user_id_from_token(token, secret)
            .map(Some)
            .ok_or(StatusCode::UNAUTHORIZED),
    }
}

async fn run_sweep_loop(service: ChatService, every: Duration) {
    let mut interval = tokio::time::interval(every);

    loop {
        interval.tick().await;
        service.sweep_presence().await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
