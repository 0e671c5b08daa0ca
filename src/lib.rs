pub mod args;
pub mod engine;
pub mod lobby;
pub mod messages;
pub mod registry;
pub mod socket;
pub mod timer;
pub mod words;

use axum::{
    extract::State,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::prelude::*;

use crate::engine::{Event, EngineConfig};
use crate::messages::LobbyInfo;

pub fn setup_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "impostor_server=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_file(false)
                .with_target(false),
        )
        .init();
}

#[derive(Clone)]
pub struct AppState {
    pub events: mpsc::UnboundedSender<Event>,
}

pub async fn run(addr: SocketAddr, words_path: Option<PathBuf>) -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let words = words::load_words(words_path.as_deref())?;
    let events = engine::spawn(EngineConfig::default(), words);
    let app = app(AppState { events });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/lobbies", get(list_lobbies_handler))
        .route("/ws", get(socket::ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn health_handler() -> impl IntoResponse {
    axum::http::StatusCode::OK
}

/// Read-only view of the public lobby directory, answered by the engine
/// so the listing always reflects the live state.
async fn list_lobbies_handler(State(state): State<AppState>) -> Json<Vec<LobbyInfo>> {
    let (tx, rx) = oneshot::channel();
    if state.events.send(Event::LobbyListQuery { reply: tx }).is_ok() {
        if let Ok(lobbies) = rx.await {
            return Json(lobbies);
        }
    }
    Json(Vec::new())
}
