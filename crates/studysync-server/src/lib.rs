//! StudySync sync agent library logic.
//!
//! The agent keeps a [`SyncClient`] open for one configured user and exposes
//! its state over a small HTTP surface.

pub mod background;
pub mod config;

use axum::{routing::get, Extension, Json, Router};
use background::SummarySnapshot;
use serde_json::{json, Value};
use std::sync::{Arc, RwLock};
use studysync_realtime::SyncClient;
use studysync_store::{SqliteBackend, StaticIdentity};
use tower_http::trace::TraceLayer;

/// The client type the agent runs.
pub type AgentClient = SyncClient<SqliteBackend, StaticIdentity>;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Sync client for the configured user.
    pub client: Arc<AgentClient>,
    /// Latest conversation summaries, written by the list task.
    pub summaries: SummarySnapshot,
}

impl AppState {
    pub fn new(client: Arc<AgentClient>) -> Self {
        Self {
            client,
            summaries: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

/// Health check handler.
///
/// Returns `200 OK` with agent status and version.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Reports the signed-in user, live subscriptions and conversation list.
async fn status(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    let summaries = state
        .summaries
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone();
    Json(json!({
        "user_id": state.client.current_user().ok(),
        "subscriptions": state.client.status(),
        "conversations": summaries,
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}
