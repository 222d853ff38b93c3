pub mod chat;
pub mod error;

use crate::config::RelayConfig;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

pub use error::ApiError;

/// Shared by every request; holds no per-request mutable state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config: Arc::new(config),
            http: reqwest::Client::new(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(chat::relay_chat))
        .route("/api/profile", get(chat::active_profile))
        .with_state(state)
}
