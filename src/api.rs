//! HTTP endpoints next to the socket: session links and presence inspection

use axum::{
    extract::{Path, State},
    response::Redirect,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::identity::generate_session_id;
use crate::presence::PresenceSnapshot;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionResponse {
    pub session_id: String,
    /// Shareable path, `/s/<id>`
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthResponse {
    pub status: String,
    pub topics: usize,
}

fn session_path(session_id: &str) -> String {
    format!("/s/{}", session_id)
}

/// GET /
///
/// Every visit to the root starts a fresh session.
pub async fn redirect_to_new_session() -> Redirect {
    let session_id = generate_session_id();
    tracing::info!("Redirecting to new session {}", session_id);
    Redirect::temporary(&session_path(&session_id))
}

/// GET /api/sessions/new
pub async fn new_session() -> Json<NewSessionResponse> {
    let session_id = generate_session_id();
    Json(NewSessionResponse {
        path: session_path(&session_id),
        session_id,
    })
}

/// GET /api/topics/{topic}/presence
///
/// Raw presence state of a topic, empty when nobody is subscribed.
pub async fn topic_presence(
    State(state): State<Arc<AppState>>,
    Path(topic): Path<String>,
) -> Json<PresenceSnapshot> {
    Json(state.hub.presence_state(&topic).await)
}

/// GET /api/health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        topics: state.hub.topic_count().await,
    })
}
