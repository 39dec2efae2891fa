use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};

use crate::{api, state::AppState, ws};

/// Assemble the relay's routes
pub fn build_router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        .route("/api/sessions/new", get(api::new_session))
        .route("/api/topics/{topic}/presence", get(api::topic_presence))
        .route("/api/health", get(api::health));

    let mut app = Router::new()
        .route("/", get(api::redirect_to_new_session))
        .route("/ws", get(ws::ws_handler))
        .merge(api_routes);

    // Unknown paths (including /s/<id>) fall through to the UI bundle
    if let Some(dir) = &state.config.static_dir {
        tracing::info!("Serving UI from {}", dir.display());
        let index = ServeFile::new(dir.join("index.html"));
        app = app.fallback_service(ServeDir::new(dir).fallback(index));
    }

    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
