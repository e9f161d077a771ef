//! HTTP handlers.

use axum::{
    Json,
    extract::State,
    http::{HeaderMap, header},
    response::Html,
};
use serde::Serialize;
use tracing::debug;

use super::state::AppState;

const INDEX_TEMPLATE: &str = include_str!("../../assets/index.html");

/// Substitute the WebSocket URL into the index page.
pub fn render_index(ws_url: &str) -> String {
    INDEX_TEMPLATE.replace("{{ wsurl }}", ws_url)
}

/// Index page with the WebSocket URL for the requesting host.
///
/// GET /
pub async fn index(headers: HeaderMap) -> Html<String> {
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    let ws_url = format!("ws://{host}/ws");
    debug!(ws_url = %ws_url, "Rendering index");
    Html(render_index(&ws_url))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub clients: usize,
    pub serial: String,
    /// Frames evicted from lagging clients' outboxes.
    pub dropped: u64,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        clients: state.connected_clients(),
        serial: state.link_state().to_string(),
        dropped: state.router.hub().dropped_frames(),
    })
}
