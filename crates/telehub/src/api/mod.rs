//! HTTP surface: index page, static assets, health, and the WebSocket route.

mod handlers;
mod routes;
mod state;

pub use handlers::{HealthResponse, render_index};
pub use routes::create_router;
pub use state::AppState;
