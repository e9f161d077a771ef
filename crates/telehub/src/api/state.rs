//! Application state shared across handlers.

use std::path::PathBuf;

use tokio::sync::watch;

use crate::config::AppConfig;
use crate::router::MessageRouter;
use crate::serial::LinkState;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Routes client frames to the hardware and the broadcast hub.
    pub router: MessageRouter,
    /// Current state of the hardware link.
    pub link_state: watch::Receiver<LinkState>,
    /// Outbox size for each new client.
    pub client_queue_capacity: usize,
    /// Directory served under `/js`.
    pub static_dir: PathBuf,
}

impl AppState {
    pub fn new(
        router: MessageRouter,
        link_state: watch::Receiver<LinkState>,
        config: &AppConfig,
    ) -> Self {
        Self {
            router,
            link_state,
            client_queue_capacity: config.hub.client_queue_capacity,
            static_dir: PathBuf::from(&config.server.static_dir),
        }
    }

    pub fn connected_clients(&self) -> usize {
        self.router.hub().registry().len()
    }

    pub fn link_state(&self) -> LinkState {
        *self.link_state.borrow()
    }
}
