use std::sync::Arc;

use rl_domain::config::Config;
use rl_engine::{Coordinator, Services};

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub services: Arc<Services>,
    pub coordinator: Arc<Coordinator>,
}
