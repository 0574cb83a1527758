use std::sync::Arc;

use crate::config::AppConfig;
use crate::relay::SessionRouter;

/// Application-wide state shared across handlers
pub struct AppState {
    /// Effective configuration (defaults, file and CLI overrides merged)
    pub config: AppConfig,
    /// Session registry and message router
    pub router: Arc<SessionRouter>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            router: Arc::new(SessionRouter::new()),
        })
    }
}
