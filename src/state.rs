//! Shared application state for request handlers.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{AppConfig, CHALLENGE_DIR};
use crate::routing::HostRouter;

/// Shared application state, cloneable across handlers via Arc-wrapped fields.
///
/// Holds the host router (which reads the live site snapshot on every request)
/// and the directory answering HTTP-01 challenges.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub router: HostRouter,
    pub challenge_dir: Arc<PathBuf>,
}

impl AppState {
    pub fn new(config: AppConfig, router: HostRouter) -> Self {
        let challenge_dir = router.registry().base_dir().join(CHALLENGE_DIR);
        Self {
            config: Arc::new(config),
            router,
            challenge_dir: Arc::new(challenge_dir),
        }
    }
}
