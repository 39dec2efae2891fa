use crate::abuse::{LimitsConfig, RateLimiter};
use crate::config::RelayConfig;
use crate::hub::PresenceHub;
use std::sync::Arc;

/// Shared relay state
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<PresenceHub>,
    pub rate_limiter: Option<RateLimiter>,
    pub config: RelayConfig,
}

impl AppState {
    pub fn new(config: RelayConfig, limits: LimitsConfig) -> Self {
        Self {
            hub: Arc::new(PresenceHub::new(config.broadcast_self)),
            rate_limiter: limits.rate_limiter,
            config,
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(RelayConfig::default(), LimitsConfig::default())
    }
}
