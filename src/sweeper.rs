use crate::state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Periodically prune hub subscribers whose connection went away without
/// unsubscribing, and expire stale rate limit windows
pub fn spawn_presence_sweeper(state: Arc<AppState>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let pruned = state.hub.sweep().await;
            if pruned > 0 {
                tracing::info!("Sweeper pruned {} dead subscribers", pruned);
            }

            if let Some(limiter) = &state.rate_limiter {
                limiter.cleanup().await;
            }
        }
    })
}
