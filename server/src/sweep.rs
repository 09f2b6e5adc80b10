//! # Idle Sweeper
//!
//! The one periodic maintenance task: every sweep interval it evicts
//! descriptors that are unattached and past the idle timeout. `sweep`
//! itself takes `now` as a parameter so tests drive eviction without
//! waiting; this task just feeds it the wall clock.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::registry::Registry;

/// Spawns the sweeper. It runs until the token is cancelled and never
/// propagates a failure out of the task.
pub fn spawn_sweeper(
    registry: Arc<Registry>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = registry.sweep(Utc::now());
                    if evicted > 0 {
                        info!(evicted, remaining = registry.len(), "evicted idle tunnels");
                    } else {
                        debug!("sweep pass, nothing idle");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TunnelSpec;

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_idle_tunnels_within_one_period() {
        // Zero idle timeout: anything unattached is idle on the next pass.
        let registry = Arc::new(Registry::new(10, Duration::ZERO));
        registry.create(TunnelSpec::default()).unwrap();
        assert_eq!(registry.len(), 1);

        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(registry.clone(), Duration::from_secs(60), cancel.clone());

        // Paused time auto-advances to the first tick.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(registry.len(), 0);

        cancel.cancel();
        handle.await.unwrap();
    }
}
