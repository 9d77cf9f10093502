//! Periodic full-replace sync from the system of record into `PolicyCache`.

use crate::errors::{QuotaError, Result};
use crate::policy::{PolicyCache, PolicySource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

pub struct PolicySyncer {
    source: Arc<dyn PolicySource>,
    cache: Arc<PolicyCache>,
    interval: Duration,
    fetch_timeout: Duration,
    trigger: Arc<Notify>,
}

impl PolicySyncer {
    pub fn new(
        source: Arc<dyn PolicySource>,
        cache: Arc<PolicyCache>,
        interval: Duration,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            source,
            cache,
            interval,
            fetch_timeout,
            trigger: Arc::new(Notify::new()),
        }
    }

    /// Handle that requests an immediate sync (policy change feed).
    pub fn trigger(&self) -> Arc<Notify> {
        Arc::clone(&self.trigger)
    }

    /// Fetch and swap once. On failure the previous snapshot stays in place.
    pub async fn sync_once(&self) -> Result<usize> {
        debug!("Starting policy sync from {}", self.source.describe());

        let fetched = match tokio::time::timeout(self.fetch_timeout, self.source.fetch_enabled())
            .await
        {
            Ok(result) => result,
            Err(_) => Err(QuotaError::Timeout(format!(
                "policy fetch exceeded {}ms",
                self.fetch_timeout.as_millis()
            ))),
        };

        match fetched {
            Ok(policies) => {
                let active = self.cache.update_policies(policies);
                crate::metrics::record_policy_sync(true);
                debug!("Policy sync completed, cached {} policies", active);
                Ok(active)
            }
            Err(e) => {
                crate::metrics::record_policy_sync(false);
                Err(e)
            }
        }
    }

    async fn sync_logged(&self) {
        if let Err(e) = self.sync_once().await {
            error!(
                "Policy sync from {} failed: {}. Keeping previous snapshot.",
                self.source.describe(),
                e
            );
        }
    }

    /// Sync now, then on every tick or trigger, until the task is dropped.
    pub async fn run(self: Arc<Self>) {
        info!(
            "Policy syncer started (source: {}, interval: {}s)",
            self.source.describe(),
            self.interval.as_secs()
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.trigger.notified() => {
                    debug!("Policy change signalled; syncing early");
                    ticker.reset();
                }
            }
            self.sync_logged().await;
        }
    }
}
