use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::registry::SubscriptionRegistry;

/// Periodic full reconciliation against the remote subscription listing.
pub struct ReconcileJob {
    registry: SubscriptionRegistry,
    period: Duration,
}

impl ReconcileJob {
    pub fn new(registry: SubscriptionRegistry, period: Duration) -> Self {
        Self { registry, period }
    }

    /// First run happens one period after spawning.
    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(self, shutdown: CancellationToken) {
        info!(stage = "reconcile", period_secs = self.period.as_secs(), "periodic reconciliation scheduled");
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    // Failures are counted and logged by the registry.
                    if self.registry.reconcile().await.is_err() {
                        debug!(stage = "reconcile", "periodic reconciliation failed; retrying next period");
                    }
                }
            }
        }
        debug!(stage = "reconcile", "periodic reconciliation stopped");
    }
}

/// One-off reconciliation at startup; failures only delay convergence.
pub fn run_startup_sync(registry: SubscriptionRegistry) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!(stage = "reconcile", "startup reconciliation started");
        if registry.reconcile().await.is_err() {
            debug!(stage = "reconcile", "startup reconciliation failed; state converges on the next sync");
        }
    })
}
