use std::{sync::Arc, time::Duration};

use dashmap::{mapref::entry::Entry, DashMap};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Time-bounded memory of EventSub message ids that were already handled.
///
/// Entries expire individually once they are older than the retention window.
#[derive(Clone)]
pub struct DuplicateFilter {
    seen: Arc<DashMap<String, Instant>>,
    retention: Duration,
}

impl DuplicateFilter {
    pub fn new(retention: Duration) -> Self {
        Self {
            seen: Arc::new(DashMap::new()),
            retention,
        }
    }

    /// Atomically records `message_id` and reports whether it was already
    /// present inside the retention window.
    pub fn check_and_mark(&self, message_id: &str) -> bool {
        let now = Instant::now();
        match self.seen.entry(message_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if now.duration_since(*entry.get()) < self.retention {
                    true
                } else {
                    entry.insert(now);
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                false
            }
        }
    }

    #[cfg(test)]
    pub fn seen(&self, message_id: &str) -> bool {
        self.seen
            .get(message_id)
            .is_some_and(|at| at.elapsed() < self.retention)
    }

    #[cfg(test)]
    pub fn mark_seen(&self, message_id: &str) {
        self.seen.insert(message_id.to_string(), Instant::now());
    }

    /// Drops expired entries and returns how many were removed.
    pub fn sweep(&self) -> usize {
        let before = self.seen.len();
        let retention = self.retention;
        self.seen.retain(|_, at| at.elapsed() < retention);
        before.saturating_sub(self.seen.len())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Runs [`DuplicateFilter::sweep`] every `every` until `shutdown` fires.
    pub fn spawn_sweeper(
        self,
        every: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.sweep();
                        if removed > 0 {
                            debug!(stage = "ingress", removed, remaining = self.len(), "expired message ids swept");
                        }
                    }
                }
            }
        })
    }
}
