use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::site::BucketList;

/// Periodic sweep that purges tombstone-only keys older than the purge
/// age from every bucket in the list.
pub struct GarbageCollector {
    buckets: Arc<BucketList>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    purge_age: u64,
    shutdown: watch::Sender<bool>,
}

impl GarbageCollector {
    pub fn new(
        buckets: Arc<BucketList>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        purge_age: u64,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            buckets,
            clock,
            interval,
            purge_age,
            shutdown,
        }
    }

    pub fn start(&self) {
        let buckets = self.buckets.clone();
        let clock = self.clock.clone();
        let interval = self.interval;
        let purge_age = self.purge_age;
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(interval) => {}
                }

                let cutoff = clock.now().saturating_sub(purge_age);
                for entry in buckets.all() {
                    info!(bucket = entry.bucket.name(), "gc: sweep");
                    match entry.bucket.garbage_collect(cutoff).await {
                        Ok(purged) if purged > 0 => {
                            info!(bucket = entry.bucket.name(), purged, "gc: purged keys");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(bucket = entry.bucket.name(), %e, "gc: sweep failed");
                        }
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}
