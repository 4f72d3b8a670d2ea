//! Background tick driver for a shard's metric map
//!
//! A single task sleeps on a ticker and runs one expiration pass per
//! interval; the pass itself may sleep to respect its soft deadline, so it
//! runs on the blocking pool. Terminates cooperatively on the shutdown
//! broadcast.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::aggregator::map::MetricMap;

/// Periodic driver of [`MetricMap::tick`]
pub struct TickWorker {
    map: Arc<MetricMap>,
    check_interval: Duration,
    target: Duration,
}

impl TickWorker {
    /// Create a worker ticking `map` every `check_interval`, giving each
    /// pass approximately `target` wall time
    pub fn new(map: Arc<MetricMap>, check_interval: Duration, target: Duration) -> Self {
        Self {
            map,
            check_interval,
            target,
        }
    }

    /// Spawn the tick loop
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            debug!(shard = self.map.shard(), "tick worker started");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let map = Arc::clone(&self.map);
                        let target = self.target;
                        match tokio::task::spawn_blocking(move || map.tick(target)).await {
                            Ok(result) => {
                                debug!(
                                    shard = self.map.shard(),
                                    active_entries = result.active_entries,
                                    expired_entries = result.expired_entries,
                                    active_elems = result.active_elems,
                                    "tick complete"
                                );
                            }
                            Err(e) => {
                                warn!(shard = self.map.shard(), error = %e, "tick task failed");
                            }
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!(shard = self.map.shard(), "tick worker stopped");
                        break;
                    }
                }
            }
        })
    }
}
