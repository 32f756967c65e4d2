//! Periodic recovery of abandoned deliveries
//!
//! A consumer that dies mid-job leaves its delivery in flight. Every running
//! consumer keeps a [`Reclaimer`] alive, which returns deliveries older than
//! the visibility timeout to the ready set so any consumer can pick them up.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::JobQueue;

/// Background recovery task, aborted when dropped
pub struct Reclaimer {
    handle: JoinHandle<()>,
}

impl Reclaimer {
    /// Recover deliveries older than `stale_after`, checking every `every`
    ///
    /// The first check runs immediately.
    pub fn spawn(queue: Arc<dyn JobQueue>, stale_after: Duration, every: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match queue.recover(stale_after).await {
                    Ok(0) => {}
                    Ok(recovered) => {
                        tracing::info!(queue = %queue.name(), recovered, "Recovered stale deliveries");
                    }
                    Err(e) => {
                        tracing::warn!(queue = %queue.name(), error = %e, "Failed to recover stale deliveries");
                    }
                }
            }
        });
        Self { handle }
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
