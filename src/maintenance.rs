//! Periodic maintenance: cancels worn-out tasks so they do not sit in the
//! queue forever.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::queue::CeQueue;

/// Runs [`CeQueue::cancel_worn_outs`] every `interval` until shut down.
pub struct WornOutSweeper {
    queue: Arc<CeQueue>,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl Clone for WornOutSweeper {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            interval: self.interval,
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl WornOutSweeper {
    pub fn new(queue: Arc<CeQueue>, interval: Duration) -> Self {
        Self {
            queue,
            interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Signal the sweeper to stop. Takes effect even if `run` has not
    /// started waiting yet.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// One sweep. Storage work runs on the blocking pool.
    pub async fn sweep_once(&self) -> Result<usize> {
        let queue = Arc::clone(&self.queue);
        tokio::task::spawn_blocking(move || queue.cancel_worn_outs())
            .await
            .map_err(|e| Error::Other(format!("sweep task panicked: {e}")))?
    }

    /// Sweep immediately, then every `interval`, until shutdown.
    pub async fn run(&self) -> Result<()> {
        info!(interval_secs = self.interval.as_secs(), "worn-out sweeper started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("worn-out sweeper shutting down");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            match self.sweep_once().await {
                Ok(0) => debug!("no worn-out tasks"),
                Ok(count) => info!(canceled = count, "worn-out sweep done"),
                Err(e) => error!("worn-out sweep error: {e}"),
            }
        }
    }
}
