//! Background scavenge task
//!
//! Runs a scavenge pass every interval on the blocking pool. On shutdown an
//! in-flight pass is cancelled at the next chunk boundary and awaited.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::Scavenger;
use crate::error::StorageError;

/// Periodic scavenger
pub struct ScavengeTask {
    scavenger: Arc<Scavenger>,
    interval: Duration,
    shutdown_rx: broadcast::Receiver<()>,
    cancel: Arc<AtomicBool>,
    passes: u64,
}

impl ScavengeTask {
    pub fn new(
        scavenger: Arc<Scavenger>,
        interval: Duration,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            scavenger,
            interval,
            shutdown_rx,
            cancel: Arc::new(AtomicBool::new(false)),
            passes: 0,
        }
    }

    /// Spawn the scavenge task as a background task
    pub fn spawn(
        scavenger: Arc<Scavenger>,
        interval: Duration,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let task = Self::new(scavenger, interval, shutdown_rx);
        tokio::spawn(async move {
            task.run().await;
        })
    }

    async fn run(mut self) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Scavenge task started"
        );

        // First pass one interval after start, not immediately.
        let mut interval = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("Scavenge task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    self.passes += 1;
                    if !self.run_pass().await {
                        info!("Scavenge task shutting down");
                        break;
                    }
                }
            }
        }

        debug!(passes = self.passes, "Scavenge task stopped");
    }

    /// Run one pass; returns false if shutdown arrived meanwhile
    async fn run_pass(&mut self) -> bool {
        self.cancel.store(false, Ordering::Release);
        let scavenger = Arc::clone(&self.scavenger);
        let cancel = Arc::clone(&self.cancel);
        let mut pass = tokio::task::spawn_blocking(move || scavenger.scavenge(&cancel));

        let (joined, keep_running) = tokio::select! {
            joined = &mut pass => (joined, true),
            _ = self.shutdown_rx.recv() => {
                self.cancel.store(true, Ordering::Release);
                (pass.await, false)
            }
        };

        match joined {
            Ok(Ok(result)) => {
                if !result.failed_chunks.is_empty() {
                    warn!(
                        pass = self.passes,
                        failed = ?result.failed_chunks,
                        "Scavenge pass left chunks for retry"
                    );
                }
            }
            Ok(Err(StorageError::Cancelled)) => debug!(pass = self.passes, "Scavenge pass cancelled"),
            Ok(Err(e)) => error!(pass = self.passes, error = %e, "Scavenge pass failed"),
            Err(e) => error!(pass = self.passes, error = %e, "Scavenge pass panicked"),
        }
        keep_running
    }
}
