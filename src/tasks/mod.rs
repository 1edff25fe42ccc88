//! Background tasks for the drain worker.
//!
//! Three long-running loops live here: the listener that drains a batch as
//! soon as it is queued, the periodic full drain that catches anything the
//! listener missed, and the obsolescence sweep. All of them stop on the
//! shared shutdown broadcast.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::config::NotificationConfig;
use crate::metrics::OBSOLETE_DELETED_TOTAL;
use crate::store::{NoticeStore, StoreError};

use crate::engine::DrainEngine;

/// Receives a nudge whenever a batch is queued.
///
/// Scheduling is fire and forget: implementations must not fail the queue
/// path, since the periodic drain picks up anything a nudge misses.
#[async_trait]
pub trait DrainScheduler: Send + Sync {
    async fn schedule_drain(&self, batch_id: Uuid);
}

/// Scheduler that drops every nudge on the floor.
///
/// Used where only the periodic drain should run, and in tests.
pub struct NoopDrainScheduler;

#[async_trait]
impl DrainScheduler for NoopDrainScheduler {
    async fn schedule_drain(&self, _batch_id: Uuid) {}
}

/// Scheduler backed by an in-process channel, consumed by `DrainListener`.
pub struct ChannelDrainScheduler {
    tx: mpsc::Sender<Uuid>,
}

impl ChannelDrainScheduler {
    /// Create the scheduler and the receiver half for the listener.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Uuid>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl DrainScheduler for ChannelDrainScheduler {
    async fn schedule_drain(&self, batch_id: Uuid) {
        // A full or closed channel is not an error for the caller; the
        // batch stays pending until the next periodic pass.
        if let Err(e) = self.tx.try_send(batch_id) {
            tracing::warn!(
                batch_id = %batch_id,
                error = %e,
                "Drain nudge dropped, batch waits for the periodic pass"
            );
        }
    }
}

/// How long to wait before re-checking a nudged batch that was not
/// visible yet, and how many times to look before giving up.
const VISIBILITY_RETRY: Duration = Duration::from_secs(2);
const VISIBILITY_ATTEMPTS: u32 = 3;

/// Drains batches as their nudges arrive.
pub struct DrainListener {
    engine: Arc<DrainEngine>,
    rx: mpsc::Receiver<Uuid>,
    shutdown: broadcast::Receiver<()>,
}

impl DrainListener {
    pub fn new(
        engine: Arc<DrainEngine>,
        rx: mpsc::Receiver<Uuid>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            engine,
            rx,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::info!("Drain listener started");
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Drain listener received shutdown signal");
                    break;
                }
                nudge = self.rx.recv() => {
                    match nudge {
                        Some(batch_id) => {
                            self.drain_with_retry(batch_id).await;
                        }
                        None => {
                            tracing::info!("Drain nudge channel closed");
                            break;
                        }
                    }
                }
            }
        }
        tracing::info!("Drain listener stopped");
    }

    /// Drain one nudged batch, re-checking a few times when it is not
    /// visible yet.
    ///
    /// With the store behind replication the nudge can outrun the batch
    /// row. A batch that was found always counts as drained or failed, so
    /// an empty summary means it was not visible.
    async fn drain_with_retry(&self, batch_id: Uuid) {
        for attempt in 1..=VISIBILITY_ATTEMPTS {
            let summary = self.engine.drain_batch(batch_id).await;
            if summary.batches_drained + summary.batches_failed > 0 {
                return;
            }
            if attempt < VISIBILITY_ATTEMPTS {
                tracing::debug!(
                    batch_id = %batch_id,
                    attempt = attempt,
                    "Nudged batch not visible yet, retrying"
                );
                tokio::time::sleep(VISIBILITY_RETRY).await;
            }
        }
        tracing::debug!(
            batch_id = %batch_id,
            "Nudged batch never became visible, leaving it to the periodic drain"
        );
    }
}

/// Periodic full drain pass.
pub struct DrainTask {
    config: NotificationConfig,
    engine: Arc<DrainEngine>,
    shutdown: broadcast::Receiver<()>,
}

impl DrainTask {
    pub fn new(
        config: NotificationConfig,
        engine: Arc<DrainEngine>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            engine,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut timer =
            tokio::time::interval(Duration::from_secs(self.config.drain_interval_secs));

        // Skip immediate first tick
        timer.tick().await;

        tracing::info!(
            drain_interval_secs = self.config.drain_interval_secs,
            "Drain task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Drain task received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    self.engine.send_all().await;
                }
            }
        }

        tracing::info!("Drain task stopped");
    }
}

/// Delete seen notices older than the retention window.
///
/// Unseen notices are never touched, however old they are.
pub async fn sweep_obsolete(
    store: &dyn NoticeStore,
    obsolete_days: i64,
) -> Result<u64, StoreError> {
    let cutoff = Utc::now() - chrono::Duration::days(obsolete_days);
    let deleted = store.delete_obsolete_notices(cutoff).await?;
    OBSOLETE_DELETED_TOTAL.inc_by(deleted);
    if deleted > 0 {
        tracing::info!(deleted = deleted, obsolete_days = obsolete_days, "Swept obsolete notices");
    }
    Ok(deleted)
}

/// Periodic obsolescence sweep.
pub struct SweepTask {
    config: NotificationConfig,
    store: Arc<dyn NoticeStore>,
    shutdown: broadcast::Receiver<()>,
}

impl SweepTask {
    pub fn new(
        config: NotificationConfig,
        store: Arc<dyn NoticeStore>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            store,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut timer =
            tokio::time::interval(Duration::from_secs(self.config.sweep_interval_secs));

        // Skip immediate first tick
        timer.tick().await;

        tracing::info!(
            sweep_interval_secs = self.config.sweep_interval_secs,
            obsolete_days = self.config.obsolete_days,
            "Sweep task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Sweep task received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    if let Err(e) = sweep_obsolete(self.store.as_ref(), self.config.obsolete_days).await {
                        tracing::error!(error = %e, "Obsolescence sweep failed");
                    }
                }
            }
        }

        tracing::info!("Sweep task stopped");
    }
}
