//! Batch drain engine.
//!
//! Drains the durable notice queue: every pending batch is decoded, its
//! recipients resolved against the user directory, and the notices
//! dispatched through the immediate path. A failing batch is reported to
//! the operator alert channel and kept for the next pass; the other
//! batches in the same pass are unaffected.

mod lock;

pub use lock::{DrainLock, DrainLockGuard, LockError};

use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

use crate::alerts::OperatorAlerts;
use crate::config::{NotificationConfig, SiteConfig};
use crate::dispatch::{Dispatcher, SendOutcome};
use crate::error::{NotificationError, Result};
use crate::metrics::{
    BATCHES_DRAINED_TOTAL, BATCHES_FAILED_TOTAL, DRAIN_DURATION_SECONDS,
    DRAIN_LOCK_CONTENTION_TOTAL, DRAIN_USERS_SKIPPED_TOTAL, PENDING_BATCHES,
};
use crate::model::{NoticeBatch, QueuedNotice};
use crate::store::NoticeStore;
use crate::users::UserDirectory;

/// Counts from one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// Batches emitted and deleted.
    pub batches_drained: usize,
    /// Batches that failed and were kept for retry.
    pub batches_failed: usize,
    /// Recipient ids the directory no longer knows.
    pub users_skipped: usize,
    /// Delivery counts aggregated over every drained batch.
    pub outcome: SendOutcome,
}

/// Drains pending notice batches through the dispatcher.
pub struct DrainEngine {
    store: Arc<dyn NoticeStore>,
    dispatcher: Arc<Dispatcher>,
    users: Arc<dyn UserDirectory>,
    alerts: Arc<dyn OperatorAlerts>,
    site: SiteConfig,
    lock: DrainLock,
}

impl DrainEngine {
    pub fn new(
        store: Arc<dyn NoticeStore>,
        dispatcher: Arc<Dispatcher>,
        users: Arc<dyn UserDirectory>,
        alerts: Arc<dyn OperatorAlerts>,
        site: SiteConfig,
        notification: &NotificationConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            users,
            alerts,
            site,
            lock: DrainLock::from_config(notification),
        }
    }

    /// Drain every pending batch, newest first.
    ///
    /// Never returns an error: a pass that cannot run (lock held, store
    /// unreachable) logs and reports an empty summary, and per-batch
    /// failures are contained inside the pass.
    #[tracing::instrument(name = "engine.send_all", skip(self))]
    pub async fn send_all(&self) -> DrainSummary {
        let started = Instant::now();

        let guard = match self.lock.acquire().await {
            Ok(guard) => guard,
            Err(e @ (LockError::AlreadyLocked | LockError::Timeout(_))) => {
                DRAIN_LOCK_CONTENTION_TOTAL.inc();
                tracing::debug!(error = %e, "Drain pass already running, skipping");
                return DrainSummary::default();
            }
            Err(e) => {
                tracing::error!(error = %e, "Could not open drain lock file");
                return DrainSummary::default();
            }
        };

        let batches = match self.store.pending_batches().await {
            Ok(batches) => batches,
            Err(e) => {
                tracing::error!(error = %e, "Could not list pending batches");
                return DrainSummary::default();
            }
        };
        PENDING_BATCHES.set(batches.len() as i64);

        let mut summary = DrainSummary::default();
        for batch in &batches {
            self.process_batch(batch, &mut summary).await;
        }
        drop(guard);

        DRAIN_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());
        tracing::info!(
            batches_drained = summary.batches_drained,
            batches_failed = summary.batches_failed,
            users_skipped = summary.users_skipped,
            sent = summary.outcome.sent,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Drain pass complete"
        );

        summary
    }

    /// Drain one batch by id, typically right after it was queued.
    ///
    /// Does not take the drain lock; a periodic pass picking up the same
    /// batch first simply leaves nothing to do here.
    #[tracing::instrument(name = "engine.drain_batch", skip(self), fields(batch_id = %batch_id))]
    pub async fn drain_batch(&self, batch_id: Uuid) -> DrainSummary {
        let mut summary = DrainSummary::default();
        match self.store.batch(batch_id).await {
            Ok(Some(batch)) => self.process_batch(&batch, &mut summary).await,
            Ok(None) => {
                tracing::debug!("Batch already drained");
            }
            Err(e) => {
                tracing::error!(error = %e, "Could not fetch batch");
            }
        }
        summary
    }

    async fn process_batch(&self, batch: &NoticeBatch, summary: &mut DrainSummary) {
        match self.emit_batch(batch).await {
            Ok((outcome, users_skipped)) => {
                summary.outcome += outcome;
                summary.users_skipped += users_skipped;
                match self.store.delete_batch(batch.id).await {
                    Ok(_) => {
                        summary.batches_drained += 1;
                        BATCHES_DRAINED_TOTAL.inc();
                    }
                    Err(e) => {
                        // Emitted but not deleted: the next pass will send it
                        // again. Surface loudly rather than silently double-send.
                        summary.batches_failed += 1;
                        self.report_failure(batch, &NotificationError::Store(e))
                            .await;
                    }
                }
            }
            Err(e) => {
                summary.batches_failed += 1;
                self.report_failure(batch, &e).await;
            }
        }
    }

    /// Decode one batch and replay each entry through the immediate path.
    ///
    /// Unknown recipients are skipped; anything else fails the whole batch.
    async fn emit_batch(&self, batch: &NoticeBatch) -> Result<(SendOutcome, usize)> {
        let queued: Vec<QueuedNotice> = serde_json::from_str(&batch.payload)?;

        let mut outcome = SendOutcome::default();
        let mut users_skipped = 0;
        for notice in &queued {
            let user = self
                .users
                .user_by_id(&notice.user_id)
                .await
                .map_err(NotificationError::Directory)?;
            let Some(user) = user else {
                users_skipped += 1;
                DRAIN_USERS_SKIPPED_TOTAL.inc();
                tracing::warn!(
                    user_id = %notice.user_id,
                    batch_id = %batch.id,
                    "Skipping recipient unknown to the user directory"
                );
                continue;
            };

            let sender = match &notice.sender {
                Some(sender_id) => {
                    let found = self
                        .users
                        .user_by_id(sender_id)
                        .await
                        .map_err(NotificationError::Directory)?;
                    if found.is_none() {
                        tracing::warn!(
                            sender_id = %sender_id,
                            batch_id = %batch.id,
                            "Sender no longer exists, delivering without one"
                        );
                    }
                    found
                }
                None => None,
            };

            outcome += self
                .dispatcher
                .send_now(
                    &[user],
                    &notice.label,
                    &notice.context,
                    sender.as_ref(),
                    &notice.flags,
                )
                .await?;
        }

        Ok((outcome, users_skipped))
    }

    async fn report_failure(&self, batch: &NoticeBatch, error: &NotificationError) {
        BATCHES_FAILED_TOTAL.inc();
        tracing::error!(
            batch_id = %batch.id,
            error = %error,
            "Failed to emit notice batch, keeping it for retry"
        );
        let subject = format!("[{} drain] notice batch send error", self.site.name);
        let body = format!(
            "Notice batch {} failed to emit and was kept for the next pass:\n\n{}",
            batch.id, error
        );
        self.alerts.alert(&subject, &body).await;
    }
}
