//! Immediate notice dispatch and queue entry points.
//!
//! The dispatcher owns the active backend set and the render/locale seams.
//! `send_now` fans one notice out to every (recipient, backend) pair with
//! per-backend failure isolation; `queue` defers the same arguments into a
//! durable batch for the drain engine.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::backends::{Delivery, NotificationBackend};
use crate::config::{NotificationConfig, SiteConfig};
use crate::context::{Context, ContextValue};
use crate::error::{NotificationError, Result};
use crate::metrics::{
    BATCHES_ENQUEUED_TOTAL, DELIVERY_FAILURES_TOTAL, NOTICES_SENT_TOTAL,
    NOTICES_SUPPRESSED_TOTAL,
};
use crate::model::{DeliveryFlags, NoticeType, Preference, QueuedNotice};
use crate::render::MessageRenderer;
use crate::store::NoticeStore;
use crate::tasks::{DrainScheduler, NoopDrainScheduler};
use crate::users::{LocaleLookup, NoLocales, UserRef};

/// When a send happens relative to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timing {
    /// Follow the deployment's `queue_all` setting.
    #[default]
    Default,
    /// Dispatch inline, regardless of configuration.
    Now,
    /// Defer into a batch, regardless of configuration.
    Queue,
}

/// Counts from one immediate dispatch, aggregated over every
/// (recipient, backend) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SendOutcome {
    /// Deliveries that reached their transport.
    pub sent: usize,
    /// Deliveries suppressed by preference or skipped by the backend.
    pub skipped: usize,
    /// Deliveries that errored; other pairs were unaffected.
    pub failed: usize,
}

impl std::ops::AddAssign for SendOutcome {
    fn add_assign(&mut self, other: Self) {
        self.sent += other.sent;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// What `send` did with the notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendResult {
    /// Dispatched inline.
    Delivered(SendOutcome),
    /// Deferred into the batch with this id.
    Queued(Uuid),
}

/// Dispatches notices to recipients across the active backends.
pub struct Dispatcher {
    store: Arc<dyn NoticeStore>,
    backends: Vec<Arc<dyn NotificationBackend>>,
    renderer: Arc<dyn MessageRenderer>,
    locales: Arc<dyn LocaleLookup>,
    scheduler: Arc<dyn DrainScheduler>,
    site: SiteConfig,
    queue_all: bool,
    default_locale: String,
}

impl Dispatcher {
    /// Create a dispatcher without locale lookup or drain scheduling.
    pub fn new(
        store: Arc<dyn NoticeStore>,
        backends: Vec<Arc<dyn NotificationBackend>>,
        renderer: Arc<dyn MessageRenderer>,
        site: SiteConfig,
        notification: &NotificationConfig,
    ) -> Self {
        Self {
            store,
            backends,
            renderer,
            locales: Arc::new(NoLocales),
            scheduler: Arc::new(NoopDrainScheduler),
            site,
            queue_all: notification.queue_all,
            default_locale: notification.default_locale.clone(),
        }
    }

    /// Attach a per-user locale lookup.
    pub fn with_locales(mut self, locales: Arc<dyn LocaleLookup>) -> Self {
        self.locales = locales;
        self
    }

    /// Attach a drain scheduler notified after every queued batch.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn DrainScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// The backends this dispatcher delivers through, in order.
    pub fn active_backends(&self) -> &[Arc<dyn NotificationBackend>] {
        &self.backends
    }

    /// Register or refresh a notice type definition.
    ///
    /// Existing definitions are updated in place when any field changed,
    /// so hosts can declare their types unconditionally at startup.
    #[tracing::instrument(name = "dispatch.create_notice_type", skip(self, display, description))]
    pub async fn create_notice_type(
        &self,
        label: &str,
        display: &str,
        description: &str,
        default_sensitivity: u8,
    ) -> Result<NoticeType> {
        let notice_type = NoticeType::new(label, display, description, default_sensitivity);
        match self.store.notice_type(label).await? {
            Some(existing) => {
                if existing != notice_type {
                    self.store.update_notice_type(&notice_type).await?;
                    tracing::info!(label = %label, "Updated notice type");
                }
            }
            None => {
                self.store.insert_notice_type(&notice_type).await?;
                tracing::info!(label = %label, "Created notice type");
            }
        }
        Ok(notice_type)
    }

    /// All registered notice types.
    pub async fn notice_types(&self) -> Result<Vec<NoticeType>> {
        Ok(self.store.notice_types().await?)
    }

    /// Record an explicit opt-in/opt-out for one (type, backend) pair.
    pub async fn set_preference(
        &self,
        user_id: &str,
        label: &str,
        backend_path: &str,
        send: bool,
    ) -> Result<Preference> {
        if self.store.notice_type(label).await?.is_none() {
            return Err(NotificationError::UnknownNoticeType(label.to_string()));
        }
        Ok(self
            .store
            .set_preference(user_id, label, backend_path, send)
            .await?)
    }

    /// All stored preference rows for a user.
    pub async fn preferences_for(&self, user_id: &str) -> Result<Vec<Preference>> {
        Ok(self.store.preferences_for(user_id).await?)
    }

    /// Send a notice, inline or queued per `timing`.
    pub async fn send(
        &self,
        recipients: &[UserRef],
        label: &str,
        extra_context: &Context,
        sender: Option<&UserRef>,
        flags: &DeliveryFlags,
        timing: Timing,
    ) -> Result<SendResult> {
        let deferred = match timing {
            Timing::Default => self.queue_all,
            Timing::Now => false,
            Timing::Queue => true,
        };
        if deferred {
            let batch_id = self
                .queue(recipients, label, extra_context, sender, flags)
                .await?;
            Ok(SendResult::Queued(batch_id))
        } else {
            let outcome = self
                .send_now(recipients, label, extra_context, sender, flags)
                .await?;
            Ok(SendResult::Delivered(outcome))
        }
    }

    /// Dispatch a notice to every recipient across the active backends.
    ///
    /// A backend failure is contained to its (recipient, backend) pair and
    /// counted in the outcome; the remaining pairs still run.
    #[tracing::instrument(
        name = "dispatch.send_now",
        skip(self, recipients, extra_context, sender),
        fields(notice_type = %label, recipient_count = recipients.len())
    )]
    pub async fn send_now(
        &self,
        recipients: &[UserRef],
        label: &str,
        extra_context: &Context,
        sender: Option<&UserRef>,
        flags: &DeliveryFlags,
    ) -> Result<SendOutcome> {
        let notice_type = self
            .store
            .notice_type(label)
            .await?
            .ok_or_else(|| NotificationError::UnknownNoticeType(label.to_string()))?;

        let mut outcome = SendOutcome::default();
        for recipient in recipients {
            outcome += self
                .dispatch_to_recipient(recipient, sender, &notice_type, extra_context, flags)
                .await?;
        }

        tracing::debug!(
            notice_type = %label,
            sent = outcome.sent,
            skipped = outcome.skipped,
            failed = outcome.failed,
            "Dispatched notice"
        );

        Ok(outcome)
    }

    async fn dispatch_to_recipient(
        &self,
        recipient: &UserRef,
        sender: Option<&UserRef>,
        notice_type: &NoticeType,
        extra_context: &Context,
        flags: &DeliveryFlags,
    ) -> Result<SendOutcome> {
        // Locale lookup is fail-soft: anything short of an answer means the
        // configured default.
        let locale = self
            .locales
            .locale_for(&recipient.id)
            .await
            .unwrap_or_else(|| self.default_locale.clone());

        let context = self.build_context(recipient, sender, notice_type, extra_context);

        let mut outcome = SendOutcome::default();
        for backend in &self.backends {
            let (preference, _) = self
                .store
                .get_or_create_preference(
                    &recipient.id,
                    &notice_type.label,
                    backend.preference_path(),
                    backend.default_send(notice_type),
                )
                .await?;
            let allowed = preference.send;

            if !allowed && !backend.delivers_when_denied() {
                outcome.skipped += 1;
                NOTICES_SUPPRESSED_TOTAL
                    .with_label_values(&[backend.slug()])
                    .inc();
                continue;
            }

            let delivery = Delivery {
                store: self.store.as_ref(),
                renderer: self.renderer.as_ref(),
                site: &self.site,
                recipient,
                sender,
                notice_type,
                context: &context,
                locale: &locale,
                allowed,
                flags,
            };

            match backend.deliver(&delivery).await {
                Ok(true) => {
                    outcome.sent += 1;
                    NOTICES_SENT_TOTAL
                        .with_label_values(&[backend.slug()])
                        .inc();
                }
                Ok(false) => {
                    outcome.skipped += 1;
                    if !allowed {
                        NOTICES_SUPPRESSED_TOTAL
                            .with_label_values(&[backend.slug()])
                            .inc();
                    }
                }
                Err(e) => {
                    outcome.failed += 1;
                    DELIVERY_FAILURES_TOTAL
                        .with_label_values(&[backend.slug()])
                        .inc();
                    tracing::warn!(
                        backend = %backend.slug(),
                        recipient = %recipient.id,
                        notice_type = %notice_type.label,
                        error = %e,
                        "Backend delivery failed"
                    );
                }
            }
        }

        Ok(outcome)
    }

    fn build_context(
        &self,
        recipient: &UserRef,
        sender: Option<&UserRef>,
        notice_type: &NoticeType,
        extra_context: &Context,
    ) -> Context {
        let mut context = Context::new();
        context.insert(
            "recipient".to_string(),
            ContextValue::Text(recipient.username.clone()),
        );
        context.insert(
            "sender".to_string(),
            sender
                .map(|user| ContextValue::Text(user.username.clone()))
                .unwrap_or(ContextValue::Null),
        );
        context.insert(
            "notice".to_string(),
            ContextValue::Text(notice_type.display.clone()),
        );
        context.insert(
            "protocol".to_string(),
            ContextValue::Text(self.site.protocol.clone()),
        );
        context.insert(
            "current_site".to_string(),
            ContextValue::Text(self.site.domain.clone()),
        );
        // Caller-provided values win over the built-ins.
        context.extend(
            extra_context
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        context
    }

    /// Defer a send into a durable batch and nudge the drain scheduler.
    pub async fn queue(
        &self,
        recipients: &[UserRef],
        label: &str,
        extra_context: &Context,
        sender: Option<&UserRef>,
        flags: &DeliveryFlags,
    ) -> Result<Uuid> {
        let recipient_ids = recipients.iter().map(|user| user.id.clone()).collect();
        self.queue_by_ids(
            recipient_ids,
            label,
            extra_context,
            sender.map(|user| user.id.clone()),
            flags,
        )
        .await
    }

    /// Like `queue`, for callers that only hold recipient ids. The ids are
    /// resolved against the user directory at drain time; accounts deleted
    /// in between are skipped then.
    #[tracing::instrument(
        name = "dispatch.queue",
        skip(self, recipient_ids, extra_context, sender_id, flags),
        fields(notice_type = %label, recipient_count = recipient_ids.len())
    )]
    pub async fn queue_by_ids(
        &self,
        recipient_ids: Vec<String>,
        label: &str,
        extra_context: &Context,
        sender_id: Option<String>,
        flags: &DeliveryFlags,
    ) -> Result<Uuid> {
        // One entry per recipient: the drain engine replays each entry as
        // its own immediate send.
        let queued: Vec<QueuedNotice> = recipient_ids
            .into_iter()
            .map(|user_id| QueuedNotice {
                user_id,
                label: label.to_string(),
                context: extra_context.clone(),
                sender: sender_id.clone(),
                flags: flags.clone(),
            })
            .collect();
        let payload = serde_json::to_string(&queued)?;
        let batch = self.store.create_batch(payload).await?;

        BATCHES_ENQUEUED_TOTAL.inc();
        tracing::debug!(
            batch_id = %batch.id,
            notice_type = %label,
            "Queued notice batch"
        );

        self.scheduler.schedule_drain(batch.id).await;
        Ok(batch.id)
    }
}
