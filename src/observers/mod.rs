//! Observation registry: subscriptions tying users to signals on objects.
//!
//! A user observing a target object receives the subscription's notice type
//! whenever the host fires the matching signal against that object. The
//! registry knows nothing about the host's object model beyond the opaque
//! `ObjectRef`.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::context::{Context, ContextValue, ObjectRef};
use crate::dispatch::{Dispatcher, SendOutcome, SendResult, Timing};
use crate::error::{NotificationError, Result};
use crate::metrics::SIGNALS_FIRED_TOTAL;
use crate::model::{DeliveryFlags, ObservedItem};
use crate::store::NoticeStore;
use crate::users::UserDirectory;

/// Counts from one fired signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalOutcome {
    /// Subscriptions that matched the (target, signal) pair.
    pub watchers: usize,
    /// Watchers the user directory no longer knows.
    pub missing_watchers: usize,
    /// Batches queued instead of dispatched inline.
    pub queued: usize,
    /// Delivery counts from the inline dispatches.
    pub outcome: SendOutcome,
}

/// Manages observation subscriptions and fans fired signals out through
/// the dispatcher.
pub struct ObserverRegistry {
    store: Arc<dyn NoticeStore>,
    dispatcher: Arc<Dispatcher>,
    users: Arc<dyn UserDirectory>,
}

impl ObserverRegistry {
    pub fn new(
        store: Arc<dyn NoticeStore>,
        dispatcher: Arc<Dispatcher>,
        users: Arc<dyn UserDirectory>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            users,
        }
    }

    /// Subscribe a user to `signal` on `target`.
    ///
    /// The notice type must already be registered. Duplicate subscriptions
    /// are allowed and each fires separately.
    #[tracing::instrument(
        name = "observers.observe",
        skip(self),
        fields(target = %target, signal = %signal, notice_type = %label)
    )]
    pub async fn observe(
        &self,
        user_id: &str,
        target: &ObjectRef,
        label: &str,
        signal: &str,
    ) -> Result<ObservedItem> {
        if self.store.notice_type(label).await?.is_none() {
            return Err(NotificationError::UnknownNoticeType(label.to_string()));
        }

        let item = ObservedItem {
            id: Uuid::new_v4(),
            target: target.clone(),
            user_id: user_id.to_string(),
            notice_type: label.to_string(),
            signal: signal.to_string(),
            added: Utc::now(),
        };
        self.store.create_observed_item(item.clone()).await?;

        tracing::debug!(user_id = %user_id, "User now observing");
        Ok(item)
    }

    /// Remove every subscription a user holds on `(target, signal)`.
    ///
    /// Returns the number removed, or `NotFound` when there was none.
    #[tracing::instrument(
        name = "observers.stop_observing",
        skip(self),
        fields(target = %target, signal = %signal)
    )]
    pub async fn stop_observing(
        &self,
        user_id: &str,
        target: &ObjectRef,
        signal: &str,
    ) -> Result<u64> {
        let items = self
            .store
            .observed_items_for_user(target, user_id, signal)
            .await?;
        if items.is_empty() {
            return Err(NotificationError::NotFound(format!(
                "user {user_id} is not observing {target} for {signal}"
            )));
        }

        let mut removed = 0;
        for item in items {
            if self.store.delete_observed_item(item.id).await? {
                removed += 1;
            }
        }
        tracing::debug!(user_id = %user_id, removed = removed, "User stopped observing");
        Ok(removed)
    }

    /// Whether a user observes `(target, signal)`. `None` (no signed-in
    /// user) is never observing.
    pub async fn is_observing(
        &self,
        user_id: Option<&str>,
        target: &ObjectRef,
        signal: &str,
    ) -> Result<bool> {
        match user_id {
            Some(user_id) => {
                let items = self
                    .store
                    .observed_items_for_user(target, user_id, signal)
                    .await?;
                Ok(!items.is_empty())
            }
            None => Ok(false),
        }
    }

    /// Fire `signal` against `target`, notifying every watcher.
    ///
    /// Each watcher is dispatched independently with the subscription's own
    /// notice type. The target rides along in the context under `observed`
    /// and becomes the related object of each stored notice. Watchers the
    /// directory no longer knows are skipped.
    #[tracing::instrument(
        name = "observers.fire_signal",
        skip(self, extra_context),
        fields(target = %target, signal = %signal)
    )]
    pub async fn fire_signal(
        &self,
        target: &ObjectRef,
        signal: &str,
        extra_context: &Context,
    ) -> Result<SignalOutcome> {
        let items = self.store.observed_items(target, signal).await?;
        SIGNALS_FIRED_TOTAL.inc();

        let mut context = extra_context.clone();
        context.insert(
            "observed".to_string(),
            ContextValue::Object(target.clone()),
        );
        let flags = DeliveryFlags::related(target.clone());

        let mut result = SignalOutcome::default();
        for item in &items {
            result.watchers += 1;
            let user = self
                .users
                .user_by_id(&item.user_id)
                .await
                .map_err(NotificationError::Directory)?;
            let Some(user) = user else {
                result.missing_watchers += 1;
                tracing::warn!(
                    user_id = %item.user_id,
                    "Skipping watcher unknown to the user directory"
                );
                continue;
            };

            let sent = self
                .dispatcher
                .send(
                    std::slice::from_ref(&user),
                    &item.notice_type,
                    &context,
                    None,
                    &flags,
                    Timing::Default,
                )
                .await?;
            match sent {
                SendResult::Delivered(outcome) => result.outcome += outcome,
                SendResult::Queued(_) => result.queued += 1,
            }
        }

        tracing::debug!(
            watchers = result.watchers,
            missing = result.missing_watchers,
            sent = result.outcome.sent,
            queued = result.queued,
            "Signal fired"
        );
        Ok(result)
    }
}
