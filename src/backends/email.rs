//! Email notice backend.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{NotificationError, Result};
use crate::render::MessagePart;

use super::{Delivery, NotificationBackend};

/// Mail transport seam. Hosts plug in their SMTP or API client; the
/// default [`LogMailer`] just logs outgoing mail.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_mail(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()>;
}

/// Mailer that writes outgoing mail to the log instead of sending it.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_mail(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()> {
        tracing::info!(
            to = %to,
            subject = %subject,
            body_bytes = body.len(),
            "Outgoing mail (log mailer)"
        );
        Ok(())
    }
}

/// Delivers notices by email.
///
/// Recipients without an email address are skipped, not failed: an
/// addressless account is an expected state, not a delivery error.
pub struct EmailBackend {
    mailer: Arc<dyn Mailer>,
}

impl EmailBackend {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl NotificationBackend for EmailBackend {
    fn slug(&self) -> &str {
        "email"
    }

    fn display_name(&self) -> &str {
        "Email"
    }

    fn sensitivity(&self) -> u8 {
        2
    }

    async fn deliver(&self, delivery: &Delivery<'_>) -> Result<bool> {
        if !delivery.allowed {
            return Ok(false);
        }

        let Some(address) = delivery.recipient.email.as_deref() else {
            tracing::debug!(
                recipient = %delivery.recipient.id,
                notice_type = %delivery.notice_type.label,
                "Recipient has no email address, skipping"
            );
            return Ok(false);
        };

        let subject_line = delivery.renderer.render(
            &delivery.notice_type.label,
            MessagePart::Subject,
            delivery.locale,
            delivery.context,
        )?;
        let body = delivery.renderer.render(
            &delivery.notice_type.label,
            MessagePart::Body,
            delivery.locale,
            delivery.context,
        )?;

        // Header injection guard: the subject must be a single line.
        let subject = format!(
            "[{}] {}",
            delivery.site.name,
            subject_line.lines().collect::<String>()
        );

        self.mailer
            .send_mail(address, &subject, &body)
            .await
            .map_err(NotificationError::Delivery)?;

        tracing::debug!(
            recipient = %delivery.recipient.id,
            notice_type = %delivery.notice_type.label,
            "Sent notice email"
        );

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SiteConfig;
    use crate::context::Context;
    use crate::model::{DeliveryFlags, NoticeType};
    use crate::render::TemplateRenderer;
    use crate::store::MemoryStore;
    use crate::users::UserRef;
    use std::sync::Mutex;

    static DEFAULT_FLAGS: DeliveryFlags = DeliveryFlags {
        on_site: true,
        related: None,
    };

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send_mail(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((to.to_string(), subject.to_string(), body.to_string()));
            Ok(())
        }
    }

    fn create_test_delivery<'a>(
        store: &'a MemoryStore,
        renderer: &'a TemplateRenderer,
        site: &'a SiteConfig,
        recipient: &'a UserRef,
        notice_type: &'a NoticeType,
        context: &'a Context,
    ) -> Delivery<'a> {
        Delivery {
            store,
            renderer,
            site,
            recipient,
            sender: None,
            notice_type,
            context,
            locale: "en",
            allowed: true,
            flags: &DEFAULT_FLAGS,
        }
    }

    #[tokio::test]
    async fn test_sends_with_site_prefixed_subject() {
        let store = MemoryStore::new();
        let renderer = TemplateRenderer::with_defaults();
        let site = SiteConfig::default();
        let recipient = UserRef::new("u1", "alice").with_email("alice@example.com");
        let notice_type = NoticeType::new("friends_invite", "Invitation", "", 2);
        let mut context = Context::new();
        context.insert("notice".to_string(), "Invitation\nfrom bob".into());

        let mailer = Arc::new(RecordingMailer::default());
        let backend = EmailBackend::new(mailer.clone());

        let delivered = backend
            .deliver(&create_test_delivery(
                &store, &renderer, &site, &recipient, &notice_type, &context,
            ))
            .await
            .unwrap();
        assert!(delivered);

        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "alice@example.com");
        // Multi-line render collapsed into a single subject line.
        assert_eq!(sent[0].1, "[Herald] Invitationfrom bob");
    }

    #[tokio::test]
    async fn test_skips_recipient_without_address() {
        let store = MemoryStore::new();
        let renderer = TemplateRenderer::with_defaults();
        let site = SiteConfig::default();
        let recipient = UserRef::new("u1", "alice");
        let notice_type = NoticeType::new("friends_invite", "Invitation", "", 2);
        let context = Context::new();

        let mailer = Arc::new(RecordingMailer::default());
        let backend = EmailBackend::new(mailer.clone());

        let delivered = backend
            .deliver(&create_test_delivery(
                &store, &renderer, &site, &recipient, &notice_type, &context,
            ))
            .await
            .unwrap();

        assert!(!delivered);
        assert!(mailer.sent.lock().unwrap().is_empty());
    }
}
