//! On-site notice backend.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::NewNotice;
use crate::render::MessagePart;

use super::{Delivery, NotificationBackend};

/// Persists notices to the store for on-site display.
///
/// Always stores the notice, even when the recipient opted out or the
/// caller sent with `on_site: false`: suppressed notices are written with
/// `on_site = false` so they exist in the archive without appearing in
/// on-site listings.
pub struct WebBackend;

impl WebBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WebBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationBackend for WebBackend {
    fn slug(&self) -> &str {
        "web"
    }

    fn display_name(&self) -> &str {
        "Web"
    }

    fn sensitivity(&self) -> u8 {
        1
    }

    fn delivers_when_denied(&self) -> bool {
        true
    }

    async fn deliver(&self, delivery: &Delivery<'_>) -> Result<bool> {
        let message = delivery.renderer.render(
            &delivery.notice_type.label,
            MessagePart::Notice,
            delivery.locale,
            delivery.context,
        )?;

        let on_site = delivery.allowed && delivery.flags.on_site;
        let notice = delivery
            .store
            .create_notice(NewNotice {
                recipient: delivery.recipient.id.clone(),
                sender: delivery.sender.map(|user| user.id.clone()),
                notice_type: delivery.notice_type.label.clone(),
                message,
                on_site,
                data: delivery.context.clone(),
                related: delivery.flags.related.clone(),
                created_at: None,
            })
            .await?;

        tracing::debug!(
            notice_id = %notice.id,
            recipient = %delivery.recipient.id,
            notice_type = %delivery.notice_type.label,
            on_site,
            "Stored on-site notice"
        );

        Ok(delivery.allowed)
    }
}
