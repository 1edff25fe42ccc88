//! No-op backend for development and tests.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::error::Result;

use super::{Delivery, NotificationBackend};

/// Counts deliveries without sending anything anywhere.
#[derive(Default)]
pub struct DummyBackend {
    delivered: AtomicU64,
}

impl DummyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of notices this instance has accepted.
    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl NotificationBackend for DummyBackend {
    fn slug(&self) -> &str {
        "dummy"
    }

    fn display_name(&self) -> &str {
        "Dummy"
    }

    fn sensitivity(&self) -> u8 {
        2
    }

    async fn deliver(&self, delivery: &Delivery<'_>) -> Result<bool> {
        if !delivery.allowed {
            return Ok(false);
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            recipient = %delivery.recipient.id,
            notice_type = %delivery.notice_type.label,
            "Dummy delivery"
        );
        Ok(true)
    }
}
