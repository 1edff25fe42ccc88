//! Operator alerting for batch processing failures.
//!
//! When the drain engine abandons a batch it notifies operators out of
//! band. Alerting is best-effort by contract: implementations must never
//! fail, because a broken alert channel must not take the drain down with
//! it.

use async_trait::async_trait;

/// Out-of-band operator notification channel.
#[async_trait]
pub trait OperatorAlerts: Send + Sync {
    /// Deliver an alert. Infallible by contract; implementations swallow
    /// and log their own transport errors.
    async fn alert(&self, subject: &str, body: &str);
}

/// Alert channel that writes to the log.
pub struct LogAlerts;

#[async_trait]
impl OperatorAlerts for LogAlerts {
    async fn alert(&self, subject: &str, body: &str) {
        tracing::error!(subject = %subject, body = %body, "Operator alert");
    }
}
