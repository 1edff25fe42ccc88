//! Error types for the notification engine.
//!
//! Configuration problems surface eagerly and loudly; delivery problems at
//! drain time are contained per batch and reported through logs and operator
//! alerts instead of propagating.

use thiserror::Error;

use crate::render::RenderError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum NotificationError {
    /// Invalid deployment configuration, e.g. an unknown backend name.
    /// Always fail-fast.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A send referenced a notice type label that was never registered.
    #[error("unknown notice type \"{0}\"")]
    UnknownNoticeType(String),

    /// A requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Datastore failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Batch payload could not be encoded or decoded.
    #[error("payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Message rendering failure.
    #[error(transparent)]
    Render(#[from] RenderError),

    /// Host user directory failure. Distinct from a merely missing user,
    /// which the drain engine tolerates.
    #[error("user directory error: {0}")]
    Directory(#[source] anyhow::Error),

    /// A backend failed to hand a message to its transport.
    #[error("delivery failed: {0}")]
    Delivery(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, NotificationError>;
