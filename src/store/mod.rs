//! Datastore abstraction for notices, preferences, batches, and
//! subscriptions.
//!
//! This module defines the storage trait the rest of the engine is written
//! against, allowing different implementations (memory, PostgreSQL) to be
//! used interchangeably. Batch payloads are opaque strings at this layer;
//! the store never interprets them.

mod memory;
mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use uuid::Uuid;

use crate::config::{DatabaseConfig, StoreConfig};
use crate::context::ObjectRef;
use crate::model::{NewNotice, Notice, NoticeBatch, NoticeFilter, NoticeType, ObservedItem, Preference};

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// PostgreSQL operation failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Stored column could not be decoded into its domain type
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Storage trait for the notification engine.
///
/// # Thread Safety
///
/// Implementations must be thread-safe (`Send + Sync`) as they are shared
/// across async tasks via `Arc<dyn NoticeStore>`.
///
/// # Semantics
///
/// Lookups return `Ok(None)` for missing records; `Err` is reserved for
/// infrastructure failures. Mutations that target a single record report
/// whether anything changed.
#[async_trait]
pub trait NoticeStore: Send + Sync {
    /// Fetch a notice type by its label.
    async fn notice_type(&self, label: &str) -> Result<Option<NoticeType>, StoreError>;

    /// Insert a new notice type. The label must not already exist.
    async fn insert_notice_type(&self, notice_type: &NoticeType) -> Result<(), StoreError>;

    /// Replace the stored definition for an existing label.
    async fn update_notice_type(&self, notice_type: &NoticeType) -> Result<bool, StoreError>;

    /// All registered notice types, ordered by label.
    async fn notice_types(&self) -> Result<Vec<NoticeType>, StoreError>;

    /// Fetch the stored preference row for one (user, type, backend) triple.
    async fn preference(
        &self,
        user_id: &str,
        notice_type: &str,
        backend_path: &str,
    ) -> Result<Option<Preference>, StoreError>;

    /// Fetch the preference row, materializing it with `default_send` on
    /// first touch.
    ///
    /// # Returns
    ///
    /// The preference and whether this call created it.
    async fn get_or_create_preference(
        &self,
        user_id: &str,
        notice_type: &str,
        backend_path: &str,
        default_send: bool,
    ) -> Result<(Preference, bool), StoreError>;

    /// Upsert an explicit opt-in/opt-out.
    async fn set_preference(
        &self,
        user_id: &str,
        notice_type: &str,
        backend_path: &str,
        send: bool,
    ) -> Result<Preference, StoreError>;

    /// All stored preference rows for a user.
    async fn preferences_for(&self, user_id: &str) -> Result<Vec<Preference>, StoreError>;

    /// Persist a new notice. The store assigns the id, marks it unseen and
    /// unarchived, and defaults `created_at` to now.
    async fn create_notice(&self, new: NewNotice) -> Result<Notice, StoreError>;

    /// Fetch a single notice by id.
    async fn notice(&self, id: Uuid) -> Result<Option<Notice>, StoreError>;

    /// List a user's notices, newest first. The filter selects mailbox
    /// side, whether archived notices are included, and optional
    /// unseen/on-site restrictions.
    async fn notices_for(
        &self,
        user_id: &str,
        filter: &NoticeFilter,
    ) -> Result<Vec<Notice>, StoreError>;

    /// Count of unseen notices addressed to a user.
    async fn unseen_count_for(&self, user_id: &str) -> Result<u64, StoreError>;

    /// Mark one notice seen. Returns false if it was missing or already seen.
    async fn mark_seen(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Mark every unseen notice for a recipient seen, returning the count.
    async fn mark_all_seen(&self, user_id: &str) -> Result<u64, StoreError>;

    /// Archive a notice, hiding it from listings.
    async fn archive_notice(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Delete a notice outright.
    async fn delete_notice(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Delete seen notices created before `cutoff`. Unseen notices are
    /// never touched regardless of age.
    ///
    /// # Returns
    ///
    /// The number of notices removed.
    async fn delete_obsolete_notices(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Persist an opaque batch payload for later draining.
    async fn create_batch(&self, payload: String) -> Result<NoticeBatch, StoreError>;

    /// Fetch a single batch by id.
    async fn batch(&self, id: Uuid) -> Result<Option<NoticeBatch>, StoreError>;

    /// All pending batches, newest first.
    async fn pending_batches(&self) -> Result<Vec<NoticeBatch>, StoreError>;

    /// Remove a fully-processed batch. Returns false if already gone.
    async fn delete_batch(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Persist a subscription.
    async fn create_observed_item(&self, item: ObservedItem) -> Result<(), StoreError>;

    /// All subscriptions watching `target` for `signal`, oldest first.
    async fn observed_items(
        &self,
        target: &ObjectRef,
        signal: &str,
    ) -> Result<Vec<ObservedItem>, StoreError>;

    /// Subscriptions one user holds on `target` for `signal`. Duplicates
    /// are possible and all are returned.
    async fn observed_items_for_user(
        &self,
        target: &ObjectRef,
        user_id: &str,
        signal: &str,
    ) -> Result<Vec<ObservedItem>, StoreError>;

    /// Remove a subscription by id.
    async fn delete_observed_item(&self, id: Uuid) -> Result<bool, StoreError>;
}

/// Create a notice store based on configuration.
///
/// Returns the implementation selected by the `backend` setting:
/// - `"postgres"`: connects a pool with the configured database settings
/// - `"memory"` (default): process-local store, lost on restart
pub async fn create_store(
    store: &StoreConfig,
    database: &DatabaseConfig,
) -> Result<Arc<dyn NoticeStore>, StoreError> {
    match store.backend.as_str() {
        "postgres" => {
            let pool = PgPoolOptions::new()
                .max_connections(database.max_connections)
                .connect(&database.url)
                .await?;
            tracing::info!(backend = "postgres", "Creating PostgreSQL notice store");
            Ok(Arc::new(PostgresStore::new(pool)))
        }
        other => {
            if other != "memory" {
                tracing::warn!(
                    backend = %other,
                    "Unknown store backend, falling back to memory"
                );
            } else {
                tracing::info!(backend = "memory", "Creating in-memory notice store");
            }
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
