//! PostgreSQL-based notice store.
//!
//! This module provides a persistent implementation of the `NoticeStore`
//! trait. Batch payloads are stored as opaque text; notice data, related
//! references and observation targets are stored as JSONB.
//!
//! Table structure (see `migrations/0001_init.sql`):
//! - `notice_types` - Registered notice types keyed by label
//! - `notice_preferences` - Per-user delivery preferences
//! - `notices` - Delivered and suppressed notices
//! - `notice_batches` - Pending queued batches, ordered by insertion
//! - `observed_items` - Subscriptions on host objects

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::context::ObjectRef;
use crate::model::{
    NewNotice, Notice, NoticeBatch, NoticeFilter, NoticeType, ObservedItem, Preference,
};

use super::{NoticeStore, StoreError};

type NoticeRow = (
    Uuid,
    String,
    Option<String>,
    String,
    String,
    DateTime<Utc>,
    bool,
    bool,
    bool,
    serde_json::Value,
    Option<serde_json::Value>,
);

type PreferenceRow = (Uuid, String, String, String, bool);

type ObservedRow = (Uuid, serde_json::Value, String, String, String, DateTime<Utc>);

fn notice_from_row(row: NoticeRow) -> Result<Notice, StoreError> {
    let (id, recipient, sender, notice_type, message, created_at, unseen, archived, on_site, data, related) =
        row;
    Ok(Notice {
        id,
        recipient,
        sender,
        notice_type,
        message,
        created_at,
        unseen,
        archived,
        on_site,
        data: serde_json::from_value(data)?,
        related: related.map(serde_json::from_value).transpose()?,
    })
}

fn preference_from_row(row: PreferenceRow) -> Preference {
    let (id, user_id, notice_type, backend_path, send) = row;
    Preference {
        id,
        user_id,
        notice_type,
        backend_path,
        send,
    }
}

fn observed_from_row(row: ObservedRow) -> Option<ObservedItem> {
    let (id, target, user_id, notice_type, signal, added) = row;
    match serde_json::from_value::<ObjectRef>(target) {
        Ok(target) => Some(ObservedItem {
            id,
            target,
            user_id,
            notice_type,
            signal,
            added,
        }),
        Err(e) => {
            tracing::warn!(
                item_id = %id,
                error = %e,
                "Failed to decode observed item target, skipping"
            );
            None
        }
    }
}

/// PostgreSQL-based notice store.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NoticeStore for PostgresStore {
    async fn notice_type(&self, label: &str) -> Result<Option<NoticeType>, StoreError> {
        let row: Option<(String, String, String, i16)> = sqlx::query_as(
            "SELECT label, display, description, default_sensitivity FROM notice_types WHERE label = $1",
        )
        .bind(label)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(label, display, description, default_sensitivity)| NoticeType {
            label,
            display,
            description,
            default_sensitivity: default_sensitivity as u8,
        }))
    }

    async fn insert_notice_type(&self, notice_type: &NoticeType) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO notice_types (label, display, description, default_sensitivity)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&notice_type.label)
        .bind(&notice_type.display)
        .bind(&notice_type.description)
        .bind(notice_type.default_sensitivity as i16)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_notice_type(&self, notice_type: &NoticeType) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE notice_types
            SET display = $2, description = $3, default_sensitivity = $4
            WHERE label = $1
            "#,
        )
        .bind(&notice_type.label)
        .bind(&notice_type.display)
        .bind(&notice_type.description)
        .bind(notice_type.default_sensitivity as i16)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn notice_types(&self) -> Result<Vec<NoticeType>, StoreError> {
        let rows: Vec<(String, String, String, i16)> = sqlx::query_as(
            "SELECT label, display, description, default_sensitivity FROM notice_types ORDER BY label",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(label, display, description, default_sensitivity)| NoticeType {
                label,
                display,
                description,
                default_sensitivity: default_sensitivity as u8,
            })
            .collect())
    }

    async fn preference(
        &self,
        user_id: &str,
        notice_type: &str,
        backend_path: &str,
    ) -> Result<Option<Preference>, StoreError> {
        let row: Option<PreferenceRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, notice_type, backend_path, send
            FROM notice_preferences
            WHERE user_id = $1 AND notice_type = $2 AND backend_path = $3
            "#,
        )
        .bind(user_id)
        .bind(notice_type)
        .bind(backend_path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(preference_from_row))
    }

    async fn get_or_create_preference(
        &self,
        user_id: &str,
        notice_type: &str,
        backend_path: &str,
        default_send: bool,
    ) -> Result<(Preference, bool), StoreError> {
        // Insert-if-absent; the RETURNING row is only produced on insert.
        let inserted: Option<PreferenceRow> = sqlx::query_as(
            r#"
            INSERT INTO notice_preferences (id, user_id, notice_type, backend_path, send)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, notice_type, backend_path) DO NOTHING
            RETURNING id, user_id, notice_type, backend_path, send
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(notice_type)
        .bind(backend_path)
        .bind(default_send)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((preference_from_row(row), true));
        }

        let row: PreferenceRow = sqlx::query_as(
            r#"
            SELECT id, user_id, notice_type, backend_path, send
            FROM notice_preferences
            WHERE user_id = $1 AND notice_type = $2 AND backend_path = $3
            "#,
        )
        .bind(user_id)
        .bind(notice_type)
        .bind(backend_path)
        .fetch_one(&self.pool)
        .await?;

        Ok((preference_from_row(row), false))
    }

    async fn set_preference(
        &self,
        user_id: &str,
        notice_type: &str,
        backend_path: &str,
        send: bool,
    ) -> Result<Preference, StoreError> {
        let row: PreferenceRow = sqlx::query_as(
            r#"
            INSERT INTO notice_preferences (id, user_id, notice_type, backend_path, send)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, notice_type, backend_path)
            DO UPDATE SET send = EXCLUDED.send
            RETURNING id, user_id, notice_type, backend_path, send
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(notice_type)
        .bind(backend_path)
        .bind(send)
        .fetch_one(&self.pool)
        .await?;

        Ok(preference_from_row(row))
    }

    async fn preferences_for(&self, user_id: &str) -> Result<Vec<Preference>, StoreError> {
        let rows: Vec<PreferenceRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, notice_type, backend_path, send
            FROM notice_preferences
            WHERE user_id = $1
            ORDER BY notice_type, backend_path
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(preference_from_row).collect())
    }

    async fn create_notice(&self, new: NewNotice) -> Result<Notice, StoreError> {
        let created_at = new.created_at.unwrap_or_else(Utc::now);
        let data = serde_json::to_value(&new.data)?;
        let related = new.related.as_ref().map(serde_json::to_value).transpose()?;
        let row: NoticeRow = sqlx::query_as(
            r#"
            INSERT INTO notices
                (id, recipient, sender, notice_type, message, created_at, unseen, archived, on_site, data, related)
            VALUES ($1, $2, $3, $4, $5, $6, TRUE, FALSE, $7, $8, $9)
            RETURNING id, recipient, sender, notice_type, message, created_at, unseen, archived, on_site, data, related
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.recipient)
        .bind(&new.sender)
        .bind(&new.notice_type)
        .bind(&new.message)
        .bind(created_at)
        .bind(new.on_site)
        .bind(&data)
        .bind(&related)
        .fetch_one(&self.pool)
        .await?;

        notice_from_row(row)
    }

    async fn notice(&self, id: Uuid) -> Result<Option<Notice>, StoreError> {
        let row: Option<NoticeRow> = sqlx::query_as(
            r#"
            SELECT id, recipient, sender, notice_type, message, created_at, unseen, archived, on_site, data, related
            FROM notices
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(notice_from_row).transpose()
    }

    async fn notices_for(
        &self,
        user_id: &str,
        filter: &NoticeFilter,
    ) -> Result<Vec<Notice>, StoreError> {
        let rows: Vec<NoticeRow> = sqlx::query_as(
            r#"
            SELECT id, recipient, sender, notice_type, message, created_at, unseen, archived, on_site, data, related
            FROM notices
            WHERE ($5::BOOLEAN OR archived = FALSE)
              AND (($1::TEXT = 'received' AND recipient = $2)
                OR ($1::TEXT = 'sent' AND sender = $2))
              AND ($3::BOOLEAN IS NULL OR unseen = $3)
              AND ($4::BOOLEAN IS NULL OR on_site = $4)
            ORDER BY created_at DESC, seq DESC
            "#,
        )
        .bind(filter.mailbox.as_str())
        .bind(user_id)
        .bind(filter.unseen)
        .bind(filter.on_site)
        .bind(filter.archived)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(notice_from_row).collect()
    }

    async fn unseen_count_for(&self, user_id: &str) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM notices WHERE recipient = $1 AND unseen = TRUE",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count as u64)
    }

    async fn mark_seen(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE notices SET unseen = FALSE WHERE id = $1 AND unseen = TRUE")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_all_seen(&self, user_id: &str) -> Result<u64, StoreError> {
        let result =
            sqlx::query("UPDATE notices SET unseen = FALSE WHERE recipient = $1 AND unseen = TRUE")
                .bind(user_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }

    async fn archive_notice(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE notices SET archived = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_notice(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM notices WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_obsolete_notices(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result =
            sqlx::query("DELETE FROM notices WHERE unseen = FALSE AND created_at < $1")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }

    async fn create_batch(&self, payload: String) -> Result<NoticeBatch, StoreError> {
        let row: (Uuid, String, DateTime<Utc>) = sqlx::query_as(
            r#"
            INSERT INTO notice_batches (id, payload, created_at)
            VALUES ($1, $2, NOW())
            RETURNING id, payload, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;

        Ok(NoticeBatch {
            id: row.0,
            payload: row.1,
            created_at: row.2,
        })
    }

    async fn batch(&self, id: Uuid) -> Result<Option<NoticeBatch>, StoreError> {
        let row: Option<(Uuid, String, DateTime<Utc>)> =
            sqlx::query_as("SELECT id, payload, created_at FROM notice_batches WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(id, payload, created_at)| NoticeBatch {
            id,
            payload,
            created_at,
        }))
    }

    async fn pending_batches(&self) -> Result<Vec<NoticeBatch>, StoreError> {
        let rows: Vec<(Uuid, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT id, payload, created_at FROM notice_batches ORDER BY seq DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, payload, created_at)| NoticeBatch {
                id,
                payload,
                created_at,
            })
            .collect())
    }

    async fn delete_batch(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM notice_batches WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn create_observed_item(&self, item: ObservedItem) -> Result<(), StoreError> {
        let target = serde_json::to_value(&item.target)?;
        sqlx::query(
            r#"
            INSERT INTO observed_items (id, target, user_id, notice_type, signal, added)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(item.id)
        .bind(&target)
        .bind(&item.user_id)
        .bind(&item.notice_type)
        .bind(&item.signal)
        .bind(item.added)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn observed_items(
        &self,
        target: &ObjectRef,
        signal: &str,
    ) -> Result<Vec<ObservedItem>, StoreError> {
        let target = serde_json::to_value(target)?;
        let rows: Vec<ObservedRow> = sqlx::query_as(
            r#"
            SELECT id, target, user_id, notice_type, signal, added
            FROM observed_items
            WHERE target = $1 AND signal = $2
            ORDER BY added ASC, id ASC
            "#,
        )
        .bind(&target)
        .bind(signal)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().filter_map(observed_from_row).collect())
    }

    async fn observed_items_for_user(
        &self,
        target: &ObjectRef,
        user_id: &str,
        signal: &str,
    ) -> Result<Vec<ObservedItem>, StoreError> {
        let target = serde_json::to_value(target)?;
        let rows: Vec<ObservedRow> = sqlx::query_as(
            r#"
            SELECT id, target, user_id, notice_type, signal, added
            FROM observed_items
            WHERE target = $1 AND user_id = $2 AND signal = $3
            ORDER BY added ASC, id ASC
            "#,
        )
        .bind(&target)
        .bind(user_id)
        .bind(signal)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().filter_map(observed_from_row).collect())
    }

    async fn delete_observed_item(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM observed_items WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
