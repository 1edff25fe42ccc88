//! In-memory notice store using DashMap.
//!
//! Backs tests and single-process deployments. All records are lost on
//! restart; durable deployments should use the PostgreSQL store.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::context::ObjectRef;
use crate::model::{
    Mailbox, NewNotice, Notice, NoticeBatch, NoticeFilter, NoticeType, ObservedItem, Preference,
};

use super::{NoticeStore, StoreError};

type PreferenceKey = (String, String, String);

/// In-memory notice store.
///
/// Uses `DashMap` for concurrent access. Insertion order is tracked with a
/// monotonic counter so listings stay stable when timestamps collide.
#[derive(Default)]
pub struct MemoryStore {
    notice_types: DashMap<String, NoticeType>,
    /// Keyed by (user_id, notice_type, backend_path).
    preferences: DashMap<PreferenceKey, Preference>,
    notices: DashMap<Uuid, (u64, Notice)>,
    batches: DashMap<Uuid, (u64, NoticeBatch)>,
    observed: DashMap<Uuid, ObservedItem>,
    insert_seq: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&self) -> u64 {
        self.insert_seq.fetch_add(1, Ordering::Relaxed)
    }
}

fn matches_filter(notice: &Notice, user_id: &str, filter: &NoticeFilter) -> bool {
    let mailbox_ok = match filter.mailbox {
        Mailbox::Received => notice.recipient == user_id,
        Mailbox::Sent => notice.sender.as_deref() == Some(user_id),
    };
    mailbox_ok
        && (filter.archived || !notice.archived)
        && filter.unseen.map_or(true, |unseen| notice.unseen == unseen)
        && filter.on_site.map_or(true, |on_site| notice.on_site == on_site)
}

#[async_trait]
impl NoticeStore for MemoryStore {
    async fn notice_type(&self, label: &str) -> Result<Option<NoticeType>, StoreError> {
        Ok(self.notice_types.get(label).map(|entry| entry.clone()))
    }

    async fn insert_notice_type(&self, notice_type: &NoticeType) -> Result<(), StoreError> {
        self.notice_types
            .insert(notice_type.label.clone(), notice_type.clone());
        Ok(())
    }

    async fn update_notice_type(&self, notice_type: &NoticeType) -> Result<bool, StoreError> {
        match self.notice_types.get_mut(&notice_type.label) {
            Some(mut entry) => {
                *entry = notice_type.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn notice_types(&self) -> Result<Vec<NoticeType>, StoreError> {
        let mut types: Vec<NoticeType> = self
            .notice_types
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        types.sort_by(|a, b| a.label.cmp(&b.label));
        Ok(types)
    }

    async fn preference(
        &self,
        user_id: &str,
        notice_type: &str,
        backend_path: &str,
    ) -> Result<Option<Preference>, StoreError> {
        let key = (
            user_id.to_string(),
            notice_type.to_string(),
            backend_path.to_string(),
        );
        Ok(self.preferences.get(&key).map(|entry| entry.clone()))
    }

    async fn get_or_create_preference(
        &self,
        user_id: &str,
        notice_type: &str,
        backend_path: &str,
        default_send: bool,
    ) -> Result<(Preference, bool), StoreError> {
        let key = (
            user_id.to_string(),
            notice_type.to_string(),
            backend_path.to_string(),
        );
        match self.preferences.entry(key) {
            Entry::Occupied(entry) => Ok((entry.get().clone(), false)),
            Entry::Vacant(entry) => {
                let preference = Preference {
                    id: Uuid::new_v4(),
                    user_id: user_id.to_string(),
                    notice_type: notice_type.to_string(),
                    backend_path: backend_path.to_string(),
                    send: default_send,
                };
                entry.insert(preference.clone());
                Ok((preference, true))
            }
        }
    }

    async fn set_preference(
        &self,
        user_id: &str,
        notice_type: &str,
        backend_path: &str,
        send: bool,
    ) -> Result<Preference, StoreError> {
        let key = (
            user_id.to_string(),
            notice_type.to_string(),
            backend_path.to_string(),
        );
        match self.preferences.entry(key) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().send = send;
                Ok(entry.get().clone())
            }
            Entry::Vacant(entry) => {
                let preference = Preference {
                    id: Uuid::new_v4(),
                    user_id: user_id.to_string(),
                    notice_type: notice_type.to_string(),
                    backend_path: backend_path.to_string(),
                    send,
                };
                entry.insert(preference.clone());
                Ok(preference)
            }
        }
    }

    async fn preferences_for(&self, user_id: &str) -> Result<Vec<Preference>, StoreError> {
        let mut preferences: Vec<Preference> = self
            .preferences
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| entry.value().clone())
            .collect();
        preferences.sort_by(|a, b| {
            (&a.notice_type, &a.backend_path).cmp(&(&b.notice_type, &b.backend_path))
        });
        Ok(preferences)
    }

    async fn create_notice(&self, new: NewNotice) -> Result<Notice, StoreError> {
        let notice = Notice {
            id: Uuid::new_v4(),
            recipient: new.recipient,
            sender: new.sender,
            notice_type: new.notice_type,
            message: new.message,
            created_at: new.created_at.unwrap_or_else(Utc::now),
            unseen: true,
            archived: false,
            on_site: new.on_site,
            data: new.data,
            related: new.related,
        };
        self.notices
            .insert(notice.id, (self.next_seq(), notice.clone()));
        Ok(notice)
    }

    async fn notice(&self, id: Uuid) -> Result<Option<Notice>, StoreError> {
        Ok(self.notices.get(&id).map(|entry| entry.1.clone()))
    }

    async fn notices_for(
        &self,
        user_id: &str,
        filter: &NoticeFilter,
    ) -> Result<Vec<Notice>, StoreError> {
        let mut matched: Vec<(u64, Notice)> = self
            .notices
            .iter()
            .filter(|entry| matches_filter(&entry.1, user_id, filter))
            .map(|entry| entry.value().clone())
            .collect();
        // Newest first
        matched.sort_by(|a, b| (b.1.created_at, b.0).cmp(&(a.1.created_at, a.0)));
        Ok(matched.into_iter().map(|(_, notice)| notice).collect())
    }

    async fn unseen_count_for(&self, user_id: &str) -> Result<u64, StoreError> {
        let count = self
            .notices
            .iter()
            .filter(|entry| entry.1.recipient == user_id && entry.1.unseen)
            .count();
        Ok(count as u64)
    }

    async fn mark_seen(&self, id: Uuid) -> Result<bool, StoreError> {
        match self.notices.get_mut(&id) {
            Some(mut entry) if entry.1.unseen => {
                entry.1.unseen = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_all_seen(&self, user_id: &str) -> Result<u64, StoreError> {
        let mut updated = 0;
        for mut entry in self.notices.iter_mut() {
            if entry.1.recipient == user_id && entry.1.unseen {
                entry.1.unseen = false;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn archive_notice(&self, id: Uuid) -> Result<bool, StoreError> {
        match self.notices.get_mut(&id) {
            Some(mut entry) => {
                entry.1.archived = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_notice(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.notices.remove(&id).is_some())
    }

    async fn delete_obsolete_notices(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let obsolete: Vec<Uuid> = self
            .notices
            .iter()
            .filter(|entry| entry.1.is_obsolete(cutoff))
            .map(|entry| *entry.key())
            .collect();
        let mut deleted = 0;
        for id in obsolete {
            if self.notices.remove(&id).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn create_batch(&self, payload: String) -> Result<NoticeBatch, StoreError> {
        let batch = NoticeBatch {
            id: Uuid::new_v4(),
            payload,
            created_at: Utc::now(),
        };
        self.batches
            .insert(batch.id, (self.next_seq(), batch.clone()));
        Ok(batch)
    }

    async fn batch(&self, id: Uuid) -> Result<Option<NoticeBatch>, StoreError> {
        Ok(self.batches.get(&id).map(|entry| entry.1.clone()))
    }

    async fn pending_batches(&self) -> Result<Vec<NoticeBatch>, StoreError> {
        let mut batches: Vec<(u64, NoticeBatch)> = self
            .batches
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        // Newest first
        batches.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(batches.into_iter().map(|(_, batch)| batch).collect())
    }

    async fn delete_batch(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.batches.remove(&id).is_some())
    }

    async fn create_observed_item(&self, item: ObservedItem) -> Result<(), StoreError> {
        self.observed.insert(item.id, item);
        Ok(())
    }

    async fn observed_items(
        &self,
        target: &ObjectRef,
        signal: &str,
    ) -> Result<Vec<ObservedItem>, StoreError> {
        let mut items: Vec<ObservedItem> = self
            .observed
            .iter()
            .filter(|entry| entry.target == *target && entry.signal == signal)
            .map(|entry| entry.value().clone())
            .collect();
        items.sort_by(|a, b| (a.added, a.id).cmp(&(b.added, b.id)));
        Ok(items)
    }

    async fn observed_items_for_user(
        &self,
        target: &ObjectRef,
        user_id: &str,
        signal: &str,
    ) -> Result<Vec<ObservedItem>, StoreError> {
        let mut items: Vec<ObservedItem> = self
            .observed
            .iter()
            .filter(|entry| {
                entry.target == *target && entry.user_id == user_id && entry.signal == signal
            })
            .map(|entry| entry.value().clone())
            .collect();
        items.sort_by(|a, b| (a.added, a.id).cmp(&(b.added, b.id)));
        Ok(items)
    }

    async fn delete_observed_item(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.observed.remove(&id).is_some())
    }
}
