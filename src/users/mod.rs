//! Host user integration: directory lookups and locale resolution.
//!
//! The engine never owns user accounts. Hosts implement [`UserDirectory`]
//! over their own account system; the in-memory implementation backs tests
//! and single-process deployments.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Snapshot of a host user as the engine needs it: stable id, display
/// username, optional delivery address and preferred locale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
    pub locale: Option<String>,
}

impl UserRef {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            email: None,
            locale: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }
}

impl std::fmt::Display for UserRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.username)
    }
}

/// Resolves user ids recorded in batches back to live users.
///
/// `Ok(None)` means the user no longer exists (deleted between queue and
/// drain) and is tolerated by the drain engine; `Err` signals an
/// infrastructure failure and aborts the batch.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn user_by_id(&self, user_id: &str) -> anyhow::Result<Option<UserRef>>;
}

/// Per-user locale resolution.
///
/// Implementations are fail-soft: any lookup failure is reported as `None`
/// and the dispatcher falls back to the configured default locale.
#[async_trait]
pub trait LocaleLookup: Send + Sync {
    async fn locale_for(&self, user_id: &str) -> Option<String>;
}

/// In-memory directory keyed by user id.
#[derive(Default)]
pub struct MemoryDirectory {
    users: DashMap<String, UserRef>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user: UserRef) {
        self.users.insert(user.id.clone(), user);
    }

    pub fn remove(&self, user_id: &str) {
        self.users.remove(user_id);
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn user_by_id(&self, user_id: &str) -> anyhow::Result<Option<UserRef>> {
        Ok(self.users.get(user_id).map(|entry| entry.value().clone()))
    }
}

/// Directory for deployments whose recipient ids are self-describing:
/// every id resolves to a user carrying that id as its username, with no
/// delivery address. Hosts with real accounts supply their own
/// [`UserDirectory`] instead.
pub struct PassthroughDirectory;

#[async_trait]
impl UserDirectory for PassthroughDirectory {
    async fn user_by_id(&self, user_id: &str) -> anyhow::Result<Option<UserRef>> {
        Ok(Some(UserRef::new(user_id, user_id)))
    }
}

/// Locale lookup that reads the locale stored on the directory's user record.
pub struct DirectoryLocales {
    directory: Arc<dyn UserDirectory>,
}

impl DirectoryLocales {
    pub fn new(directory: Arc<dyn UserDirectory>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl LocaleLookup for DirectoryLocales {
    async fn locale_for(&self, user_id: &str) -> Option<String> {
        match self.directory.user_by_id(user_id).await {
            Ok(Some(user)) => user.locale,
            _ => None,
        }
    }
}

/// Lookup for hosts without per-user locales; always defers to the default.
pub struct NoLocales;

#[async_trait]
impl LocaleLookup for NoLocales {
    async fn locale_for(&self, _user_id: &str) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_directory_lookup() {
        let directory = MemoryDirectory::new();
        directory.insert(UserRef::new("u1", "alice").with_email("alice@example.com"));

        let found = directory.user_by_id("u1").await.unwrap();
        assert_eq!(found.unwrap().username, "alice");

        let missing = directory.user_by_id("u2").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_passthrough_directory() {
        let directory = PassthroughDirectory;
        let user = directory.user_by_id("carol").await.unwrap().unwrap();
        assert_eq!(user.id, "carol");
        assert_eq!(user.username, "carol");
        assert!(user.email.is_none());
    }

    #[tokio::test]
    async fn test_directory_locales() {
        let directory = Arc::new(MemoryDirectory::new());
        directory.insert(UserRef::new("u1", "alice").with_locale("de"));
        directory.insert(UserRef::new("u2", "bob"));

        let locales = DirectoryLocales::new(directory);
        assert_eq!(locales.locale_for("u1").await, Some("de".to_string()));
        assert_eq!(locales.locale_for("u2").await, None);
        assert_eq!(locales.locale_for("ghost").await, None);
    }
}
