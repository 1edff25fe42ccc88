//! Core domain types shared across stores, dispatch, and the drain engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::{Context, ObjectRef};

/// A registered kind of event users can be notified about.
///
/// `label` is the stable machine key; `display` and `description` feed
/// rendered output. `default_sensitivity` is the threshold used to derive
/// implicit per-backend preferences: a backend delivers by default when its
/// own sensitivity does not exceed this value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticeType {
    pub label: String,
    pub display: String,
    pub description: String,
    pub default_sensitivity: u8,
}

impl NoticeType {
    pub fn new(
        label: impl Into<String>,
        display: impl Into<String>,
        description: impl Into<String>,
        default_sensitivity: u8,
    ) -> Self {
        Self {
            label: label.into(),
            display: display.into(),
            description: description.into(),
            default_sensitivity,
        }
    }
}

/// A user's explicit opt-in/opt-out for one (notice type, backend) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preference {
    pub id: Uuid,
    pub user_id: String,
    pub notice_type: String,
    pub backend_path: String,
    pub send: bool,
}

/// Per-send flags riding along with a notice, immediate or queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryFlags {
    /// Whether a permitted on-site notice should appear in the feed.
    /// False persists it as archive-only regardless of preference.
    #[serde(default = "default_on_site")]
    pub on_site: bool,
    /// Host object this notice is about, carried onto the stored notice.
    #[serde(default)]
    pub related: Option<ObjectRef>,
}

fn default_on_site() -> bool {
    true
}

impl Default for DeliveryFlags {
    fn default() -> Self {
        Self {
            on_site: true,
            related: None,
        }
    }
}

impl DeliveryFlags {
    /// Flags tying the notice to a host object.
    pub fn related(target: ObjectRef) -> Self {
        Self {
            related: Some(target),
            ..Self::default()
        }
    }
}

/// A delivered (or suppressed) on-site notice as persisted for a recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub id: Uuid,
    pub recipient: String,
    pub sender: Option<String>,
    pub notice_type: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub unseen: bool,
    pub archived: bool,
    /// False when the recipient opted out of on-site delivery or the caller
    /// sent with `on_site: false`; such notices are persisted but hidden
    /// from on-site listings.
    pub on_site: bool,
    /// The render context captured at delivery. Stored opaquely, never
    /// queried.
    pub data: Context,
    /// Non-owning reference to the host object this notice is about.
    pub related: Option<ObjectRef>,
}

impl Notice {
    /// Obsolete notices are eligible for the retention sweep: already seen
    /// and older than the cutoff.
    pub fn is_obsolete(&self, cutoff: DateTime<Utc>) -> bool {
        !self.unseen && self.created_at < cutoff
    }
}

/// Parameters for persisting a new notice. The store assigns the id, marks
/// the notice unseen and unarchived, and defaults `created_at` to now.
#[derive(Debug, Clone)]
pub struct NewNotice {
    pub recipient: String,
    pub sender: Option<String>,
    pub notice_type: String,
    pub message: String,
    pub on_site: bool,
    pub data: Context,
    pub related: Option<ObjectRef>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Which side of a notice a listing query selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mailbox {
    Received,
    Sent,
}

impl Mailbox {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mailbox::Received => "received",
            Mailbox::Sent => "sent",
        }
    }
}

/// Listing filter for `notices_for`. `archived = false` (the default)
/// hides archived notices; `true` includes them alongside the rest.
#[derive(Debug, Clone, Copy)]
pub struct NoticeFilter {
    pub mailbox: Mailbox,
    pub archived: bool,
    pub unseen: Option<bool>,
    pub on_site: Option<bool>,
}

impl NoticeFilter {
    pub fn received() -> Self {
        Self {
            mailbox: Mailbox::Received,
            archived: false,
            unseen: None,
            on_site: None,
        }
    }

    pub fn sent() -> Self {
        Self {
            mailbox: Mailbox::Sent,
            archived: false,
            unseen: None,
            on_site: None,
        }
    }

    pub fn archived(mut self, archived: bool) -> Self {
        self.archived = archived;
        self
    }

    pub fn unseen(mut self, unseen: bool) -> Self {
        self.unseen = Some(unseen);
        self
    }

    pub fn on_site(mut self, on_site: bool) -> Self {
        self.on_site = Some(on_site);
        self
    }
}

/// One deferred send inside a batch: the arguments an immediate send would
/// have received, one recipient per entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedNotice {
    pub user_id: String,
    pub label: String,
    #[serde(default)]
    pub context: Context,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub flags: DeliveryFlags,
}

/// A durable batch of queued notices. `payload` is the opaque serialized
/// form of `Vec<QueuedNotice>`; the store never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticeBatch {
    pub id: Uuid,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

/// A subscription: deliver `notice_type` to `user_id` whenever `signal`
/// fires against the target object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedItem {
    pub id: Uuid,
    pub target: ObjectRef,
    pub user_id: String,
    pub notice_type: String,
    pub signal: String,
    pub added: DateTime<Utc>,
}
