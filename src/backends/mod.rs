//! Delivery backends and the backend registry.
//!
//! A backend is one way of getting a notice to a user. Each backend carries
//! a sensitivity level (0 = urgent-only, 2 = routine); a backend delivers
//! by default when its sensitivity does not exceed the notice type's
//! default, and users can override per (type, backend) pair.
//!
//! The registry resolves configured names (including aliases) to backend
//! instances and fails fast on unknown names.

mod dummy;
mod email;
mod web;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::SiteConfig;
use crate::context::Context;
use crate::error::{NotificationError, Result};
use crate::model::{DeliveryFlags, NoticeType};
use crate::render::MessageRenderer;
use crate::store::NoticeStore;
use crate::users::UserRef;

pub use dummy::DummyBackend;
pub use email::{EmailBackend, LogMailer, Mailer};
pub use web::WebBackend;

/// Backends activated when the configuration names none.
pub const DEFAULT_BACKENDS: &[&str] = &["email", "web"];

/// Everything a backend needs to deliver one notice to one recipient.
pub struct Delivery<'a> {
    pub store: &'a dyn NoticeStore,
    pub renderer: &'a dyn MessageRenderer,
    pub site: &'a SiteConfig,
    pub recipient: &'a UserRef,
    pub sender: Option<&'a UserRef>,
    pub notice_type: &'a NoticeType,
    pub context: &'a Context,
    pub locale: &'a str,
    /// Whether the recipient's preference allows this backend. Only
    /// backends with `delivers_when_denied` are invoked with `false`.
    pub allowed: bool,
    /// Caller-supplied flags for this send.
    pub flags: &'a DeliveryFlags,
}

/// One way of delivering notices.
///
/// # Thread Safety
///
/// Backends are shared across async tasks via `Arc<dyn NotificationBackend>`
/// and must be `Send + Sync`.
#[async_trait]
pub trait NotificationBackend: Send + Sync {
    /// Stable registry name.
    fn slug(&self) -> &str;

    /// Human-readable name for preference UIs.
    fn display_name(&self) -> &str;

    /// Sensitivity level (0 = urgent-only, 2 = routine).
    fn sensitivity(&self) -> u8;

    /// Key under which preferences for this backend are stored. Two
    /// configured names resolving to the same path are the same backend.
    fn preference_path(&self) -> &str {
        self.slug()
    }

    /// Whether a fresh preference for this backend starts enabled.
    fn default_send(&self, notice_type: &NoticeType) -> bool {
        self.sensitivity() <= notice_type.default_sensitivity
    }

    /// Whether `deliver` should still run when the recipient opted out.
    /// Backends persisting a suppressed record (web) return true.
    fn delivers_when_denied(&self) -> bool {
        false
    }

    /// Deliver one notice. Returns whether the notice was actually
    /// delivered; false means the backend chose to skip.
    async fn deliver(&self, delivery: &Delivery<'_>) -> Result<bool>;
}

/// Resolves configured backend names to instances.
///
/// Unknown names are a configuration error: a deployment naming a backend
/// that does not exist should fail at startup, not silently drop
/// deliveries.
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn NotificationBackend>>,
    aliases: HashMap<String, String>,
}

impl BackendRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            aliases: HashMap::new(),
        }
    }

    /// A registry with the built-in backends (web, email, dummy) and their
    /// aliases registered.
    pub fn builtin(mailer: Arc<dyn Mailer>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(WebBackend::new()));
        registry.register(Arc::new(EmailBackend::new(mailer)));
        registry.register(Arc::new(DummyBackend::new()));
        registry.alias("on_site", "web");
        registry
    }

    /// Register a backend under its slug.
    pub fn register(&mut self, backend: Arc<dyn NotificationBackend>) {
        self.backends.insert(backend.slug().to_string(), backend);
    }

    /// Register an alternate name for an already-registered backend.
    pub fn alias(&mut self, alias: &str, slug: &str) {
        self.aliases.insert(alias.to_string(), slug.to_string());
    }

    /// Resolve one configured name.
    pub fn load(&self, name: &str) -> Result<Arc<dyn NotificationBackend>> {
        let slug = self.aliases.get(name).map(String::as_str).unwrap_or(name);
        self.backends.get(slug).cloned().ok_or_else(|| {
            NotificationError::Configuration(format!(
                "unknown notification backend \"{}\"",
                name
            ))
        })
    }

    /// Resolve a list of configured names, preserving order and dropping
    /// duplicates that share a preference path. An empty list resolves to
    /// `DEFAULT_BACKENDS`.
    pub fn load_all(&self, names: &[String]) -> Result<Vec<Arc<dyn NotificationBackend>>> {
        let names: Vec<&str> = if names.is_empty() {
            DEFAULT_BACKENDS.to_vec()
        } else {
            names.iter().map(String::as_str).collect()
        };

        let mut seen = HashSet::new();
        let mut backends = Vec::new();
        for name in names {
            let backend = self.load(name)?;
            if seen.insert(backend.preference_path().to_string()) {
                backends.push(backend);
            }
        }
        Ok(backends)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::builtin(Arc::new(LogMailer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_registry() -> BackendRegistry {
        BackendRegistry::builtin(Arc::new(LogMailer))
    }

    #[test]
    fn test_load_by_slug_and_alias() {
        let registry = create_test_registry();

        assert_eq!(registry.load("web").unwrap().slug(), "web");
        assert_eq!(registry.load("email").unwrap().slug(), "email");
        // Alias resolves to the same backend
        assert_eq!(registry.load("on_site").unwrap().slug(), "web");
    }

    #[test]
    fn test_unknown_backend_is_configuration_error() {
        let registry = create_test_registry();
        let result = registry.load("carrier_pigeon");
        assert!(matches!(
            result,
            Err(NotificationError::Configuration(_))
        ));
    }

    #[test]
    fn test_load_all_preserves_order_and_dedups() {
        let registry = create_test_registry();
        let names: Vec<String> = ["email", "on_site", "web", "email"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let backends = registry.load_all(&names).unwrap();
        let slugs: Vec<&str> = backends.iter().map(|b| b.slug()).collect();
        assert_eq!(slugs, vec!["email", "web"]);
    }

    #[test]
    fn test_load_all_empty_uses_default_set() {
        let registry = create_test_registry();

        let backends = registry.load_all(&[]).unwrap();
        let slugs: Vec<&str> = backends.iter().map(|b| b.slug()).collect();
        assert_eq!(slugs, vec!["email", "web"]);
    }

    #[test]
    fn test_load_all_fails_fast() {
        let registry = create_test_registry();
        let names: Vec<String> = ["email", "missing", "web"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(registry.load_all(&names).is_err());
    }

    #[test]
    fn test_default_send_threshold() {
        let web = WebBackend::new();
        let routine = NoticeType::new("routine", "Routine", "", 2);
        let quiet = NoticeType::new("quiet", "Quiet", "", 0);

        assert!(web.default_send(&routine));
        assert!(!web.default_send(&quiet));
    }
}
