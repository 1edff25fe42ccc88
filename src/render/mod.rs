//! Message rendering for notice delivery.
//!
//! Backends ask for rendered message parts by (notice type, part, locale).
//! The default renderer substitutes `{{variable}}` placeholders from the
//! notice context; hosts can register per-type and per-locale templates or
//! supply their own [`MessageRenderer`] entirely.

use dashmap::DashMap;
use thiserror::Error;

use crate::context::Context;

/// Which piece of a notice is being rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessagePart {
    /// The on-site listing line.
    Notice,
    /// The subject line for mail-like backends.
    Subject,
    /// The long-form body for mail-like backends.
    Body,
}

impl MessagePart {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessagePart::Notice => "notice",
            MessagePart::Subject => "subject",
            MessagePart::Body => "body",
        }
    }
}

impl std::fmt::Display for MessagePart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    /// No template is registered for this combination and no fallback exists.
    #[error("no template available for \"{label}\" part {part}")]
    Missing { label: String, part: MessagePart },

    /// A custom renderer failed to produce output.
    #[error("rendering \"{label}\" part {part} failed: {reason}")]
    Failed {
        label: String,
        part: MessagePart,
        reason: String,
    },
}

/// Renders one part of a notice for one recipient.
pub trait MessageRenderer: Send + Sync {
    fn render(
        &self,
        label: &str,
        part: MessagePart,
        locale: &str,
        context: &Context,
    ) -> Result<String, RenderError>;
}

const DEFAULT_NOTICE: &str = "{{notice}}";
const DEFAULT_SUBJECT: &str = "{{notice}}";
const DEFAULT_BODY: &str = "You have received the following notice:\n\n{{notice}}\n\nTo see other notices, visit {{protocol}}://{{current_site}}";

/// Keyed by (notice type label, part, locale). An empty label is the
/// any-type fallback; an empty locale is the any-locale fallback.
type TemplateKey = (String, MessagePart, String);

/// `{{variable}}`-substituting template renderer.
///
/// Lookup walks from most to least specific: (label, locale), (label, any),
/// (any, locale), (any, any). `with_defaults` seeds the any/any slot for
/// every part so rendering always succeeds out of the box.
pub struct TemplateRenderer {
    templates: DashMap<TemplateKey, String>,
}

impl TemplateRenderer {
    /// An empty renderer; rendering fails until templates are registered.
    pub fn new() -> Self {
        Self {
            templates: DashMap::new(),
        }
    }

    /// A renderer seeded with the built-in fallback templates.
    pub fn with_defaults() -> Self {
        let renderer = Self::new();
        renderer.register_default(MessagePart::Notice, "", DEFAULT_NOTICE);
        renderer.register_default(MessagePart::Subject, "", DEFAULT_SUBJECT);
        renderer.register_default(MessagePart::Body, "", DEFAULT_BODY);
        renderer
    }

    /// Register a template for one notice type. An empty `locale` applies
    /// to every locale without a more specific registration.
    pub fn register(
        &self,
        label: &str,
        part: MessagePart,
        locale: &str,
        template: impl Into<String>,
    ) {
        self.templates
            .insert((label.to_string(), part, locale.to_string()), template.into());
    }

    /// Register a fallback template used by every notice type without its
    /// own registration.
    pub fn register_default(&self, part: MessagePart, locale: &str, template: impl Into<String>) {
        self.register("", part, locale, template);
    }

    fn lookup(&self, label: &str, part: MessagePart, locale: &str) -> Option<String> {
        let candidates: [TemplateKey; 4] = [
            (label.to_string(), part, locale.to_string()),
            (label.to_string(), part, String::new()),
            (String::new(), part, locale.to_string()),
            (String::new(), part, String::new()),
        ];
        candidates
            .into_iter()
            .find_map(|key| self.templates.get(&key).map(|entry| entry.clone()))
    }
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl MessageRenderer for TemplateRenderer {
    fn render(
        &self,
        label: &str,
        part: MessagePart,
        locale: &str,
        context: &Context,
    ) -> Result<String, RenderError> {
        let template = self
            .lookup(label, part, locale)
            .ok_or_else(|| RenderError::Missing {
                label: label.to_string(),
                part,
            })?;
        Ok(substitute(&template, context))
    }
}

/// Substitute `{{variable}}` placeholders from the context.
fn substitute(template: &str, context: &Context) -> String {
    let mut result = template.to_string();

    // Find all {{variable}} patterns and replace them
    for (key, value) in context {
        let pattern = format!("{{{{{}}}}}", key);
        if result.contains(&pattern) {
            result = result.replace(&pattern, &value.to_display_string());
        }
    }

    result
}
