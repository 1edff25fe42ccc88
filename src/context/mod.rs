//! Structured render/payload context carried by every notice.
//!
//! The envelope is a self-contained tagged union so batch payloads survive
//! round-trips through any datastore without depending on host types:
//! primitives, nested lists/maps, and typed by-id references to arbitrary
//! host objects (`ObjectRef`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Render context: ordered map of named values merged from the dispatcher
/// (recipient, sender, site metadata) and the caller's extra context.
pub type Context = BTreeMap<String, ContextValue>;

/// A non-owning reference to a host-side object, stored as a
/// (kind, id) pair. The referenced object's lifecycle belongs to the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Host-defined type discriminator (e.g. "blog.post").
    pub kind: String,
    /// Host-defined object identifier.
    pub id: String,
}

impl ObjectRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// A single context value.
///
/// Adjacently tagged so the serialized form is unambiguous and portable
/// across store implementations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ContextValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<ContextValue>),
    Map(BTreeMap<String, ContextValue>),
    Object(ObjectRef),
}

impl ContextValue {
    /// Inline text rendering used for template substitution: strings verbatim,
    /// scalars via `Display`, null as empty, structured values as JSON.
    pub fn to_display_string(&self) -> String {
        match self {
            ContextValue::Null => String::new(),
            ContextValue::Bool(b) => b.to_string(),
            ContextValue::Int(i) => i.to_string(),
            ContextValue::Float(f) => f.to_string(),
            ContextValue::Text(s) => s.clone(),
            ContextValue::Object(obj) => obj.to_string(),
            other => serde_json::to_string(other).unwrap_or_default(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContextValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            ContextValue::Object(obj) => Some(obj),
            _ => None,
        }
    }
}

impl From<bool> for ContextValue {
    fn from(v: bool) -> Self {
        ContextValue::Bool(v)
    }
}

impl From<i64> for ContextValue {
    fn from(v: i64) -> Self {
        ContextValue::Int(v)
    }
}

impl From<f64> for ContextValue {
    fn from(v: f64) -> Self {
        ContextValue::Float(v)
    }
}

impl From<&str> for ContextValue {
    fn from(v: &str) -> Self {
        ContextValue::Text(v.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(v: String) -> Self {
        ContextValue::Text(v)
    }
}

impl From<ObjectRef> for ContextValue {
    fn from(v: ObjectRef) -> Self {
        ContextValue::Object(v)
    }
}

impl From<Vec<ContextValue>> for ContextValue {
    fn from(v: Vec<ContextValue>) -> Self {
        ContextValue::List(v)
    }
}
