//! Property values held by the room.

use serde::{Deserialize, Serialize};

/// A room property value.
///
/// The store treats values as opaque blobs; the two shapes here cover the
/// counters (plain integers) and the text-serialized state records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyValue {
    /// A plain integer (counters).
    Int(i64),
    /// A text blob (serialized records).
    Text(String),
}

impl PropertyValue {
    /// Get as integer, if this is an integer property.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Text(_) => None,
        }
    }

    /// Get as text, if this is a text property.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Int(_) => None,
        }
    }
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{}", v),
            Self::Text(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// A property change applied to a peer's local view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyChange {
    /// The property key.
    pub key: String,
    /// The value now visible locally.
    pub value: PropertyValue,
}
