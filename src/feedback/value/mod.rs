
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// An extracted field value.
///
/// Untagged so that plain JSON strings, arrays and objects map onto the
/// three kinds directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Scalar(String),
    List(Vec<String>),
    Structured(BTreeMap<String, FieldValue>),
}

impl Default for FieldValue {
    #[inline]
    fn default() -> Self {
        Self::Scalar(String::new())
    }
}

impl From<&str> for FieldValue {
    #[inline]
    fn from(value: &str) -> Self {
        Self::Scalar(value.to_string())
    }
}

impl From<String> for FieldValue {
    #[inline]
    fn from(value: String) -> Self {
        Self::Scalar(value)
    }
}

impl From<Vec<String>> for FieldValue {
    #[inline]
    fn from(values: Vec<String>) -> Self {
        Self::List(values)
    }
}

impl FieldValue {
    /// Flattened text used for similarity, features and diffs.
    ///
    /// Lists are joined with `", "`; structured values render as
    /// `key: value` pairs in key order separated by `"; "`.
    #[inline]
    pub fn as_text(&self) -> String {
        match self {
            Self::Scalar(text) => text.clone(),
            Self::List(items) => items.join(", "),
            Self::Structured(fields) => fields
                .iter()
                .filter(|(_, value)| !value.is_empty())
                .map(|(key, value)| format!("{key}: {}", value.as_text()))
                .collect::<Vec<_>>()
                .join("; "),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Scalar(text) => text.trim().is_empty(),
            Self::List(items) => items.iter().all(|item| item.trim().is_empty()),
            Self::Structured(fields) => fields.values().all(Self::is_empty),
        }
    }

    /// Merges `other` into a copy of `self`.
    ///
    /// Scalars take `other`. Lists keep `self`'s order and append unseen
    /// items from `other`. Structured values merge key by key. When the
    /// kinds differ `other` wins.
    #[inline]
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::List(ours), Self::List(theirs)) => {
                let mut merged = ours.clone();
                for item in theirs {
                    if !merged.contains(item) {
                        merged.push(item.clone());
                    }
                }
                Self::List(merged)
            }
            (Self::Structured(ours), Self::Structured(theirs)) => {
                let mut merged = ours.clone();
                for (key, value) in theirs {
                    let next = match merged.get(key) {
                        Some(existing) => existing.merge(value),
                        None => value.clone(),
                    };
                    merged.insert(key.clone(), next);
                }
                Self::Structured(merged)
            }
            _ => other.clone(),
        }
    }
}

impl std::fmt::Display for FieldValue {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_text())
    }
}
