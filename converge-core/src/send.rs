//! The typed value bundles a resource publishes after a successful apply.
//!
//! A bundle is an ordered map of field name to nullable JSON value. Three
//! states are representable and survive the on-disk cache: a field can be
//! absent from the bundle, present but unset (`None`), or present with a
//! value (which may be the empty string). `Some(Value::Null)` is not used;
//! an unset field is always the outer `None`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A kind-specific record of typed output fields, published atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendBundle {
    fields: BTreeMap<String, Option<Value>>,
}

impl SendBundle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion, used by `Sendable::sends` declarations.
    #[must_use]
    pub fn with(mut self, field: &str, value: Option<Value>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: &str, value: Option<Value>) {
        self.fields.insert(field.to_owned(), value);
    }

    /// Outer `None` means the field is absent from the bundle entirely.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Option<Value>> {
        self.fields.get(field)
    }

    /// The field's string value, if the field is present and set to a string.
    #[must_use]
    pub fn value_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field)?.as_ref()?.as_str()
    }

    /// True when the field is present in the bundle but unset.
    #[must_use]
    pub fn is_null(&self, field: &str) -> bool {
        matches!(self.fields.get(field), Some(None))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Option<Value>)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.keys().map(String::as_str).collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }
}

/// One received input value, as returned by `Context::recv`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvEntry {
    pub value: Value,
    /// Whether the value changed since the previous `recv` call.
    pub changed: bool,
}
