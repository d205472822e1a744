use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum number of fields a summary may hold.
pub const MAX_SUMMARY_FIELDS: usize = 16;

/// Maximum length in bytes of a single summary value.
pub const MAX_SUMMARY_VALUE_LEN: usize = 256;

/// Protocol-specific structured payload of an event record.
///
/// A bounded ordered map: inserting past [`MAX_SUMMARY_FIELDS`] distinct keys
/// is ignored and every value is truncated to [`MAX_SUMMARY_VALUE_LEN`] bytes,
/// so attacker-controlled input never grows a record without limit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Summary {
    fields: BTreeMap<String, String>,
}

impl Summary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`Summary::insert`].
    pub fn with(mut self, key: &str, value: impl AsRef<str>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl AsRef<str>) {
        if !self.fields.contains_key(key) && self.fields.len() >= MAX_SUMMARY_FIELDS {
            return;
        }
        let key = truncate_str(key, MAX_SUMMARY_VALUE_LEN).to_string();
        let value = truncate_str(value.as_ref(), MAX_SUMMARY_VALUE_LEN).to_string();
        self.fields.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Cuts `s` to at most `max` bytes without splitting a UTF-8 character.
pub fn truncate_str(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
