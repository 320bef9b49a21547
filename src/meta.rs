// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Metadata model: [`MetaInfo`] maps and localized [`Title`]s.
//!
//! Metadata travels over per-key topics (`.../meta/{key}`) as plain string
//! payloads, and additionally as a combined JSON document on the bare
//! `.../meta` topic. An absent key means "never set"; an *empty* value is a
//! deliberate tombstone used by [`MetaInfo::delta`] to signal deletion, so
//! the two must never be conflated.
//!
//! # Examples
//!
//! ```
//! use mqttconv::meta::MetaInfo;
//!
//! let old = MetaInfo::from_pairs([("type", "switch"), ("units", "V")]);
//! let new = MetaInfo::from_pairs([("type", "alarm")]);
//!
//! let delta = new.delta(&old);
//! assert_eq!(delta.get("type"), Some("alarm")); // changed
//! assert_eq!(delta.get("units"), Some(""));     // deleted
//! assert_eq!(delta.len(), 2);
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ========== Meta key vocabulary ==========

/// Device meta: owning driver id.
pub const KEY_DRIVER: &str = "driver";
/// Device and control meta: localized title (JSON document).
pub const KEY_TITLE: &str = "title";
/// Legacy alias for the English title.
pub const KEY_NAME: &str = "name";
/// Device and control meta: error state.
pub const KEY_ERROR: &str = "error";
/// Control meta: declared type.
pub const KEY_TYPE: &str = "type";
/// Control meta: value units.
pub const KEY_UNITS: &str = "units";
/// Control meta: upper bound for range-like controls.
pub const KEY_MAX: &str = "max";
/// Control meta: lower bound.
pub const KEY_MIN: &str = "min";
/// Control meta: value precision step.
pub const KEY_PRECISION: &str = "precision";
/// Control meta: explicit display order.
pub const KEY_ORDER: &str = "order";
/// Control meta: readonly flag, `"1"` means read-only.
pub const KEY_READONLY: &str = "readonly";
/// Legacy control meta: writable flag, `"1"` means writable.
pub const KEY_WRITABLE: &str = "writable";
/// Control meta: human-readable description.
pub const KEY_DESCRIPTION: &str = "description";
/// Control meta: titles for enumerated values (JSON document).
pub const KEY_ENUM: &str = "enum";

// ========== MetaInfo ==========

/// A set of metadata fields, keyed by meta-key.
///
/// Keys are unique and iterate in sorted order, which keeps renderings and
/// combined JSON documents deterministic. An absent key is distinct from a
/// key holding the empty string: the empty string is the delete tombstone
/// produced by [`MetaInfo::delta`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetaInfo(BTreeMap<String, String>);

impl MetaInfo {
    /// Creates an empty metadata set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a metadata set from key/value pairs.
    #[must_use]
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Returns the value for a key, if ever set.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Sets a key to a value, returning the previous value if any.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    /// Removes a key, returning its value if it was set.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// `true` if the key has ever been set.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of keys set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// `true` if no key has been set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over `(key, value)` pairs in sorted key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Computes the minimal change set from `prev` to `self`.
    ///
    /// The result contains a key iff its value differs between the two sets,
    /// where a missing key is distinguishable from the empty string. Keys
    /// present only in `prev` map to `""`, the delete tombstone. Keys equal
    /// in both are absent. Feeding the result to [`MetaInfo::apply`] on a
    /// copy of `prev` reproduces `self`.
    #[must_use]
    pub fn delta(&self, prev: &MetaInfo) -> MetaInfo {
        let mut delta = MetaInfo::new();
        for (key, value) in &self.0 {
            if prev.0.get(key) != Some(value) {
                delta.0.insert(key.clone(), value.clone());
            }
        }
        for key in prev.0.keys() {
            if !self.0.contains_key(key) {
                delta.0.insert(key.clone(), String::new());
            }
        }
        delta
    }

    /// Applies a delta: non-empty values are set, empty values delete.
    pub fn apply(&mut self, delta: &MetaInfo) {
        for (key, value) in &delta.0 {
            if value.is_empty() {
                self.0.remove(key);
            } else {
                self.0.insert(key.clone(), value.clone());
            }
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MetaInfo {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self::from_pairs(iter)
    }
}

impl fmt::Display for MetaInfo {
    /// Renders as `[ key1: 'value1' key2: 'value2' ]`, sorted by key.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[ ")?;
        for (key, value) in &self.0 {
            write!(f, "{key}: '{value}' ")?;
        }
        write!(f, "]")
    }
}

// ========== Title ==========

/// A localized display title: ISO language code to display string.
///
/// No key is required; an absent language simply has no localization. On the
/// wire a title is either a plain string (English) or a JSON object keyed by
/// language code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Title(BTreeMap<String, String>);

impl Title {
    /// Creates an empty title.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a title with a single English localization.
    #[must_use]
    pub fn single(text: impl Into<String>) -> Self {
        let mut title = Self::new();
        title.0.insert("en".to_string(), text.into());
        title
    }

    /// Returns the localization for a language code.
    #[must_use]
    pub fn get(&self, lang: &str) -> Option<&str> {
        self.0.get(lang).map(String::as_str)
    }

    /// Sets the localization for a language code.
    pub fn set(&mut self, lang: impl Into<String>, text: impl Into<String>) {
        self.0.insert(lang.into(), text.into());
    }

    /// `true` if no localization has been supplied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decodes a title payload: a JSON object of localizations, or a plain
    /// string treated as English. Empty payload decodes to an empty title.
    #[must_use]
    pub fn from_payload(raw: &str) -> Self {
        if raw.is_empty() {
            return Self::new();
        }
        if raw.trim_start().starts_with('{')
            && let Ok(map) = serde_json::from_str::<BTreeMap<String, String>>(raw)
        {
            return Self(map);
        }
        Self::single(raw)
    }

    /// Encodes for the wire: a plain string when only English is set, a JSON
    /// object otherwise. Empty title encodes to the empty payload.
    #[must_use]
    pub fn to_payload(&self) -> String {
        match self.0.len() {
            0 => String::new(),
            1 if self.0.contains_key("en") => self.0["en"].clone(),
            // BTreeMap keys keep the document deterministic.
            _ => serde_json::to_string(&self.0).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_reports_changed_and_new_keys() {
        let old = MetaInfo::from_pairs([("type", "switch"), ("units", "V")]);
        let new = MetaInfo::from_pairs([("type", "alarm"), ("units", "V"), ("max", "10")]);

        let delta = new.delta(&old);
        assert_eq!(delta.get("type"), Some("alarm"));
        assert_eq!(delta.get("max"), Some("10"));
        assert_eq!(delta.get("units"), None);
        assert_eq!(delta.len(), 2);
    }

    #[test]
    fn delta_tombstones_removed_keys() {
        let old = MetaInfo::from_pairs([("type", "switch"), ("units", "V")]);
        let new = MetaInfo::from_pairs([("type", "switch")]);

        let delta = new.delta(&old);
        assert_eq!(delta.get("units"), Some(""));
        assert_eq!(delta.len(), 1);
    }

    #[test]
    fn delta_distinguishes_missing_from_empty() {
        let old = MetaInfo::from_pairs([("error", "")]);
        let new = MetaInfo::new();

        // "" was explicitly set before, now it is gone: still a tombstone.
        let delta = new.delta(&old);
        assert_eq!(delta.get("error"), Some(""));

        // The reverse: newly set to "" where it was missing.
        let delta = old.delta(&new);
        assert_eq!(delta.get("error"), Some(""));
        assert_eq!(delta.len(), 1);
    }

    #[test]
    fn delta_of_equal_sets_is_empty() {
        let meta = MetaInfo::from_pairs([("type", "text"), ("order", "3")]);
        assert!(meta.delta(&meta.clone()).is_empty());
    }

    #[test]
    fn delta_round_trip_law() {
        let old = MetaInfo::from_pairs([("type", "range"), ("max", "100"), ("units", "%")]);
        let new = MetaInfo::from_pairs([("type", "range"), ("max", "255"), ("order", "1")]);

        let mut rebuilt = old.clone();
        rebuilt.apply(&new.delta(&old));
        assert_eq!(rebuilt, new);
    }

    #[test]
    fn display_is_sorted_by_key() {
        let meta = MetaInfo::from_pairs([("units", "V"), ("max", "10"), ("type", "range")]);
        assert_eq!(meta.to_string(), "[ max: '10' type: 'range' units: 'V' ]");
        assert_eq!(MetaInfo::new().to_string(), "[ ]");
    }

    #[test]
    fn meta_serializes_as_plain_map() {
        let meta = MetaInfo::from_pairs([("type", "switch"), ("readonly", "0")]);
        let json = serde_json::to_string(&meta).unwrap();
        assert_eq!(json, r#"{"readonly":"0","type":"switch"}"#);

        let back: MetaInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn title_plain_payload_is_english() {
        let title = Title::from_payload("Room temperature");
        assert_eq!(title.get("en"), Some("Room temperature"));
        assert_eq!(title.to_payload(), "Room temperature");
    }

    #[test]
    fn title_json_payload_round_trip() {
        let mut title = Title::single("Temperature");
        title.set("ru", "Температура");

        let payload = title.to_payload();
        assert!(payload.starts_with('{'));

        let back = Title::from_payload(&payload);
        assert_eq!(back, title);
    }

    #[test]
    fn title_empty_payload() {
        assert!(Title::from_payload("").is_empty());
        assert_eq!(Title::new().to_payload(), "");
    }

    #[test]
    fn title_malformed_json_falls_back_to_english() {
        let title = Title::from_payload("{not json");
        assert_eq!(title.get("en"), Some("{not json"));
    }
}
