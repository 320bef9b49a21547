// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-control state machine.
//!
//! A [`Control`] tracks one addressable value under a device: its declared
//! type and metadata, the authoritative raw value, and the registered value
//! handlers. Controls move through three states:
//!
//! ```text
//! Incomplete ──(mandatory meta accepted)──▶ Complete ──▶ Deleted
//! ```
//!
//! A control is complete once its declared type has arrived (plus `max` for
//! range controls), whatever the arrival order. `Deleted` is terminal: every
//! later mutation fails with [`ControlError::Deleted`] and leaves the state
//! untouched. Raw-value seeding is permitted while incomplete; typed reads
//! and local writes are not.
//!
//! Handlers registered here are *stored* only; the driver loop invokes them
//! synchronously after applying the mutation, passing the open transaction.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{ControlError, Error, Result, ValueError};
use crate::meta::{self, MetaInfo, Title};
use crate::value::{BOOL_FALSE, BOOL_TRUE, ControlType, DataType, Value};

/// What changed when a control value moved, handed to value handlers.
#[derive(Debug, Clone)]
pub struct ValueChange {
    /// Device owning the control.
    pub device: String,
    /// Control id.
    pub control: String,
    /// Typed form of the new value.
    pub value: Value,
    /// New raw value.
    pub raw_value: String,
    /// Raw value before the change; empty if never set.
    pub prev_raw_value: String,
}

/// Handler invoked by the driver loop when a control value moves.
///
/// Runs synchronously inside the loop with the already-open transaction;
/// it must not block and must not open another transaction.
pub type ControlValueHandler =
    dyn Fn(&mut crate::driver::DriverTx, &ValueChange) -> Result<()> + Send + Sync;

/// `true` if the id is non-empty and uses only `[A-Za-z0-9_-]`.
pub(crate) fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn parse_bool_meta(raw: &str) -> Result<bool> {
    Value::from_raw(raw, DataType::Boolean)?
        .as_bool()
        .ok_or_else(|| {
            ValueError::WrongValueType {
                data_type: DataType::Boolean,
                raw: raw.to_string(),
            }
            .into()
        })
}

fn parse_numeric_meta(field: &'static str, raw: &str) -> Result<f64> {
    raw.parse::<f64>().map_err(|_| {
        ValueError::BadNumeric {
            field,
            raw: raw.to_string(),
        }
        .into()
    })
}

// ========== Control ==========

/// A single typed, addressable value under a device.
pub struct Control {
    id: String,
    kind: Option<ControlType>,
    units: String,
    writable: bool,
    max: Option<f64>,
    min: Option<f64>,
    precision: Option<f64>,
    order: Option<u32>,
    error: String,
    description: String,
    title: Title,
    enum_titles: BTreeMap<String, Title>,
    raw_value: String,
    lazy_init: bool,
    do_load_previous: Option<bool>,
    deleted: bool,
    /// Whether the backend has created this control's topics yet. Stays
    /// `false` for lazy-init controls until the first explicit value.
    topics_created: bool,
    value_update_handler: Option<Arc<ControlValueHandler>>,
    on_value_receive_handler: Option<Arc<ControlValueHandler>>,
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Control")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("raw_value", &self.raw_value)
            .field("writable", &self.writable)
            .field("complete", &self.is_complete())
            .field("deleted", &self.deleted)
            .finish_non_exhaustive()
    }
}

impl Control {
    /// Builds a local control from validated [`ControlArgs`].
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::ArgsMissing`] when id or type is absent,
    /// [`ControlError::IncorrectId`] for a malformed id, and
    /// [`ValueError::NotRepresentable`] when the initial typed value does
    /// not fit the declared type.
    pub fn from_args(args: ControlArgs) -> Result<Self> {
        let id = args.id.ok_or(ControlError::ArgsMissing("id"))?;
        if !is_valid_id(&id) {
            return Err(ControlError::IncorrectId(id).into());
        }
        let kind = args.kind.ok_or(ControlError::ArgsMissing("type"))?;

        let data_type = kind.data_type();
        // Buttons are inherently writable; everything else defaults readonly.
        let writable = args.writable.unwrap_or(data_type == DataType::Button);

        let mut explicit_value = false;
        let raw_value = if let Some(raw) = args.raw_value {
            explicit_value = true;
            raw
        } else if let Some(value) = args.value {
            explicit_value = true;
            value.to_raw(data_type)?
        } else {
            kind.default_raw_value().unwrap_or_default().to_string()
        };

        let lazy_init = args.lazy_init.unwrap_or(false);
        Ok(Self {
            id,
            kind: Some(kind),
            units: args.units.unwrap_or_default(),
            writable,
            max: args.max,
            min: args.min,
            precision: args.precision,
            order: args.order,
            error: String::new(),
            description: args.description.unwrap_or_default(),
            title: args.title.unwrap_or_default(),
            enum_titles: args.enum_titles,
            raw_value,
            lazy_init,
            do_load_previous: args.do_load_previous,
            deleted: false,
            topics_created: !lazy_init || explicit_value,
            value_update_handler: None,
            on_value_receive_handler: None,
        })
    }

    /// Creates an incomplete mirror of an externally observed control.
    #[must_use]
    pub fn external(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: None,
            units: String::new(),
            writable: false,
            max: None,
            min: None,
            precision: None,
            order: None,
            error: String::new(),
            description: String::new(),
            title: Title::new(),
            enum_titles: BTreeMap::new(),
            raw_value: String::new(),
            lazy_init: false,
            do_load_previous: None,
            deleted: false,
            topics_created: true,
            value_update_handler: None,
            on_value_receive_handler: None,
        }
    }

    fn check_not_deleted(&self) -> Result<()> {
        if self.deleted {
            return Err(ControlError::Deleted(self.id.clone()).into());
        }
        Ok(())
    }

    // ========== Accessors ==========

    /// Control id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Declared type, if its meta has arrived.
    #[must_use]
    pub fn control_type(&self) -> Option<&ControlType> {
        self.kind.as_ref()
    }

    /// Value units string; empty if unset.
    #[must_use]
    pub fn units(&self) -> &str {
        &self.units
    }

    /// `true` if the control accepts writes through its `/on` topic.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Upper bound, if set.
    #[must_use]
    pub fn max(&self) -> Option<f64> {
        self.max
    }

    /// Lower bound, if set.
    #[must_use]
    pub fn min(&self) -> Option<f64> {
        self.min
    }

    /// Value precision step, if set.
    #[must_use]
    pub fn precision(&self) -> Option<f64> {
        self.precision
    }

    /// Explicit display order; `None` means automatic.
    #[must_use]
    pub fn order(&self) -> Option<u32> {
        self.order
    }

    /// Error state string; empty if no error.
    #[must_use]
    pub fn error_state(&self) -> &str {
        &self.error
    }

    /// Human-readable description; empty if unset.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Localized title.
    #[must_use]
    pub fn title(&self) -> &Title {
        &self.title
    }

    /// Titles for enumerated raw values.
    #[must_use]
    pub fn enum_titles(&self) -> &BTreeMap<String, Title> {
        &self.enum_titles
    }

    /// Authoritative raw wire value; empty if never set.
    #[must_use]
    pub fn raw_value(&self) -> &str {
        &self.raw_value
    }

    /// `true` once all mandatory metadata for the declared type arrived.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        match &self.kind {
            Some(kind) => !kind.requires_max() || self.max.is_some(),
            None => false,
        }
    }

    /// `true` once [`Control::mark_deleted`] has been called.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// `true` if the value topic is published retained. Button values carry
    /// no state between presses and are never retained.
    #[must_use]
    pub fn is_retained(&self) -> bool {
        self.data_type() != DataType::Button
    }

    /// Lazy-init flag: topics and persistence wait for the first value.
    #[must_use]
    pub fn lazy_init(&self) -> bool {
        self.lazy_init
    }

    /// Whether the stored previous value should be loaded at creation,
    /// falling back to the owning device's preference.
    #[must_use]
    pub fn do_load_previous(&self, device_default: bool) -> bool {
        self.do_load_previous.unwrap_or(device_default)
    }

    pub(crate) fn topics_created(&self) -> bool {
        self.topics_created
    }

    pub(crate) fn set_topics_created(&mut self) {
        self.topics_created = true;
    }

    fn data_type(&self) -> DataType {
        self.kind
            .as_ref()
            .map_or(DataType::String, ControlType::data_type)
    }

    // ========== Value paths ==========

    /// Typed value derived from the raw value and declared type.
    ///
    /// # Errors
    ///
    /// [`ControlError::Deleted`] after deletion, [`ControlError::Incomplete`]
    /// before the type meta arrived, [`ValueError::WrongValueType`] when the
    /// raw value does not parse under the declared type.
    pub fn value(&self) -> Result<Value> {
        self.check_not_deleted()?;
        if self.kind.is_none() {
            return Err(ControlError::Incomplete(self.id.clone()).into());
        }
        Ok(Value::from_raw(&self.raw_value, self.data_type())?)
    }

    /// Replaces the raw value without any notification, returning the
    /// previous raw value. Permitted while incomplete (value seeding).
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Deleted`] after deletion.
    pub fn set_raw_value(&mut self, raw: impl Into<String>) -> Result<String> {
        self.check_not_deleted()?;
        let raw = raw.into();
        let prev = std::mem::replace(&mut self.raw_value, raw);
        Ok(prev)
    }

    /// Local write path: serializes `value` under the declared type and
    /// stores the raw form, returning `(previous_raw, new_raw)`.
    ///
    /// Whether handlers see this change is the caller's decision; the
    /// control itself only moves the value.
    ///
    /// # Errors
    ///
    /// [`ControlError::Deleted`] after deletion, [`ControlError::Incomplete`]
    /// while incomplete, [`ValueError::NotRepresentable`] when `value`
    /// cannot be encoded under the declared type.
    pub fn update_value(&mut self, value: &Value) -> Result<(String, String)> {
        self.check_not_deleted()?;
        if !self.is_complete() {
            return Err(ControlError::Incomplete(self.id.clone()).into());
        }
        let raw = value.to_raw(self.data_type())?;
        let prev = std::mem::replace(&mut self.raw_value, raw.clone());
        Ok((prev, raw))
    }

    /// Checks an inbound `/on` write against writability.
    ///
    /// # Errors
    ///
    /// [`ControlError::Deleted`], [`ControlError::Incomplete`], or
    /// [`ControlError::NotWritable`] for read-only controls.
    pub fn check_on_value_allowed(&self) -> Result<()> {
        self.check_not_deleted()?;
        if !self.is_complete() {
            return Err(ControlError::Incomplete(self.id.clone()).into());
        }
        if !self.writable {
            return Err(ControlError::NotWritable(self.id.clone()).into());
        }
        Ok(())
    }

    // ========== Metadata ==========

    /// Accepts a single meta field by wire key.
    ///
    /// The empty value clears the field (tombstone semantics). Completeness
    /// is recomputed from the union of everything accepted so far.
    ///
    /// # Errors
    ///
    /// [`ControlError::Deleted`] after deletion,
    /// [`ControlError::UnknownMeta`] for keys outside the vocabulary, and a
    /// value error when a numeric or boolean field fails to parse; the
    /// field is left unchanged on error.
    pub fn accept_meta(&mut self, key: &str, value: &str) -> Result<()> {
        self.check_not_deleted()?;
        match key {
            meta::KEY_TYPE => {
                self.kind = if value.is_empty() {
                    None
                } else {
                    Some(ControlType::from(value))
                };
            }
            meta::KEY_UNITS => self.units = value.to_string(),
            meta::KEY_MAX => {
                self.max = if value.is_empty() {
                    None
                } else {
                    Some(parse_numeric_meta("max", value)?)
                };
            }
            meta::KEY_MIN => {
                self.min = if value.is_empty() {
                    None
                } else {
                    Some(parse_numeric_meta("min", value)?)
                };
            }
            meta::KEY_PRECISION => {
                self.precision = if value.is_empty() {
                    None
                } else {
                    Some(parse_numeric_meta("precision", value)?)
                };
            }
            meta::KEY_ORDER => {
                self.order = if value.is_empty() {
                    None
                } else {
                    Some(value.parse::<u32>().map_err(|_| {
                        Error::from(ValueError::BadNumeric {
                            field: "order",
                            raw: value.to_string(),
                        })
                    })?)
                };
            }
            meta::KEY_ERROR => self.error = value.to_string(),
            meta::KEY_READONLY => {
                if value.is_empty() {
                    self.writable = false;
                } else {
                    self.writable = !parse_bool_meta(value)?;
                }
            }
            meta::KEY_WRITABLE => {
                if value.is_empty() {
                    self.writable = false;
                } else {
                    self.writable = parse_bool_meta(value)?;
                }
            }
            meta::KEY_DESCRIPTION => self.description = value.to_string(),
            meta::KEY_TITLE => self.title = Title::from_payload(value),
            meta::KEY_NAME => {
                if value.is_empty() {
                    self.title = Title::new();
                } else {
                    self.title.set("en", value);
                }
            }
            meta::KEY_ENUM => self.enum_titles = parse_enum_titles(value),
            _ => return Err(ControlError::UnknownMeta(key.to_string()).into()),
        }
        Ok(())
    }

    /// Sets the error state; empty clears it.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Deleted`] after deletion.
    pub fn set_error_state(&mut self, error: impl Into<String>) -> Result<()> {
        self.check_not_deleted()?;
        self.error = error.into();
        Ok(())
    }

    /// Renders the current metadata as wire fields, keyed by meta key.
    ///
    /// This is the publication view: only set fields appear, except
    /// `readonly` which is always explicit.
    #[must_use]
    pub fn meta(&self) -> MetaInfo {
        let mut info = MetaInfo::new();
        if let Some(kind) = &self.kind {
            info.set(meta::KEY_TYPE, kind.to_string());
        }
        if !self.units.is_empty() {
            info.set(meta::KEY_UNITS, self.units.clone());
        }
        if let Some(max) = self.max {
            info.set(meta::KEY_MAX, max.to_string());
        }
        if let Some(min) = self.min {
            info.set(meta::KEY_MIN, min.to_string());
        }
        if let Some(precision) = self.precision {
            info.set(meta::KEY_PRECISION, precision.to_string());
        }
        if let Some(order) = self.order {
            info.set(meta::KEY_ORDER, order.to_string());
        }
        info.set(
            meta::KEY_READONLY,
            if self.writable { BOOL_FALSE } else { BOOL_TRUE },
        );
        if !self.error.is_empty() {
            info.set(meta::KEY_ERROR, self.error.clone());
        }
        if !self.description.is_empty() {
            info.set(meta::KEY_DESCRIPTION, self.description.clone());
        }
        if !self.title.is_empty() {
            info.set(meta::KEY_TITLE, self.title.to_payload());
        }
        if !self.enum_titles.is_empty()
            && let Ok(json) = serde_json::to_string(&self.enum_titles)
        {
            info.set(meta::KEY_ENUM, json);
        }
        info
    }

    /// `true` when nothing remains on the mirror: no value, no metadata.
    /// Cleared external controls in this state remove themselves.
    #[must_use]
    pub fn is_cleared(&self) -> bool {
        self.raw_value.is_empty()
            && self.kind.is_none()
            && self.units.is_empty()
            && self.max.is_none()
            && self.min.is_none()
            && self.precision.is_none()
            && self.order.is_none()
            && self.error.is_empty()
            && self.description.is_empty()
            && self.title.is_empty()
            && self.enum_titles.is_empty()
    }

    // ========== Handlers ==========

    /// Registers the value-update handler, replacing any prior one.
    /// Fired when a confirmed value lands on an external control.
    pub fn set_value_update_handler(&mut self, handler: Arc<ControlValueHandler>) {
        self.value_update_handler = Some(handler);
    }

    /// Registers the `/on`-value handler, replacing any prior one.
    /// Fired when a change request lands on a local writable control.
    pub fn set_on_value_receive_handler(&mut self, handler: Arc<ControlValueHandler>) {
        self.on_value_receive_handler = Some(handler);
    }

    pub(crate) fn value_update_handler(&self) -> Option<Arc<ControlValueHandler>> {
        self.value_update_handler.clone()
    }

    pub(crate) fn on_value_receive_handler(&self) -> Option<Arc<ControlValueHandler>> {
        self.on_value_receive_handler.clone()
    }

    // ========== Deletion ==========

    /// Marks the control deleted. Idempotent and terminal.
    pub fn mark_deleted(&mut self) {
        self.deleted = true;
    }
}

fn parse_enum_titles(raw: &str) -> BTreeMap<String, Title> {
    if raw.is_empty() {
        return BTreeMap::new();
    }
    if let Ok(titles) = serde_json::from_str::<BTreeMap<String, Title>>(raw) {
        return titles;
    }
    // Tolerate the flat form mapping values straight to English strings.
    serde_json::from_str::<BTreeMap<String, String>>(raw)
        .map(|flat| {
            flat.into_iter()
                .map(|(k, v)| (k, Title::single(v)))
                .collect()
        })
        .unwrap_or_default()
}

// ========== ControlArgs ==========

/// Builder for local control creation.
///
/// Id and type are mandatory; everything else defaults sensibly. Validation
/// happens once, when the device builds the control.
///
/// # Examples
///
/// ```
/// use mqttconv::control::ControlArgs;
/// use mqttconv::value::ControlType;
///
/// let args = ControlArgs::new()
///     .id("temperature")
///     .kind(ControlType::Temperature)
///     .units("deg C")
///     .order(1);
/// ```
#[derive(Debug, Default)]
pub struct ControlArgs {
    id: Option<String>,
    kind: Option<ControlType>,
    units: Option<String>,
    writable: Option<bool>,
    max: Option<f64>,
    min: Option<f64>,
    precision: Option<f64>,
    order: Option<u32>,
    description: Option<String>,
    title: Option<Title>,
    enum_titles: BTreeMap<String, Title>,
    lazy_init: Option<bool>,
    do_load_previous: Option<bool>,
    value: Option<Value>,
    raw_value: Option<String>,
}

impl ControlArgs {
    /// Creates an empty argument set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Control id (mandatory, `[A-Za-z0-9_-]`).
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Declared control type (mandatory).
    #[must_use]
    pub fn kind(mut self, kind: ControlType) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Value units.
    #[must_use]
    pub fn units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    /// Marks the control writable (default: read-only, except buttons).
    #[must_use]
    pub fn writable(mut self, writable: bool) -> Self {
        self.writable = Some(writable);
        self
    }

    /// Inverse convenience for [`ControlArgs::writable`].
    #[must_use]
    pub fn readonly(mut self, readonly: bool) -> Self {
        self.writable = Some(!readonly);
        self
    }

    /// Upper bound; mandatory for range controls.
    #[must_use]
    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    /// Lower bound.
    #[must_use]
    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    /// Value precision step.
    #[must_use]
    pub fn precision(mut self, precision: f64) -> Self {
        self.precision = Some(precision);
        self
    }

    /// Explicit display order.
    #[must_use]
    pub fn order(mut self, order: u32) -> Self {
        self.order = Some(order);
        self
    }

    /// Human-readable description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// English title.
    #[must_use]
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(Title::single(title));
        self
    }

    /// Full localized title, replacing any previous one.
    #[must_use]
    pub fn localized_title(mut self, title: Title) -> Self {
        self.title = Some(title);
        self
    }

    /// Adds a title for one enumerated raw value.
    #[must_use]
    pub fn enum_title(mut self, raw: impl Into<String>, title: Title) -> Self {
        self.enum_titles.insert(raw.into(), title);
        self
    }

    /// Defers topic creation and persistence until the first value.
    #[must_use]
    pub fn lazy_init(mut self, lazy: bool) -> Self {
        self.lazy_init = Some(lazy);
        self
    }

    /// Whether to restore the stored previous value at creation,
    /// overriding the device preference.
    #[must_use]
    pub fn do_load_previous(mut self, load: bool) -> Self {
        self.do_load_previous = Some(load);
        self
    }

    /// Initial typed value, serialized under the declared type.
    #[must_use]
    pub fn value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Initial raw value, taken verbatim. Wins over
    /// [`ControlArgs::value`] if both are given.
    #[must_use]
    pub fn raw_value(mut self, raw: impl Into<String>) -> Self {
        self.raw_value = Some(raw.into());
        self
    }

    /// Whether an initial value was supplied, in either form.
    pub(crate) fn has_explicit_value(&self) -> bool {
        self.value.is_some() || self.raw_value.is_some()
    }
}
