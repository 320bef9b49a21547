// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Devices: named containers of controls.
//!
//! A [`Device`] is either *local* (owned by this process, published to the
//! broker) or *external* (a mirror of state observed from the broker).
//! Local devices are created explicitly inside a transaction; external
//! devices materialize when the first matching topic is seen and remove
//! themselves once their topics are cleared.
//!
//! Deleted controls stay in the container as shadows so in-flight
//! references stay valid, but they are excluded from every listing and
//! lookup; re-creating a control with the same id replaces the shadow.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use crate::control::{Control, is_valid_id};
use crate::error::{ControlError, DeviceError, Result};
use crate::meta::{self, MetaInfo, Title};

/// What kind of device this is: ours or mirrored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceKind {
    /// Owned by this process.
    Local {
        /// Virtual devices cache values through the storage collaborator
        /// and restore them across restarts; physical devices do not.
        virtual_device: bool,
        /// Default load-previous preference for this device's controls.
        do_load_previous: bool,
    },
    /// Mirrored from the broker.
    External {
        /// Owning driver id from the `driver` meta key; empty if unowned.
        driver_id: String,
    },
}

/// A named container of controls.
pub struct Device {
    id: String,
    kind: DeviceKind,
    title: Title,
    error: String,
    deleted: bool,
    controls: BTreeMap<String, Control>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("controls", &self.controls.len())
            .field("deleted", &self.deleted)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Builds a local device from validated [`DeviceArgs`].
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::ArgsMissing`] when the id is absent and
    /// [`DeviceError::IncorrectId`] for a malformed id.
    pub fn local(args: DeviceArgs) -> Result<Self> {
        let id = args.id.ok_or(DeviceError::ArgsMissing("id"))?;
        if !is_valid_id(&id) {
            return Err(DeviceError::IncorrectId(id).into());
        }
        let virtual_device = args.virtual_device.unwrap_or(false);
        Ok(Self {
            id,
            kind: DeviceKind::Local {
                virtual_device,
                // Virtual devices restore cached values unless told not to.
                do_load_previous: args.do_load_previous.unwrap_or(virtual_device),
            },
            title: args.title.unwrap_or_default(),
            error: String::new(),
            deleted: false,
            controls: BTreeMap::new(),
        })
    }

    /// Creates an empty mirror of an externally observed device.
    #[must_use]
    pub fn external(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: DeviceKind::External {
                driver_id: String::new(),
            },
            title: Title::new(),
            error: String::new(),
            deleted: false,
            controls: BTreeMap::new(),
        }
    }

    fn check_not_deleted(&self) -> Result<()> {
        if self.deleted {
            return Err(DeviceError::Deleted(self.id.clone()).into());
        }
        Ok(())
    }

    // ========== Accessors ==========

    /// Device id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Device kind.
    #[must_use]
    pub fn kind(&self) -> &DeviceKind {
        &self.kind
    }

    /// `true` for devices owned by this process.
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self.kind, DeviceKind::Local { .. })
    }

    /// `true` for local virtual devices (value caching applies).
    #[must_use]
    pub fn is_virtual(&self) -> bool {
        matches!(
            self.kind,
            DeviceKind::Local {
                virtual_device: true,
                ..
            }
        )
    }

    /// Device-level load-previous preference; `false` for external mirrors.
    #[must_use]
    pub fn do_load_previous(&self) -> bool {
        matches!(
            self.kind,
            DeviceKind::Local {
                do_load_previous: true,
                ..
            }
        )
    }

    /// Owning driver id of an external mirror; `None` for local devices,
    /// `Some("")` for an unowned mirror.
    #[must_use]
    pub fn driver_id(&self) -> Option<&str> {
        match &self.kind {
            DeviceKind::External { driver_id } => Some(driver_id),
            DeviceKind::Local { .. } => None,
        }
    }

    pub(crate) fn set_driver_id(&mut self, id: impl Into<String>) {
        if let DeviceKind::External { driver_id } = &mut self.kind {
            *driver_id = id.into();
        }
    }

    /// Localized device title.
    #[must_use]
    pub fn title(&self) -> &Title {
        &self.title
    }

    /// Replaces the device title. On an external mirror this updates only
    /// the local mirror; no topic is written.
    pub fn set_title(&mut self, title: Title) {
        self.title = title;
    }

    /// Error state string; empty if no error.
    #[must_use]
    pub fn error_state(&self) -> &str {
        &self.error
    }

    /// Sets the device error state; empty clears it.
    pub fn set_error_state(&mut self, error: impl Into<String>) {
        self.error = error.into();
    }

    /// `true` once the device has been deleted. Terminal.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    // ========== Controls ==========

    /// `true` if a non-deleted control with this id exists.
    #[must_use]
    pub fn has_control(&self, id: &str) -> bool {
        self.controls.get(id).is_some_and(|c| !c.is_deleted())
    }

    /// Looks up a non-deleted control.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] when absent or deleted.
    pub fn control(&self, id: &str) -> Result<&Control> {
        self.controls
            .get(id)
            .filter(|c| !c.is_deleted())
            .ok_or_else(|| ControlError::NotFound(id.to_string()).into())
    }

    pub(crate) fn control_mut(&mut self, id: &str) -> Result<&mut Control> {
        self.controls
            .get_mut(id)
            .filter(|c| !c.is_deleted())
            .ok_or_else(|| ControlError::NotFound(id.to_string()).into())
    }

    /// Lists non-deleted controls in id order.
    #[must_use]
    pub fn controls_list(&self) -> Vec<&Control> {
        self.controls.values().filter(|c| !c.is_deleted()).collect()
    }

    /// Ids of non-deleted controls, in order.
    #[must_use]
    pub fn control_ids(&self) -> Vec<String> {
        self.controls
            .values()
            .filter(|c| !c.is_deleted())
            .map(|c| c.id().to_string())
            .collect()
    }

    /// Adds a built control to the device.
    ///
    /// A deleted shadow with the same id is replaced.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Deleted`] on a deleted device and
    /// [`ControlError::Redefinition`] when a live control already holds
    /// the id.
    pub fn add_control(&mut self, control: Control) -> Result<&mut Control> {
        self.check_not_deleted()?;
        let id = control.id().to_string();
        match self.controls.entry(id) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_deleted() {
                    return Err(ControlError::Redefinition(entry.key().clone()).into());
                }
                entry.insert(control);
                Ok(entry.into_mut())
            }
            Entry::Vacant(entry) => Ok(entry.insert(control)),
        }
    }

    /// Marks a control deleted, keeping it as a shadow.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] when absent or already deleted.
    pub fn remove_control(&mut self, id: &str) -> Result<()> {
        self.check_not_deleted()?;
        self.control_mut(id)?.mark_deleted();
        Ok(())
    }

    /// Drops a control entry entirely. Used for external mirrors whose
    /// topics were cleared on the broker; there is nothing to shadow.
    pub(crate) fn drop_control(&mut self, id: &str) -> Option<Control> {
        self.controls.remove(id)
    }

    // ========== Metadata ==========

    /// Accepts a single device meta field by wire key.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Deleted`] after deletion and
    /// [`DeviceError::UnknownMeta`] for keys outside the vocabulary.
    pub fn accept_meta(&mut self, key: &str, value: &str) -> Result<()> {
        self.check_not_deleted()?;
        match key {
            meta::KEY_DRIVER => self.set_driver_id(value),
            meta::KEY_TITLE => self.title = Title::from_payload(value),
            meta::KEY_NAME => {
                if value.is_empty() {
                    self.title = Title::new();
                } else {
                    self.title.set("en", value);
                }
            }
            meta::KEY_ERROR => self.error = value.to_string(),
            _ => return Err(DeviceError::UnknownMeta(key.to_string()).into()),
        }
        Ok(())
    }

    /// Renders device-level metadata as wire fields.
    ///
    /// The `driver` key appears only on external mirrors; for local devices
    /// the driver core stamps its own id at publication time.
    #[must_use]
    pub fn meta(&self) -> MetaInfo {
        let mut info = MetaInfo::new();
        if let DeviceKind::External { driver_id } = &self.kind
            && !driver_id.is_empty()
        {
            info.set(meta::KEY_DRIVER, driver_id.clone());
        }
        if !self.title.is_empty() {
            info.set(meta::KEY_TITLE, self.title.to_payload());
        }
        if !self.error.is_empty() {
            info.set(meta::KEY_ERROR, self.error.clone());
        }
        info
    }

    /// `true` when nothing remains on an external mirror: no live controls
    /// and no device metadata. Such mirrors remove themselves.
    #[must_use]
    pub fn is_cleared(&self) -> bool {
        self.controls.values().all(Control::is_deleted)
            && self.title.is_empty()
            && self.error.is_empty()
            && self.driver_id().is_none_or(str::is_empty)
    }

    // ========== Deletion ==========

    /// Marks the device and all its controls deleted. Idempotent, terminal.
    pub fn mark_deleted(&mut self) {
        self.deleted = true;
        for control in self.controls.values_mut() {
            control.mark_deleted();
        }
    }
}

// ========== DeviceArgs ==========

/// Builder for local device creation.
///
/// # Examples
///
/// ```
/// use mqttconv::device::DeviceArgs;
///
/// let args = DeviceArgs::new()
///     .id("sample_sensor")
///     .title("Sample sensor")
///     .virtual_device(true);
/// ```
#[derive(Debug, Default)]
pub struct DeviceArgs {
    id: Option<String>,
    title: Option<Title>,
    virtual_device: Option<bool>,
    do_load_previous: Option<bool>,
}

impl DeviceArgs {
    /// Creates an empty argument set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Device id (mandatory, `[A-Za-z0-9_-]`).
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
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

    /// Marks the device virtual: values are cached and restored.
    #[must_use]
    pub fn virtual_device(mut self, virtual_device: bool) -> Self {
        self.virtual_device = Some(virtual_device);
        self
    }

    /// Device-wide load-previous preference. Defaults to the virtual flag.
    #[must_use]
    pub fn do_load_previous(mut self, load: bool) -> Self {
        self.do_load_previous = Some(load);
        self
    }

    pub(crate) fn id_ref(&self) -> Option<&str> {
        self.id.as_deref()
    }
}
