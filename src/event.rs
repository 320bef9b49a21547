// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver events: the backend-to-core contract.
//!
//! The backend decodes inbound wire messages into [`DriverEvent`] values and
//! delivers them through the driver's bounded queue; the loop consumes them
//! strictly in arrival order. [`DriverEvent::Ready`] marks the end of a
//! retained-message replay after (re)subscription.

/// An event delivered from the backend to the driver core.
///
/// # Examples
///
/// ```
/// use mqttconv::event::DriverEvent;
///
/// let event = DriverEvent::control_value("sensor1", "value", "21.5", "");
/// assert_eq!(event.device_id(), Some("sensor1"));
/// assert!(!event.is_ready());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// Every retained message for the current subscriptions was delivered.
    Ready,

    /// First sight of an external device.
    NewExternalDevice {
        /// Device id.
        device_id: String,
    },

    /// First sight of a control on an external device.
    NewExternalDeviceControl {
        /// Device id.
        device_id: String,
        /// Control id.
        control_id: String,
    },

    /// A device meta field arrived for an external device.
    NewExternalDeviceMeta {
        /// Device id.
        device_id: String,
        /// Meta key.
        key: String,
        /// Meta value; empty deletes the field.
        value: String,
    },

    /// A control meta field arrived for an external device.
    NewExternalDeviceControlMeta {
        /// Device id.
        device_id: String,
        /// Control id.
        control_id: String,
        /// Meta key.
        key: String,
        /// Meta value; empty deletes the field.
        value: String,
    },

    /// A confirmed value arrived on a control value topic.
    ///
    /// For local controls this is an echo of our own publication: the loop
    /// does not mutate the graph for it, but observers still see it.
    ControlValue {
        /// Device id.
        device_id: String,
        /// Control id.
        control_id: String,
        /// New raw value.
        raw_value: String,
        /// Raw value before this event; empty if none was known.
        prev_raw_value: String,
    },

    /// A change request arrived on a control's `/on` topic.
    ControlOnValue {
        /// Device id.
        device_id: String,
        /// Control id.
        control_id: String,
        /// Requested raw value.
        raw_value: String,
    },
}

impl DriverEvent {
    /// Creates a ready event.
    #[must_use]
    pub fn ready() -> Self {
        Self::Ready
    }

    /// Creates a new-external-device event.
    #[must_use]
    pub fn new_external_device(device_id: impl Into<String>) -> Self {
        Self::NewExternalDevice {
            device_id: device_id.into(),
        }
    }

    /// Creates a new-external-control event.
    #[must_use]
    pub fn new_external_device_control(
        device_id: impl Into<String>,
        control_id: impl Into<String>,
    ) -> Self {
        Self::NewExternalDeviceControl {
            device_id: device_id.into(),
            control_id: control_id.into(),
        }
    }

    /// Creates a device meta event.
    #[must_use]
    pub fn new_external_device_meta(
        device_id: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::NewExternalDeviceMeta {
            device_id: device_id.into(),
            key: key.into(),
            value: value.into(),
        }
    }

    /// Creates a control meta event.
    #[must_use]
    pub fn new_external_device_control_meta(
        device_id: impl Into<String>,
        control_id: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::NewExternalDeviceControlMeta {
            device_id: device_id.into(),
            control_id: control_id.into(),
            key: key.into(),
            value: value.into(),
        }
    }

    /// Creates a control value event.
    #[must_use]
    pub fn control_value(
        device_id: impl Into<String>,
        control_id: impl Into<String>,
        raw_value: impl Into<String>,
        prev_raw_value: impl Into<String>,
    ) -> Self {
        Self::ControlValue {
            device_id: device_id.into(),
            control_id: control_id.into(),
            raw_value: raw_value.into(),
            prev_raw_value: prev_raw_value.into(),
        }
    }

    /// Creates a control on-value event.
    #[must_use]
    pub fn control_on_value(
        device_id: impl Into<String>,
        control_id: impl Into<String>,
        raw_value: impl Into<String>,
    ) -> Self {
        Self::ControlOnValue {
            device_id: device_id.into(),
            control_id: control_id.into(),
            raw_value: raw_value.into(),
        }
    }

    /// Returns the device id the event concerns; `None` for
    /// [`DriverEvent::Ready`].
    #[must_use]
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::Ready => None,
            Self::NewExternalDevice { device_id }
            | Self::NewExternalDeviceControl { device_id, .. }
            | Self::NewExternalDeviceMeta { device_id, .. }
            | Self::NewExternalDeviceControlMeta { device_id, .. }
            | Self::ControlValue { device_id, .. }
            | Self::ControlOnValue { device_id, .. } => Some(device_id),
        }
    }

    /// Returns the control id the event concerns, if there is one.
    #[must_use]
    pub fn control_id(&self) -> Option<&str> {
        match self {
            Self::NewExternalDeviceControl { control_id, .. }
            | Self::NewExternalDeviceControlMeta { control_id, .. }
            | Self::ControlValue { control_id, .. }
            | Self::ControlOnValue { control_id, .. } => Some(control_id),
            Self::Ready | Self::NewExternalDevice { .. } | Self::NewExternalDeviceMeta { .. } => {
                None
            }
        }
    }

    /// `true` for the retained-replay completion marker.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// `true` for external discovery events (new device/control/meta).
    #[must_use]
    pub fn is_discovery(&self) -> bool {
        matches!(
            self,
            Self::NewExternalDevice { .. }
                | Self::NewExternalDeviceControl { .. }
                | Self::NewExternalDeviceMeta { .. }
                | Self::NewExternalDeviceControlMeta { .. }
        )
    }

    /// `true` for value traffic (confirmed or requested).
    #[must_use]
    pub fn is_value(&self) -> bool {
        matches!(self, Self::ControlValue { .. } | Self::ControlOnValue { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_and_accessors() {
        let event = DriverEvent::control_value("d", "c", "1", "0");
        assert_eq!(event.device_id(), Some("d"));
        assert_eq!(event.control_id(), Some("c"));
        assert!(event.is_value());
        assert!(!event.is_discovery());

        let event = DriverEvent::new_external_device_meta("d", "driver", "x");
        assert_eq!(event.device_id(), Some("d"));
        assert_eq!(event.control_id(), None);
        assert!(event.is_discovery());
    }

    #[test]
    fn ready_has_no_ids() {
        let event = DriverEvent::ready();
        assert!(event.is_ready());
        assert_eq!(event.device_id(), None);
        assert_eq!(event.control_id(), None);
    }

    #[test]
    fn events_compare_by_content() {
        assert_eq!(
            DriverEvent::control_on_value("d", "c", "1"),
            DriverEvent::ControlOnValue {
                device_id: "d".to_string(),
                control_id: "c".to_string(),
                raw_value: "1".to_string(),
            }
        );
    }
}
