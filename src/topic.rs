// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Topic codec for the devices/controls convention.
//!
//! Every object the driver manages lives under a fixed topic grammar:
//!
//! ```text
//! /devices/{dev}/controls/{ctrl}            control value
//! /devices/{dev}/controls/{ctrl}/on         control "on" request
//! /devices/{dev}/controls/{ctrl}/meta/{key} control meta field
//! /devices/{dev}/controls/{ctrl}/meta       combined control meta (JSON)
//! /devices/{dev}/meta/{key}                 device meta field
//! /devices/{dev}/meta                       combined device meta (JSON)
//! ```
//!
//! This module provides the pure string half of the protocol: formatting
//! topics from ids, recognizing which shape an inbound topic belongs to, and
//! MQTT-style wildcard matching. It performs no I/O and keeps no state.
//!
//! # Examples
//!
//! ```
//! use mqttconv::topic::{self, ParsedTopic};
//!
//! let t = topic::control_value_topic("sensor1", "value")?;
//! assert_eq!(t, "/devices/sensor1/controls/value");
//!
//! match topic::parse(&t)? {
//!     ParsedTopic::ControlValue { device, control } => {
//!         assert_eq!(device, "sensor1");
//!         assert_eq!(control, "value");
//!     }
//!     other => panic!("unexpected shape: {other:?}"),
//! }
//!
//! assert!(topic::matches("/devices/+/controls/+", &t));
//! # Ok::<(), mqttconv::Error>(())
//! ```

use crate::error::{Result, TopicError};

/// Root of the convention's topic namespace.
pub const DEVICES_PREFIX: &str = "/devices";

/// Device meta key carrying the owning driver id.
pub const DRIVER_META_KEY: &str = "driver";

// ========== Topic formatting ==========

/// Returns the value topic of a control.
///
/// # Errors
///
/// Returns [`TopicError::BadComponent`] if an id contains `/`.
pub fn control_value_topic(device: &str, control: &str) -> Result<String> {
    check_component(device)?;
    check_component(control)?;
    Ok(format!("{DEVICES_PREFIX}/{device}/controls/{control}"))
}

/// Returns the "on" request topic of a control.
///
/// Publishing here asks the owning driver to change the control's value; it
/// is distinct from the confirmed value topic.
///
/// # Errors
///
/// Returns [`TopicError::BadComponent`] if an id contains `/`.
pub fn control_on_topic(device: &str, control: &str) -> Result<String> {
    Ok(format!("{}/on", control_value_topic(device, control)?))
}

/// Returns the topic of a single control meta field.
///
/// # Errors
///
/// Returns [`TopicError::BadComponent`] if an id or key contains `/`.
pub fn control_meta_topic(device: &str, control: &str, key: &str) -> Result<String> {
    check_component(key)?;
    Ok(format!("{}/meta/{key}", control_value_topic(device, control)?))
}

/// Returns the combined (JSON document) control meta topic.
///
/// # Errors
///
/// Returns [`TopicError::BadComponent`] if an id contains `/`.
pub fn control_meta_json_topic(device: &str, control: &str) -> Result<String> {
    Ok(format!("{}/meta", control_value_topic(device, control)?))
}

/// Returns the topic of a single device meta field.
///
/// # Errors
///
/// Returns [`TopicError::BadComponent`] if the id or key contains `/`.
pub fn device_meta_topic(device: &str, key: &str) -> Result<String> {
    check_component(device)?;
    check_component(key)?;
    Ok(format!("{DEVICES_PREFIX}/{device}/meta/{key}"))
}

/// Returns the combined (JSON document) device meta topic.
///
/// # Errors
///
/// Returns [`TopicError::BadComponent`] if the id contains `/`.
pub fn device_meta_json_topic(device: &str) -> Result<String> {
    check_component(device)?;
    Ok(format!("{DEVICES_PREFIX}/{device}/meta"))
}

/// Returns the driver-ownership topic of a device.
///
/// # Errors
///
/// Returns [`TopicError::BadComponent`] if the id contains `/`.
pub fn driver_ownership_topic(device: &str) -> Result<String> {
    device_meta_topic(device, DRIVER_META_KEY)
}

fn check_component(id: &str) -> Result<()> {
    if id.contains('/') {
        return Err(TopicError::BadComponent(id.to_string()).into());
    }
    Ok(())
}

// ========== Topic recognition ==========

/// An inbound topic decomposed into one of the convention's shapes.
///
/// Borrows its ids from the parsed topic string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedTopic<'a> {
    /// `/devices/{dev}/controls/{ctrl}`
    ControlValue {
        /// Device id.
        device: &'a str,
        /// Control id.
        control: &'a str,
    },
    /// `/devices/{dev}/controls/{ctrl}/on`
    ControlOn {
        /// Device id.
        device: &'a str,
        /// Control id.
        control: &'a str,
    },
    /// `/devices/{dev}/controls/{ctrl}/meta/{key}`
    ControlMeta {
        /// Device id.
        device: &'a str,
        /// Control id.
        control: &'a str,
        /// Meta key.
        key: &'a str,
    },
    /// `/devices/{dev}/controls/{ctrl}/meta`
    ControlMetaJson {
        /// Device id.
        device: &'a str,
        /// Control id.
        control: &'a str,
    },
    /// `/devices/{dev}/meta/{key}`
    DeviceMeta {
        /// Device id.
        device: &'a str,
        /// Meta key.
        key: &'a str,
    },
    /// `/devices/{dev}/meta`
    DeviceMetaJson {
        /// Device id.
        device: &'a str,
    },
}

impl<'a> ParsedTopic<'a> {
    /// Returns the device id named by the topic, whatever its shape.
    #[must_use]
    pub fn device(&self) -> &'a str {
        match self {
            Self::ControlValue { device, .. }
            | Self::ControlOn { device, .. }
            | Self::ControlMeta { device, .. }
            | Self::ControlMetaJson { device, .. }
            | Self::DeviceMeta { device, .. }
            | Self::DeviceMetaJson { device } => device,
        }
    }
}

/// Recognizes which shape of the convention a topic belongs to.
///
/// # Errors
///
/// Returns [`TopicError::Unrecognized`] for topics outside the grammar,
/// including topics with empty id or key segments.
pub fn parse(topic: &str) -> Result<ParsedTopic<'_>> {
    let segments: Vec<&str> = topic.split('/').collect();
    let parsed = match segments.as_slice() {
        ["", "devices", device, "controls", control] => ParsedTopic::ControlValue { device, control },
        ["", "devices", device, "controls", control, "on"] => {
            ParsedTopic::ControlOn { device, control }
        }
        ["", "devices", device, "controls", control, "meta"] => {
            ParsedTopic::ControlMetaJson { device, control }
        }
        ["", "devices", device, "controls", control, "meta", key] => {
            ParsedTopic::ControlMeta { device, control, key }
        }
        ["", "devices", device, "meta"] => ParsedTopic::DeviceMetaJson { device },
        ["", "devices", device, "meta", key] => ParsedTopic::DeviceMeta { device, key },
        _ => return Err(TopicError::Unrecognized(topic.to_string()).into()),
    };

    let ids_ok = match parsed {
        ParsedTopic::ControlValue { device, control }
        | ParsedTopic::ControlOn { device, control }
        | ParsedTopic::ControlMetaJson { device, control } => {
            !device.is_empty() && !control.is_empty()
        }
        ParsedTopic::ControlMeta { device, control, key } => {
            !device.is_empty() && !control.is_empty() && !key.is_empty()
        }
        ParsedTopic::DeviceMeta { device, key } => !device.is_empty() && !key.is_empty(),
        ParsedTopic::DeviceMetaJson { device } => !device.is_empty(),
    };
    if !ids_ok {
        return Err(TopicError::Unrecognized(topic.to_string()).into());
    }
    Ok(parsed)
}

// ========== Wildcard matching ==========

/// Matches a topic against an MQTT-style pattern.
///
/// `+` matches exactly one segment, `#` matches all remaining segments, any
/// other segment must match exactly (case-sensitive). A pattern with no
/// remaining segments matches only a topic with no remaining segments, so a
/// leading `/` in the pattern requires a leading `/` in the topic.
#[must_use]
pub fn matches(pattern: &str, topic: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('/').collect();
    let topic: Vec<&str> = topic.split('/').collect();
    segments_match(&pattern, &topic)
}

fn segments_match(pattern: &[&str], topic: &[&str]) -> bool {
    match pattern.split_first() {
        None => topic.is_empty(),
        Some((&"#", _)) => true,
        Some((head, rest)) => match topic.split_first() {
            None => false,
            Some((first, tail)) => (*head == "+" || head == first) && segments_match(rest, tail),
        },
    }
}
