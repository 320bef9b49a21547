// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the `mqttconv` library.
//!
//! This module provides the error hierarchy for failures across the library:
//! topic parsing, raw/typed value conversion, control and device state
//! machines, and the driver core itself.

use thiserror::Error;

use crate::value::DataType;

/// The main error type for this library.
///
/// This enum encompasses all possible errors that can occur while running a
/// driver over the devices/controls topic convention.
#[derive(Debug, Error)]
pub enum Error {
    /// Error in topic construction or recognition.
    #[error("topic error: {0}")]
    Topic(#[from] TopicError),

    /// Error converting between raw wire strings and typed values.
    #[error("value error: {0}")]
    Value(#[from] ValueError),

    /// Error in a control operation.
    #[error("control error: {0}")]
    Control(#[from] ControlError),

    /// Error in a device operation.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// Error in the driver core or one of its collaborators.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
}

/// Errors related to topic construction and recognition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicError {
    /// The topic does not belong to any shape of the convention.
    #[error("unrecognized topic: {0}")]
    Unrecognized(String),

    /// A device or control id used in a topic contains a `/`.
    #[error("topic component contains '/': {0}")]
    BadComponent(String),
}

/// Errors related to raw/typed value conversion.
///
/// Raw values are the authoritative wire strings; typed values are derived
/// from them on demand. Conversion never coerces silently.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValueError {
    /// A raw wire string does not parse under the control's data type.
    #[error("raw value {raw:?} does not parse as {data_type}")]
    WrongValueType {
        /// Data type the control declares.
        data_type: DataType,
        /// The raw string that failed to parse.
        raw: String,
    },

    /// A typed value cannot be encoded under the control's data type.
    #[error("{value} cannot be encoded as {data_type}")]
    NotRepresentable {
        /// Data type the control declares.
        data_type: DataType,
        /// Display form of the offending value.
        value: String,
    },

    /// A numeric meta field (max, min, precision, order) failed to parse.
    #[error("invalid numeric value for {field}: {raw:?}")]
    BadNumeric {
        /// The meta field being parsed.
        field: &'static str,
        /// The raw string that failed to parse.
        raw: String,
    },

    /// An `"r;g;b"` string has a malformed component or separator.
    #[error("invalid rgb value: {0:?}")]
    InvalidRgb(String),
}

/// Errors related to control operations and the control state machine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// Mandatory control arguments were not supplied.
    #[error("mandatory control argument missing: {0}")]
    ArgsMissing(&'static str),

    /// Control id is empty or contains characters outside `[A-Za-z0-9_-]`.
    #[error("incorrect control id: {0:?}")]
    IncorrectId(String),

    /// A control with this id already exists on the device.
    #[error("control {0:?} already defined")]
    Redefinition(String),

    /// No control with this id exists on the device.
    #[error("control {0:?} not found")]
    NotFound(String),

    /// The control's mandatory metadata has not all arrived yet.
    #[error("control {0:?} is not complete")]
    Incomplete(String),

    /// The control was deleted; no further mutation is possible.
    #[error("control {0:?} is deleted")]
    Deleted(String),

    /// Attempt to write through a control that is not writable.
    #[error("control {0:?} is not writable")]
    NotWritable(String),

    /// Inbound control metadata used a key outside the convention.
    #[error("unknown control meta key: {0:?}")]
    UnknownMeta(String),
}

/// Errors related to device operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// Mandatory device arguments were not supplied.
    #[error("mandatory device argument missing: {0}")]
    ArgsMissing(&'static str),

    /// Device id is empty or contains characters outside `[A-Za-z0-9_-]`.
    #[error("incorrect device id: {0:?}")]
    IncorrectId(String),

    /// A device with this id already exists in the driver.
    #[error("device {0:?} already defined")]
    Redefinition(String),

    /// No device with this id exists in the driver.
    #[error("device {0:?} not found")]
    NotFound(String),

    /// The device was deleted; no further mutation is possible.
    #[error("device {0:?} is deleted")]
    Deleted(String),

    /// The operation requires a local device.
    #[error("device {0:?} is not local")]
    NotLocal(String),

    /// The operation requires an external device.
    #[error("device {0:?} is not external")]
    NotExternal(String),

    /// Inbound device metadata used a key outside the convention.
    #[error("unknown device meta key: {0:?}")]
    UnknownMeta(String),
}

/// Errors related to the driver core and its collaborators.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The driver configuration is unusable.
    #[error("invalid driver configuration: {0}")]
    Config(&'static str),

    /// The driver loop is already running.
    #[error("driver loop is already running")]
    Active,

    /// The driver loop is not running.
    #[error("driver loop is not running")]
    Inactive,

    /// The bounded event queue is full; the event was not enqueued.
    #[error("driver event queue is full")]
    EventQueueFull,

    /// The other side of a request was dropped before resolving it.
    #[error("request dropped before resolution")]
    FutureDropped,

    /// A wait on a request outcome did not finish in time.
    #[error("request timed out")]
    Timeout,

    /// MQTT client operation failed.
    #[cfg(feature = "mqtt")]
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// Transport collaborator failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// Persistence collaborator failed.
    #[error("storage error: {0}")]
    Storage(String),
}

/// A specialized Result type for this library.
pub type Result<T> = std::result::Result<T, Error>;
