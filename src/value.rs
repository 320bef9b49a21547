// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control types and typed values.
//!
//! Every control declares a [`ControlType`] in its `type` meta field. The
//! declared type selects a [`DataType`], which governs how the raw wire
//! string converts to and from a typed [`Value`]. Raw strings stay
//! authoritative: the typed value is always derived on demand, and a raw
//! string that does not parse under the declared type is an error, never a
//! silent coercion.
//!
//! # Examples
//!
//! ```
//! use mqttconv::value::{ControlType, DataType, Value};
//!
//! let kind = ControlType::from("temperature");
//! assert_eq!(kind.data_type(), DataType::Float);
//!
//! let value = Value::from_raw("21.5", kind.data_type())?;
//! assert_eq!(value.as_f64(), Some(21.5));
//! # Ok::<(), mqttconv::error::ValueError>(())
//! ```

use std::fmt;
use std::str::FromStr;

use crate::error::ValueError;

/// Wire encoding of boolean `true`.
pub const BOOL_TRUE: &str = "1";
/// Wire encoding of boolean `false`.
pub const BOOL_FALSE: &str = "0";

// ========== Control types ==========

/// The declared type of a control, as carried in its `type` meta field.
///
/// The vocabulary is closed over the generic types plus the value-derived
/// physical types; any other wire string lands in [`ControlType::Other`]
/// and behaves as a plain string control.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ControlType {
    /// Two-state actuator, `"1"`/`"0"`.
    Switch,
    /// Two-state indicator, `"1"`/`"0"`.
    Alarm,
    /// Stateless button; write-only, never retained.
    Pushbutton,
    /// Numeric value bounded by the `max` meta field.
    Range,
    /// Color value encoded `"r;g;b"`.
    Rgb,
    /// Free-form text.
    Text,
    /// Generic numeric value.
    Value,
    /// Temperature reading.
    Temperature,
    /// Relative humidity reading.
    RelHumidity,
    /// Atmospheric pressure reading.
    AtmosphericPressure,
    /// Rainfall rate reading.
    Rainfall,
    /// Wind speed reading.
    WindSpeed,
    /// Instantaneous power reading.
    Power,
    /// Accumulated power consumption.
    PowerConsumption,
    /// Voltage reading.
    Voltage,
    /// Water flow rate reading.
    WaterFlow,
    /// Accumulated water consumption.
    WaterConsumption,
    /// Resistance reading.
    Resistance,
    /// Concentration reading.
    Concentration,
    /// Instantaneous heat power reading.
    HeatPower,
    /// Accumulated heat energy.
    HeatEnergy,
    /// Unknown type string; treated as plain text.
    Other(String),
}

impl ControlType {
    /// Returns the data type governing raw/typed conversion for this type.
    #[must_use]
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Switch | Self::Alarm => DataType::Boolean,
            Self::Pushbutton => DataType::Button,
            Self::Range
            | Self::Value
            | Self::Temperature
            | Self::RelHumidity
            | Self::AtmosphericPressure
            | Self::Rainfall
            | Self::WindSpeed
            | Self::Power
            | Self::PowerConsumption
            | Self::Voltage
            | Self::WaterFlow
            | Self::WaterConsumption
            | Self::Resistance
            | Self::Concentration
            | Self::HeatPower
            | Self::HeatEnergy => DataType::Float,
            Self::Rgb | Self::Text | Self::Other(_) => DataType::String,
        }
    }

    /// Returns the default raw value seeded at control creation, if the
    /// type defines one.
    #[must_use]
    pub fn default_raw_value(&self) -> Option<&'static str> {
        match self {
            Self::Switch | Self::Alarm => Some(BOOL_FALSE),
            _ => None,
        }
    }

    /// `true` for types whose mandatory metadata includes `max`.
    #[must_use]
    pub fn requires_max(&self) -> bool {
        matches!(self, Self::Range)
    }
}

impl From<&str> for ControlType {
    fn from(s: &str) -> Self {
        match s {
            "switch" => Self::Switch,
            "alarm" => Self::Alarm,
            "pushbutton" => Self::Pushbutton,
            "range" => Self::Range,
            "rgb" => Self::Rgb,
            "text" => Self::Text,
            "value" => Self::Value,
            "temperature" => Self::Temperature,
            "rel_humidity" => Self::RelHumidity,
            "atmospheric_pressure" => Self::AtmosphericPressure,
            "rainfall" => Self::Rainfall,
            "wind_speed" => Self::WindSpeed,
            "power" => Self::Power,
            "power_consumption" => Self::PowerConsumption,
            "voltage" => Self::Voltage,
            "water_flow" => Self::WaterFlow,
            "water_consumption" => Self::WaterConsumption,
            "resistance" => Self::Resistance,
            "concentration" => Self::Concentration,
            "heat_power" => Self::HeatPower,
            "heat_energy" => Self::HeatEnergy,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for ControlType {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl fmt::Display for ControlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Switch => "switch",
            Self::Alarm => "alarm",
            Self::Pushbutton => "pushbutton",
            Self::Range => "range",
            Self::Rgb => "rgb",
            Self::Text => "text",
            Self::Value => "value",
            Self::Temperature => "temperature",
            Self::RelHumidity => "rel_humidity",
            Self::AtmosphericPressure => "atmospheric_pressure",
            Self::Rainfall => "rainfall",
            Self::WindSpeed => "wind_speed",
            Self::Power => "power",
            Self::PowerConsumption => "power_consumption",
            Self::Voltage => "voltage",
            Self::WaterFlow => "water_flow",
            Self::WaterConsumption => "water_consumption",
            Self::Resistance => "resistance",
            Self::Concentration => "concentration",
            Self::HeatPower => "heat_power",
            Self::HeatEnergy => "heat_energy",
            Self::Other(s) => s,
        };
        f.write_str(s)
    }
}

// ========== Data types ==========

/// The conversion discipline a control type selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// Raw string passes through unchanged.
    String,
    /// `"1"`/`"0"` wire encoding.
    Boolean,
    /// Decimal number.
    Float,
    /// Boolean-encoded press; write-only, never retained.
    Button,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Boolean => "boolean",
            Self::Float => "float",
            Self::Button => "button",
        };
        f.write_str(s)
    }
}

// ========== Typed values ==========

/// A typed control value, derived from or serialized to a raw wire string.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Boolean value (`"1"`/`"0"` on the wire).
    Bool(bool),
    /// Numeric value.
    Number(f64),
    /// Text value.
    Text(String),
    /// Color value (`"r;g;b"` on the wire).
    Rgb(Rgb),
}

impl Value {
    /// Derives a typed value from a raw wire string.
    ///
    /// Pure and idempotent: the same `(raw, data_type)` pair always produces
    /// the same result.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::WrongValueType`] when `raw` does not parse
    /// under `data_type`.
    pub fn from_raw(raw: &str, data_type: DataType) -> Result<Self, ValueError> {
        match data_type {
            DataType::String => Ok(Self::Text(raw.to_string())),
            DataType::Boolean | DataType::Button => match raw {
                BOOL_TRUE => Ok(Self::Bool(true)),
                BOOL_FALSE => Ok(Self::Bool(false)),
                other if other.eq_ignore_ascii_case("true") => Ok(Self::Bool(true)),
                other if other.eq_ignore_ascii_case("false") => Ok(Self::Bool(false)),
                _ => Err(ValueError::WrongValueType {
                    data_type,
                    raw: raw.to_string(),
                }),
            },
            DataType::Float => raw.parse::<f64>().map(Self::Number).map_err(|_| {
                ValueError::WrongValueType {
                    data_type,
                    raw: raw.to_string(),
                }
            }),
        }
    }

    /// Serializes to the raw wire string under a data type.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::NotRepresentable`] when this variant cannot
    /// represent `data_type`.
    pub fn to_raw(&self, data_type: DataType) -> Result<String, ValueError> {
        match (self, data_type) {
            (Self::Bool(b), DataType::Boolean | DataType::Button) => {
                Ok(if *b { BOOL_TRUE } else { BOOL_FALSE }.to_string())
            }
            (Self::Number(n), DataType::Float) => Ok(n.to_string()),
            (Self::Text(s), DataType::String) => Ok(s.clone()),
            (Self::Rgb(c), DataType::String) => Ok(c.to_string()),
            _ => Err(ValueError::NotRepresentable {
                data_type,
                value: self.to_string(),
            }),
        }
    }

    /// Returns the boolean payload, if this is a [`Value::Bool`].
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the numeric payload, if this is a [`Value::Number`].
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the text payload, if this is a [`Value::Text`].
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Rgb> for Value {
    fn from(c: Rgb) -> Self {
        Self::Rgb(c)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
            Self::Rgb(c) => write!(f, "{c}"),
        }
    }
}

// ========== Rgb ==========

/// A color value, encoded `"r;g;b"` on the wire with components 0-255.
///
/// # Examples
///
/// ```
/// use mqttconv::value::Rgb;
///
/// let red = Rgb::new(255, 0, 0);
/// assert_eq!(red.to_string(), "255;0;0");
///
/// let parsed: Rgb = "0;128;255".parse()?;
/// assert_eq!(parsed.blue(), 255);
/// # Ok::<(), mqttconv::error::ValueError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rgb {
    red: u8,
    green: u8,
    blue: u8,
}

impl Rgb {
    /// Creates a color from components.
    #[must_use]
    pub const fn new(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }

    /// Red component.
    #[must_use]
    pub const fn red(&self) -> u8 {
        self.red
    }

    /// Green component.
    #[must_use]
    pub const fn green(&self) -> u8 {
        self.green
    }

    /// Blue component.
    #[must_use]
    pub const fn blue(&self) -> u8 {
        self.blue
    }
}

impl FromStr for Rgb {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ValueError::InvalidRgb(s.to_string());
        let mut parts = s.split(';');
        let red = parts.next().ok_or_else(bad)?;
        let green = parts.next().ok_or_else(bad)?;
        let blue = parts.next().ok_or_else(bad)?;
        if parts.next().is_some() {
            return Err(bad());
        }
        Ok(Self {
            red: red.trim().parse().map_err(|_| bad())?,
            green: green.trim().parse().map_err(|_| bad())?,
            blue: blue.trim().parse().map_err(|_| bad())?,
        })
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{};{}", self.red, self.green, self.blue)
    }
}
