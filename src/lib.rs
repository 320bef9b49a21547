// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `mqttconv` - A Rust driver framework for the `/devices` MQTT convention.
//!
//! Devices on the bus live under `/devices/{device}/controls/{control}`:
//! retained value and metadata topics describe them, a `/on` topic accepts
//! write requests, and a `driver` metadata key records ownership. This
//! crate gives a driver everything it needs to speak that convention.
//!
//! # What's Inside
//!
//! - **Topic codec**: build and recognize every topic shape of the
//!   convention, with `+`/`#` pattern matching
//! - **Device model**: local devices you publish, external mirrors built
//!   from observed traffic, typed controls with metadata deltas
//! - **Driver core**: a single-writer event loop, exclusive transactions,
//!   and futures that resolve when effects reach the broker
//! - **Retained bootstrap**: subscribe, replay retained state, and learn
//!   exactly when the replay is over
//! - **Persistence**: restore virtual-device control values across restarts
//!
//! The `mqtt` feature (default) provides the [`rumqttc`]-backed transport;
//! [`testing::FakeBroker`] covers everything in-process.
//!
//! # Quick Start
//!
//! ## Publishing a Local Device
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mqttconv::control::ControlArgs;
//! use mqttconv::device::DeviceArgs;
//! use mqttconv::driver::{Driver, DriverConfig};
//! use mqttconv::transport::RumqttcTransport;
//! use mqttconv::value::ControlType;
//!
//! #[tokio::main]
//! async fn main() -> mqttconv::Result<()> {
//!     let transport = Arc::new(RumqttcTransport::builder().host("192.168.1.50").build());
//!     let driver = Driver::new(DriverConfig::new(transport).driver_id("demo-driver"))?;
//!     driver.start_loop()?;
//!     driver.wait_for_ready().await?;
//!
//!     // Futures are created inside the transaction and awaited outside it.
//!     let (device, control) = driver
//!         .access(|tx| {
//!             let device = tx.create_device(DeviceArgs::new().id("demo").title("Demo"));
//!             let control = tx.create_control(
//!                 "demo",
//!                 ControlArgs::new()
//!                     .id("temperature")
//!                     .kind(ControlType::Temperature)
//!                     .value(21.5),
//!             );
//!             Ok((device, control))
//!         })
//!         .await?;
//!     device.await?;
//!     control.await?;
//!
//!     driver.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Observing the Whole Bus
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mqttconv::driver::{Driver, DriverConfig};
//! use mqttconv::filter::DeviceFilter;
//! use mqttconv::transport::RumqttcTransport;
//!
//! #[tokio::main]
//! async fn main() -> mqttconv::Result<()> {
//!     let transport = Arc::new(RumqttcTransport::builder().host("192.168.1.50").build());
//!     let driver = Driver::new(
//!         DriverConfig::new(transport)
//!             .driver_id("observer")
//!             .filter(DeviceFilter::AllDevices),
//!     )?;
//!     driver.on_driver_event(|event| println!("bus: {event:?}"));
//!     driver.start_loop()?;
//!     driver.wait_for_ready().await?;
//!
//!     // Every retained device on the bus is mirrored by now.
//!     let devices = driver.access(|tx| Ok(tx.device_ids())).await?;
//!     println!("found {devices:?}");
//!
//!     driver.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Reacting to Write Requests
//!
//! A writable control's `/on` topic carries value change requests from
//! other drivers. Without a handler the driver confirms them as-is; with
//! one, your code decides:
//!
//! ```ignore
//! driver
//!     .access(|tx| {
//!         tx.set_on_value_receive_handler("demo", "relay", |tx, change| {
//!             let _ = tx.update_control_value("demo", "relay", change.value.clone(), true);
//!             Ok(())
//!         })
//!     })
//!     .await?;
//! ```

pub mod control;
pub mod device;
pub mod driver;
pub mod error;
pub mod event;
pub mod filter;
pub mod future;
pub mod meta;
pub mod storage;
pub mod testing;
pub mod topic;
pub mod transport;
pub mod value;

pub use control::{Control, ControlArgs, ControlValueHandler, ValueChange};
pub use device::{Device, DeviceArgs, DeviceKind};
pub use driver::{Driver, DriverConfig, DriverTx, HandlerId};
pub use error::{
    ControlError, DeviceError, DriverError, Error, Result, TopicError, ValueError,
};
pub use event::DriverEvent;
pub use filter::DeviceFilter;
pub use future::DriverFuture;
pub use meta::{MetaInfo, Title};
pub use storage::{JsonFileStorage, MemoryStorage, ValueStorage};
#[cfg(feature = "mqtt")]
pub use transport::RumqttcTransport;
pub use transport::{MqttMessage, Transport};
pub use value::{ControlType, DataType, Rgb, Value};
