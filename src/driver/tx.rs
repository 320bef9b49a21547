// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transactions over the device graph.
//!
//! A [`DriverTx`] holds the graph lock; while one is open neither the loop
//! nor another transaction can touch any device. Mutating operations apply
//! to the graph immediately, snapshot the resulting wire messages, and hand
//! them to the backend; the returned [`DriverFuture`] resolves once the
//! backend has pushed them to the broker.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::OwnedMutexGuard;

use super::{BackendRequest, DriverCore, DriverState};
use crate::control::{Control, ControlArgs, ValueChange};
use crate::device::{Device, DeviceArgs};
use crate::error::{ControlError, DeviceError, Result};
use crate::future::DriverFuture;
use crate::meta::{self, MetaInfo};
use crate::topic;
use crate::transport::MqttMessage;
use crate::value::Value;

/// An exclusive transaction over the device graph.
///
/// Obtained from [`Driver::begin_tx`](super::Driver::begin_tx) or passed
/// into handlers by the loop. Dropping it (or calling [`DriverTx::end`])
/// releases the graph.
pub struct DriverTx {
    state: OwnedMutexGuard<DriverState>,
    core: Arc<DriverCore>,
}

impl DriverTx {
    pub(crate) fn new(state: OwnedMutexGuard<DriverState>, core: Arc<DriverCore>) -> Self {
        Self { state, core }
    }

    pub(crate) fn graph_mut(&mut self) -> &mut DriverState {
        &mut self.state
    }

    pub(crate) fn core(&self) -> &DriverCore {
        &self.core
    }

    /// Closes the transaction, releasing the graph lock.
    pub fn end(self) {
        drop(self);
    }

    /// The id this driver publishes as device ownership.
    #[must_use]
    pub fn driver_id(&self) -> &str {
        &self.core.driver_id
    }

    // ========== Graph queries ==========

    /// `true` if a live (not deleted) device with this id exists.
    #[must_use]
    pub fn has_device(&self, device_id: &str) -> bool {
        self.state
            .devices
            .get(device_id)
            .is_some_and(|device| !device.is_deleted())
    }

    /// Looks up a live device.
    ///
    /// # Errors
    ///
    /// [`DeviceError::NotFound`] for an unknown id, [`DeviceError::Deleted`]
    /// for a removed one.
    pub fn device(&self, device_id: &str) -> Result<&Device> {
        match self.state.devices.get(device_id) {
            None => Err(DeviceError::NotFound(device_id.to_string()).into()),
            Some(device) if device.is_deleted() => {
                Err(DeviceError::Deleted(device_id.to_string()).into())
            }
            Some(device) => Ok(device),
        }
    }

    /// All live devices, local and external, ordered by id.
    #[must_use]
    pub fn devices_list(&self) -> Vec<&Device> {
        self.state
            .devices
            .values()
            .filter(|device| !device.is_deleted())
            .collect()
    }

    /// Ids of all live devices.
    #[must_use]
    pub fn device_ids(&self) -> Vec<String> {
        self.state
            .devices
            .values()
            .filter(|device| !device.is_deleted())
            .map(|device| device.id().to_string())
            .collect()
    }

    fn live_device_mut(&mut self, device_id: &str) -> Result<&mut Device> {
        match self.state.devices.get_mut(device_id) {
            None => Err(DeviceError::NotFound(device_id.to_string()).into()),
            Some(device) if device.is_deleted() => {
                Err(DeviceError::Deleted(device_id.to_string()).into())
            }
            Some(device) => Ok(device),
        }
    }

    fn local_device_mut(&mut self, device_id: &str) -> Result<&mut Device> {
        let device = self.live_device_mut(device_id)?;
        if !device.is_local() {
            return Err(DeviceError::NotLocal(device_id.to_string()).into());
        }
        Ok(device)
    }

    // ========== Devices ==========

    /// Creates a local device and publishes its metadata, ownership
    /// included.
    ///
    /// An external mirror with the same id is adopted in place if it is
    /// unowned or already owned by this driver: its retained metadata is
    /// reconciled by delta (stale keys are cleared) and its control
    /// metadata is remembered so re-created controls reconcile the same
    /// way. A mirror owned by another driver, or a live local device,
    /// fails with [`DeviceError::Redefinition`].
    ///
    /// The future resolves with the device id once the metadata is on the
    /// wire.
    pub fn create_device(&mut self, args: DeviceArgs) -> DriverFuture<String> {
        match self.create_device_inner(args) {
            Ok(future) => future,
            Err(e) => DriverFuture::ready(Err(e)),
        }
    }

    fn create_device_inner(&mut self, args: DeviceArgs) -> Result<DriverFuture<String>> {
        let device_id = args
            .id_ref()
            .ok_or(DeviceError::ArgsMissing("id"))?
            .to_string();

        let mut previous_meta = MetaInfo::new();
        let mut adopted_controls: BTreeMap<String, MetaInfo> = BTreeMap::new();
        match self.state.devices.get(&device_id) {
            None => {}
            // A deleted shadow's topics were cleared at removal.
            Some(existing) if existing.is_deleted() => {}
            Some(existing) if existing.is_local() => {
                return Err(DeviceError::Redefinition(device_id).into());
            }
            Some(existing) => {
                let adoptable = existing
                    .driver_id()
                    .is_none_or(|owner| owner.is_empty() || owner == self.core.driver_id);
                if !adoptable {
                    return Err(DeviceError::Redefinition(device_id).into());
                }
                previous_meta = existing.meta();
                for control in existing.controls_list() {
                    adopted_controls.insert(control.id().to_string(), control.meta());
                }
                tracing::info!(device = %device_id, "adopting external device");
            }
        }

        let device = Device::local(args)?;
        let meta = publish_meta(&self.core.driver_id, &device);
        let mut messages = Vec::new();
        for (key, value) in meta.delta(&previous_meta).iter() {
            messages.push(MqttMessage::retained(
                topic::device_meta_topic(&device_id, key)?,
                value,
            ));
        }
        if let Some(doc) = combined_document(&meta) {
            messages.push(MqttMessage::retained(
                topic::device_meta_json_topic(&device_id)?,
                doc,
            ));
        }

        self.state.devices.insert(device_id.clone(), device);
        self.state
            .adopted_control_meta
            .insert(device_id.clone(), adopted_controls);

        let (done, future) = DriverFuture::pair();
        self.core.submit(BackendRequest::NewDevice {
            device_id,
            messages,
            done,
        });
        Ok(future)
    }

    /// Removes a local device: clears every topic it ever published
    /// (values, control metadata, device metadata, ownership), drops its
    /// `/on` subscriptions and forgets its stored values.
    ///
    /// The graph keeps a deleted shadow so stale references fail loudly
    /// instead of resurrecting the device.
    pub fn remove_device(&mut self, device_id: &str) -> DriverFuture<()> {
        match self.remove_device_inner(device_id) {
            Ok(future) => future,
            Err(e) => DriverFuture::ready(Err(e)),
        }
    }

    fn remove_device_inner(&mut self, device_id: &str) -> Result<DriverFuture<()>> {
        let our_id = self.core.driver_id.clone();
        let storage = self.core.storage.clone();

        let (messages, unsubscribe) = {
            let device = self.local_device_mut(device_id)?;
            let mut messages = Vec::new();
            let mut unsubscribe = Vec::new();
            for control in device.controls_list() {
                let control_id = control.id();
                if control.topics_created() {
                    if control.is_retained() {
                        messages.push(MqttMessage::retained(
                            topic::control_value_topic(device_id, control_id)?,
                            "",
                        ));
                    }
                    for (key, _) in control.meta().iter() {
                        messages.push(MqttMessage::retained(
                            topic::control_meta_topic(device_id, control_id, key)?,
                            "",
                        ));
                    }
                    messages.push(MqttMessage::retained(
                        topic::control_meta_json_topic(device_id, control_id)?,
                        "",
                    ));
                }
                if control.is_writable() {
                    unsubscribe.push(topic::control_on_topic(device_id, control_id)?);
                }
            }
            for (key, _) in publish_meta(&our_id, device).iter() {
                messages.push(MqttMessage::retained(
                    topic::device_meta_topic(device_id, key)?,
                    "",
                ));
            }
            messages.push(MqttMessage::retained(
                topic::device_meta_json_topic(device_id)?,
                "",
            ));
            device.mark_deleted();
            (messages, unsubscribe)
        };

        if let Some(storage) = &storage
            && let Err(e) = storage.remove_device(device_id)
        {
            tracing::warn!(device = %device_id, error = %e,
                "stored value cleanup failed");
        }
        self.state.adopted_control_meta.remove(device_id);

        let (done, future) = DriverFuture::pair();
        self.core.submit(BackendRequest::RemoveDevice {
            device_id: device_id.to_string(),
            messages,
            unsubscribe,
            done,
        });
        Ok(future)
    }

    // ========== Controls ==========

    /// Creates a control on a local device, publishes its metadata and
    /// initial value, and subscribes its `/on` topic when writable.
    ///
    /// Without an explicit initial value, a stored previous value is
    /// restored when the control (or its device) asks for it. Lazy-init
    /// controls publish nothing until their first value. On an adopted
    /// device, metadata left by the adopted mirror's control of the same
    /// id is reconciled by delta.
    ///
    /// The future resolves with the control id.
    pub fn create_control(&mut self, device_id: &str, args: ControlArgs) -> DriverFuture<String> {
        match self.create_control_inner(device_id, args) {
            Ok(future) => future,
            Err(e) => DriverFuture::ready(Err(e)),
        }
    }

    fn create_control_inner(
        &mut self,
        device_id: &str,
        args: ControlArgs,
    ) -> Result<DriverFuture<String>> {
        let explicit_value = args.has_explicit_value();
        let storage = self.core.storage.clone();

        let device_default = {
            let device = self.local_device_mut(device_id)?;
            device.do_load_previous()
        };

        let mut control = Control::from_args(args)?;
        if !explicit_value
            && control.do_load_previous(device_default)
            && let Some(storage) = &storage
        {
            match storage.load(device_id, control.id()) {
                Ok(Some(stored)) => {
                    // A restored value counts as a first value.
                    if control.set_raw_value(stored).is_ok() {
                        control.set_topics_created();
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(device = %device_id, control = %control.id(),
                        error = %e, "stored value load failed");
                }
            }
        }

        let control_id = control.id().to_string();
        let previous_meta = self
            .state
            .adopted_control_meta
            .get_mut(device_id)
            .and_then(|controls| controls.remove(&control_id))
            .unwrap_or_default();

        let (messages, subscribe) = {
            let device = self.local_device_mut(device_id)?;
            let control = device.add_control(control)?;
            let meta = control.meta();
            let mut messages = Vec::new();
            if control.topics_created() {
                for (key, value) in meta.delta(&previous_meta).iter() {
                    messages.push(MqttMessage::retained(
                        topic::control_meta_topic(device_id, &control_id, key)?,
                        value,
                    ));
                }
                if let Some(doc) = combined_document(&meta) {
                    messages.push(MqttMessage::retained(
                        topic::control_meta_json_topic(device_id, &control_id)?,
                        doc,
                    ));
                }
                if control.is_retained() {
                    messages.push(MqttMessage::retained(
                        topic::control_value_topic(device_id, &control_id)?,
                        control.raw_value(),
                    ));
                }
            } else {
                tracing::debug!(device = %device_id, control = %control_id,
                    "lazy control, topics deferred until first value");
            }
            let subscribe = if control.is_writable() {
                Some(topic::control_on_topic(device_id, &control_id)?)
            } else {
                None
            };
            (messages, subscribe)
        };

        let (done, future) = DriverFuture::pair();
        self.core.submit(BackendRequest::NewControl {
            device_id: device_id.to_string(),
            control_id,
            messages,
            subscribe,
            done,
        });
        Ok(future)
    }

    /// Removes a control from a local device, clearing its topics and
    /// dropping its `/on` subscription and stored value.
    pub fn remove_control(&mut self, device_id: &str, control_id: &str) -> DriverFuture<()> {
        match self.remove_control_inner(device_id, control_id) {
            Ok(future) => future,
            Err(e) => DriverFuture::ready(Err(e)),
        }
    }

    fn remove_control_inner(
        &mut self,
        device_id: &str,
        control_id: &str,
    ) -> Result<DriverFuture<()>> {
        let storage = self.core.storage.clone();

        let (messages, unsubscribe) = {
            let device = self.local_device_mut(device_id)?;
            let control = device.control(control_id)?;
            let mut messages = Vec::new();
            if control.topics_created() {
                if control.is_retained() {
                    messages.push(MqttMessage::retained(
                        topic::control_value_topic(device_id, control_id)?,
                        "",
                    ));
                }
                for (key, _) in control.meta().iter() {
                    messages.push(MqttMessage::retained(
                        topic::control_meta_topic(device_id, control_id, key)?,
                        "",
                    ));
                }
                messages.push(MqttMessage::retained(
                    topic::control_meta_json_topic(device_id, control_id)?,
                    "",
                ));
            }
            let unsubscribe = if control.is_writable() {
                Some(topic::control_on_topic(device_id, control_id)?)
            } else {
                None
            };
            device.remove_control(control_id)?;
            (messages, unsubscribe)
        };

        if let Some(storage) = &storage
            && let Err(e) = storage.remove(device_id, control_id)
        {
            tracing::warn!(device = %device_id, control = %control_id, error = %e,
                "stored value cleanup failed");
        }

        let (done, future) = DriverFuture::pair();
        self.core.submit(BackendRequest::RemoveControl {
            device_id: device_id.to_string(),
            control_id: control_id.to_string(),
            messages,
            unsubscribe,
            done,
        });
        Ok(future)
    }

    // ========== Values ==========

    /// Sets a typed value on a local control and publishes it: retained
    /// for stateful controls, transient for buttons.
    ///
    /// With `notify` the control's value-update handler runs inside this
    /// transaction after the publication is queued. The stored previous
    /// value is updated for controls that restore it.
    pub fn update_control_value(
        &mut self,
        device_id: &str,
        control_id: &str,
        value: impl Into<Value>,
        notify: bool,
    ) -> DriverFuture<()> {
        let value = value.into();
        let result = (|| {
            let raw = {
                let device = self.local_device_mut(device_id)?;
                let control = device.control(control_id)?;
                let Some(kind) = control.control_type() else {
                    return Err(ControlError::Incomplete(control_id.to_string()).into());
                };
                value.to_raw(kind.data_type())?
            };
            self.apply_local_value(device_id, control_id, &raw, value, notify)
        })();
        match result {
            Ok(future) => future,
            Err(e) => DriverFuture::ready(Err(e)),
        }
    }

    /// Raw-string variant of [`DriverTx::update_control_value`]; the raw
    /// value must parse under the control's declared type.
    pub fn update_control_raw_value(
        &mut self,
        device_id: &str,
        control_id: &str,
        raw_value: &str,
        notify: bool,
    ) -> DriverFuture<()> {
        match self.update_control_raw_value_inner(device_id, control_id, raw_value, notify) {
            Ok(future) => future,
            Err(e) => DriverFuture::ready(Err(e)),
        }
    }

    pub(crate) fn update_control_raw_value_inner(
        &mut self,
        device_id: &str,
        control_id: &str,
        raw_value: &str,
        notify: bool,
    ) -> Result<DriverFuture<()>> {
        let typed = {
            let device = self.local_device_mut(device_id)?;
            let control = device.control(control_id)?;
            let Some(kind) = control.control_type() else {
                return Err(ControlError::Incomplete(control_id.to_string()).into());
            };
            Value::from_raw(raw_value, kind.data_type())?
        };
        self.apply_local_value(device_id, control_id, raw_value, typed, notify)
    }

    fn apply_local_value(
        &mut self,
        device_id: &str,
        control_id: &str,
        raw_value: &str,
        value: Value,
        notify: bool,
    ) -> Result<DriverFuture<()>> {
        let storage = self.core.storage.clone();

        let (prev, messages, persist, handler) = {
            let device = self.local_device_mut(device_id)?;
            let device_default = device.do_load_previous();
            let control = device.control_mut(control_id)?;
            if !control.is_complete() {
                return Err(ControlError::Incomplete(control_id.to_string()).into());
            }
            let prev = control.set_raw_value(raw_value)?;
            let flush_meta = !control.topics_created();
            control.set_topics_created();

            let mut messages = Vec::new();
            if flush_meta {
                let meta = control.meta();
                for (key, value) in meta.iter() {
                    messages.push(MqttMessage::retained(
                        topic::control_meta_topic(device_id, control_id, key)?,
                        value,
                    ));
                }
                if let Some(doc) = combined_document(&meta) {
                    messages.push(MqttMessage::retained(
                        topic::control_meta_json_topic(device_id, control_id)?,
                        doc,
                    ));
                }
            }
            let value_topic = topic::control_value_topic(device_id, control_id)?;
            messages.push(if control.is_retained() {
                MqttMessage::retained(value_topic, raw_value)
            } else {
                MqttMessage::transient(value_topic, raw_value)
            });

            let handler = if notify {
                control.value_update_handler()
            } else {
                None
            };
            (
                prev,
                messages,
                control.do_load_previous(device_default),
                handler,
            )
        };

        let (done, future) = DriverFuture::pair();
        self.core.submit(BackendRequest::UpdateControlValue { messages, done });

        if persist
            && let Some(storage) = &storage
            && let Err(e) = storage.store(device_id, control_id, raw_value)
        {
            tracing::warn!(device = %device_id, control = %control_id, error = %e,
                "value persistence failed");
        }

        if let Some(handler) = handler {
            let change = ValueChange {
                device: device_id.to_string(),
                control: control_id.to_string(),
                value,
                raw_value: raw_value.to_string(),
                prev_raw_value: prev,
            };
            if let Err(e) = handler(self, &change) {
                tracing::warn!(device = %device_id, control = %control_id, error = %e,
                    "value handler failed");
            }
        }

        Ok(future)
    }

    // ========== Metadata ==========

    /// Updates one control meta field. On a local device the field and the
    /// refreshed combined document are published; on an external mirror
    /// only the local bookkeeping changes.
    pub fn update_control_meta(
        &mut self,
        device_id: &str,
        control_id: &str,
        key: &str,
        value: &str,
    ) -> DriverFuture<()> {
        match self.update_control_meta_inner(device_id, control_id, key, value) {
            Ok(future) => future,
            Err(e) => DriverFuture::ready(Err(e)),
        }
    }

    fn update_control_meta_inner(
        &mut self,
        device_id: &str,
        control_id: &str,
        key: &str,
        value: &str,
    ) -> Result<DriverFuture<()>> {
        let messages = {
            let device = self.live_device_mut(device_id)?;
            let local = device.is_local();
            let control = device.control_mut(control_id)?;
            control.accept_meta(key, value)?;
            if !local || !control.topics_created() {
                return Ok(DriverFuture::ready(Ok(())));
            }
            let mut messages = vec![MqttMessage::retained(
                topic::control_meta_topic(device_id, control_id, key)?,
                value,
            )];
            if let Some(doc) = combined_document(&control.meta()) {
                messages.push(MqttMessage::retained(
                    topic::control_meta_json_topic(device_id, control_id)?,
                    doc,
                ));
            }
            messages
        };

        let (done, future) = DriverFuture::pair();
        self.core.submit(BackendRequest::UpdateControlMeta { messages, done });
        Ok(future)
    }

    /// Updates one device meta field, publishing it together with the
    /// refreshed combined document for local devices.
    ///
    /// The ownership key is managed by the core and rejected here.
    pub fn update_device_meta(
        &mut self,
        device_id: &str,
        key: &str,
        value: &str,
    ) -> DriverFuture<()> {
        match self.update_device_meta_inner(device_id, key, value) {
            Ok(future) => future,
            Err(e) => DriverFuture::ready(Err(e)),
        }
    }

    fn update_device_meta_inner(
        &mut self,
        device_id: &str,
        key: &str,
        value: &str,
    ) -> Result<DriverFuture<()>> {
        if key == topic::DRIVER_META_KEY {
            return Err(DeviceError::UnknownMeta(key.to_string()).into());
        }
        let our_id = self.core.driver_id.clone();

        let messages = {
            let device = self.live_device_mut(device_id)?;
            device.accept_meta(key, value)?;
            if !device.is_local() {
                return Ok(DriverFuture::ready(Ok(())));
            }
            let mut messages = vec![MqttMessage::retained(
                topic::device_meta_topic(device_id, key)?,
                value,
            )];
            if let Some(doc) = combined_document(&publish_meta(&our_id, device)) {
                messages.push(MqttMessage::retained(
                    topic::device_meta_json_topic(device_id)?,
                    doc,
                ));
            }
            messages
        };

        let (done, future) = DriverFuture::pair();
        self.core.submit(BackendRequest::UpdateDeviceMeta { messages, done });
        Ok(future)
    }

    // ========== External writes ==========

    /// Requests a value change on another driver's control by publishing a
    /// typed value to its `/on` topic. The owning driver confirms (or
    /// rejects) by publishing the value topic.
    pub fn set_on_value(
        &mut self,
        device_id: &str,
        control_id: &str,
        value: impl Into<Value>,
    ) -> DriverFuture<()> {
        let value = value.into();
        let result = (|| {
            let raw = {
                let device = self.external_device(device_id)?;
                let control = device.control(control_id)?;
                control.check_on_value_allowed()?;
                let Some(kind) = control.control_type() else {
                    return Err(ControlError::Incomplete(control_id.to_string()).into());
                };
                value.to_raw(kind.data_type())?
            };
            self.submit_on_value(device_id, control_id, raw)
        })();
        match result {
            Ok(future) => future,
            Err(e) => DriverFuture::ready(Err(e)),
        }
    }

    /// Raw-string variant of [`DriverTx::set_on_value`]; the payload goes
    /// out verbatim, validation is the owning driver's business.
    pub fn set_raw_on_value(
        &mut self,
        device_id: &str,
        control_id: &str,
        raw_value: impl Into<String>,
    ) -> DriverFuture<()> {
        let result = (|| {
            {
                let device = self.external_device(device_id)?;
                let control = device.control(control_id)?;
                control.check_on_value_allowed()?;
            }
            self.submit_on_value(device_id, control_id, raw_value.into())
        })();
        match result {
            Ok(future) => future,
            Err(e) => DriverFuture::ready(Err(e)),
        }
    }

    fn external_device(&self, device_id: &str) -> Result<&Device> {
        let device = self.device(device_id)?;
        if device.is_local() {
            return Err(DeviceError::NotExternal(device_id.to_string()).into());
        }
        Ok(device)
    }

    fn submit_on_value(
        &mut self,
        device_id: &str,
        control_id: &str,
        raw_value: String,
    ) -> Result<DriverFuture<()>> {
        let message =
            MqttMessage::transient(topic::control_on_topic(device_id, control_id)?, raw_value);
        let (done, future) = DriverFuture::pair();
        self.core.submit(BackendRequest::SetOnValue { message, done });
        Ok(future)
    }

    // ========== Handlers ==========

    /// Installs the handler run inside the loop when a confirmed value
    /// lands on this control. For local controls it fires on updates made
    /// with `notify`; for external mirrors on every confirmed change.
    ///
    /// # Errors
    ///
    /// Device or control lookup errors.
    pub fn set_value_update_handler(
        &mut self,
        device_id: &str,
        control_id: &str,
        handler: impl Fn(&mut DriverTx, &ValueChange) -> Result<()> + Send + Sync + 'static,
    ) -> Result<()> {
        let device = self.live_device_mut(device_id)?;
        let control = device.control_mut(control_id)?;
        control.set_value_update_handler(Arc::new(handler));
        Ok(())
    }

    /// Installs the handler run inside the loop when a value change
    /// request arrives on this local control's `/on` topic. Without one,
    /// requests are confirmed as-is.
    ///
    /// # Errors
    ///
    /// Device or control lookup errors; [`DeviceError::NotLocal`] for
    /// external mirrors, whose `/on` topic belongs to their owner.
    pub fn set_on_value_receive_handler(
        &mut self,
        device_id: &str,
        control_id: &str,
        handler: impl Fn(&mut DriverTx, &ValueChange) -> Result<()> + Send + Sync + 'static,
    ) -> Result<()> {
        let device = self.local_device_mut(device_id)?;
        let control = device.control_mut(control_id)?;
        control.set_on_value_receive_handler(Arc::new(handler));
        Ok(())
    }
}

impl std::fmt::Debug for DriverTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverTx")
            .field("driver_id", &self.core.driver_id)
            .field("devices", &self.state.devices.len())
            .finish_non_exhaustive()
    }
}

/// Device metadata as published: local devices are stamped with our
/// ownership.
fn publish_meta(driver_id: &str, device: &Device) -> MetaInfo {
    let mut meta = device.meta();
    if device.is_local() {
        meta.set(meta::KEY_DRIVER, driver_id);
    }
    meta
}

/// The combined per-object metadata document: a flat JSON object of the
/// per-key payloads.
fn combined_document(meta: &MetaInfo) -> Option<String> {
    match serde_json::to_string(meta) {
        Ok(doc) => Some(doc),
        Err(e) => {
            tracing::warn!(error = %e, "combined meta document encoding failed");
            None
        }
    }
}
