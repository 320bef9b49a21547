// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The driver core: a single-writer event loop over the device graph.
//!
//! One loop task owns all mutation of the device/control graph. Everything
//! else reaches the graph through a [`DriverTx`] transaction, which holds
//! the graph lock for its lifetime, so user code and the loop never observe
//! each other mid-change. Inbound traffic arrives as [`DriverEvent`] values
//! on a bounded queue; outbound effects leave as backend requests that
//! resolve a [`DriverFuture`] once the wire effect is durable.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mqttconv::device::DeviceArgs;
//! use mqttconv::driver::{Driver, DriverConfig};
//! use mqttconv::filter::DeviceFilter;
//! use mqttconv::transport::RumqttcTransport;
//!
//! # async fn example() -> mqttconv::Result<()> {
//! let transport = Arc::new(RumqttcTransport::builder().host("localhost").build());
//! let driver = Driver::new(
//!     DriverConfig::new(transport)
//!         .driver_id("sample-driver")
//!         .filter(DeviceFilter::AllDevices),
//! )?;
//! driver.start_loop()?;
//! driver.wait_for_ready().await?;
//!
//! let future = driver
//!     .access(|tx| Ok(tx.create_device(DeviceArgs::new().id("sample").title("Sample"))))
//!     .await?;
//! future.await?;
//!
//! driver.close().await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod tx;

pub use self::tx::DriverTx;
pub(crate) use self::backend::BackendRequest;

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::control::{Control, ValueChange};
use crate::device::Device;
use crate::error::{DriverError, Result};
use crate::event::DriverEvent;
use crate::filter::DeviceFilter;
use crate::future::{Completer, DriverFuture};
use crate::meta::MetaInfo;
use crate::storage::ValueStorage;
use crate::topic;
use crate::transport::{MqttMessage, Transport};
use crate::value::{ControlType, Value};

/// Default capacity of the bounded event queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Poll interval of the spawned loop task between shutdown checks.
const LOOP_TICK: Duration = Duration::from_millis(500);

/// Identifies a registered driver-event observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

/// Observer of processed driver events. Runs in the loop after the event is
/// applied; must not call back into the driver while the loop is blocked on
/// it (graph access goes through [`Driver::access`] from elsewhere).
type DriverEventObserver = dyn Fn(&DriverEvent) + Send + Sync;

type ReadyThunk = Box<dyn FnOnce(&mut DriverTx) + Send>;
type AccessThunk = Box<dyn FnOnce(&mut DriverTx) -> Result<()> + Send>;

// ========== Configuration ==========

/// Configuration for [`Driver::new`].
///
/// The transport is mandatory at construction; the driver id is mandatory
/// before the driver is built. Everything else has defaults.
pub struct DriverConfig {
    transport: Arc<dyn Transport>,
    driver_id: String,
    queue_capacity: usize,
    reown_unknown_devices: bool,
    storage: Option<Arc<dyn ValueStorage>>,
    filter: DeviceFilter,
}

impl DriverConfig {
    /// Starts a configuration around a transport.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            driver_id: String::new(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            reown_unknown_devices: false,
            storage: None,
            filter: DeviceFilter::default(),
        }
    }

    /// Sets the driver id published as the ownership meta of every local
    /// device. Mandatory.
    #[must_use]
    pub fn driver_id(mut self, id: impl Into<String>) -> Self {
        self.driver_id = id.into();
        self
    }

    /// Sets the bounded event queue capacity (default
    /// [`DEFAULT_QUEUE_CAPACITY`]).
    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// When set, external devices observed with an *empty* ownership meta
    /// are claimed by publishing this driver's id (default off).
    #[must_use]
    pub fn reown_unknown_devices(mut self, reown: bool) -> Self {
        self.reown_unknown_devices = reown;
        self
    }

    /// Attaches a value storage used to persist and restore control values
    /// of virtual devices.
    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn ValueStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Sets the initial device filter (default [`DeviceFilter::NoDevices`]).
    #[must_use]
    pub fn filter(mut self, filter: DeviceFilter) -> Self {
        self.filter = filter;
        self
    }
}

// ========== Shared state ==========

/// The device graph. Owned by the async mutex a transaction locks.
pub(crate) struct DriverState {
    pub(crate) devices: BTreeMap<String, Device>,
    /// Control metadata of adopted external mirrors, kept until the
    /// matching control is re-created so its topics can be reconciled by
    /// delta.
    pub(crate) adopted_control_meta: BTreeMap<String, BTreeMap<String, MetaInfo>>,
}

/// Cheap shared context transactions need besides the graph itself.
pub(crate) struct DriverCore {
    pub(crate) driver_id: String,
    pub(crate) reown_unknown_devices: bool,
    pub(crate) storage: Option<Arc<dyn ValueStorage>>,
    backend_tx: mpsc::UnboundedSender<BackendRequest>,
}

impl DriverCore {
    /// Hands a request to the backend task; if the backend is gone the
    /// request's future (if any) fails with [`DriverError::Inactive`].
    pub(crate) fn submit(&self, request: BackendRequest) {
        if let Err(mpsc::error::SendError(request)) = self.backend_tx.send(request) {
            request.fail(DriverError::Inactive.into());
        }
    }
}

pub(crate) enum LoopMessage {
    Event(DriverEvent),
    Task(AccessTask),
    Stop,
}

pub(crate) struct AccessTask {
    thunk: AccessThunk,
    done: Completer<()>,
}

#[derive(Default)]
struct ReadyState {
    thunks: Vec<ReadyThunk>,
    waiters: Vec<Completer<()>>,
}

struct DriverInner {
    core: Arc<DriverCore>,
    state: Arc<AsyncMutex<DriverState>>,
    queue_tx: mpsc::Sender<LoopMessage>,
    queue_rx: AsyncMutex<mpsc::Receiver<LoopMessage>>,
    transport: Arc<dyn Transport>,
    filter: Mutex<DeviceFilter>,
    observers: RwLock<BTreeMap<HandlerId, Arc<DriverEventObserver>>>,
    next_handler_id: AtomicU64,
    ready: Mutex<ReadyState>,
    running: AtomicBool,
    closed: AtomicBool,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    /// Taken by the first `start_loop`; the backend task lives until
    /// `close`.
    backend_rx: Mutex<Option<mpsc::UnboundedReceiver<BackendRequest>>>,
}

// ========== Driver ==========

/// The driver: owns the device graph and the event loop over it.
///
/// Cheaply cloneable; clones share the same graph and queues.
#[derive(Clone)]
pub struct Driver {
    inner: Arc<DriverInner>,
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("driver_id", &self.inner.core.driver_id)
            .finish_non_exhaustive()
    }
}

impl Driver {
    /// Builds a driver from its configuration.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Config`] for an empty driver id or a zero
    /// queue capacity.
    pub fn new(config: DriverConfig) -> Result<Self> {
        if config.driver_id.is_empty() {
            return Err(DriverError::Config("driver id must not be empty").into());
        }
        if config.queue_capacity == 0 {
            return Err(DriverError::Config("event queue capacity must be non-zero").into());
        }

        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
        let (backend_tx, backend_rx) = mpsc::unbounded_channel();

        let core = Arc::new(DriverCore {
            driver_id: config.driver_id,
            reown_unknown_devices: config.reown_unknown_devices,
            storage: config.storage,
            backend_tx,
        });
        let state = Arc::new(AsyncMutex::new(DriverState {
            devices: BTreeMap::new(),
            adopted_control_meta: BTreeMap::new(),
        }));

        Ok(Self {
            inner: Arc::new(DriverInner {
                core,
                state,
                queue_tx,
                queue_rx: AsyncMutex::new(queue_rx),
                transport: config.transport,
                filter: Mutex::new(config.filter),
                observers: RwLock::new(BTreeMap::new()),
                next_handler_id: AtomicU64::new(1),
                ready: Mutex::new(ReadyState::default()),
                running: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                loop_task: Mutex::new(None),
                backend_rx: Mutex::new(Some(backend_rx)),
            }),
        })
    }

    /// The id this driver publishes as device ownership.
    #[must_use]
    pub fn driver_id(&self) -> &str {
        &self.inner.core.driver_id
    }

    // ========== Lifecycle ==========

    /// Starts the transport, the backend task and the loop task, then
    /// installs the configured filter (which triggers retained replay and a
    /// [`DriverEvent::Ready`]).
    ///
    /// # Errors
    ///
    /// [`DriverError::Active`] if the loop is already running,
    /// [`DriverError::Inactive`] after [`Driver::close`], and any transport
    /// start failure.
    pub fn start_loop(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(DriverError::Inactive.into());
        }
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(DriverError::Active.into());
        }

        if let Err(e) = self.inner.transport.start() {
            self.inner.running.store(false, Ordering::Release);
            return Err(e);
        }

        // The backend task is spawned once and serves across loop restarts.
        if let Some(backend_rx) = self.inner.backend_rx.lock().take() {
            let transport = Arc::clone(&self.inner.transport);
            let queue_tx = self.inner.queue_tx.clone();
            let backend_tx = self.inner.core.backend_tx.clone();
            tokio::spawn(async move {
                backend::run(backend_rx, backend_tx, transport, queue_tx).await;
            });
        }

        let filter = self.inner.filter.lock().clone();
        let (done, installed) = DriverFuture::pair();
        self.inner.core.submit(BackendRequest::SetFilter {
            topics: filter.topics(),
            done,
        });
        drop(installed);

        let driver = self.clone();
        let task = tokio::spawn(async move {
            while driver.loop_once(LOOP_TICK).await {}
            driver.inner.running.store(false, Ordering::Release);
            tracing::info!("driver loop stopped");
        });
        *self.inner.loop_task.lock() = Some(task);

        tracing::info!(driver_id = %self.inner.core.driver_id, "driver loop started");
        Ok(())
    }

    /// Signals the loop task to stop and waits for it to finish.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Inactive`] if the loop is not running.
    pub async fn stop_loop(&self) -> Result<()> {
        if !self.inner.running.load(Ordering::Acquire) {
            return Err(DriverError::Inactive.into());
        }
        if self.inner.queue_tx.send(LoopMessage::Stop).await.is_err() {
            return Err(DriverError::Inactive.into());
        }
        let task = self.inner.loop_task.lock().take();
        if let Some(task) = task
            && task.await.is_err()
        {
            tracing::warn!("driver loop task ended abnormally");
        }
        self.inner.running.store(false, Ordering::Release);
        Ok(())
    }

    /// Stops the loop if running, flushes and shuts down the backend, and
    /// stops the transport. Terminal: the driver cannot be restarted, and
    /// work still queued for the loop fails with [`DriverError::Inactive`].
    ///
    /// # Errors
    ///
    /// Returns the first transport shutdown failure, if any.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.inner.running.load(Ordering::Acquire) {
            let _ = self.stop_loop().await;
        }
        // If the backend never ran there is nothing to flush or stop;
        // dropping its queue fails anything submitted from now on.
        if self.inner.backend_rx.lock().take().is_some() {
            self.drain_queue().await;
            return Ok(());
        }
        let (done, flushed) = DriverFuture::pair();
        self.inner.core.submit(BackendRequest::Shutdown { done });
        // The loop no longer drains the queue. Close it so a backend parked
        // on a full queue can reach the shutdown request, and fail whatever
        // user work was still buffered.
        self.drain_queue().await;
        let _ = flushed.await;
        self.inner.transport.stop()?;
        tracing::info!(driver_id = %self.inner.core.driver_id, "driver closed");
        Ok(())
    }

    /// Closes the loop queue and fails the work still buffered in it. From
    /// here on `push_event` and `access_async` report
    /// [`DriverError::Inactive`].
    async fn drain_queue(&self) {
        let mut queue = self.inner.queue_rx.lock().await;
        queue.close();
        while let Some(message) = queue.recv().await {
            if let LoopMessage::Task(task) = message {
                task.done.fail(DriverError::Inactive.into());
            }
        }
    }

    // ========== Graph access ==========

    /// Opens an exclusive transaction over the device graph.
    ///
    /// The transaction serializes with the loop: while it is held no event
    /// is applied. Do not call from inside a handler running in the loop;
    /// handlers already hold the open transaction.
    pub async fn begin_tx(&self) -> DriverTx {
        let guard = Arc::clone(&self.inner.state).lock_owned().await;
        DriverTx::new(guard, Arc::clone(&self.inner.core))
    }

    /// Runs `f` inside a transaction and closes it afterwards.
    ///
    /// # Errors
    ///
    /// Passes through whatever `f` returns.
    pub async fn access<T>(&self, f: impl FnOnce(&mut DriverTx) -> Result<T>) -> Result<T> {
        let mut tx = self.begin_tx().await;
        let result = f(&mut tx);
        tx.end();
        result
    }

    /// Enqueues `f` to run inside the loop with its transaction; never
    /// blocks the caller.
    ///
    /// The returned future resolves with `f`'s result, or with
    /// [`DriverError::EventQueueFull`] if the queue had no room.
    pub fn access_async(
        &self,
        f: impl FnOnce(&mut DriverTx) -> Result<()> + Send + 'static,
    ) -> DriverFuture<()> {
        let (done, future) = DriverFuture::pair();
        let task = AccessTask {
            thunk: Box::new(f),
            done,
        };
        match self.inner.queue_tx.try_send(LoopMessage::Task(task)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                if let LoopMessage::Task(task) = message {
                    task.done.fail(DriverError::EventQueueFull.into());
                }
            }
            Err(mpsc::error::TrySendError::Closed(message)) => {
                if let LoopMessage::Task(task) = message {
                    task.done.fail(DriverError::Inactive.into());
                }
            }
        }
        future
    }

    /// Enqueues a driver event without blocking.
    ///
    /// # Errors
    ///
    /// [`DriverError::EventQueueFull`] when the bounded queue is full; the
    /// event is rejected, not queued. [`DriverError::Inactive`] once the
    /// driver is closed.
    pub fn push_event(&self, event: DriverEvent) -> Result<()> {
        match self.inner.queue_tx.try_send(LoopMessage::Event(event)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(DriverError::EventQueueFull.into()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DriverError::Inactive.into()),
        }
    }

    /// Processes at most one queue item, waiting up to `timeout` for one.
    ///
    /// Returns `false` when the shutdown signal was received, `true`
    /// otherwise, including a timeout with nothing processed. Intended for
    /// embedding the loop into an external run loop; [`Driver::start_loop`]
    /// drives it internally.
    pub async fn loop_once(&self, timeout: Duration) -> bool {
        let message = {
            let mut queue = self.inner.queue_rx.lock().await;
            match tokio::time::timeout(timeout, queue.recv()).await {
                Err(_) => return true,
                Ok(None) => return false,
                Ok(Some(message)) => message,
            }
        };
        match message {
            LoopMessage::Stop => false,
            LoopMessage::Task(task) => {
                let mut tx = self.begin_tx().await;
                let result = (task.thunk)(&mut tx);
                tx.end();
                task.done.complete(result);
                true
            }
            LoopMessage::Event(event) => {
                self.process_event(event).await;
                true
            }
        }
    }

    // ========== Ready protocol ==========

    /// Defers `thunk` to run inside the loop on the next
    /// [`DriverEvent::Ready`]. One-shot: re-register to react to the next
    /// replay as well.
    pub fn on_retain_ready(&self, thunk: impl FnOnce(&mut DriverTx) + Send + 'static) {
        self.inner.ready.lock().thunks.push(Box::new(thunk));
    }

    /// Resolves once the next [`DriverEvent::Ready`] has been processed.
    #[must_use]
    pub fn wait_for_ready(&self) -> DriverFuture<()> {
        let (done, future) = DriverFuture::pair();
        self.inner.ready.lock().waiters.push(done);
        future
    }

    /// Replaces the device filter. The backend swaps subscriptions and
    /// replays retained state, so a fresh [`DriverEvent::Ready`] follows.
    ///
    /// The returned future resolves once the new subscriptions are
    /// installed.
    pub fn set_filter(&self, filter: DeviceFilter) -> DriverFuture<()> {
        let topics = filter.topics();
        *self.inner.filter.lock() = filter;
        let (done, future) = DriverFuture::pair();
        self.inner.core.submit(BackendRequest::SetFilter { topics, done });
        future
    }

    // ========== Observers ==========

    /// Registers an observer called for every processed driver event,
    /// including the events the core synthesizes for external discovery.
    pub fn on_driver_event(
        &self,
        handler: impl Fn(&DriverEvent) + Send + Sync + 'static,
    ) -> HandlerId {
        let id = HandlerId(self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.inner.observers.write().insert(id, Arc::new(handler));
        id
    }

    /// Removes a registered observer; returns whether it existed.
    pub fn remove_driver_event_handler(&self, id: HandlerId) -> bool {
        self.inner.observers.write().remove(&id).is_some()
    }

    fn notify_observers(&self, event: &DriverEvent) {
        let observers: Vec<Arc<DriverEventObserver>> =
            self.inner.observers.read().values().cloned().collect();
        for observer in observers {
            observer(event);
        }
    }

    // ========== Event application ==========

    async fn process_event(&self, event: DriverEvent) {
        tracing::debug!(?event, "processing driver event");
        let mut notifications: Vec<DriverEvent> = Vec::new();
        {
            let mut tx = self.begin_tx().await;
            self.apply_event(&mut tx, event, &mut notifications);
            tx.end();
        }
        // Observers run with the graph lock released so they may schedule
        // follow-up work through the driver handle.
        for notification in &notifications {
            self.notify_observers(notification);
        }
    }

    #[allow(clippy::too_many_lines)]
    fn apply_event(
        &self,
        tx: &mut DriverTx,
        event: DriverEvent,
        notifications: &mut Vec<DriverEvent>,
    ) {
        match event {
            DriverEvent::Ready => {
                // Replay has settled: an external mirror still without an
                // owner is genuinely unowned.
                if self.inner.core.reown_unknown_devices {
                    claim_unowned_devices(tx);
                }
                let ReadyState { thunks, waiters } =
                    std::mem::take(&mut *self.inner.ready.lock());
                for thunk in thunks {
                    thunk(tx);
                }
                for waiter in waiters {
                    waiter.succeed(());
                }
                tracing::info!("retained replay complete, driver ready");
                notifications.push(DriverEvent::Ready);
            }

            DriverEvent::NewExternalDevice { device_id } => {
                ensure_external_device(tx.graph_mut(), &device_id, notifications);
            }

            DriverEvent::NewExternalDeviceControl {
                device_id,
                control_id,
            } => {
                let device = ensure_external_device(tx.graph_mut(), &device_id, notifications);
                if device.is_local() {
                    tracing::debug!(device = %device_id, control = %control_id,
                        "ignoring external control event for local device");
                } else {
                    ensure_external_control(device, &device_id, &control_id, notifications);
                }
            }

            DriverEvent::NewExternalDeviceMeta {
                device_id,
                key,
                value,
            } => {
                self.apply_device_meta(tx, &device_id, &key, &value, notifications);
                notifications.push(DriverEvent::NewExternalDeviceMeta {
                    device_id,
                    key,
                    value,
                });
            }

            DriverEvent::NewExternalDeviceControlMeta {
                device_id,
                control_id,
                key,
                value,
            } => {
                self.apply_control_meta(tx, &device_id, &control_id, &key, &value, notifications);
                notifications.push(DriverEvent::NewExternalDeviceControlMeta {
                    device_id,
                    control_id,
                    key,
                    value,
                });
            }

            DriverEvent::ControlValue {
                device_id,
                control_id,
                raw_value,
                ..
            } => {
                let prev_raw_value =
                    self.apply_control_value(tx, &device_id, &control_id, &raw_value, notifications);
                notifications.push(DriverEvent::ControlValue {
                    device_id,
                    control_id,
                    raw_value,
                    prev_raw_value,
                });
            }

            DriverEvent::ControlOnValue {
                device_id,
                control_id,
                raw_value,
            } => {
                self.apply_on_value(tx, &device_id, &control_id, &raw_value);
                notifications.push(DriverEvent::ControlOnValue {
                    device_id,
                    control_id,
                    raw_value,
                });
            }
        }
    }

    fn apply_device_meta(
        &self,
        tx: &mut DriverTx,
        device_id: &str,
        key: &str,
        value: &str,
        notifications: &mut Vec<DriverEvent>,
    ) {
        let our_id = self.inner.core.driver_id.clone();
        let reown = self.inner.core.reown_unknown_devices;

        let device = ensure_external_device(tx.graph_mut(), device_id, notifications);
        if device.is_local() {
            tracing::debug!(device = %device_id, key = %key,
                "device meta echo for local device");
            return;
        }

        if let Err(e) = device.accept_meta(key, value) {
            tracing::warn!(device = %device_id, key = %key, error = %e,
                "ignoring device meta");
        }

        // An unowned mirror may be claimed: publish our ownership once.
        let mut claim = false;
        if key == topic::DRIVER_META_KEY
            && reown
            && device.driver_id().is_some_and(str::is_empty)
        {
            device.set_driver_id(&our_id);
            claim = true;
        }

        if claim {
            if let Ok(ownership) = topic::driver_ownership_topic(device_id) {
                let (done, claimed) = DriverFuture::pair();
                tx.core().submit(BackendRequest::UpdateDeviceMeta {
                    messages: vec![MqttMessage::retained(ownership, our_id)],
                    done,
                });
                drop(claimed);
            }
            tracing::info!(device = %device_id, "claimed unowned external device");
        }

        if value.is_empty() {
            maybe_remove_cleared_device(tx, device_id);
        }
    }

    fn apply_control_meta(
        &self,
        tx: &mut DriverTx,
        device_id: &str,
        control_id: &str,
        key: &str,
        value: &str,
        notifications: &mut Vec<DriverEvent>,
    ) {
        let device = ensure_external_device(tx.graph_mut(), device_id, notifications);
        if device.is_local() {
            tracing::debug!(device = %device_id, control = %control_id, key = %key,
                "control meta echo for local device");
            return;
        }
        ensure_external_control(device, device_id, control_id, notifications);
        if let Ok(control) = device.control_mut(control_id)
            && let Err(e) = control.accept_meta(key, value)
        {
            tracing::warn!(device = %device_id, control = %control_id, key = %key,
                error = %e, "ignoring control meta");
        }

        if value.is_empty() {
            maybe_remove_cleared_control(tx, device_id, control_id);
            maybe_remove_cleared_device(tx, device_id);
        }
    }

    /// Applies a confirmed value; returns the previous raw value for the
    /// outgoing notification.
    fn apply_control_value(
        &self,
        tx: &mut DriverTx,
        device_id: &str,
        control_id: &str,
        raw_value: &str,
        notifications: &mut Vec<DriverEvent>,
    ) -> String {
        let device = ensure_external_device(tx.graph_mut(), device_id, notifications);

        if device.is_local() {
            // Echo of our own publication: observers see it, the graph
            // already holds the value.
            let prev = device
                .control(control_id)
                .map(|control| control.raw_value().to_string())
                .unwrap_or_default();
            tracing::debug!(device = %device_id, control = %control_id,
                "own value echo");
            return prev;
        }

        ensure_external_control(device, device_id, control_id, notifications);
        let (prev, handler, typed) = match device.control_mut(control_id) {
            Ok(control) => {
                let Ok(prev) = control.set_raw_value(raw_value) else {
                    return String::new();
                };
                (prev, control.value_update_handler(), control.value().ok())
            }
            Err(_) => return String::new(),
        };

        if let Some(handler) = handler {
            if let Some(value) = typed {
                let change = ValueChange {
                    device: device_id.to_string(),
                    control: control_id.to_string(),
                    value,
                    raw_value: raw_value.to_string(),
                    prev_raw_value: prev.clone(),
                };
                if let Err(e) = handler(tx, &change) {
                    tracing::warn!(device = %device_id, control = %control_id,
                        error = %e, "value handler failed");
                }
            } else {
                tracing::debug!(device = %device_id, control = %control_id,
                    "value handler skipped, typed value unavailable");
            }
        }

        if raw_value.is_empty() {
            maybe_remove_cleared_control(tx, device_id, control_id);
            maybe_remove_cleared_device(tx, device_id);
        }
        prev
    }

    fn apply_on_value(
        &self,
        tx: &mut DriverTx,
        device_id: &str,
        control_id: &str,
        raw_value: &str,
    ) {
        let outcome = {
            let Some(device) = tx.graph_mut().devices.get_mut(device_id) else {
                tracing::warn!(device = %device_id, "on request for unknown device");
                return;
            };
            if !device.is_local() {
                tracing::warn!(device = %device_id, control = %control_id,
                    "on request for external device");
                return;
            }
            let control = match device.control_mut(control_id) {
                Ok(control) => control,
                Err(e) => {
                    tracing::warn!(device = %device_id, control = %control_id,
                        error = %e, "on request for unknown control");
                    return;
                }
            };
            if let Err(e) = control.check_on_value_allowed() {
                tracing::warn!(device = %device_id, control = %control_id,
                    error = %e, "rejected on request");
                return;
            }
            let data_type = control
                .control_type()
                .map_or(crate::value::DataType::String, ControlType::data_type);
            match Value::from_raw(raw_value, data_type) {
                Ok(value) => (
                    value,
                    control.on_value_receive_handler(),
                    control.raw_value().to_string(),
                ),
                Err(e) => {
                    tracing::warn!(device = %device_id, control = %control_id,
                        error = %e, "unparsable on request");
                    return;
                }
            }
        };
        let (value, handler, prev) = outcome;

        if let Some(handler) = handler {
            let change = ValueChange {
                device: device_id.to_string(),
                control: control_id.to_string(),
                value,
                raw_value: raw_value.to_string(),
                prev_raw_value: prev,
            };
            if let Err(e) = handler(tx, &change) {
                tracing::warn!(device = %device_id, control = %control_id,
                    error = %e, "on-value handler failed");
            }
        } else {
            // No handler: confirm the requested value as-is.
            match tx.update_control_raw_value_inner(device_id, control_id, raw_value, true) {
                Ok(confirmed) => drop(confirmed),
                Err(e) => {
                    tracing::warn!(device = %device_id, control = %control_id,
                        error = %e, "auto-confirm failed");
                }
            }
        }
    }
}

// ========== External mirror bookkeeping ==========

/// Returns the device for `device_id`, materializing an external mirror on
/// first sight (or over a deleted shadow) and recording the synthesized
/// discovery notification.
fn ensure_external_device<'a>(
    graph: &'a mut DriverState,
    device_id: &str,
    notifications: &mut Vec<DriverEvent>,
) -> &'a mut Device {
    match graph.devices.entry(device_id.to_string()) {
        Entry::Occupied(entry) => {
            let device = entry.into_mut();
            if device.is_deleted() {
                tracing::debug!(device = %device_id, "mirroring external device over shadow");
                *device = Device::external(device_id);
                notifications.push(DriverEvent::new_external_device(device_id));
            }
            device
        }
        Entry::Vacant(entry) => {
            tracing::debug!(device = %device_id, "mirroring new external device");
            notifications.push(DriverEvent::new_external_device(device_id));
            entry.insert(Device::external(device_id))
        }
    }
}

fn ensure_external_control(
    device: &mut Device,
    device_id: &str,
    control_id: &str,
    notifications: &mut Vec<DriverEvent>,
) {
    if !device.has_control(control_id)
        && device.add_control(Control::external(control_id)).is_ok()
    {
        tracing::debug!(device = %device_id, control = %control_id,
            "mirroring new external control");
        notifications.push(DriverEvent::new_external_device_control(
            device_id, control_id,
        ));
    }
}

/// Drops an external control whose topics were all cleared; the control
/// requested its own removal, there is nothing left to clean on the wire.
fn maybe_remove_cleared_control(tx: &mut DriverTx, device_id: &str, control_id: &str) {
    let Some(device) = tx.graph_mut().devices.get_mut(device_id) else {
        return;
    };
    if device.is_local() {
        return;
    }
    let cleared = device
        .control(control_id)
        .is_ok_and(Control::is_cleared);
    if !cleared {
        return;
    }
    device.drop_control(control_id);
    tx.core().submit(BackendRequest::RemoveExternalControl {
        device_id: device_id.to_string(),
        control_id: control_id.to_string(),
    });
}

fn maybe_remove_cleared_device(tx: &mut DriverTx, device_id: &str) {
    let cleared = tx
        .graph_mut()
        .devices
        .get(device_id)
        .is_some_and(|device| !device.is_local() && device.is_cleared());
    if !cleared {
        return;
    }
    tx.graph_mut().devices.remove(device_id);
    tx.core().submit(BackendRequest::RemoveExternalDevice {
        device_id: device_id.to_string(),
    });
}

/// Claims every external mirror whose ownership meta replayed empty: records
/// our id on the mirror and publishes it to the ownership topic, once per
/// device.
fn claim_unowned_devices(tx: &mut DriverTx) {
    let our_id = tx.core().driver_id.clone();
    let unowned: Vec<String> = tx
        .graph_mut()
        .devices
        .values()
        .filter(|device| {
            !device.is_deleted()
                && !device.is_local()
                && device.driver_id().is_some_and(str::is_empty)
        })
        .map(|device| device.id().to_string())
        .collect();

    for device_id in unowned {
        let Ok(ownership) = topic::driver_ownership_topic(&device_id) else {
            continue;
        };
        if let Some(device) = tx.graph_mut().devices.get_mut(&device_id) {
            device.set_driver_id(&our_id);
        }
        let (done, claimed) = DriverFuture::pair();
        tx.core().submit(BackendRequest::UpdateDeviceMeta {
            messages: vec![MqttMessage::retained(ownership, our_id.clone())],
            done,
        });
        drop(claimed);
        tracing::info!(device = %device_id, "claimed unowned external device");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::testing::FakeBroker;

    fn test_driver(broker: &FakeBroker) -> Driver {
        Driver::new(
            DriverConfig::new(broker.client("test-driver"))
                .driver_id("test-driver")
                .queue_capacity(4),
        )
        .unwrap()
    }

    #[test]
    fn config_requires_driver_id() {
        let broker = FakeBroker::new();
        let err = Driver::new(DriverConfig::new(broker.client("x"))).unwrap_err();
        assert!(matches!(err, Error::Driver(DriverError::Config(_))));
    }

    #[test]
    fn config_rejects_zero_capacity() {
        let broker = FakeBroker::new();
        let err = Driver::new(
            DriverConfig::new(broker.client("x"))
                .driver_id("d")
                .queue_capacity(0),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Driver(DriverError::Config(_))));
    }

    #[tokio::test]
    async fn push_event_reports_queue_full() {
        let broker = FakeBroker::new();
        let driver = test_driver(&broker);
        // Loop not started: nothing drains the queue.
        for _ in 0..4 {
            driver.push_event(DriverEvent::ready()).unwrap();
        }
        let err = driver.push_event(DriverEvent::ready()).unwrap_err();
        assert!(matches!(err, Error::Driver(DriverError::EventQueueFull)));
    }

    #[tokio::test]
    async fn start_twice_is_active_error() {
        let broker = FakeBroker::new();
        let driver = test_driver(&broker);
        driver.start_loop().unwrap();
        assert!(matches!(
            driver.start_loop().unwrap_err(),
            Error::Driver(DriverError::Active)
        ));
        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn stop_without_start_is_inactive_error() {
        let broker = FakeBroker::new();
        let driver = test_driver(&broker);
        assert!(matches!(
            driver.stop_loop().await.unwrap_err(),
            Error::Driver(DriverError::Inactive)
        ));
    }

    #[tokio::test]
    async fn close_fails_queued_and_late_work() {
        let broker = FakeBroker::new();
        let driver = test_driver(&broker);
        // Loop never started: the task stays queued until close drains it.
        let pending = driver.access_async(|_| Ok(()));
        driver.close().await.unwrap();

        assert!(matches!(
            pending.await.unwrap_err(),
            Error::Driver(DriverError::Inactive)
        ));
        assert!(matches!(
            driver.push_event(DriverEvent::ready()).unwrap_err(),
            Error::Driver(DriverError::Inactive)
        ));
        assert!(matches!(
            driver.access_async(|_| Ok(())).await.unwrap_err(),
            Error::Driver(DriverError::Inactive)
        ));
    }

    #[tokio::test]
    async fn observer_registration_roundtrip() {
        let broker = FakeBroker::new();
        let driver = test_driver(&broker);
        let id = driver.on_driver_event(|_| {});
        let other = driver.on_driver_event(|_| {});
        assert_ne!(id, other);
        assert!(driver.remove_driver_event_handler(id));
        assert!(!driver.remove_driver_event_handler(id));
    }
}
