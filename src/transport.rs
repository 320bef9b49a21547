// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire transport abstraction.
//!
//! The driver core talks to the broker through the [`Transport`] trait, so
//! the real MQTT client and the in-process fake used by tests are
//! interchangeable. The trait mirrors the small surface the convention
//! needs: lifecycle, publish, pattern subscriptions and the retained-replay
//! probe behind [`Transport::wait_for_retained`].
//!
//! [`RumqttcTransport`] (behind the `mqtt` feature, on by default) is the
//! production implementation over a shared `rumqttc` connection.

use std::sync::Arc;

use crate::error::Result;

/// A single broker message, inbound or outbound.
///
/// Payloads under the convention are UTF-8 strings; inbound frames that do
/// not decode as UTF-8 are dropped by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    /// Full topic the message was published on.
    pub topic: String,
    /// Raw payload string.
    pub payload: String,
    /// Quality-of-service level (0, 1 or 2).
    pub qos: u8,
    /// Whether the broker keeps (or kept) this message as the topic's
    /// retained value. On inbound messages this flags retained replay.
    pub retained: bool,
}

impl MqttMessage {
    /// Creates a QoS 1 retained message.
    ///
    /// State under the convention (values and meta) is published retained so
    /// late subscribers bootstrap from it. An empty retained payload clears
    /// the topic.
    #[must_use]
    pub fn retained(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: 1,
            retained: true,
        }
    }

    /// Creates a QoS 1 non-retained message.
    ///
    /// Used for `/on` change requests, which are commands rather than state.
    #[must_use]
    pub fn transient(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: 1,
            retained: false,
        }
    }

    /// `true` if the payload is empty, i.e. the message clears a retained
    /// topic rather than setting it.
    #[must_use]
    pub fn is_clearing(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Callback invoked by the transport for every inbound message matching a
/// subscription.
pub type MessageHandler = dyn Fn(MqttMessage) + Send + Sync;

/// The broker-facing surface the driver backend relies on.
///
/// Implementations must deliver retained replay for a subscription before
/// they fire a [`Transport::wait_for_retained`] callback requested after
/// that subscription, and must keep per-connection message order.
pub trait Transport: Send + Sync {
    /// Starts the transport. Starting an already-started transport is a
    /// no-op.
    fn start(&self) -> Result<()>;

    /// Stops the transport and drops the connection.
    fn stop(&self) -> Result<()>;

    /// Enqueues `message` for publication.
    fn publish(&self, message: MqttMessage) -> Result<()>;

    /// Subscribes `handler` to every pattern in `topics`.
    ///
    /// Patterns use the usual wildcards (`+` for one segment, `#` for the
    /// remainder). Retained messages matching a new pattern are replayed to
    /// the handler with [`MqttMessage::retained`] set.
    fn subscribe(&self, handler: Arc<MessageHandler>, topics: &[String]) -> Result<()>;

    /// Drops the subscriptions for every pattern in `topics`.
    fn unsubscribe(&self, topics: &[String]) -> Result<()>;

    /// Arranges for `done` to run once all retained messages for the
    /// subscriptions issued so far have been delivered.
    fn wait_for_retained(&self, done: Box<dyn FnOnce() + Send>) -> Result<()>;
}

#[cfg(feature = "mqtt")]
pub use self::rumqttc_transport::{RumqttcTransport, RumqttcTransportBuilder};

#[cfg(feature = "mqtt")]
mod rumqttc_transport {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;
    use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeFilter};
    use tokio::task::JoinHandle;

    use super::{MessageHandler, MqttMessage, Transport};
    use crate::error::{DriverError, Result};

    /// Global counter for generating unique client ids.
    static CLIENT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

    /// Counter for generating unique retained-probe topics.
    static PROBE_COUNTER: AtomicU64 = AtomicU64::new(0);

    /// Request queue capacity for the `rumqttc` client. Sized for the burst
    /// of retained publications a device redefinition produces.
    const REQUEST_QUEUE_CAP: usize = 256;

    fn qos_from(level: u8) -> QoS {
        match level {
            0 => QoS::AtMostOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtLeastOnce,
        }
    }

    fn qos_level(qos: QoS) -> u8 {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }

    struct SubscriptionEntry {
        pattern: String,
        handler: Arc<MessageHandler>,
    }

    /// State shared between the transport handle and its poll task.
    struct Shared {
        subscriptions: Mutex<Vec<SubscriptionEntry>>,
        /// Pending retained probes by probe topic.
        probes: Mutex<HashMap<String, Box<dyn FnOnce() + Send>>>,
        connected: AtomicBool,
        stopping: AtomicBool,
        reconnect_delay: Duration,
    }

    impl Shared {
        /// Routes an inbound message to probe callbacks or subscription
        /// handlers.
        fn dispatch(&self, client: &AsyncClient, message: MqttMessage) {
            if let Some(done) = self.probes.lock().remove(&message.topic) {
                let _ = client.try_unsubscribe(&message.topic);
                done();
                return;
            }

            let handlers: Vec<Arc<MessageHandler>> = {
                let subscriptions = self.subscriptions.lock();
                let mut matched: Vec<Arc<MessageHandler>> = Vec::new();
                for entry in subscriptions.iter() {
                    if crate::topic::matches(&entry.pattern, &message.topic)
                        && !matched.iter().any(|h| Arc::ptr_eq(h, &entry.handler))
                    {
                        matched.push(Arc::clone(&entry.handler));
                    }
                }
                matched
            };

            for handler in handlers {
                handler(message.clone());
            }
        }

        /// Re-issues every known subscription. Called on (re)connect since
        /// the session is clean.
        fn resubscribe_all(&self, client: &AsyncClient) {
            let filters: Vec<SubscribeFilter> = self
                .subscriptions
                .lock()
                .iter()
                .map(|entry| SubscribeFilter::new(entry.pattern.clone(), QoS::AtLeastOnce))
                .collect();
            if filters.is_empty() {
                return;
            }
            if let Err(e) = client.try_subscribe_many(filters) {
                tracing::warn!(error = %e, "failed to restore subscriptions");
            }
        }
    }

    struct Connection {
        client: AsyncClient,
        poll_task: JoinHandle<()>,
    }

    /// MQTT transport over a `rumqttc` async client.
    ///
    /// The connection is opened by [`Transport::start`]; a background task
    /// polls the event loop, restores subscriptions after reconnects and
    /// routes inbound publishes to the registered handlers.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use mqttconv::transport::{RumqttcTransport, Transport};
    ///
    /// # fn example() -> mqttconv::Result<()> {
    /// let transport = RumqttcTransport::builder()
    ///     .host("192.168.1.50")
    ///     .port(1883)
    ///     .client_id("my-driver")
    ///     .build();
    /// transport.start()?;
    /// # Ok(())
    /// # }
    /// ```
    pub struct RumqttcTransport {
        config: TransportConfig,
        connection: Mutex<Option<Connection>>,
        shared: Arc<Shared>,
    }

    #[derive(Debug, Clone)]
    struct TransportConfig {
        host: String,
        port: u16,
        credentials: Option<(String, String)>,
        keep_alive: Duration,
        client_id: String,
    }

    impl RumqttcTransport {
        /// Creates a new builder for configuring the transport.
        #[must_use]
        pub fn builder() -> RumqttcTransportBuilder {
            RumqttcTransportBuilder::default()
        }

        /// Returns whether the underlying connection is currently up.
        #[must_use]
        pub fn is_connected(&self) -> bool {
            self.shared.connected.load(Ordering::Acquire)
        }

        /// Returns the client id used for the connection.
        #[must_use]
        pub fn client_id(&self) -> &str {
            &self.config.client_id
        }

        fn with_client<T>(&self, op: impl FnOnce(&AsyncClient) -> Result<T>) -> Result<T> {
            let connection = self.connection.lock();
            match connection.as_ref() {
                Some(connection) => op(&connection.client),
                None => Err(DriverError::Transport("transport is not started".to_string()).into()),
            }
        }
    }

    impl Transport for RumqttcTransport {
        fn start(&self) -> Result<()> {
            let mut connection = self.connection.lock();
            if connection.is_some() {
                return Ok(());
            }

            let mut options = MqttOptions::new(
                &self.config.client_id,
                &self.config.host,
                self.config.port,
            );
            options.set_keep_alive(self.config.keep_alive);
            options.set_clean_session(true);
            if let Some((ref username, ref password)) = self.config.credentials {
                options.set_credentials(username, password);
            }

            let (client, event_loop) = AsyncClient::new(options, REQUEST_QUEUE_CAP);
            self.shared.stopping.store(false, Ordering::Release);

            let shared = Arc::clone(&self.shared);
            let loop_client = client.clone();
            let poll_task = tokio::spawn(async move {
                run_event_loop(event_loop, loop_client, shared).await;
            });

            tracing::info!(
                host = %self.config.host,
                port = %self.config.port,
                client_id = %self.config.client_id,
                "MQTT transport started"
            );

            *connection = Some(Connection { client, poll_task });
            Ok(())
        }

        fn stop(&self) -> Result<()> {
            let Some(connection) = self.connection.lock().take() else {
                return Err(DriverError::Transport("transport is not started".to_string()).into());
            };

            self.shared.stopping.store(true, Ordering::Release);
            if connection.client.try_disconnect().is_err() {
                // The request queue may be gone already; the poll task sees
                // the stopping flag either way.
                connection.poll_task.abort();
            }
            self.shared.connected.store(false, Ordering::Release);
            tracing::info!(client_id = %self.config.client_id, "MQTT transport stopped");
            Ok(())
        }

        fn publish(&self, message: MqttMessage) -> Result<()> {
            self.with_client(|client| {
                client
                    .try_publish(
                        &message.topic,
                        qos_from(message.qos),
                        message.retained,
                        message.payload.clone(),
                    )
                    .map_err(DriverError::Mqtt)?;
                Ok(())
            })
        }

        fn subscribe(&self, handler: Arc<MessageHandler>, topics: &[String]) -> Result<()> {
            if topics.is_empty() {
                return Ok(());
            }
            self.with_client(|client| {
                {
                    let mut subscriptions = self.shared.subscriptions.lock();
                    for pattern in topics {
                        subscriptions.push(SubscriptionEntry {
                            pattern: pattern.clone(),
                            handler: Arc::clone(&handler),
                        });
                    }
                }
                let filters: Vec<SubscribeFilter> = topics
                    .iter()
                    .map(|pattern| SubscribeFilter::new(pattern.clone(), QoS::AtLeastOnce))
                    .collect();
                client.try_subscribe_many(filters).map_err(DriverError::Mqtt)?;
                Ok(())
            })
        }

        fn unsubscribe(&self, topics: &[String]) -> Result<()> {
            self.with_client(|client| {
                {
                    let mut subscriptions = self.shared.subscriptions.lock();
                    subscriptions.retain(|entry| !topics.contains(&entry.pattern));
                }
                for pattern in topics {
                    client.try_unsubscribe(pattern).map_err(DriverError::Mqtt)?;
                }
                Ok(())
            })
        }

        fn wait_for_retained(&self, done: Box<dyn FnOnce() + Send>) -> Result<()> {
            // The probe rides the same ordered request stream as the
            // subscriptions before it, so its echo arrives only after the
            // broker has flushed their retained replay.
            self.with_client(|client| {
                let probe = format!(
                    "/tmp/{}/retainhack/{}",
                    self.config.client_id,
                    PROBE_COUNTER.fetch_add(1, Ordering::Relaxed)
                );
                self.shared.probes.lock().insert(probe.clone(), done);
                if let Err(e) = client
                    .try_subscribe(&probe, QoS::AtLeastOnce)
                    .and_then(|()| client.try_publish(&probe, QoS::AtLeastOnce, false, "1"))
                {
                    self.shared.probes.lock().remove(&probe);
                    return Err(DriverError::Mqtt(e).into());
                }
                Ok(())
            })
        }
    }

    async fn run_event_loop(mut event_loop: EventLoop, client: AsyncClient, shared: Arc<Shared>) {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                    tracing::debug!(?connack, "MQTT connection established");
                    shared.connected.store(true, Ordering::Release);
                    shared.resubscribe_all(&client);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if let Ok(payload) = String::from_utf8(publish.payload.to_vec()) {
                        shared.dispatch(
                            &client,
                            MqttMessage {
                                topic: publish.topic,
                                payload,
                                qos: qos_level(publish.qos),
                                retained: publish.retain,
                            },
                        );
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    shared.connected.store(false, Ordering::Release);
                    if shared.stopping.load(Ordering::Acquire) {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    shared.connected.store(false, Ordering::Release);
                    if shared.stopping.load(Ordering::Acquire) {
                        break;
                    }
                    tracing::warn!(error = %e, "MQTT connection lost, reconnecting");
                    tokio::time::sleep(shared.reconnect_delay).await;
                }
            }
        }
    }

    /// Builder for [`RumqttcTransport`].
    #[derive(Debug, Clone)]
    pub struct RumqttcTransportBuilder {
        host: String,
        port: u16,
        credentials: Option<(String, String)>,
        keep_alive: Duration,
        client_id: Option<String>,
        reconnect_delay: Duration,
    }

    impl Default for RumqttcTransportBuilder {
        fn default() -> Self {
            Self {
                host: "localhost".to_string(),
                port: 1883,
                credentials: None,
                keep_alive: Duration::from_secs(30),
                client_id: None,
                reconnect_delay: Duration::from_secs(2),
            }
        }
    }

    impl RumqttcTransportBuilder {
        /// Sets the broker host.
        #[must_use]
        pub fn host(mut self, host: impl Into<String>) -> Self {
            self.host = host.into();
            self
        }

        /// Sets the broker port (default 1883).
        #[must_use]
        pub fn port(mut self, port: u16) -> Self {
            self.port = port;
            self
        }

        /// Sets username/password authentication.
        #[must_use]
        pub fn credentials(
            mut self,
            username: impl Into<String>,
            password: impl Into<String>,
        ) -> Self {
            self.credentials = Some((username.into(), password.into()));
            self
        }

        /// Sets the keep-alive interval (default 30 seconds).
        #[must_use]
        pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
            self.keep_alive = keep_alive;
            self
        }

        /// Sets an explicit client id. Without one a process-unique id is
        /// generated.
        #[must_use]
        pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
            self.client_id = Some(client_id.into());
            self
        }

        /// Sets the delay between reconnection attempts (default 2 seconds).
        #[must_use]
        pub fn reconnect_delay(mut self, delay: Duration) -> Self {
            self.reconnect_delay = delay;
            self
        }

        /// Builds the transport. The connection is not opened until
        /// [`Transport::start`].
        #[must_use]
        pub fn build(self) -> RumqttcTransport {
            let client_id = self.client_id.unwrap_or_else(|| {
                let counter = CLIENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
                format!("mqttconv_{}_{}", std::process::id(), counter)
            });
            RumqttcTransport {
                config: TransportConfig {
                    host: self.host,
                    port: self.port,
                    credentials: self.credentials,
                    keep_alive: self.keep_alive,
                    client_id,
                },
                connection: Mutex::new(None),
                shared: Arc::new(Shared {
                    subscriptions: Mutex::new(Vec::new()),
                    probes: Mutex::new(HashMap::new()),
                    connected: AtomicBool::new(false),
                    stopping: AtomicBool::new(false),
                    reconnect_delay: self.reconnect_delay,
                }),
            }
        }
    }
}
