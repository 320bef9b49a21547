// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test doubles for driver code: an in-process broker with faithful
//! retained-message semantics.
//!
//! [`FakeBroker`] keeps the retained map and the full publication log, and
//! hands out any number of [`FakeClient`] transports. Deliveries happen
//! inline: when [`Transport::subscribe`] returns, every matching retained
//! message has already gone through the handler, so the retained-replay
//! probe fires strictly after the replay, the same ordering a real broker
//! guarantees over one connection.
//!
//! # Examples
//!
//! ```
//! use mqttconv::testing::FakeBroker;
//! use mqttconv::transport::{MqttMessage, Transport};
//!
//! let broker = FakeBroker::new();
//! broker.publish(MqttMessage::retained("/devices/ext/controls/t", "21.5"));
//!
//! let client = broker.client("reader");
//! client.start().unwrap();
//! let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
//! let sink = std::sync::Arc::clone(&seen);
//! client
//!     .subscribe(
//!         std::sync::Arc::new(move |m| sink.lock().unwrap().push(m)),
//!         &["/devices/+/controls/+".to_string()],
//!     )
//!     .unwrap();
//! assert_eq!(seen.lock().unwrap().len(), 1);
//! assert!(seen.lock().unwrap()[0].retained);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::{DriverError, Result};
use crate::topic;
use crate::transport::{MessageHandler, MqttMessage, Transport};

struct Subscription {
    client_id: String,
    pattern: String,
    handler: Arc<MessageHandler>,
}

struct BrokerInner {
    /// Retained payloads by topic. An empty retained publication deletes
    /// the entry, like a real broker.
    retained: Mutex<BTreeMap<String, String>>,
    subscriptions: Mutex<Vec<Subscription>>,
    /// Every publication in arrival order.
    log: Mutex<Vec<MqttMessage>>,
}

impl BrokerInner {
    fn deliver(&self, message: &MqttMessage) {
        self.log.lock().push(message.clone());

        if message.retained {
            let mut retained = self.retained.lock();
            if message.payload.is_empty() {
                retained.remove(&message.topic);
            } else {
                retained.insert(message.topic.clone(), message.payload.clone());
            }
        }

        // Live deliveries carry a cleared retain flag; only replay sets it.
        let delivery = MqttMessage {
            retained: false,
            ..message.clone()
        };
        let handlers: Vec<Arc<MessageHandler>> = {
            let subscriptions = self.subscriptions.lock();
            let mut handlers: Vec<Arc<MessageHandler>> = Vec::new();
            for subscription in subscriptions.iter() {
                if topic::matches(&subscription.pattern, &message.topic)
                    && !handlers
                        .iter()
                        .any(|known| Arc::ptr_eq(known, &subscription.handler))
                {
                    handlers.push(Arc::clone(&subscription.handler));
                }
            }
            handlers
        };
        for handler in handlers {
            handler(delivery.clone());
        }
    }
}

/// An in-process broker for tests.
pub struct FakeBroker {
    inner: Arc<BrokerInner>,
}

impl FakeBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                retained: Mutex::new(BTreeMap::new()),
                subscriptions: Mutex::new(Vec::new()),
                log: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Creates a transport connected to this broker.
    #[must_use]
    pub fn client(&self, client_id: impl Into<String>) -> Arc<FakeClient> {
        Arc::new(FakeClient {
            client_id: client_id.into(),
            broker: Arc::clone(&self.inner),
            started: AtomicBool::new(false),
        })
    }

    /// Publishes from nowhere in particular, simulating another party on
    /// the bus.
    pub fn publish(&self, message: MqttMessage) {
        self.inner.deliver(&message);
    }

    /// Snapshot of the retained map.
    #[must_use]
    pub fn retained(&self) -> BTreeMap<String, String> {
        self.inner.retained.lock().clone()
    }

    /// The retained payload at a topic, if any.
    #[must_use]
    pub fn retained_payload(&self, topic: &str) -> Option<String> {
        self.inner.retained.lock().get(topic).cloned()
    }

    /// Everything published so far, in order.
    #[must_use]
    pub fn published(&self) -> Vec<MqttMessage> {
        self.inner.log.lock().clone()
    }

    /// Payloads published to one topic, in order.
    #[must_use]
    pub fn payloads(&self, topic: &str) -> Vec<String> {
        self.inner
            .log
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload.clone())
            .collect()
    }
}

impl Default for FakeBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// One client's view of a [`FakeBroker`].
pub struct FakeClient {
    client_id: String,
    broker: Arc<BrokerInner>,
    started: AtomicBool,
}

impl FakeClient {
    fn check_started(&self) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        Err(DriverError::Transport("transport is not started".to_string()).into())
    }
}

impl Transport for FakeClient {
    fn start(&self) -> Result<()> {
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.started.store(false, Ordering::Release);
        self.broker
            .subscriptions
            .lock()
            .retain(|s| s.client_id != self.client_id);
        Ok(())
    }

    fn publish(&self, message: MqttMessage) -> Result<()> {
        self.check_started()?;
        self.broker.deliver(&message);
        Ok(())
    }

    fn subscribe(&self, handler: Arc<MessageHandler>, topics: &[String]) -> Result<()> {
        self.check_started()?;
        {
            let mut subscriptions = self.broker.subscriptions.lock();
            for pattern in topics {
                subscriptions.push(Subscription {
                    client_id: self.client_id.clone(),
                    pattern: pattern.clone(),
                    handler: Arc::clone(&handler),
                });
            }
        }
        // Inline replay: one delivery per retained topic however many of
        // the new patterns it matches.
        let replay: Vec<MqttMessage> = {
            let retained = self.broker.retained.lock();
            retained
                .iter()
                .filter(|(topic, _)| topics.iter().any(|pattern| topic::matches(pattern, topic)))
                .map(|(topic, payload)| MqttMessage::retained(topic.clone(), payload.clone()))
                .collect()
        };
        for message in replay {
            handler(message);
        }
        Ok(())
    }

    fn unsubscribe(&self, topics: &[String]) -> Result<()> {
        self.check_started()?;
        self.broker
            .subscriptions
            .lock()
            .retain(|s| s.client_id != self.client_id || !topics.contains(&s.pattern));
        Ok(())
    }

    fn wait_for_retained(&self, callback: Box<dyn FnOnce() + Send>) -> Result<()> {
        self.check_started()?;
        // Replay already happened inline during subscribe.
        callback();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn collector() -> (Arc<MessageHandler>, Arc<StdMutex<Vec<MqttMessage>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: Arc<MessageHandler> =
            Arc::new(move |message| sink.lock().unwrap().push(message));
        (handler, seen)
    }

    #[test]
    fn retained_replay_marks_messages_retained() {
        let broker = FakeBroker::new();
        broker.publish(MqttMessage::retained("/devices/a/controls/x", "1"));
        broker.publish(MqttMessage::retained("/devices/b/controls/y", "2"));

        let client = broker.client("c");
        client.start().unwrap();
        let (handler, seen) = collector();
        client
            .subscribe(handler, &["/devices/+/controls/+".to_string()])
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|m| m.retained));
    }

    #[test]
    fn live_deliveries_clear_the_retain_flag() {
        let broker = FakeBroker::new();
        let client = broker.client("c");
        client.start().unwrap();
        let (handler, seen) = collector();
        client
            .subscribe(handler, &["/devices/d/controls/x".to_string()])
            .unwrap();

        broker.publish(MqttMessage::retained("/devices/d/controls/x", "5"));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].retained);
        assert_eq!(broker.retained_payload("/devices/d/controls/x").as_deref(), Some("5"));
    }

    #[test]
    fn empty_retained_payload_deletes_the_entry() {
        let broker = FakeBroker::new();
        broker.publish(MqttMessage::retained("/devices/d/meta/title", "T"));
        broker.publish(MqttMessage::retained("/devices/d/meta/title", ""));
        assert!(broker.retained_payload("/devices/d/meta/title").is_none());
    }

    #[test]
    fn probe_fires_after_replay() {
        let broker = FakeBroker::new();
        broker.publish(MqttMessage::retained("/devices/d/controls/x", "1"));

        let client = broker.client("c");
        client.start().unwrap();
        let order = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&order);
        client
            .subscribe(
                Arc::new(move |m: MqttMessage| sink.lock().unwrap().push(m.topic)),
                &["/devices/+/controls/+".to_string()],
            )
            .unwrap();
        let sink = Arc::clone(&order);
        client
            .wait_for_retained(Box::new(move || {
                sink.lock().unwrap().push("ready".to_string());
            }))
            .unwrap();

        assert_eq!(
            *order.lock().unwrap(),
            vec!["/devices/d/controls/x".to_string(), "ready".to_string()]
        );
    }

    #[test]
    fn unsubscribe_stops_deliveries() {
        let broker = FakeBroker::new();
        let client = broker.client("c");
        client.start().unwrap();
        let (handler, seen) = collector();
        let pattern = vec!["/devices/d/controls/x".to_string()];
        client.subscribe(handler, &pattern).unwrap();
        client.unsubscribe(&pattern).unwrap();

        broker.publish(MqttMessage::transient("/devices/d/controls/x", "1"));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn operations_require_start() {
        let broker = FakeBroker::new();
        let client = broker.client("c");
        assert!(client.publish(MqttMessage::transient("/t", "x")).is_err());
        assert!(client.unsubscribe(&["/t".to_string()]).is_err());
    }
}
