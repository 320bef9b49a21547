// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The wire backend task.
//!
//! All transport I/O funnels through here: publication snapshots from
//! transactions, subscription changes, and raw inbound traffic. Inbound
//! messages ride the same queue as requests, so deliveries and control
//! operations stay in arrival order; decoded events are then pushed into
//! the loop's bounded queue, which is where backpressure takes hold.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::LoopMessage;
use crate::error::{DriverError, Error, Result};
use crate::event::DriverEvent;
use crate::future::Completer;
use crate::topic::{self, ParsedTopic};
use crate::transport::{MessageHandler, MqttMessage, Transport};

/// A unit of backend work. Most variants carry a [`Completer`] resolved
/// exactly once, after the wire effect happened.
pub(crate) enum BackendRequest {
    /// Raw inbound wire traffic, decoded here and fed to the loop.
    Inbound(MqttMessage),
    /// The retained-replay probe echoed back: all retained state is in.
    RetainedDone,
    SetFilter {
        topics: Vec<String>,
        done: Completer<()>,
    },
    NewDevice {
        device_id: String,
        messages: Vec<MqttMessage>,
        done: Completer<String>,
    },
    RemoveDevice {
        device_id: String,
        messages: Vec<MqttMessage>,
        unsubscribe: Vec<String>,
        done: Completer<()>,
    },
    NewControl {
        device_id: String,
        control_id: String,
        messages: Vec<MqttMessage>,
        subscribe: Option<String>,
        done: Completer<String>,
    },
    RemoveControl {
        device_id: String,
        control_id: String,
        messages: Vec<MqttMessage>,
        unsubscribe: Option<String>,
        done: Completer<()>,
    },
    UpdateControlValue {
        messages: Vec<MqttMessage>,
        done: Completer<()>,
    },
    UpdateControlMeta {
        messages: Vec<MqttMessage>,
        done: Completer<()>,
    },
    UpdateDeviceMeta {
        messages: Vec<MqttMessage>,
        done: Completer<()>,
    },
    SetOnValue {
        message: MqttMessage,
        done: Completer<()>,
    },
    /// A cleared external control left the graph; nothing remains on the
    /// wire, this is bookkeeping only.
    RemoveExternalControl {
        device_id: String,
        control_id: String,
    },
    RemoveExternalDevice {
        device_id: String,
    },
    Shutdown {
        done: Completer<()>,
    },
}

impl BackendRequest {
    /// Fails the request's future, if it carries one.
    pub(crate) fn fail(self, error: Error) {
        match self {
            Self::SetFilter { done, .. }
            | Self::RemoveDevice { done, .. }
            | Self::RemoveControl { done, .. }
            | Self::UpdateControlValue { done, .. }
            | Self::UpdateControlMeta { done, .. }
            | Self::UpdateDeviceMeta { done, .. }
            | Self::SetOnValue { done, .. }
            | Self::Shutdown { done } => done.fail(error),
            Self::NewDevice { done, .. } => done.fail(error),
            Self::NewControl { done, .. } => done.fail(error),
            Self::Inbound(_)
            | Self::RetainedDone
            | Self::RemoveExternalControl { .. }
            | Self::RemoveExternalDevice { .. } => {}
        }
    }
}

/// Runs until shutdown (or until the request senders are gone), then fails
/// whatever is still queued. A closed loop queue only sheds events: requests
/// keep flushing so a shutdown submitted behind them is always reached.
pub(crate) async fn run(
    mut requests: mpsc::UnboundedReceiver<BackendRequest>,
    self_tx: mpsc::UnboundedSender<BackendRequest>,
    transport: Arc<dyn Transport>,
    events: mpsc::Sender<LoopMessage>,
) {
    let mut filter_patterns: Vec<String> = Vec::new();
    let inbound: Arc<MessageHandler> = {
        let self_tx = self_tx.clone();
        Arc::new(move |message: MqttMessage| {
            let _ = self_tx.send(BackendRequest::Inbound(message));
        })
    };
    tracing::debug!("backend task started");

    while let Some(request) = requests.recv().await {
        match request {
            BackendRequest::Inbound(message) => {
                if let Some(event) = decode(&message)
                    && events.send(LoopMessage::Event(event)).await.is_err()
                {
                    tracing::debug!("event queue closed, dropping inbound event");
                }
            }
            BackendRequest::RetainedDone => {
                if events
                    .send(LoopMessage::Event(DriverEvent::ready()))
                    .await
                    .is_err()
                {
                    tracing::debug!("event queue closed, dropping ready event");
                }
            }
            BackendRequest::SetFilter { topics, done } => {
                let result = swap_filter(
                    transport.as_ref(),
                    &inbound,
                    &self_tx,
                    &mut filter_patterns,
                    topics,
                );
                if let Err(e) = &result {
                    tracing::warn!(error = %e, "filter installation failed");
                }
                done.complete(result);
            }
            BackendRequest::NewDevice {
                device_id,
                messages,
                done,
            } => {
                let result = publish_all(transport.as_ref(), messages);
                if result.is_ok() {
                    tracing::info!(device = %device_id, "device announced");
                }
                done.complete(result.map(|()| device_id));
            }
            BackendRequest::RemoveDevice {
                device_id,
                messages,
                unsubscribe,
                done,
            } => {
                let result = publish_all(transport.as_ref(), messages).and_then(|()| {
                    if unsubscribe.is_empty() {
                        Ok(())
                    } else {
                        transport.unsubscribe(&unsubscribe)
                    }
                });
                if result.is_ok() {
                    tracing::info!(device = %device_id, "device topics cleared");
                }
                done.complete(result);
            }
            BackendRequest::NewControl {
                device_id,
                control_id,
                messages,
                subscribe,
                done,
            } => {
                // Subscribe before announcing so no early write request is
                // missed.
                let result = subscribe
                    .map_or(Ok(()), |on_topic| {
                        transport.subscribe(Arc::clone(&inbound), &[on_topic])
                    })
                    .and_then(|()| publish_all(transport.as_ref(), messages));
                if result.is_ok() {
                    tracing::debug!(device = %device_id, control = %control_id,
                        "control announced");
                }
                done.complete(result.map(|()| control_id));
            }
            BackendRequest::RemoveControl {
                device_id,
                control_id,
                messages,
                unsubscribe,
                done,
            } => {
                let result = publish_all(transport.as_ref(), messages).and_then(|()| {
                    unsubscribe.map_or(Ok(()), |on_topic| transport.unsubscribe(&[on_topic]))
                });
                if result.is_ok() {
                    tracing::debug!(device = %device_id, control = %control_id,
                        "control topics cleared");
                }
                done.complete(result);
            }
            BackendRequest::UpdateControlValue { messages, done }
            | BackendRequest::UpdateControlMeta { messages, done }
            | BackendRequest::UpdateDeviceMeta { messages, done } => {
                done.complete(publish_all(transport.as_ref(), messages));
            }
            BackendRequest::SetOnValue { message, done } => {
                done.complete(transport.publish(message));
            }
            BackendRequest::RemoveExternalControl {
                device_id,
                control_id,
            } => {
                tracing::info!(device = %device_id, control = %control_id,
                    "external control disappeared");
            }
            BackendRequest::RemoveExternalDevice { device_id } => {
                tracing::info!(device = %device_id, "external device disappeared");
            }
            BackendRequest::Shutdown { done } => {
                done.succeed(());
                break;
            }
        }
    }

    // Nothing may hang on a dead backend.
    requests.close();
    while let Ok(request) = requests.try_recv() {
        request.fail(DriverError::Inactive.into());
    }
    tracing::debug!("backend task finished");
}

fn swap_filter(
    transport: &dyn Transport,
    inbound: &Arc<MessageHandler>,
    self_tx: &mpsc::UnboundedSender<BackendRequest>,
    current: &mut Vec<String>,
    next: Vec<String>,
) -> Result<()> {
    if !current.is_empty() {
        transport.unsubscribe(current)?;
    }
    if !next.is_empty() {
        transport.subscribe(Arc::clone(inbound), &next)?;
    }
    *current = next;
    // Even an empty filter completes a replay: readiness must not hang.
    let probe_tx = self_tx.clone();
    transport.wait_for_retained(Box::new(move || {
        let _ = probe_tx.send(BackendRequest::RetainedDone);
    }))?;
    Ok(())
}

fn publish_all(transport: &dyn Transport, messages: Vec<MqttMessage>) -> Result<()> {
    for message in messages {
        transport.publish(message)?;
    }
    Ok(())
}

/// Decodes one wire message into the event the loop understands, or
/// nothing for traffic outside the convention.
fn decode(message: &MqttMessage) -> Option<DriverEvent> {
    match topic::parse(&message.topic) {
        Ok(ParsedTopic::ControlValue { device, control }) => Some(DriverEvent::control_value(
            device,
            control,
            &message.payload,
            "",
        )),
        Ok(ParsedTopic::ControlOn { device, control }) => Some(DriverEvent::control_on_value(
            device,
            control,
            &message.payload,
        )),
        Ok(ParsedTopic::ControlMeta {
            device,
            control,
            key,
        }) => Some(DriverEvent::new_external_device_control_meta(
            device,
            control,
            key,
            &message.payload,
        )),
        Ok(ParsedTopic::DeviceMeta { device, key }) => Some(
            DriverEvent::new_external_device_meta(device, key, &message.payload),
        ),
        Ok(ParsedTopic::ControlMetaJson { .. } | ParsedTopic::DeviceMetaJson { .. }) => {
            // Per-key topics are authoritative; the combined documents are
            // published for consumers, never consumed.
            None
        }
        Err(_) => {
            tracing::debug!(topic = %message.topic, "ignoring message outside the convention");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_recognizes_convention_topics() {
        let value = decode(&MqttMessage::retained("/devices/d/controls/c", "21.5")).unwrap();
        assert_eq!(
            value,
            DriverEvent::control_value("d", "c", "21.5", "")
        );

        let on = decode(&MqttMessage::transient("/devices/d/controls/c/on", "1")).unwrap();
        assert_eq!(on, DriverEvent::control_on_value("d", "c", "1"));

        let control_meta =
            decode(&MqttMessage::retained("/devices/d/controls/c/meta/type", "switch")).unwrap();
        assert_eq!(
            control_meta,
            DriverEvent::new_external_device_control_meta("d", "c", "type", "switch")
        );

        let device_meta = decode(&MqttMessage::retained("/devices/d/meta/title", "D")).unwrap();
        assert_eq!(
            device_meta,
            DriverEvent::new_external_device_meta("d", "title", "D")
        );
    }

    #[test]
    fn decode_skips_combined_documents_and_foreign_topics() {
        assert!(decode(&MqttMessage::retained("/devices/d/meta", "{}")).is_none());
        assert!(decode(&MqttMessage::retained("/devices/d/controls/c/meta", "{}")).is_none());
        assert!(decode(&MqttMessage::retained("/weather/city", "x")).is_none());
    }

    #[tokio::test]
    async fn failed_request_resolves_future() {
        let (done, future) = crate::future::DriverFuture::<String>::pair();
        let request = BackendRequest::NewDevice {
            device_id: "d".to_string(),
            messages: Vec::new(),
            done,
        };
        request.fail(DriverError::Inactive.into());
        assert!(future.await.is_err());
    }
}
