// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end driver tests over the in-process broker.
//!
//! Every test drives a real [`Driver`] against [`FakeBroker`]: retained
//! bootstrap, local publication, external mirroring, ownership claims and
//! loop discipline, with assertions on both the device graph and the wire.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use mqttconv::testing::FakeBroker;
use mqttconv::{
    ControlArgs, ControlError, ControlType, DeviceArgs, DeviceError, DeviceFilter, Driver,
    DriverConfig, DriverError, DriverEvent, Error, MqttMessage, Value,
};
use tokio::sync::mpsc;

const DRIVER_ID: &str = "conv-test";

// ============================================================================
// Helpers
// ============================================================================

fn build_driver(broker: &FakeBroker) -> Driver {
    Driver::new(
        DriverConfig::new(broker.client(DRIVER_ID))
            .driver_id(DRIVER_ID)
            .filter(DeviceFilter::AllDevices),
    )
    .unwrap()
}

/// Starts the loop and waits for the first retained replay to settle.
async fn started(driver: &Driver) {
    let ready = driver.wait_for_ready();
    driver.start_loop().unwrap();
    ready.await.unwrap();
}

/// Streams every processed driver event into a channel.
fn events_of(driver: &Driver) -> mpsc::UnboundedReceiver<DriverEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    driver.on_driver_event(move |event| {
        let _ = tx.send(event.clone());
    });
    rx
}

/// Awaits the next event matching `wanted`, skipping everything else.
async fn next_event(
    events: &mut mpsc::UnboundedReceiver<DriverEvent>,
    wanted: impl Fn(&DriverEvent) -> bool,
) -> DriverEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("no matching driver event arrived")
}

async fn recv_event(events: &mut mpsc::UnboundedReceiver<DriverEvent>) -> DriverEvent {
    next_event(events, |_| true).await
}

/// Drives a marker device through the loop and the backend; once it
/// resolves, every backend request submitted before it has reached the
/// broker.
async fn flush_backend(driver: &Driver) {
    let created = driver
        .access(|tx| Ok(tx.create_device(DeviceArgs::new().id("marker"))))
        .await
        .unwrap();
    created.await.unwrap();
}

// ============================================================================
// Retained bootstrap and the Ready protocol
// ============================================================================

mod retained_bootstrap {
    use super::*;

    #[tokio::test]
    async fn replayed_state_is_typed_and_complete_after_ready() {
        let broker = FakeBroker::new();
        broker.publish(MqttMessage::retained(
            "/devices/sensor1/controls/value/meta/type",
            "temperature",
        ));
        broker.publish(MqttMessage::retained("/devices/sensor1/controls/value", "21.5"));

        let driver = build_driver(&broker);
        started(&driver).await;

        driver
            .access(|tx| {
                let device = tx.device("sensor1")?;
                assert!(!device.is_local());
                let control = device.control("value")?;
                assert!(control.is_complete());
                assert_eq!(control.raw_value(), "21.5");
                assert_eq!(control.value()?, Value::Number(21.5));
                Ok(())
            })
            .await
            .unwrap();
        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn ready_thunks_run_inside_the_loop_once() {
        let broker = FakeBroker::new();
        broker.publish(MqttMessage::retained(
            "/devices/sensor1/controls/value/meta/type",
            "temperature",
        ));

        let driver = build_driver(&broker);
        let saw_replay = Arc::new(AtomicBool::new(false));
        let runs = Arc::new(AtomicUsize::new(0));
        let saw = Arc::clone(&saw_replay);
        let counted = Arc::clone(&runs);
        driver.on_retain_ready(move |tx| {
            saw.store(tx.has_device("sensor1"), Ordering::SeqCst);
            counted.fetch_add(1, Ordering::SeqCst);
        });

        started(&driver).await;
        assert!(saw_replay.load(Ordering::SeqCst), "thunk ran before replay settled");
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // A thunk fires for one replay only; the next Ready passes it by.
        let ready = driver.wait_for_ready();
        driver.set_filter(DeviceFilter::AllDevices).await.unwrap();
        ready.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn set_filter_replays_retained_state_again() {
        let broker = FakeBroker::new();
        broker.publish(MqttMessage::retained(
            "/devices/lamp/controls/power/meta/type",
            "switch",
        ));
        broker.publish(MqttMessage::retained("/devices/lamp/controls/power", "1"));

        let driver = Driver::new(
            DriverConfig::new(broker.client(DRIVER_ID))
                .driver_id(DRIVER_ID)
                .filter(DeviceFilter::NoDevices),
        )
        .unwrap();
        started(&driver).await;
        driver
            .access(|tx| {
                assert!(tx.device_ids().is_empty());
                Ok(())
            })
            .await
            .unwrap();

        let ready = driver.wait_for_ready();
        driver.set_filter(DeviceFilter::AllDevices).await.unwrap();
        ready.await.unwrap();

        driver
            .access(|tx| {
                let control = tx.device("lamp")?.control("power")?;
                assert_eq!(control.value()?, Value::Bool(true));
                Ok(())
            })
            .await
            .unwrap();
        driver.close().await.unwrap();
    }
}

// ============================================================================
// Local devices on the wire
// ============================================================================

mod local_devices {
    use super::*;

    #[tokio::test]
    async fn device_announcement_reaches_the_broker() {
        let broker = FakeBroker::new();
        let driver = build_driver(&broker);
        started(&driver).await;

        let (device, control) = driver
            .access(|tx| {
                let device = tx.create_device(DeviceArgs::new().id("demo").title("Demo device"));
                let control = tx.create_control(
                    "demo",
                    ControlArgs::new()
                        .id("temperature")
                        .kind(ControlType::Temperature)
                        .value(21.5),
                );
                Ok((device, control))
            })
            .await
            .unwrap();
        assert_eq!(device.await.unwrap(), "demo");
        assert_eq!(control.await.unwrap(), "temperature");

        assert_eq!(
            broker.retained_payload("/devices/demo/meta/driver").as_deref(),
            Some(DRIVER_ID)
        );
        assert_eq!(
            broker.retained_payload("/devices/demo/meta/title").as_deref(),
            Some("Demo device")
        );
        assert_eq!(
            broker
                .retained_payload("/devices/demo/controls/temperature/meta/type")
                .as_deref(),
            Some("temperature")
        );
        assert_eq!(
            broker
                .retained_payload("/devices/demo/controls/temperature")
                .as_deref(),
            Some("21.5")
        );
        let combined = broker.retained_payload("/devices/demo/meta").unwrap();
        assert!(combined.contains("\"driver\":\"conv-test\""));
        assert!(combined.contains("\"title\":\"Demo device\""));
        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn malformed_control_id_is_rejected_without_side_effects() {
        let broker = FakeBroker::new();
        let driver = build_driver(&broker);
        started(&driver).await;

        let created = driver
            .access(|tx| Ok(tx.create_device(DeviceArgs::new().id("demo"))))
            .await
            .unwrap();
        created.await.unwrap();

        let attempt = driver
            .access(|tx| {
                Ok(tx.create_control(
                    "demo",
                    ControlArgs::new().id("bad/id").kind(ControlType::Switch),
                ))
            })
            .await
            .unwrap();
        let err = attempt.await.unwrap_err();
        assert!(matches!(err, Error::Control(ControlError::IncorrectId(_))));

        driver
            .access(|tx| {
                assert!(tx.device("demo")?.control_ids().is_empty());
                Ok(())
            })
            .await
            .unwrap();
        let stray: Vec<MqttMessage> = broker
            .published()
            .into_iter()
            .filter(|message| message.topic.contains("bad"))
            .collect();
        assert!(stray.is_empty(), "published for a rejected control: {stray:?}");
        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn value_updates_land_retained_on_the_value_topic() {
        let broker = FakeBroker::new();
        let driver = build_driver(&broker);
        started(&driver).await;

        let created = driver
            .access(|tx| {
                let _ = tx.create_device(DeviceArgs::new().id("demo"));
                Ok(tx.create_control(
                    "demo",
                    ControlArgs::new()
                        .id("relay")
                        .kind(ControlType::Switch)
                        .writable(true)
                        .value(false),
                ))
            })
            .await
            .unwrap();
        created.await.unwrap();

        let updated = driver
            .access(|tx| Ok(tx.update_control_value("demo", "relay", true, false)))
            .await
            .unwrap();
        updated.await.unwrap();

        assert_eq!(
            broker.retained_payload("/devices/demo/controls/relay").as_deref(),
            Some("1")
        );
        assert_eq!(broker.payloads("/devices/demo/controls/relay"), ["0", "1"]);
        driver
            .access(|tx| {
                assert_eq!(tx.device("demo")?.control("relay")?.raw_value(), "1");
                Ok(())
            })
            .await
            .unwrap();
        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn remove_device_clears_the_wire() {
        let broker = FakeBroker::new();
        let driver = build_driver(&broker);
        started(&driver).await;

        let created = driver
            .access(|tx| {
                let _ = tx.create_device(DeviceArgs::new().id("demo").title("Demo device"));
                Ok(tx.create_control(
                    "demo",
                    ControlArgs::new()
                        .id("relay")
                        .kind(ControlType::Switch)
                        .writable(true)
                        .value(false),
                ))
            })
            .await
            .unwrap();
        created.await.unwrap();

        let removed = driver
            .access(|tx| Ok(tx.remove_device("demo")))
            .await
            .unwrap();
        removed.await.unwrap();

        let leftovers: Vec<String> = broker
            .retained()
            .into_keys()
            .filter(|topic| topic.starts_with("/devices/demo"))
            .collect();
        assert!(leftovers.is_empty(), "retained leftovers: {leftovers:?}");
        driver
            .access(|tx| {
                assert!(!tx.has_device("demo"));
                Ok(())
            })
            .await
            .unwrap();
        driver.close().await.unwrap();
    }
}

// ============================================================================
// External device mirroring
// ============================================================================

mod external_mirroring {
    use super::*;

    #[tokio::test]
    async fn live_traffic_materializes_mirrors() {
        let broker = FakeBroker::new();
        let driver = build_driver(&broker);
        started(&driver).await;
        let mut events = events_of(&driver);

        broker.publish(MqttMessage::retained(
            "/devices/ext1/controls/mode/meta/type",
            "switch",
        ));
        broker.publish(MqttMessage::retained("/devices/ext1/controls/mode", "1"));

        assert_eq!(
            recv_event(&mut events).await,
            DriverEvent::NewExternalDevice { device_id: "ext1".into() }
        );
        assert_eq!(
            recv_event(&mut events).await,
            DriverEvent::NewExternalDeviceControl {
                device_id: "ext1".into(),
                control_id: "mode".into(),
            }
        );
        assert_eq!(
            recv_event(&mut events).await,
            DriverEvent::NewExternalDeviceControlMeta {
                device_id: "ext1".into(),
                control_id: "mode".into(),
                key: "type".into(),
                value: "switch".into(),
            }
        );
        assert_eq!(
            recv_event(&mut events).await,
            DriverEvent::ControlValue {
                device_id: "ext1".into(),
                control_id: "mode".into(),
                raw_value: "1".into(),
                prev_raw_value: String::new(),
            }
        );

        driver
            .access(|tx| {
                let device = tx.device("ext1")?;
                assert!(!device.is_local());
                assert_eq!(device.control("mode")?.value()?, Value::Bool(true));
                Ok(())
            })
            .await
            .unwrap();
        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn on_requests_without_handler_confirm_as_published() {
        let broker = FakeBroker::new();
        let driver = build_driver(&broker);
        started(&driver).await;

        let created = driver
            .access(|tx| {
                let _ = tx.create_device(DeviceArgs::new().id("demo"));
                Ok(tx.create_control(
                    "demo",
                    ControlArgs::new()
                        .id("relay")
                        .kind(ControlType::Switch)
                        .writable(true)
                        .value(false),
                ))
            })
            .await
            .unwrap();
        created.await.unwrap();
        let mut events = events_of(&driver);

        broker.publish(MqttMessage::transient("/devices/demo/controls/relay/on", "1"));

        assert_eq!(
            recv_event(&mut events).await,
            DriverEvent::ControlOnValue {
                device_id: "demo".into(),
                control_id: "relay".into(),
                raw_value: "1".into(),
            }
        );
        // The confirmation echoes back from the broker.
        assert_eq!(
            recv_event(&mut events).await,
            DriverEvent::ControlValue {
                device_id: "demo".into(),
                control_id: "relay".into(),
                raw_value: "1".into(),
                prev_raw_value: "1".into(),
            }
        );
        assert_eq!(
            broker.retained_payload("/devices/demo/controls/relay").as_deref(),
            Some("1")
        );
        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn on_value_receive_handler_decides_the_outcome() {
        let broker = FakeBroker::new();
        let driver = build_driver(&broker);
        started(&driver).await;

        let created = driver
            .access(|tx| {
                let _ = tx.create_device(DeviceArgs::new().id("demo"));
                let created = tx.create_control(
                    "demo",
                    ControlArgs::new()
                        .id("power")
                        .kind(ControlType::Range)
                        .max(10.0)
                        .writable(true)
                        .value(0.0),
                );
                tx.set_on_value_receive_handler("demo", "power", |tx, change| {
                    let requested = change.value.as_f64().unwrap_or(0.0);
                    let _ = tx.update_control_value(
                        &change.device,
                        &change.control,
                        requested.min(5.0),
                        false,
                    );
                    Ok(())
                })?;
                Ok(created)
            })
            .await
            .unwrap();
        created.await.unwrap();
        let mut events = events_of(&driver);

        broker.publish(MqttMessage::transient("/devices/demo/controls/power/on", "8"));

        let confirmed =
            next_event(&mut events, |e| matches!(e, DriverEvent::ControlValue { .. })).await;
        assert_eq!(
            confirmed,
            DriverEvent::ControlValue {
                device_id: "demo".into(),
                control_id: "power".into(),
                raw_value: "5".into(),
                prev_raw_value: "5".into(),
            }
        );
        // Only the clamped value ever reaches the value topic.
        assert_eq!(broker.payloads("/devices/demo/controls/power"), ["0", "5"]);
        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn set_on_value_publishes_to_the_owner() {
        let broker = FakeBroker::new();
        let driver = build_driver(&broker);
        started(&driver).await;
        let mut events = events_of(&driver);

        broker.publish(MqttMessage::retained(
            "/devices/ext2/controls/mode/meta/type",
            "switch",
        ));
        broker.publish(MqttMessage::retained(
            "/devices/ext2/controls/mode/meta/readonly",
            "0",
        ));
        broker.publish(MqttMessage::retained("/devices/ext2/controls/mode", "0"));
        next_event(&mut events, |e| matches!(e, DriverEvent::ControlValue { .. })).await;

        let sent = driver
            .access(|tx| Ok(tx.set_on_value("ext2", "mode", true)))
            .await
            .unwrap();
        sent.await.unwrap();

        let requests: Vec<MqttMessage> = broker
            .published()
            .into_iter()
            .filter(|message| message.topic == "/devices/ext2/controls/mode/on")
            .collect();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].payload, "1");
        assert!(!requests[0].retained, "on requests must not be retained");
        // The value topic stays whatever the owner last confirmed.
        assert_eq!(
            broker.retained_payload("/devices/ext2/controls/mode").as_deref(),
            Some("0")
        );
        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn set_on_value_rejects_local_controls() {
        let broker = FakeBroker::new();
        let driver = build_driver(&broker);
        started(&driver).await;

        let created = driver
            .access(|tx| {
                let _ = tx.create_device(DeviceArgs::new().id("demo"));
                Ok(tx.create_control(
                    "demo",
                    ControlArgs::new()
                        .id("relay")
                        .kind(ControlType::Switch)
                        .writable(true)
                        .value(false),
                ))
            })
            .await
            .unwrap();
        created.await.unwrap();

        let attempt = driver
            .access(|tx| Ok(tx.set_on_value("demo", "relay", true)))
            .await
            .unwrap();
        let err = attempt.await.unwrap_err();
        assert!(matches!(err, Error::Device(DeviceError::NotExternal(_))));
        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn cleared_mirrors_remove_themselves() {
        let broker = FakeBroker::new();
        let driver = build_driver(&broker);
        started(&driver).await;
        let mut events = events_of(&driver);

        broker.publish(MqttMessage::retained(
            "/devices/ext3/controls/state/meta/type",
            "text",
        ));
        broker.publish(MqttMessage::retained("/devices/ext3/controls/state", "ok"));
        next_event(&mut events, |e| matches!(e, DriverEvent::ControlValue { .. })).await;

        // The owner tears the control down: meta first, then the value.
        broker.publish(MqttMessage::retained("/devices/ext3/controls/state/meta/type", ""));
        broker.publish(MqttMessage::retained("/devices/ext3/controls/state", ""));

        let gone = next_event(&mut events, |e| {
            matches!(e, DriverEvent::ControlValue { raw_value, .. } if raw_value.is_empty())
        })
        .await;
        assert_eq!(
            gone,
            DriverEvent::ControlValue {
                device_id: "ext3".into(),
                control_id: "state".into(),
                raw_value: String::new(),
                prev_raw_value: "ok".into(),
            }
        );
        driver
            .access(|tx| {
                assert!(!tx.has_device("ext3"));
                Ok(())
            })
            .await
            .unwrap();
        driver.close().await.unwrap();
    }
}

// ============================================================================
// Ownership claims
// ============================================================================

mod reown {
    use super::*;

    fn reowning_driver(broker: &FakeBroker) -> Driver {
        Driver::new(
            DriverConfig::new(broker.client(DRIVER_ID))
                .driver_id(DRIVER_ID)
                .filter(DeviceFilter::AllDevices)
                .reown_unknown_devices(true),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn unowned_devices_are_claimed_once_after_replay() {
        let broker = FakeBroker::new();
        broker.publish(MqttMessage::retained(
            "/devices/orphan/controls/state/meta/type",
            "text",
        ));
        broker.publish(MqttMessage::retained("/devices/orphan/controls/state", "ok"));

        let driver = reowning_driver(&broker);
        started(&driver).await;
        flush_backend(&driver).await;

        assert_eq!(
            broker.retained_payload("/devices/orphan/meta/driver").as_deref(),
            Some(DRIVER_ID)
        );
        assert_eq!(broker.payloads("/devices/orphan/meta/driver").len(), 1);
        driver
            .access(|tx| {
                assert_eq!(tx.device("orphan")?.driver_id(), Some(DRIVER_ID));
                Ok(())
            })
            .await
            .unwrap();
        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn foreign_devices_are_left_alone() {
        let broker = FakeBroker::new();
        broker.publish(MqttMessage::retained(
            "/devices/occupied/controls/state/meta/type",
            "text",
        ));
        broker.publish(MqttMessage::retained("/devices/occupied/meta/driver", "other-daemon"));

        let driver = reowning_driver(&broker);
        started(&driver).await;
        flush_backend(&driver).await;

        assert_eq!(broker.payloads("/devices/occupied/meta/driver"), ["other-daemon"]);
        driver
            .access(|tx| {
                assert_eq!(tx.device("occupied")?.driver_id(), Some("other-daemon"));
                Ok(())
            })
            .await
            .unwrap();
        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn live_release_is_claimed_immediately() {
        let broker = FakeBroker::new();
        let driver = reowning_driver(&broker);
        started(&driver).await;
        let mut events = events_of(&driver);

        broker.publish(MqttMessage::retained(
            "/devices/handoff/controls/mode/meta/type",
            "switch",
        ));
        broker.publish(MqttMessage::retained("/devices/handoff/meta/driver", "other-daemon"));
        next_event(&mut events, |e| {
            matches!(e, DriverEvent::NewExternalDeviceMeta { value, .. } if value == "other-daemon")
        })
        .await;

        // The previous owner releases the device by clearing its ownership.
        broker.publish(MqttMessage::retained("/devices/handoff/meta/driver", ""));
        next_event(&mut events, |e| {
            matches!(e, DriverEvent::NewExternalDeviceMeta { value, .. } if value == DRIVER_ID)
        })
        .await;

        assert_eq!(
            broker.retained_payload("/devices/handoff/meta/driver").as_deref(),
            Some(DRIVER_ID)
        );
        assert_eq!(
            broker.payloads("/devices/handoff/meta/driver"),
            ["other-daemon", "", DRIVER_ID]
        );
        driver
            .access(|tx| {
                assert_eq!(tx.device("handoff")?.driver_id(), Some(DRIVER_ID));
                Ok(())
            })
            .await
            .unwrap();
        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn claiming_is_opt_in() {
        let broker = FakeBroker::new();
        broker.publish(MqttMessage::retained(
            "/devices/orphan/controls/state/meta/type",
            "text",
        ));

        let driver = build_driver(&broker);
        started(&driver).await;
        flush_backend(&driver).await;

        assert_eq!(broker.retained_payload("/devices/orphan/meta/driver"), None);
        driver
            .access(|tx| {
                assert_eq!(tx.device("orphan")?.driver_id(), Some(""));
                Ok(())
            })
            .await
            .unwrap();
        driver.close().await.unwrap();
    }
}

// ============================================================================
// Device filters
// ============================================================================

mod device_filters {
    use super::*;

    #[tokio::test]
    async fn list_filter_mirrors_only_listed_devices() {
        let broker = FakeBroker::new();
        broker.publish(MqttMessage::retained("/devices/dev1/controls/x/meta/type", "text"));
        broker.publish(MqttMessage::retained("/devices/dev2/controls/x/meta/type", "text"));

        let driver = Driver::new(
            DriverConfig::new(broker.client(DRIVER_ID))
                .driver_id(DRIVER_ID)
                .filter(DeviceFilter::device_list(["dev1"])),
        )
        .unwrap();
        started(&driver).await;

        driver
            .access(|tx| {
                assert!(tx.has_device("dev1"));
                assert!(!tx.has_device("dev2"));
                Ok(())
            })
            .await
            .unwrap();
        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn no_devices_filter_sees_nothing() {
        let broker = FakeBroker::new();
        broker.publish(MqttMessage::retained("/devices/dev1/controls/x/meta/type", "text"));

        let driver = Driver::new(
            DriverConfig::new(broker.client(DRIVER_ID))
                .driver_id(DRIVER_ID)
                .filter(DeviceFilter::NoDevices),
        )
        .unwrap();
        started(&driver).await;

        driver
            .access(|tx| {
                assert!(tx.device_ids().is_empty());
                Ok(())
            })
            .await
            .unwrap();
        driver.close().await.unwrap();
    }
}

// ============================================================================
// Loop discipline
// ============================================================================

mod loop_discipline {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn transactions_are_mutually_exclusive() {
        let broker = FakeBroker::new();
        let driver = Arc::new(build_driver(&broker));
        let in_flight = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let driver = Arc::clone(&driver);
            let in_flight = Arc::clone(&in_flight);
            let finished = Arc::clone(&finished);
            tasks.push(tokio::spawn(async move {
                let tx = driver.begin_tx().await;
                assert!(
                    !in_flight.swap(true, Ordering::SeqCst),
                    "two transactions ran at once"
                );
                tokio::task::yield_now().await;
                in_flight.store(false, Ordering::SeqCst);
                finished.fetch_add(1, Ordering::SeqCst);
                tx.end();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(finished.load(Ordering::SeqCst), 16);
    }

    #[tokio::test]
    async fn held_transactions_defer_event_processing() {
        let broker = FakeBroker::new();
        let driver = build_driver(&broker);
        started(&driver).await;
        let mut events = events_of(&driver);

        let tx = driver.begin_tx().await;
        broker.publish(MqttMessage::retained(
            "/devices/ghost/controls/seen/meta/type",
            "text",
        ));
        // Give the pipeline every chance to run ahead; it must stall on the
        // open transaction.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!tx.has_device("ghost"));
        tx.end();

        next_event(&mut events, |e| {
            matches!(e, DriverEvent::NewExternalDeviceControlMeta { .. })
        })
        .await;
        driver
            .access(|tx| {
                assert!(tx.has_device("ghost"));
                Ok(())
            })
            .await
            .unwrap();
        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn access_async_runs_inside_the_loop() {
        let broker = FakeBroker::new();
        let driver = build_driver(&broker);
        started(&driver).await;

        let done = driver.access_async(|tx| {
            let _ = tx.create_device(DeviceArgs::new().id("bg"));
            Ok(())
        });
        done.await.unwrap();

        driver
            .access(|tx| {
                assert!(tx.has_device("bg"));
                Ok(())
            })
            .await
            .unwrap();
        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn full_queue_is_reported_not_dropped() {
        let broker = FakeBroker::new();
        let driver = Driver::new(
            DriverConfig::new(broker.client(DRIVER_ID))
                .driver_id(DRIVER_ID)
                .queue_capacity(2),
        )
        .unwrap();

        // Loop not started: nothing drains the queue.
        driver.push_event(DriverEvent::ready()).unwrap();
        driver.push_event(DriverEvent::ready()).unwrap();
        let err = driver.push_event(DriverEvent::ready()).unwrap_err();
        assert!(matches!(err, Error::Driver(DriverError::EventQueueFull)));

        let stalled = driver.access_async(|_| Ok(()));
        assert!(matches!(
            stalled.await.unwrap_err(),
            Error::Driver(DriverError::EventQueueFull)
        ));
        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn loop_once_embeds_in_external_run_loops() {
        let broker = FakeBroker::new();
        let driver = build_driver(&broker);

        let ready = driver.wait_for_ready();
        driver.push_event(DriverEvent::ready()).unwrap();
        assert!(driver.loop_once(Duration::from_millis(50)).await);
        ready.await.unwrap();

        // An idle tick times out and reports the loop as alive.
        assert!(driver.loop_once(Duration::from_millis(10)).await);
        driver.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_completes_under_inbound_pressure() {
        let broker = FakeBroker::new();
        let driver = Driver::new(
            DriverConfig::new(broker.client(DRIVER_ID))
                .driver_id(DRIVER_ID)
                .filter(DeviceFilter::AllDevices)
                .queue_capacity(1),
        )
        .unwrap();
        started(&driver).await;
        driver.stop_loop().await.unwrap();

        // With the loop stopped nothing drains the queue; the second
        // message parks the backend on its bounded send.
        broker.publish(MqttMessage::retained("/devices/burst/controls/a", "1"));
        broker.publish(MqttMessage::retained("/devices/burst/controls/b", "2"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(5), driver.close())
            .await
            .expect("close stalled behind the backlog")
            .unwrap();
        assert!(matches!(
            driver.push_event(DriverEvent::ready()).unwrap_err(),
            Error::Driver(DriverError::Inactive)
        ));
    }

    #[tokio::test]
    async fn closed_driver_fails_backend_requests() {
        let broker = FakeBroker::new();
        let driver = build_driver(&broker);
        driver.close().await.unwrap();
        // Closing again is a no-op.
        driver.close().await.unwrap();

        assert!(matches!(
            driver.start_loop().unwrap_err(),
            Error::Driver(DriverError::Inactive)
        ));
        let created = driver
            .access(|tx| Ok(tx.create_device(DeviceArgs::new().id("late"))))
            .await
            .unwrap();
        assert!(matches!(
            created.await.unwrap_err(),
            Error::Driver(DriverError::Inactive)
        ));
    }
}
