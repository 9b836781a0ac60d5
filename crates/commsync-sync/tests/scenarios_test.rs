//! End-to-end sync between devices over the in-memory transport.

mod common;

use serde_json::json;
use std::sync::{Arc, Mutex};

use commsync_core::types::{ConflictPolicy, DataKind, DeviceClass, DeviceStatus};
use commsync_sync::conflict::{union_merge, ManualChoice};
use commsync_sync::protocol::{MessageBody, WireMessage};
use commsync_sync::transport::MemoryNetwork;
use commsync_sync::{Device, LifecycleSignal, SyncRecord, SyncSettings, Transport};

use common::{mesh, node, node_with, settle, test_settings};

#[tokio::test]
async fn discovery_links_devices_in_priority_order() {
    let net = MemoryNetwork::new();
    let tablet = node(&net, "tablet", DeviceClass::Tablet, 10);
    let phone = node(&net, "phone", DeviceClass::Phone, 5);
    let watch = node(&net, "watch", DeviceClass::Wearable, 1);
    mesh(&[&tablet, &phone, &watch]).await;

    let ids: Vec<String> = watch
        .get_connected_devices()
        .into_iter()
        .map(|d| d.id)
        .collect();
    assert_eq!(ids, vec!["tablet", "phone"]);
    assert_eq!(tablet.get_sync_status().connected_devices, 2);
    assert!(tablet.get_connected_devices().iter().all(|d| !d.is_local));
}

#[tokio::test]
async fn offline_device_catches_up_then_follows_live_updates() {
    let net = MemoryNetwork::new();
    let a = node(&net, "tablet", DeviceClass::Tablet, 10);
    let b = node(&net, "phone", DeviceClass::Phone, 5);
    mesh(&[&a, &b]).await;

    net.set_reachable("phone", false);
    b.handle_lifecycle(LifecycleSignal::NetworkDown).await.unwrap();
    a.disconnect_device("phone").await.unwrap();

    let v1 = a.publish(DataKind::Settings, json!({"volume": 5}));
    settle().await;
    assert_eq!(v1.version, 1);
    assert!(b.current(DataKind::Settings).is_none());
    assert_eq!(a.get_sync_status().pending_changes, 1);

    net.set_reachable("phone", true);
    b.handle_lifecycle(LifecycleSignal::NetworkUp).await.unwrap();
    settle().await;

    let on_b = b.current(DataKind::Settings).unwrap();
    assert_eq!(on_b.version, 1);
    assert_eq!(on_b.payload, json!({"volume": 5}));
    assert_eq!(on_b.checksum, v1.checksum);
    assert_eq!(
        a.device("phone").unwrap().status,
        DeviceStatus::Online
    );

    let v2 = a.publish(DataKind::Settings, json!({"volume": 7}));
    settle().await;
    assert_eq!(v2.version, 2);
    let on_b = b.current(DataKind::Settings).unwrap();
    assert_eq!(on_b.version, 2);
    assert_eq!(on_b.payload, json!({"volume": 7}));
    assert_eq!(a.get_sync_status().pending_changes, 0);
}

#[tokio::test]
async fn concurrent_vocabulary_edits_converge_on_later_write() {
    let net = MemoryNetwork::new();
    let a = node(&net, "tablet", DeviceClass::Tablet, 10);
    let b = node(&net, "phone", DeviceClass::Phone, 5);
    let c = node(&net, "tv", DeviceClass::Tv, 1);
    mesh(&[&a, &b, &c]).await;

    for word in ["water", "help", "outside"] {
        a.publish(DataKind::Vocabulary, json!([word]));
        settle().await;
    }
    for n in [&a, &b, &c] {
        assert_eq!(n.current(DataKind::Vocabulary).unwrap().version, 3);
    }

    // no await between the two writes: neither sees the other before bumping
    let from_a = a.publish(DataKind::Vocabulary, json!(["water", "juice"]));
    std::thread::sleep(std::time::Duration::from_millis(5));
    let from_b = b.publish(DataKind::Vocabulary, json!(["water", "tea"]));
    assert_eq!(from_a.version, 4);
    assert_eq!(from_b.version, 4);
    assert!(from_b.timestamp > from_a.timestamp);
    settle().await;

    for n in [&a, &b, &c] {
        let rec = n.current(DataKind::Vocabulary).unwrap();
        assert_eq!(rec.version, 4, "{}", n.local_id());
        assert_eq!(rec.payload, json!(["water", "tea"]), "{}", n.local_id());
        assert_eq!(rec.checksum, from_b.checksum);
    }
}

#[tokio::test]
async fn merge_policy_unions_concurrent_edits() {
    let net = MemoryNetwork::new();
    let settings = SyncSettings {
        conflict_policy: ConflictPolicy::Merge,
        ..test_settings()
    };
    let a = node_with(&net, "tablet", DeviceClass::Tablet, 10, settings.clone());
    let b = node_with(&net, "phone", DeviceClass::Phone, 5, settings);
    for n in [&a, &b] {
        n.register_merge(DataKind::Vocabulary, union_merge());
    }
    mesh(&[&a, &b]).await;

    a.publish(DataKind::Vocabulary, json!(["water", "juice"]));
    b.publish(DataKind::Vocabulary, json!(["tea", "water"]));
    settle().await;

    let on_a = a.current(DataKind::Vocabulary).unwrap();
    let on_b = b.current(DataKind::Vocabulary).unwrap();
    assert_eq!(on_a.payload, json!(["juice", "tea", "water"]));
    assert_eq!(on_a, on_b);
    assert_eq!(on_a.version, 1);
    assert!(on_a.verify());
}

#[tokio::test]
async fn manual_conflict_waits_for_a_decision() {
    let net = MemoryNetwork::new();
    let settings = SyncSettings {
        conflict_policy: ConflictPolicy::Manual,
        ..test_settings()
    };
    let a = node_with(&net, "tablet", DeviceClass::Tablet, 10, settings.clone());
    let b = node_with(&net, "phone", DeviceClass::Phone, 5, settings);
    mesh(&[&a, &b]).await;

    a.publish(DataKind::Settings, json!({"voice": "anna"}));
    b.publish(DataKind::Settings, json!({"voice": "ben"}));
    settle().await;

    for n in [&a, &b] {
        let status = n.get_sync_status();
        assert_eq!(status.paused_kinds, vec![DataKind::Settings]);
        assert_eq!(status.unresolved_errors, 1);
    }
    assert_eq!(
        a.current(DataKind::Settings).unwrap().payload,
        json!({"voice": "anna"})
    );

    // paused kind does not propagate
    a.publish(DataKind::Settings, json!({"voice": "carla"}));
    settle().await;
    assert_eq!(b.current(DataKind::Settings).unwrap().version, 1);

    let chosen = a
        .submit_resolution(DataKind::Settings, ManualChoice::KeepRemote)
        .unwrap();
    assert_eq!(chosen.version, 3);
    settle().await;

    for n in [&a, &b] {
        let rec = n.current(DataKind::Settings).unwrap();
        assert_eq!(rec.version, 3);
        assert_eq!(rec.payload, json!({"voice": "ben"}));
        assert!(n.get_sync_status().paused_kinds.is_empty());
        assert!(n.unresolved_errors().is_empty());
    }
}

#[tokio::test]
async fn tampered_record_never_applied() {
    let net = MemoryNetwork::new();
    let a = node(&net, "tablet", DeviceClass::Tablet, 10);
    let mallory = net.attach(Device::new("mallory", "mallory", DeviceClass::Computer));

    let mut forged = SyncRecord::new(DataKind::Clinical, 99, json!({"dose": "1mg"}), "mallory");
    forged.payload = json!({"dose": "100mg"});
    mallory.connect("tablet").await.unwrap();
    mallory
        .send("tablet", WireMessage::new("mallory", MessageBody::SyncData(forged)))
        .await
        .unwrap();
    settle().await;

    assert!(a.current(DataKind::Clinical).is_none());
    assert_eq!(a.engine().version(DataKind::Clinical), 0);
    let errors = a.unresolved_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].device_id, "mallory");
    assert!(!errors[0].retryable);
}

#[tokio::test]
async fn redelivered_record_is_applied_once() {
    let net = MemoryNetwork::new();
    let a = node(&net, "tablet", DeviceClass::Tablet, 10);
    let peer = net.attach(Device::new("phone", "phone", DeviceClass::Phone));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    a.on_data_changed(
        DataKind::Predictions,
        Arc::new(move |r: &SyncRecord| sink.lock().unwrap().push(r.version)),
    );

    let rec = SyncRecord::new(DataKind::Predictions, 2, json!({"next": ["you"]}), "phone");
    peer.connect("tablet").await.unwrap();
    for _ in 0..3 {
        peer.send(
            "tablet",
            WireMessage::new("phone", MessageBody::SyncData(rec.clone())),
        )
        .await
        .unwrap();
    }
    settle().await;

    assert_eq!(*seen.lock().unwrap(), vec![2]);
    assert_eq!(a.current(DataKind::Predictions).unwrap(), rec);
    assert!(a.unresolved_errors().is_empty());
}

#[tokio::test]
async fn update_request_returns_authoritative_records() {
    let net = MemoryNetwork::new();
    let a = node(&net, "tablet", DeviceClass::Tablet, 10);
    a.publish(DataKind::Emergency, json!({"contact": "555-0100"}));
    a.publish(DataKind::Settings, json!({"volume": 3}));

    let peer = net.attach(Device::new("phone", "phone", DeviceClass::Phone));
    let got = Arc::new(Mutex::new(Vec::new()));
    let sink = got.clone();
    peer.on_message(Arc::new(move |inb: commsync_sync::transport::Inbound| {
        if let MessageBody::SyncData(r) = inb.message.body {
            sink.lock().unwrap().push(r.kind);
        }
    }));
    peer.connect("tablet").await.unwrap();
    peer.send(
        "tablet",
        WireMessage::new(
            "phone",
            MessageBody::UpdateRequest {
                kinds: vec![DataKind::Emergency],
            },
        ),
    )
    .await
    .unwrap();
    settle().await;

    assert_eq!(*got.lock().unwrap(), vec![DataKind::Emergency]);
}

#[tokio::test]
async fn background_device_queues_until_foreground() {
    let net = MemoryNetwork::new();
    let a = node(&net, "tablet", DeviceClass::Tablet, 10);
    let b = node(&net, "phone", DeviceClass::Phone, 5);
    mesh(&[&a, &b]).await;

    a.handle_lifecycle(LifecycleSignal::Background).await.unwrap();
    a.publish(DataKind::CommunicationHistory, json!(["hello"]));
    settle().await;
    assert!(b.current(DataKind::CommunicationHistory).is_none());
    assert!(a.force_sync_now().await.skipped);

    a.handle_lifecycle(LifecycleSignal::Foreground).await.unwrap();
    let report = a.force_sync_now().await;
    assert!(!report.skipped);
    assert_eq!(report.records_sent, 1);
    settle().await;
    assert_eq!(
        b.current(DataKind::CommunicationHistory).unwrap().payload,
        json!(["hello"])
    );
    assert!(a.get_sync_status().last_sync.is_some());
}
