//! Session handoff between two running contexts.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use commsync_core::types::{DeviceClass, DeviceStatus};
use commsync_core::CommsyncError;
use commsync_sync::handoff::{ContextProvider, HandoffAcceptor, HandoffState};
use commsync_sync::protocol::MessageType;
use commsync_sync::transport::MemoryNetwork;
use commsync_sync::{
    Device, HandoffContext, HandoffOutcome, HandoffRequest, RegistryEvent, SyncContext, SyncEvent,
};

use common::{mesh, node, settle, test_settings};

struct Composing(&'static str);

impl ContextProvider for Composing {
    fn capture(&self) -> HandoffContext {
        HandoffContext {
            current_view: Some("keyboard".into()),
            composition_buffer: self.0.to_string(),
            recent_predictions: vec!["please".into(), "thanks".into()],
            ..HandoffContext::default()
        }
    }
}

#[derive(Default)]
struct Recorder {
    accept: bool,
    /// Time spent bringing the session up before answering
    delay: Duration,
    received: Mutex<Vec<HandoffRequest>>,
}

impl HandoffAcceptor for Recorder {
    fn activate(&self, request: &HandoffRequest) -> bool {
        self.received.lock().unwrap().push(request.clone());
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.accept
    }
}

fn handoff_pair(net: &MemoryNetwork, accept: bool) -> (SyncContext, SyncContext, Arc<Recorder>) {
    handoff_pair_with(
        net,
        Recorder {
            accept,
            ..Recorder::default()
        },
    )
}

fn handoff_pair_with(
    net: &MemoryNetwork,
    recorder: Recorder,
) -> (SyncContext, SyncContext, Arc<Recorder>) {
    let tablet = Device::local("tablet", "tablet", DeviceClass::Tablet).with_priority(10);
    let a = SyncContext::builder(tablet.clone(), Arc::new(net.attach(tablet)))
        .settings(test_settings())
        .context_provider(Arc::new(Composing("I want wa")))
        .handoff_timeout(Duration::from_millis(300))
        .build()
        .unwrap();

    let recorder = Arc::new(recorder);
    let phone = Device::local("phone", "phone", DeviceClass::Phone).with_priority(5);
    let b = SyncContext::builder(phone.clone(), Arc::new(net.attach(phone)))
        .settings(test_settings())
        .acceptor(recorder.clone())
        .handoff_timeout(Duration::from_millis(300))
        .build()
        .unwrap();

    a.start();
    b.start();
    (a, b, recorder)
}

#[tokio::test]
async fn confirmed_handoff_moves_context_and_priority() {
    let net = MemoryNetwork::new();
    let (a, b, recorder) = handoff_pair(&net, true);
    mesh(&[&a, &b]).await;
    let mut phone_events = b.subscribe();

    let outcome = a.initiate_handoff("phone").await.unwrap();
    assert_eq!(outcome, HandoffOutcome::Confirmed);
    assert_eq!(a.handoff_state("phone"), HandoffState::Confirmed);
    settle().await;

    let mut own_entry_updated = false;
    while let Ok(event) = phone_events.try_recv() {
        if let SyncEvent::Device(RegistryEvent::DeviceUpdated(d)) = event {
            own_entry_updated |= d.id == "phone" && d.sync_priority == 11;
        }
    }
    assert!(own_entry_updated);

    let received = recorder.received.lock().unwrap().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].source, "tablet");
    assert_eq!(received[0].context.composition_buffer, "I want wa");
    assert_eq!(received[0].context.current_view.as_deref(), Some("keyboard"));

    for ctx in [&a, &b] {
        let phone = ctx.device("phone").unwrap();
        let tablet = ctx.device("tablet").unwrap();
        assert_eq!(phone.sync_priority, 11, "{}", ctx.local_id());
        assert_eq!(tablet.sync_priority, 9, "{}", ctx.local_id());
    }
    assert_eq!(a.get_connected_devices()[0].id, "phone");
    assert_eq!(net.count_sent("phone", MessageType::HandoffConfirm), 1);
}

#[tokio::test]
async fn declined_handoff_expires_without_priority_change() {
    let net = MemoryNetwork::new();
    let (a, b, recorder) = handoff_pair(&net, false);
    mesh(&[&a, &b]).await;

    let outcome = a.initiate_handoff("phone").await.unwrap();
    assert_eq!(outcome, HandoffOutcome::Expired);
    assert_eq!(a.handoff_state("phone"), HandoffState::Expired);
    assert_eq!(recorder.received.lock().unwrap().len(), 1);
    assert_eq!(a.device("phone").unwrap().sync_priority, 5);
    assert_eq!(a.device("tablet").unwrap().sync_priority, 10);
    assert_eq!(b.device("phone").unwrap().sync_priority, 5);
    assert_eq!(net.count_sent("phone", MessageType::HandoffConfirm), 0);
}

// the slow acceptor blocks its router thread, so the source needs its own
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_acceptance_is_rolled_back_after_expiry() {
    let net = MemoryNetwork::new();
    let (a, b, recorder) = handoff_pair_with(
        &net,
        Recorder {
            accept: true,
            delay: Duration::from_millis(500),
            ..Recorder::default()
        },
    );
    mesh(&[&a, &b]).await;

    let outcome = a.initiate_handoff("phone").await.unwrap();
    assert_eq!(outcome, HandoffOutcome::Expired);
    assert_eq!(net.count_sent("tablet", MessageType::HandoffCancel), 1);

    // acceptor finishes, confirms too late, then sees the cancel
    tokio::time::sleep(Duration::from_millis(400)).await;
    settle().await;
    assert_eq!(recorder.received.lock().unwrap().len(), 1);
    assert_eq!(net.count_sent("phone", MessageType::HandoffConfirm), 1);

    for ctx in [&a, &b] {
        assert_eq!(ctx.device("phone").unwrap().sync_priority, 5, "{}", ctx.local_id());
        assert_eq!(ctx.device("tablet").unwrap().sync_priority, 10, "{}", ctx.local_id());
    }
    assert_eq!(a.handoff_state("phone"), HandoffState::Expired);
}

#[tokio::test]
async fn offline_target_gets_nothing() {
    let net = MemoryNetwork::new();
    let a = node(&net, "tablet", DeviceClass::Tablet, 10);
    a.register_device(
        Device::new("watch", "watch", DeviceClass::Wearable).with_status(DeviceStatus::Offline),
    )
    .unwrap();

    let outcome = a.initiate_handoff("watch").await.unwrap();
    assert_eq!(outcome, HandoffOutcome::TargetOffline);
    assert_eq!(a.handoff_state("watch"), HandoffState::Idle);
    assert_eq!(net.count_sent("tablet", MessageType::HandoffRequest), 0);

    assert!(matches!(
        a.initiate_handoff("fridge").await,
        Err(CommsyncError::UnknownDevice(_))
    ));
}

#[tokio::test]
async fn second_handoff_to_same_target_is_rejected() {
    let net = MemoryNetwork::new();
    let a = node(&net, "tablet", DeviceClass::Tablet, 10);
    // attached but never answers
    let _tv = net.attach(Device::new("tv", "tv", DeviceClass::Tv));
    a.register_device(Device::new("tv", "tv", DeviceClass::Tv)).unwrap();
    settle().await;

    let first = {
        let a = a.clone();
        tokio::spawn(async move { a.initiate_handoff("tv").await })
    };
    while a.handoff_state("tv") != HandoffState::AwaitingConfirmation {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    assert!(matches!(
        a.initiate_handoff("tv").await,
        Err(CommsyncError::HandoffInProgress(_))
    ));
    assert_eq!(first.await.unwrap().unwrap(), HandoffOutcome::Expired);
    assert_eq!(net.count_sent("tablet", MessageType::HandoffRequest), 1);
    assert_eq!(a.device("tv").unwrap().sync_priority, 0);
}

#[tokio::test]
async fn unreachable_target_reports_send_failure() {
    let net = MemoryNetwork::new();
    let a = node(&net, "tablet", DeviceClass::Tablet, 10);
    let b = node(&net, "phone", DeviceClass::Phone, 5);
    mesh(&[&a, &b]).await;

    net.set_reachable("phone", false);
    let outcome = a.initiate_handoff("phone").await.unwrap();
    assert!(matches!(outcome, HandoffOutcome::SendFailed(_)));
    assert!(!outcome.is_success());
    assert_eq!(a.handoff_state("phone"), HandoffState::Expired);
}
