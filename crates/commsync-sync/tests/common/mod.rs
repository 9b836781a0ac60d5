//! Shared fixtures: devices on an in-memory network, each running a started
//! `SyncContext`.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use commsync_core::types::DeviceClass;
use commsync_sync::transport::MemoryNetwork;
use commsync_sync::{Device, SyncContext, SyncSettings};

/// Settings with a timer that never fires during a test and quick retries.
pub fn test_settings() -> SyncSettings {
    SyncSettings {
        auto_sync: true,
        sync_interval_ms: 3_600_000,
        max_retries: 3,
        retry_base_ms: 20,
        silence_window_ms: 3_600_000,
        ..SyncSettings::default()
    }
}

pub fn node(net: &MemoryNetwork, id: &str, class: DeviceClass, priority: i32) -> SyncContext {
    node_with(net, id, class, priority, test_settings())
}

pub fn node_with(
    net: &MemoryNetwork,
    id: &str,
    class: DeviceClass,
    priority: i32,
    settings: SyncSettings,
) -> SyncContext {
    let local = Device::local(id, id, class).with_priority(priority);
    let transport = Arc::new(net.attach(local.clone()));
    let ctx = SyncContext::builder(local, transport)
        .settings(settings)
        .handoff_timeout(Duration::from_millis(300))
        .build()
        .unwrap();
    ctx.start();
    ctx
}

/// Let routers and spawned fan-outs drain.
pub async fn settle() {
    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Every node discovers every other one.
pub async fn mesh(nodes: &[&SyncContext]) {
    for n in nodes {
        n.discover_peers().await;
    }
    settle().await;
}
