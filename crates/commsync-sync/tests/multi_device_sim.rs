//! 3-device simulation using property-based testing.
//!
//! Runs real `SyncContext`s over the in-memory network while devices drop off
//! and rejoin. Verifies:
//!   1. Version monotonicity: a device's version of a kind never goes backward
//!   2. Integrity: every authoritative record matches its checksum
//!   3. Eventual convergence: once healed and synced, all devices agree

use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use commsync_core::types::{DataKind, DeviceClass};
use commsync_sync::transport::MemoryNetwork;
use commsync_sync::{Device, SyncContext};

// ── Simulated fleet ─────────────────────────────────────────────────────────

const DEVICES: [(&str, DeviceClass, i32); 3] = [
    ("tablet", DeviceClass::Tablet, 10),
    ("phone", DeviceClass::Phone, 5),
    ("watch", DeviceClass::Wearable, 1),
];

const KINDS: [DataKind; 2] = [DataKind::Vocabulary, DataKind::Settings];

struct Fleet {
    net: MemoryNetwork,
    nodes: Vec<SyncContext>,
}

impl Fleet {
    async fn new() -> Self {
        let net = MemoryNetwork::new();
        let mut nodes = Vec::new();
        for (id, class, priority) in DEVICES {
            let local = Device::local(id, id, class).with_priority(priority);
            let transport = Arc::new(net.attach(local.clone()));
            let ctx = SyncContext::builder(local, transport)
                .settings(commsync_sync::SyncSettings {
                    sync_interval_ms: 3_600_000,
                    silence_window_ms: 3_600_000,
                    retry_base_ms: 10,
                    ..Default::default()
                })
                .build()
                .unwrap();
            ctx.start();
            nodes.push(ctx);
        }
        for n in &nodes {
            n.discover_peers().await;
        }
        drain().await;
        Self { net, nodes }
    }

    fn versions(&self) -> Vec<BTreeMap<DataKind, u64>> {
        self.nodes
            .iter()
            .map(|n| KINDS.iter().map(|k| (*k, n.engine().version(*k))).collect())
            .collect()
    }

    async fn heal_and_sync(&self) {
        for (id, _, _) in DEVICES {
            self.net.set_reachable(id, true);
        }
        for _ in 0..2 {
            for n in &self.nodes {
                n.force_sync_now().await;
            }
            drain().await;
        }
    }
}

async fn drain() {
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ── Simulation operations ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum SimOp {
    Publish {
        device: usize,
        kind: DataKind,
        word: String,
    },
    GoOffline {
        device: usize,
    },
    ComeOnline {
        device: usize,
    },
}

async fn execute_op(fleet: &Fleet, op: &SimOp) {
    match op {
        SimOp::Publish { device, kind, word } => {
            let payload = match kind {
                DataKind::Settings => json!({ "voice": word }),
                _ => json!([word]),
            };
            fleet.nodes[*device].publish(*kind, payload);
        }
        SimOp::GoOffline { device } => fleet.net.set_reachable(DEVICES[*device].0, false),
        SimOp::ComeOnline { device } => fleet.net.set_reachable(DEVICES[*device].0, true),
    }
    drain().await;
}

fn run<F: std::future::Future>(f: F) -> F::Output {
    tokio_test::block_on(f)
}

// ── Proptest strategies ─────────────────────────────────────────────────────

fn arb_device_idx() -> impl Strategy<Value = usize> {
    0..DEVICES.len()
}

fn arb_kind() -> impl Strategy<Value = DataKind> {
    prop::sample::select(KINDS.to_vec())
}

fn arb_op() -> impl Strategy<Value = SimOp> {
    prop_oneof![
        4 => (arb_device_idx(), arb_kind(), "[a-z]{1,8}")
            .prop_map(|(device, kind, word)| SimOp::Publish { device, kind, word }),
        1 => arb_device_idx().prop_map(|device| SimOp::GoOffline { device }),
        1 => arb_device_idx().prop_map(|device| SimOp::ComeOnline { device }),
    ]
}

fn arb_ops(max_ops: usize) -> impl Strategy<Value = Vec<SimOp>> {
    prop::collection::vec(arb_op(), 1..max_ops)
}

// ── Properties ──────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Versions never move backward on any device, whatever the partitions.
    #[test]
    fn versions_monotonic(ops in arb_ops(12)) {
        let regressions = run(async {
            let fleet = Fleet::new().await;
            let mut last = fleet.versions();
            let mut regressions = Vec::new();
            for op in &ops {
                execute_op(&fleet, op).await;
                let now = fleet.versions();
                for (i, (before, after)) in last.iter().zip(&now).enumerate() {
                    for kind in KINDS {
                        if after[&kind] < before[&kind] {
                            regressions.push((DEVICES[i].0, kind, before[&kind], after[&kind]));
                        }
                    }
                }
                last = now;
            }
            regressions
        });
        prop_assert!(regressions.is_empty(), "regressed: {:?}", regressions);
    }

    /// After healing and two sync rounds every device holds the same record
    /// of every kind, and that record verifies.
    #[test]
    fn fleet_converges(ops in arb_ops(12)) {
        let finals = run(async {
            let fleet = Fleet::new().await;
            for op in &ops {
                execute_op(&fleet, op).await;
            }
            fleet.heal_and_sync().await;
            fleet
                .nodes
                .iter()
                .map(|n| KINDS.iter().map(|k| n.current(*k)).collect::<Vec<_>>())
                .collect::<Vec<_>>()
        });

        for (i, records) in finals.iter().enumerate() {
            for rec in records.iter().flatten() {
                prop_assert!(rec.verify(), "{} holds a corrupt record", DEVICES[i].0);
            }
        }
        for (i, records) in finals.iter().enumerate().skip(1) {
            for (k, kind) in KINDS.iter().enumerate() {
                let ours = records[k].as_ref().map(|r| (r.version, r.checksum.clone()));
                let first = finals[0][k].as_ref().map(|r| (r.version, r.checksum.clone()));
                prop_assert_eq!(
                    ours,
                    first,
                    "{} disagrees with {} on {}",
                    DEVICES[i].0,
                    DEVICES[0].0,
                    kind
                );
            }
        }
    }
}

// ── Deterministic integration tests ─────────────────────────────────────────

#[test]
fn test_three_device_basic_sync() {
    run(async {
        let fleet = Fleet::new().await;
        fleet.nodes[0].publish(DataKind::Vocabulary, json!(["water"]));
        drain().await;
        fleet.nodes[1].publish(DataKind::Vocabulary, json!(["water", "help"]));
        drain().await;

        for n in &fleet.nodes {
            let rec = n.current(DataKind::Vocabulary).unwrap();
            assert_eq!(rec.version, 2);
            assert_eq!(rec.origin, "phone");
            assert_eq!(rec.payload, json!(["water", "help"]));
        }
    });
}

#[test]
fn test_isolated_device_catches_up() {
    run(async {
        let fleet = Fleet::new().await;
        fleet.net.set_reachable("watch", false);
        for word in ["a", "b", "c"] {
            fleet.nodes[0].publish(DataKind::Settings, json!({ "voice": word }));
            drain().await;
        }
        assert!(fleet.nodes[2].current(DataKind::Settings).is_none());
        assert_eq!(fleet.nodes[1].engine().version(DataKind::Settings), 3);

        fleet.heal_and_sync().await;
        let rec = fleet.nodes[2].current(DataKind::Settings).unwrap();
        assert_eq!(rec.version, 3);
        assert_eq!(rec.payload, json!({ "voice": "c" }));
        assert!(fleet.nodes[0].unresolved_errors().is_empty());
    });
}

#[test]
fn test_split_brain_resolves_to_one_value() {
    run(async {
        let fleet = Fleet::new().await;
        fleet.net.set_reachable("tablet", false);
        fleet.nodes[0].publish(DataKind::Settings, json!({ "voice": "anna" }));
        drain().await;
        fleet.nodes[1].publish(DataKind::Settings, json!({ "voice": "ben" }));
        drain().await;
        assert_eq!(fleet.nodes[2].current(DataKind::Settings).unwrap().payload, json!({ "voice": "ben" }));

        fleet.heal_and_sync().await;
        let winner = fleet.nodes[0].current(DataKind::Settings).unwrap();
        assert_eq!(winner.payload, json!({ "voice": "ben" }));
        for n in &fleet.nodes {
            assert_eq!(n.current(DataKind::Settings).unwrap(), winner);
        }
    });
}
