//! Conflict detection and resolution for per-kind versioned records.
//!
//! Two devices that both bump the same kind from version N to N+1 before
//! seeing each other's write produce records with equal versions and
//! different checksums. Resolution must be a pure function of the two
//! records (plus the shared priority table) so every replica picks the same
//! survivor regardless of which side it considers "local".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use commsync_core::types::{ConflictPolicy, DataKind};

use crate::record::{checksum, SyncRecord};

/// Kind-specific structural merge: `(older, newer) -> merged`.
///
/// Always called with the two payloads in last-write-wins order, so the
/// function does not need to be commutative itself.
pub type MergeFn = Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>;

// ── Ordering ──────────────────────────────────────────────────────────────────

/// Last-write-wins ordering: later timestamp, then higher origin priority,
/// then lexicographically smaller origin id, then larger checksum.
///
/// Returns `Ordering::Greater` when `a` beats `b`.
pub fn lww_order(a: &SyncRecord, b: &SyncRecord, priority: &dyn Fn(&str) -> i32) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| priority(&a.origin).cmp(&priority(&b.origin)))
        .then_with(|| b.origin.cmp(&a.origin))
        .then_with(|| a.checksum.cmp(&b.checksum))
}

/// The surviving record under last-write-wins.
pub fn last_write_wins<'a>(
    a: &'a SyncRecord,
    b: &'a SyncRecord,
    priority: &dyn Fn(&str) -> i32,
) -> &'a SyncRecord {
    match lww_order(a, b, priority) {
        Ordering::Less => b,
        _ => a,
    }
}

// ── Resolution ────────────────────────────────────────────────────────────────

/// A conflict held for a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub kind: DataKind,
    pub version: u64,
    pub local: SyncRecord,
    pub remote: SyncRecord,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// This record is the new authoritative value (may be a merge result).
    Winner(SyncRecord),
    /// Manual policy: nothing applied, the pair awaits a decision.
    Deferred(ConflictInfo),
}

/// Collaborator's answer to a deferred conflict
#[derive(Debug, Clone, PartialEq)]
pub enum ManualChoice {
    KeepLocal,
    KeepRemote,
    Replace(Value),
}

/// Policy plus registered kind-specific merge functions
#[derive(Clone, Default)]
pub struct ConflictResolver {
    policy: ConflictPolicy,
    merges: HashMap<DataKind, MergeFn>,
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("policy", &self.policy)
            .field("merge_kinds", &self.merges.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ConflictResolver {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self {
            policy,
            merges: HashMap::new(),
        }
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: ConflictPolicy) {
        self.policy = policy;
    }

    pub fn register_merge(&mut self, kind: DataKind, merge: MergeFn) {
        self.merges.insert(kind, merge);
    }

    pub fn has_merge(&self, kind: DataKind) -> bool {
        self.merges.contains_key(&kind)
    }

    /// Settle two records of the same kind and version with different content.
    pub fn resolve(
        &self,
        local: &SyncRecord,
        remote: &SyncRecord,
        priority: &dyn Fn(&str) -> i32,
    ) -> Resolution {
        match self.policy {
            ConflictPolicy::Manual => Resolution::Deferred(ConflictInfo {
                kind: local.kind,
                version: local.version,
                local: local.clone(),
                remote: remote.clone(),
                detected_at: Utc::now(),
            }),
            ConflictPolicy::Merge => match self.merges.get(&local.kind) {
                Some(merge) => Resolution::Winner(merge_records(local, remote, merge, priority)),
                None => Resolution::Winner(last_write_wins(local, remote, priority).clone()),
            },
            ConflictPolicy::LastWriteWins => {
                Resolution::Winner(last_write_wins(local, remote, priority).clone())
            }
        }
    }
}

/// Merge in LWW order and stamp the result with the winner's identity so
/// both sides produce byte-identical records.
fn merge_records(
    a: &SyncRecord,
    b: &SyncRecord,
    merge: &MergeFn,
    priority: &dyn Fn(&str) -> i32,
) -> SyncRecord {
    let (older, newer) = match lww_order(a, b, priority) {
        Ordering::Less => (a, b),
        _ => (b, a),
    };
    let payload = merge(&older.payload, &newer.payload);
    let checksum = checksum(&payload);
    SyncRecord {
        payload,
        checksum,
        ..newer.clone()
    }
}

/// Union of two JSON arrays, sorted and de-duplicated.
///
/// Non-array inputs fall back to the newer payload.
pub fn union_merge() -> MergeFn {
    Arc::new(|older: &Value, newer: &Value| match (older, newer) {
        (Value::Array(a), Value::Array(b)) => {
            let mut items: Vec<Value> = a.iter().chain(b.iter()).cloned().collect();
            items.sort_by_key(|v| v.to_string());
            items.dedup();
            Value::Array(items)
        }
        _ => newer.clone(),
    })
}
