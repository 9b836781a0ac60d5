//! Mutable sync state owned by the engine: per-kind versions, authoritative
//! records, the pending-change queue, recorded errors and what each peer is
//! known to hold.
//!
//! Plain data behind the engine's mutex; nothing here awaits or does I/O.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use commsync_core::types::DataKind;

use crate::conflict::ConflictInfo;
use crate::record::SyncRecord;

/// A recorded failure
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncError {
    pub id: u64,
    pub device_id: String,
    pub kind: Option<DataKind>,
    pub cause: String,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub resolved: bool,
    /// Delivery failures are retried; integrity and conflict errors are not
    pub retryable: bool,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Set for conflicts held under the manual policy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict: Option<ConflictInfo>,
}

impl SyncError {
    pub fn is_conflict(&self) -> bool {
        self.conflict.is_some()
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retryable && !self.resolved && self.next_retry_at.is_none()
    }
}

/// Delay before retry attempt `attempt` (1-based): `base * attempt`.
pub fn backoff(base_ms: u64, attempt: u32) -> Duration {
    let ms = base_ms.saturating_mul(u64::from(attempt.max(1)));
    Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

#[derive(Debug, Default)]
pub struct SyncState {
    pub sync_in_progress: bool,
    pub last_full_sync: Option<DateTime<Utc>>,
    versions: BTreeMap<DataKind, u64>,
    authoritative: BTreeMap<DataKind, SyncRecord>,
    pending: VecDeque<SyncRecord>,
    errors: Vec<SyncError>,
    next_error_id: u64,
    peer_versions: HashMap<String, BTreeMap<DataKind, u64>>,
    /// kind → id of the conflict error holding it
    paused: BTreeMap<DataKind, u64>,
    /// device → tickets of sends currently in flight
    in_flight: HashMap<String, HashSet<SendTicket>>,
    next_ticket: u64,
}

/// Identifies one send attempt, so a late finish of an abandoned attempt
/// cannot clear a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SendTicket(u64);

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Versions and records ─────────────────────────────────────────────────

    pub fn version(&self, kind: DataKind) -> u64 {
        self.versions.get(&kind).copied().unwrap_or(0)
    }

    pub fn versions(&self) -> &BTreeMap<DataKind, u64> {
        &self.versions
    }

    /// Bump and return the version for a local write.
    pub fn next_version(&mut self, kind: DataKind) -> u64 {
        let v = self.versions.entry(kind).or_insert(0);
        *v += 1;
        *v
    }

    /// Raise the stored version to at least `version`.
    pub fn observe_version(&mut self, kind: DataKind, version: u64) {
        let v = self.versions.entry(kind).or_insert(0);
        *v = (*v).max(version);
    }

    pub fn authoritative(&self, kind: DataKind) -> Option<&SyncRecord> {
        self.authoritative.get(&kind)
    }

    pub fn records(&self) -> impl Iterator<Item = &SyncRecord> {
        self.authoritative.values()
    }

    /// Make `record` the authoritative value of its kind.
    pub fn adopt(&mut self, record: SyncRecord) {
        self.observe_version(record.kind, record.version);
        self.authoritative.insert(record.kind, record);
    }

    // ── Pending queue ────────────────────────────────────────────────────────

    /// Queue a change; an older queued change of the same kind is superseded.
    pub fn enqueue(&mut self, record: SyncRecord) {
        self.pending
            .retain(|p| p.kind != record.kind || p.version > record.version);
        self.pending.push_back(record);
    }

    pub fn pending(&self) -> &VecDeque<SyncRecord> {
        &self.pending
    }

    /// Drop queued changes every one of `devices` has confirmed.
    pub fn prune_pending(&mut self, devices: &[String]) {
        if devices.is_empty() {
            return;
        }
        let peers = &self.peer_versions;
        self.pending.retain(|p| {
            !devices.iter().all(|d| {
                peers
                    .get(d)
                    .and_then(|m| m.get(&p.kind))
                    .is_some_and(|v| *v >= p.version)
            })
        });
    }

    // ── Peer knowledge ───────────────────────────────────────────────────────

    pub fn peer_version(&self, device_id: &str, kind: DataKind) -> u64 {
        self.peer_versions
            .get(device_id)
            .and_then(|m| m.get(&kind))
            .copied()
            .unwrap_or(0)
    }

    /// Record that `device_id` holds `kind` at `version` or later.
    pub fn confirm_peer(&mut self, device_id: &str, kind: DataKind, version: u64) {
        let v = self
            .peer_versions
            .entry(device_id.to_string())
            .or_default()
            .entry(kind)
            .or_insert(0);
        *v = (*v).max(version);
    }

    /// Forget confirmations at exactly `version` of `kind`: those peers may
    /// hold the losing side of a conflict. `None` applies to every peer.
    pub fn unconfirm(&mut self, device_id: Option<&str>, kind: DataKind, version: u64) {
        for (id, versions) in self.peer_versions.iter_mut() {
            if device_id.is_some_and(|d| d != id) {
                continue;
            }
            if let Some(v) = versions.get_mut(&kind) {
                if *v == version {
                    *v = version.saturating_sub(1);
                }
            }
        }
    }

    /// Replace what we know about a peer with its own version table.
    pub fn set_peer_versions(&mut self, device_id: &str, versions: BTreeMap<DataKind, u64>) {
        self.peer_versions.insert(device_id.to_string(), versions);
    }

    /// Authoritative records `device_id` has not confirmed, skipping paused kinds.
    pub fn outstanding_for(&self, device_id: &str) -> Vec<SyncRecord> {
        self.authoritative
            .values()
            .filter(|r| !self.is_paused(r.kind))
            .filter(|r| r.version > self.peer_version(device_id, r.kind))
            .cloned()
            .collect()
    }

    // ── In-flight sends ──────────────────────────────────────────────────────

    pub fn begin_send(&mut self, device_id: &str) -> SendTicket {
        self.next_ticket += 1;
        let ticket = SendTicket(self.next_ticket);
        self.in_flight
            .entry(device_id.to_string())
            .or_default()
            .insert(ticket);
        ticket
    }

    pub fn is_in_flight(&self, device_id: &str, ticket: SendTicket) -> bool {
        self.in_flight
            .get(device_id)
            .is_some_and(|t| t.contains(&ticket))
    }

    /// `false` if the send was abandoned while in flight.
    pub fn end_send(&mut self, device_id: &str, ticket: SendTicket) -> bool {
        let Some(tickets) = self.in_flight.get_mut(device_id) else {
            return false;
        };
        let live = tickets.remove(&ticket);
        if tickets.is_empty() {
            self.in_flight.remove(device_id);
        }
        live
    }

    /// Abandon every in-flight send to `device_id`; `true` if any existed.
    pub fn abandon_send(&mut self, device_id: &str) -> bool {
        self.in_flight
            .remove(device_id)
            .is_some_and(|t| !t.is_empty())
    }

    // ── Errors ───────────────────────────────────────────────────────────────

    fn push_error(&mut self, mut error: SyncError) -> u64 {
        self.next_error_id += 1;
        error.id = self.next_error_id;
        self.errors.push(error);
        self.next_error_id
    }

    /// Record a delivery failure. Repeated failures toward the same device
    /// fold into its open error while that one still has retries left.
    pub fn record_failure(
        &mut self,
        device_id: &str,
        kind: Option<DataKind>,
        cause: impl Into<String>,
        retry_base_ms: u64,
    ) -> u64 {
        let now = Utc::now();
        let cause = cause.into();
        if let Some(open) = self
            .errors
            .iter_mut()
            .find(|e| e.device_id == device_id && e.retryable && !e.resolved && e.next_retry_at.is_some())
        {
            open.cause = cause;
            open.timestamp = now;
            return open.id;
        }
        self.push_error(SyncError {
            id: 0,
            device_id: device_id.to_string(),
            kind,
            cause,
            timestamp: now,
            retry_count: 0,
            resolved: false,
            retryable: true,
            next_retry_at: Some(now + backoff(retry_base_ms, 1)),
            conflict: None,
        })
    }

    /// Record an error that is never retried (integrity, protocol).
    pub fn record_fatal(
        &mut self,
        device_id: &str,
        kind: Option<DataKind>,
        cause: impl Into<String>,
    ) -> u64 {
        self.push_error(SyncError {
            id: 0,
            device_id: device_id.to_string(),
            kind,
            cause: cause.into(),
            timestamp: Utc::now(),
            retry_count: 0,
            resolved: false,
            retryable: false,
            next_retry_at: None,
            conflict: None,
        })
    }

    /// Hold a conflict for a manual decision and pause its kind.
    pub fn record_conflict(&mut self, info: ConflictInfo) -> u64 {
        if let Some(id) = self.paused.get(&info.kind).copied() {
            let same = self
                .errors
                .iter()
                .find(|e| e.id == id)
                .and_then(|e| e.conflict.as_ref())
                .is_some_and(|c| c.remote.checksum == info.remote.checksum);
            if same {
                return id;
            }
            self.resolve_error(id);
        }
        let kind = info.kind;
        let id = self.push_error(SyncError {
            id: 0,
            device_id: info.remote.origin.clone(),
            kind: Some(kind),
            cause: format!("conflict on {kind} v{}", info.version),
            timestamp: Utc::now(),
            retry_count: 0,
            resolved: false,
            retryable: false,
            next_retry_at: None,
            conflict: Some(info),
        });
        self.paused.insert(kind, id);
        id
    }

    pub fn is_paused(&self, kind: DataKind) -> bool {
        self.paused.contains_key(&kind)
    }

    pub fn paused_kinds(&self) -> Vec<DataKind> {
        self.paused.keys().copied().collect()
    }

    /// The conflict currently holding `kind`, if any.
    pub fn conflict_for(&self, kind: DataKind) -> Option<(u64, &ConflictInfo)> {
        let id = *self.paused.get(&kind)?;
        self.errors
            .iter()
            .find(|e| e.id == id)
            .and_then(|e| e.conflict.as_ref().map(|c| (id, c)))
    }

    /// Mark an error resolved; resolving a conflict unpauses its kind.
    pub fn resolve_error(&mut self, id: u64) -> bool {
        let Some(error) = self.errors.iter_mut().find(|e| e.id == id) else {
            return false;
        };
        error.resolved = true;
        error.next_retry_at = None;
        self.paused.retain(|_, held_by| *held_by != id);
        true
    }

    /// Close open delivery failures toward `device_id` after a successful sync.
    pub fn resolve_failures(&mut self, device_id: &str) {
        for e in self
            .errors
            .iter_mut()
            .filter(|e| e.retryable && !e.resolved && e.device_id == device_id)
        {
            e.resolved = true;
            e.next_retry_at = None;
        }
    }

    pub fn errors(&self) -> &[SyncError] {
        &self.errors
    }

    pub fn unresolved(&self) -> Vec<SyncError> {
        self.errors.iter().filter(|e| !e.resolved).cloned().collect()
    }

    /// Devices with an open delivery failure whose retry time has come.
    pub fn due_retries(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut due: Vec<String> = self
            .errors
            .iter()
            .filter(|e| e.retryable && !e.resolved)
            .filter(|e| e.next_retry_at.is_some_and(|at| at <= now))
            .map(|e| e.device_id.clone())
            .collect();
        due.sort();
        due.dedup();
        due
    }

    /// Count a failed retry toward `device_id`. Returns `true` once the
    /// retry budget is spent; the error then stays open without a next try.
    pub fn retry_failed(
        &mut self,
        device_id: &str,
        now: DateTime<Utc>,
        retry_base_ms: u64,
        max_retries: u32,
    ) -> bool {
        let mut exhausted = false;
        for e in self
            .errors
            .iter_mut()
            .filter(|e| e.retryable && !e.resolved && e.device_id == device_id)
        {
            e.retry_count += 1;
            e.timestamp = now;
            if e.retry_count >= max_retries {
                e.next_retry_at = None;
                exhausted = true;
            } else {
                e.next_retry_at = Some(now + backoff(retry_base_ms, e.retry_count + 1));
            }
        }
        exhausted
    }

    /// Clear the pending queue, the error log and peer knowledge.
    /// Versions and authoritative records survive so versions never regress.
    pub fn reset(&mut self) {
        let versions = std::mem::take(&mut self.versions);
        let authoritative = std::mem::take(&mut self.authoritative);
        let last_full_sync = self.last_full_sync;
        let next_ticket = self.next_ticket;
        *self = SyncState {
            versions,
            authoritative,
            last_full_sync,
            next_ticket,
            ..SyncState::default()
        };
    }
}
