//! Sync engine: versions local writes, pushes them to online peers, applies
//! records from peers, and runs sync passes and retries.
//!
//! State mutations happen under a short synchronous lock and never span a
//! transport call, so every mutation is atomic with respect to suspension
//! points.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use commsync_core::config::SyncConfig;
use commsync_core::types::{ConflictPolicy, DataKind, DeviceStatus};
use commsync_core::{CommsyncError, CommsyncResult};

use crate::conflict::{ConflictResolver, ManualChoice, MergeFn, Resolution};
use crate::device::{RegistryEvent, SharedRegistry, StatusChange};
use crate::handoff::HandoffOutcome;
use crate::lock;
use crate::protocol::{MessageBody, WireMessage};
use crate::record::SyncRecord;
use crate::state::{SendTicket, SyncError, SyncState};
use crate::store::PersistedState;
use crate::transport::{Transport, TransportError};

/// Callback for accepted changes of a kind
pub type ChangeHandler = Arc<dyn Fn(&SyncRecord) + Send + Sync>;

/// Runtime-tunable sync settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncSettings {
    pub auto_sync: bool,
    pub sync_interval_ms: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub conflict_policy: ConflictPolicy,
    pub silence_window_ms: u64,
}

impl From<&SyncConfig> for SyncSettings {
    fn from(c: &SyncConfig) -> Self {
        Self {
            auto_sync: c.auto_sync,
            sync_interval_ms: c.sync_interval_ms,
            max_retries: c.max_retries,
            retry_base_ms: c.retry_base_ms,
            conflict_policy: c.conflict_policy,
            silence_window_ms: c.silence_window_ms,
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

/// Snapshot for collaborators (UI indicators, daemon metrics)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub active: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub connected_devices: usize,
    pub pending_changes: usize,
    pub unresolved_errors: usize,
    pub paused_kinds: Vec<DataKind>,
}

/// What [`SyncEngine::apply_incoming`] did with a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Accepted,
    /// Same version and checksum as ours
    Duplicate,
    /// Older than ours
    Stale,
    /// Conflict settled by policy; `kept_local` if our record survived unchanged
    Resolved { kept_local: bool },
    /// Conflict held for a manual decision
    Deferred,
    /// Checksum mismatch
    Rejected,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncPassReport {
    pub skipped: bool,
    pub devices: usize,
    pub records_sent: usize,
    pub failed: Vec<String>,
}

impl SyncPassReport {
    pub(crate) fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Broadcast to collaborators that want a live feed
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Device(RegistryEvent),
    StatusChanged {
        device: String,
        change: StatusChange,
    },
    DataChanged {
        kind: DataKind,
        version: u64,
        origin: String,
    },
    ConflictHeld {
        kind: DataKind,
        error_id: u64,
    },
    PassCompleted(SyncPassReport),
    Handoff {
        target: String,
        outcome: HandoffOutcome,
    },
}

struct EngineInner {
    local_id: String,
    registry: SharedRegistry,
    transport: Arc<dyn Transport>,
    state: Mutex<SyncState>,
    settings: Mutex<SyncSettings>,
    resolver: Mutex<ConflictResolver>,
    subscribers: Mutex<HashMap<DataKind, Vec<ChangeHandler>>>,
    events: broadcast::Sender<SyncEvent>,
}

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(
        registry: SharedRegistry,
        transport: Arc<dyn Transport>,
        settings: SyncSettings,
    ) -> Self {
        let local_id = lock(&registry).local_id().to_string();
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(EngineInner {
                local_id,
                registry,
                transport,
                state: Mutex::new(SyncState::new()),
                resolver: Mutex::new(ConflictResolver::new(settings.conflict_policy)),
                settings: Mutex::new(settings),
                subscribers: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.inner.registry
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    // ── Settings and subscriptions ───────────────────────────────────────────

    pub fn settings(&self) -> SyncSettings {
        lock(&self.inner.settings).clone()
    }

    pub fn configure(&self, settings: SyncSettings) {
        lock(&self.inner.resolver).set_policy(settings.conflict_policy);
        info!(
            auto_sync = settings.auto_sync,
            interval_ms = settings.sync_interval_ms,
            max_retries = settings.max_retries,
            policy = ?settings.conflict_policy,
            "sync settings updated"
        );
        *lock(&self.inner.settings) = settings;
    }

    pub fn register_merge(&self, kind: DataKind, merge: MergeFn) {
        lock(&self.inner.resolver).register_merge(kind, merge);
    }

    pub fn on_data_changed(&self, kind: DataKind, handler: ChangeHandler) {
        lock(&self.inner.subscribers)
            .entry(kind)
            .or_default()
            .push(handler);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        // no receivers is fine
        let _ = self.inner.events.send(event);
    }

    fn notify(&self, record: &SyncRecord) {
        let handlers = lock(&self.inner.subscribers)
            .get(&record.kind)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            handler(record);
        }
        self.emit(SyncEvent::DataChanged {
            kind: record.kind,
            version: record.version,
            origin: record.origin.clone(),
        });
    }

    fn retry_base_ms(&self) -> u64 {
        lock(&self.inner.settings).retry_base_ms
    }

    pub fn local_online(&self) -> bool {
        lock(&self.inner.registry)
            .local()
            .map(|d| d.status.is_reachable())
            .unwrap_or(false)
    }

    fn can_send_now(&self, kind: DataKind) -> bool {
        let auto_sync = lock(&self.inner.settings).auto_sync;
        if !auto_sync || !self.local_online() {
            return false;
        }
        let st = lock(&self.inner.state);
        !st.sync_in_progress && !st.is_paused(kind)
    }

    fn spawn_fan_out(&self, record: SyncRecord) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(kind = %record.kind, "no runtime; change stays queued");
            return;
        };
        let engine = self.clone();
        handle.spawn(async move { engine.fan_out(record).await });
    }

    // ── Outbound ─────────────────────────────────────────────────────────────

    /// Version a local write and push it to online peers (or queue it).
    pub fn publish(&self, kind: DataKind, payload: Value) -> SyncRecord {
        let record = {
            let mut st = lock(&self.inner.state);
            let version = st.next_version(kind);
            let record = SyncRecord::new(kind, version, payload, &self.inner.local_id);
            st.adopt(record.clone());
            st.enqueue(record.clone());
            record
        };
        info!(kind = %kind, version = record.version, "published");

        if self.can_send_now(kind) {
            self.spawn_fan_out(record.clone());
        } else {
            debug!(kind = %kind, version = record.version, "queued for next sync pass");
        }
        record
    }

    /// Send `record` to every online device, then drop it from the queue if
    /// all of them took it.
    pub async fn fan_out(&self, record: SyncRecord) {
        let targets = lock(&self.inner.registry).list_online(true);
        let ids: Vec<String> = targets.iter().map(|d| d.id.clone()).collect();
        for id in &ids {
            let _ = self.send_records(id, std::slice::from_ref(&record)).await;
        }
        lock(&self.inner.state).prune_pending(&ids);
    }

    /// Connect if needed and send one message.
    pub async fn deliver(&self, device_id: &str, body: MessageBody) -> Result<(), TransportError> {
        self.inner.transport.connect(device_id).await?;
        let message = WireMessage::new(&self.inner.local_id, body);
        self.inner.transport.send(device_id, message).await
    }

    /// Send records in order; each delivered record counts as confirmed by
    /// the peer. Failures are recorded for retry.
    async fn send_records(
        &self,
        device_id: &str,
        records: &[SyncRecord],
    ) -> Result<usize, TransportError> {
        if records.is_empty() {
            return Ok(0);
        }
        let ticket = lock(&self.inner.state).begin_send(device_id);
        let result = self.send_in_flight(device_id, ticket, records).await;
        let completed = lock(&self.inner.state).end_send(device_id, ticket);

        match result {
            Ok(n) if completed => Ok(n),
            // abandoned mid-send; the status change already recorded it
            Ok(_) => Err(TransportError::connection_failed(device_id, "device unreachable")),
            Err(e) => {
                warn!(device = %device_id, "sync delivery failed: {e}");
                let kind = records.first().map(|r| r.kind);
                let base = self.retry_base_ms();
                lock(&self.inner.state).record_failure(device_id, kind, e.to_string(), base);
                Err(e)
            }
        }
    }

    async fn send_in_flight(
        &self,
        device_id: &str,
        ticket: SendTicket,
        records: &[SyncRecord],
    ) -> Result<usize, TransportError> {
        self.inner.transport.connect(device_id).await?;
        let mut sent = 0;
        for record in records {
            if !lock(&self.inner.state).is_in_flight(device_id, ticket) {
                break;
            }
            let message =
                WireMessage::new(&self.inner.local_id, MessageBody::SyncData(record.clone()));
            self.inner.transport.send(device_id, message).await?;
            lock(&self.inner.state).confirm_peer(device_id, record.kind, record.version);
            debug!(device = %device_id, kind = %record.kind, version = record.version, "sent");
            sent += 1;
        }
        Ok(sent)
    }

    /// Replay everything `device_id` has not confirmed. Open failures for
    /// the device close only once it has actually been reached.
    pub async fn sync_device(&self, device_id: &str) -> Result<usize, TransportError> {
        let records = lock(&self.inner.state).outstanding_for(device_id);
        let sent = if records.is_empty() {
            self.check_reachable(device_id).await?;
            0
        } else {
            self.send_records(device_id, &records).await?
        };
        lock(&self.inner.state).resolve_failures(device_id);
        Ok(sent)
    }

    /// Nothing to replay: connect anyway so a dead peer is not taken for a
    /// recovered one.
    async fn check_reachable(&self, device_id: &str) -> Result<(), TransportError> {
        if let Err(e) = self.inner.transport.connect(device_id).await {
            debug!(device = %device_id, "still unreachable: {e}");
            let base = self.retry_base_ms();
            lock(&self.inner.state).record_failure(device_id, None, e.to_string(), base);
            return Err(e);
        }
        Ok(())
    }

    /// Ask `device_id` for anything newer than our version table.
    pub async fn request_sync(&self, device_id: &str) -> Result<(), TransportError> {
        let versions = lock(&self.inner.state).versions().clone();
        self.deliver(device_id, MessageBody::SyncRequest { versions })
            .await
    }

    /// Introduce ourselves to `device_id`: announcement, then sync request.
    pub async fn introduce(&self, device_id: &str) -> Result<(), TransportError> {
        let me = lock(&self.inner.registry).local().cloned();
        if let Ok(me) = me {
            self.deliver(device_id, MessageBody::DeviceUpdate(me)).await?;
        }
        self.request_sync(device_id).await
    }

    /// Peer sent its version table: remember it and answer with newer records.
    pub async fn answer_sync_request(
        &self,
        from: &str,
        versions: BTreeMap<DataKind, u64>,
    ) -> Result<usize, TransportError> {
        lock(&self.inner.state).set_peer_versions(from, versions);
        self.sync_device(from).await
    }

    /// Peer asked for our authoritative records of `kinds`.
    pub async fn answer_update_request(
        &self,
        from: &str,
        kinds: &[DataKind],
    ) -> Result<usize, TransportError> {
        let records: Vec<SyncRecord> = {
            let st = lock(&self.inner.state);
            kinds
                .iter()
                .filter_map(|k| st.authoritative(*k).cloned())
                .collect()
        };
        self.send_records(from, &records).await
    }

    /// Broadcast our device entry to online peers.
    pub async fn heartbeat(&self) -> usize {
        let (me, targets) = {
            let reg = lock(&self.inner.registry);
            (reg.local().cloned(), reg.list_online(false))
        };
        let Ok(me) = me else { return 0 };
        let mut delivered = 0;
        for device in targets {
            match self
                .deliver(&device.id, MessageBody::DeviceUpdate(me.clone()))
                .await
            {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(device = %device.id, "heartbeat failed: {e}");
                    let base = self.retry_base_ms();
                    lock(&self.inner.state).record_failure(&device.id, None, e.to_string(), base);
                }
            }
        }
        delivered
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    /// Apply a record received from `from`. Idempotent.
    pub async fn apply_incoming(&self, from: &str, record: SyncRecord) -> ApplyOutcome {
        let (outcome, rebroadcast) = self.apply_record(from, record);
        if let Some(winner) = rebroadcast {
            self.fan_out(winner).await;
        }
        outcome
    }

    fn apply_record(&self, from: &str, record: SyncRecord) -> (ApplyOutcome, Option<SyncRecord>) {
        let kind = record.kind;
        if !record.verify() {
            warn!(device = %from, kind = %kind, version = record.version, "checksum mismatch, record rejected");
            lock(&self.inner.state).record_fatal(
                from,
                Some(kind),
                format!("checksum mismatch on {kind} v{}", record.version),
            );
            return (ApplyOutcome::Rejected, None);
        }

        loop {
            let local = {
                let mut st = lock(&self.inner.state);
                st.confirm_peer(from, kind, record.version);
                let current = st.version(kind);
                if record.version < current {
                    debug!(device = %from, kind = %kind, version = record.version, current, "stale record discarded");
                    return (ApplyOutcome::Stale, None);
                }
                let existing = st
                    .authoritative(kind)
                    .filter(|r| r.version == record.version)
                    .cloned();
                match existing {
                    Some(local) if local.checksum == record.checksum => {
                        debug!(device = %from, kind = %kind, version = record.version, "duplicate record discarded");
                        return (ApplyOutcome::Duplicate, None);
                    }
                    Some(local) => local,
                    None => {
                        let held = st.conflict_for(kind).map(|(id, c)| (id, c.version));
                        if let Some((id, version)) = held {
                            if record.version > version {
                                st.resolve_error(id);
                                info!(kind = %kind, version = record.version, "newer version supersedes held conflict");
                            }
                        }
                        st.adopt(record.clone());
                        drop(st);
                        info!(device = %from, kind = %kind, version = record.version, "accepted");
                        self.notify(&record);
                        return (ApplyOutcome::Accepted, None);
                    }
                }
            };

            let (local_prio, remote_prio) = {
                let reg = lock(&self.inner.registry);
                (reg.priority_of(&local.origin), reg.priority_of(&record.origin))
            };
            let priority = |id: &str| {
                if id == local.origin {
                    local_prio
                } else if id == record.origin {
                    remote_prio
                } else {
                    0
                }
            };
            let resolution = lock(&self.inner.resolver).resolve(&local, &record, &priority);

            let mut st = lock(&self.inner.state);
            let unchanged = st
                .authoritative(kind)
                .is_some_and(|r| r.version == local.version && r.checksum == local.checksum);
            if !unchanged {
                // our record moved while resolving; classify again
                continue;
            }

            return match resolution {
                Resolution::Winner(winner) => {
                    let kept_local = winner.checksum == local.checksum;
                    if !kept_local {
                        st.adopt(winner.clone());
                        st.unconfirm(None, kind, winner.version);
                    } else if winner.checksum != record.checksum {
                        st.unconfirm(Some(from), kind, winner.version);
                    }
                    drop(st);
                    info!(
                        device = %from,
                        kind = %kind,
                        version = winner.version,
                        winner = %winner.origin,
                        kept_local,
                        "conflict resolved"
                    );
                    if !kept_local {
                        self.notify(&winner);
                    }
                    (ApplyOutcome::Resolved { kept_local }, Some(winner))
                }
                Resolution::Deferred(info) => {
                    let error_id = st.record_conflict(info);
                    drop(st);
                    warn!(device = %from, kind = %kind, version = record.version, error_id, "conflict held for manual resolution");
                    self.emit(SyncEvent::ConflictHeld { kind, error_id });
                    (ApplyOutcome::Deferred, None)
                }
            };
        }
    }

    /// Settle a held conflict. The chosen value is written as a new version
    /// and broadcast; the kind resumes syncing.
    pub fn submit_resolution(
        &self,
        kind: DataKind,
        choice: ManualChoice,
    ) -> CommsyncResult<SyncRecord> {
        let record = {
            let mut st = lock(&self.inner.state);
            let (id, info) = st
                .conflict_for(kind)
                .map(|(id, c)| (id, c.clone()))
                .ok_or_else(|| CommsyncError::NotFound(format!("no held conflict for {kind}")))?;
            let payload = match choice {
                // local writes made while paused count as the local side
                ManualChoice::KeepLocal => st
                    .authoritative(kind)
                    .filter(|r| r.version >= info.local.version)
                    .map_or(info.local.payload, |r| r.payload.clone()),
                ManualChoice::KeepRemote => info.remote.payload,
                ManualChoice::Replace(payload) => payload,
            };
            let version = st.version(kind).max(info.version) + 1;
            let record = SyncRecord::new(kind, version, payload, &self.inner.local_id);
            st.adopt(record.clone());
            st.enqueue(record.clone());
            st.resolve_error(id);
            record
        };
        info!(kind = %kind, version = record.version, "manual resolution applied");
        self.notify(&record);
        if self.can_send_now(kind) {
            self.spawn_fan_out(record.clone());
        }
        Ok(record)
    }

    // ── Passes and retries ───────────────────────────────────────────────────

    /// Bring every online device up to date. A call while a pass is running
    /// (or while this device is not online) does nothing.
    pub async fn run_sync_pass(&self) -> SyncPassReport {
        if !self.local_online() {
            debug!("local device not online; sync pass skipped");
            return SyncPassReport::skipped();
        }
        {
            let mut st = lock(&self.inner.state);
            if st.sync_in_progress {
                debug!("sync pass already running");
                return SyncPassReport::skipped();
            }
            st.sync_in_progress = true;
        }

        let targets = lock(&self.inner.registry).list_online(true);
        let mut report = SyncPassReport {
            devices: targets.len(),
            ..SyncPassReport::default()
        };

        for device in &targets {
            let reachable = lock(&self.inner.registry)
                .get(&device.id)
                .is_some_and(|d| d.status.is_reachable());
            if !reachable {
                let base = self.retry_base_ms();
                lock(&self.inner.state).record_failure(&device.id, None, "device unreachable", base);
                report.failed.push(device.id.clone());
                continue;
            }

            if let Err(e) = lock(&self.inner.registry).mark_status(&device.id, DeviceStatus::Syncing) {
                debug!(device = %device.id, "not marked syncing: {e}");
            }
            match self.sync_device(&device.id).await {
                Ok(n) => report.records_sent += n,
                Err(_) => report.failed.push(device.id.clone()),
            }
            let still_syncing = lock(&self.inner.registry)
                .get(&device.id)
                .is_some_and(|d| d.status == DeviceStatus::Syncing);
            if still_syncing {
                if let Err(e) = lock(&self.inner.registry).mark_status(&device.id, DeviceStatus::Online) {
                    debug!(device = %device.id, "not marked online: {e}");
                }
            }
        }

        let ids: Vec<String> = targets.into_iter().map(|d| d.id).collect();
        {
            let mut st = lock(&self.inner.state);
            st.prune_pending(&ids);
            st.sync_in_progress = false;
            if report.failed.is_empty() {
                st.last_full_sync = Some(Utc::now());
            }
        }
        info!(
            devices = report.devices,
            sent = report.records_sent,
            failed = report.failed.len(),
            "sync pass complete"
        );
        self.emit(SyncEvent::PassCompleted(report.clone()));
        report
    }

    /// Retry devices whose backoff has elapsed. Returns how many recovered.
    pub async fn run_due_retries(&self) -> usize {
        let due = lock(&self.inner.state).due_retries(Utc::now());
        let mut recovered = 0;
        for device in due {
            match self.sync_device(&device).await {
                Ok(_) => {
                    info!(device = %device, "retry succeeded");
                    recovered += 1;
                }
                Err(e) => {
                    let (base, max) = {
                        let s = lock(&self.inner.settings);
                        (s.retry_base_ms, s.max_retries)
                    };
                    let exhausted =
                        lock(&self.inner.state).retry_failed(&device, Utc::now(), base, max);
                    if exhausted {
                        error!(device = %device, retries = max, "giving up on delivery: {e}");
                    } else {
                        debug!(device = %device, "retry failed: {e}");
                    }
                }
            }
        }
        recovered
    }

    // ── Device status ────────────────────────────────────────────────────────

    /// Change a device's status and apply the side effects of going
    /// unreachable (abandon in-flight sends) or coming back (catch up).
    pub fn mark_status(
        &self,
        device_id: &str,
        status: DeviceStatus,
    ) -> CommsyncResult<Option<StatusChange>> {
        let change = lock(&self.inner.registry).mark_status(device_id, status)?;
        if let Some(change) = change {
            self.status_changed(device_id, change);
        }
        Ok(change)
    }

    /// A message arrived from `device_id`: refresh it, waking it if needed.
    pub fn touch(&self, device_id: &str) -> Option<StatusChange> {
        let change = lock(&self.inner.registry).touch(device_id, Utc::now());
        if let Some(change) = change {
            self.status_changed(device_id, change);
        }
        change
    }

    /// Demote devices silent longer than the configured window.
    pub fn demote_silent(&self) -> Vec<String> {
        let window = chrono::Duration::milliseconds(
            i64::try_from(lock(&self.inner.settings).silence_window_ms).unwrap_or(i64::MAX),
        );
        let demoted = lock(&self.inner.registry).demote_silent(Utc::now(), window);
        for (id, change) in &demoted {
            self.status_changed(id, *change);
        }
        demoted.into_iter().map(|(id, _)| id).collect()
    }

    fn status_changed(&self, device_id: &str, change: StatusChange) {
        info!(device = %device_id, from = %change.from, to = %change.to, "device status changed");
        if device_id != self.inner.local_id {
            if !change.to.is_reachable() {
                self.went_unreachable(device_id);
            } else if change.came_online() {
                self.spawn_catch_up(device_id);
            }
        }
        self.emit(SyncEvent::StatusChanged {
            device: device_id.to_string(),
            change,
        });
    }

    fn went_unreachable(&self, device_id: &str) {
        let base = self.retry_base_ms();
        let mut st = lock(&self.inner.state);
        if st.abandon_send(device_id) {
            warn!(device = %device_id, "device went away mid-sync");
            st.record_failure(device_id, None, "device unreachable", base);
        }
    }

    fn spawn_catch_up(&self, device_id: &str) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let engine = self.clone();
        let device_id = device_id.to_string();
        handle.spawn(async move {
            if let Err(e) = engine.sync_device(&device_id).await {
                debug!(device = %device_id, "catch-up failed: {e}");
            }
        });
    }

    // ── Introspection ────────────────────────────────────────────────────────

    pub fn status(&self) -> SyncStatus {
        let connected_devices = lock(&self.inner.registry).list_online(false).len();
        let st = lock(&self.inner.state);
        SyncStatus {
            active: st.sync_in_progress,
            last_sync: st.last_full_sync,
            connected_devices,
            pending_changes: st.pending().len(),
            unresolved_errors: st.errors().iter().filter(|e| !e.resolved).count(),
            paused_kinds: st.paused_kinds(),
        }
    }

    pub fn version(&self, kind: DataKind) -> u64 {
        lock(&self.inner.state).version(kind)
    }

    /// Current authoritative record of `kind`.
    pub fn current(&self, kind: DataKind) -> Option<SyncRecord> {
        lock(&self.inner.state).authoritative(kind).cloned()
    }

    pub fn unresolved_errors(&self) -> Vec<SyncError> {
        lock(&self.inner.state).unresolved()
    }

    pub fn acknowledge_error(&self, id: u64) -> bool {
        lock(&self.inner.state).resolve_error(id)
    }

    pub fn reset(&self) {
        lock(&self.inner.state).reset();
        info!("sync state reset");
    }

    // ── Persistence ──────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> PersistedState {
        let devices = lock(&self.inner.registry)
            .devices()
            .filter(|d| !d.is_local)
            .cloned()
            .collect();
        let st = lock(&self.inner.state);
        PersistedState {
            devices,
            versions: st.versions().clone(),
            records: st.records().cloned().collect(),
        }
    }

    /// Load a snapshot: versions only move forward, remote devices come back
    /// offline until heard from.
    pub fn restore(&self, persisted: PersistedState) {
        {
            let mut reg = lock(&self.inner.registry);
            for device in persisted.devices {
                if device.is_local || device.id == self.inner.local_id {
                    continue;
                }
                let device = device.with_status(DeviceStatus::Offline);
                if let Err(e) = reg.register(device) {
                    warn!("skipping persisted device: {e}");
                }
            }
        }
        let mut st = lock(&self.inner.state);
        for (kind, version) in persisted.versions {
            st.observe_version(kind, version);
        }
        for record in persisted.records {
            let newer = st
                .authoritative(record.kind)
                .map_or(true, |r| record.version > r.version);
            if record.verify() && newer && record.version >= st.version(record.kind) {
                st.adopt(record);
            }
        }
    }
}
