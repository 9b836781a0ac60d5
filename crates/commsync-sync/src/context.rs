//! `SyncContext`: the composition root hosts construct once per process.
//!
//! Owns the registry, engine, handoff coordinator and optional state store,
//! routes inbound transport messages, and drives the auto-sync loop.

use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use commsync_core::config::{expand_home, CommsyncConfig};
use commsync_core::types::{DataKind, DeviceStatus};
use commsync_core::{CommsyncError, CommsyncResult};

use crate::conflict::{ManualChoice, MergeFn};
use crate::device::{Device, DeviceRegistry, RegistryEvent, SharedRegistry};
use crate::engine::{ChangeHandler, SyncEngine, SyncEvent, SyncPassReport, SyncSettings, SyncStatus};
use crate::handoff::{
    AcceptAll, ContextProvider, EmptyContext, HandoffAcceptor, HandoffCoordinator,
    HandoffOutcome, HandoffState,
};
use crate::lifecycle::LifecycleSignal;
use crate::lock;
use crate::protocol::MessageBody;
use crate::record::SyncRecord;
use crate::state::SyncError;
use crate::store::StateStore;
use crate::transport::{Inbound, Transport};

pub struct SyncContextBuilder {
    local: Device,
    transport: Arc<dyn Transport>,
    settings: SyncSettings,
    handoff_timeout: Duration,
    state_path: Option<PathBuf>,
    provider: Arc<dyn ContextProvider>,
    acceptor: Arc<dyn HandoffAcceptor>,
}

impl SyncContextBuilder {
    pub fn settings(mut self, settings: SyncSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn handoff_timeout(mut self, timeout: Duration) -> Self {
        self.handoff_timeout = timeout;
        self
    }

    /// Persist devices and versions to this JSON file.
    pub fn state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }

    pub fn context_provider(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.provider = provider;
        self
    }

    pub fn acceptor(mut self, acceptor: Arc<dyn HandoffAcceptor>) -> Self {
        self.acceptor = acceptor;
        self
    }

    /// Apply the `[sync]` section: settings, handoff timeout, state file.
    pub fn config(self, config: &CommsyncConfig) -> Self {
        let state_path = expand_home(&config.sync.state_path);
        self.settings(SyncSettings::from(&config.sync))
            .handoff_timeout(Duration::from_millis(config.sync.handoff_timeout_ms))
            .state_path(state_path)
    }

    pub fn build(self) -> CommsyncResult<SyncContext> {
        let registry: SharedRegistry = Arc::new(Mutex::new(DeviceRegistry::new(self.local)));
        let engine = SyncEngine::new(registry.clone(), self.transport.clone(), self.settings);
        let handoff = HandoffCoordinator::new(
            registry,
            self.transport.clone(),
            self.handoff_timeout,
            self.provider,
            self.acceptor,
        );

        let store = match self.state_path {
            Some(path) => {
                let store = StateStore::open(&path)?;
                engine.restore(store.state().clone());
                info!(path = %path.display(), "sync state loaded");
                Some(store)
            }
            None => None,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        self.transport.on_message(Arc::new(move |inbound: Inbound| {
            if tx.send(inbound).is_err() {
                debug!("inbound message after shutdown dropped");
            }
        }));
        let (shutdown, _) = watch::channel(false);

        Ok(SyncContext {
            inner: Arc::new(ContextInner {
                engine,
                handoff,
                store: Mutex::new(store),
                inbound: Mutex::new(Some(rx)),
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }
}

struct ContextInner {
    engine: SyncEngine,
    handoff: HandoffCoordinator,
    store: Mutex<Option<StateStore>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct SyncContext {
    inner: Arc<ContextInner>,
}

impl SyncContext {
    pub fn builder(local: Device, transport: Arc<dyn Transport>) -> SyncContextBuilder {
        let mut local = local;
        local.is_local = true;
        SyncContextBuilder {
            local,
            transport,
            settings: SyncSettings::default(),
            handoff_timeout: Duration::from_secs(10),
            state_path: None,
            provider: Arc::new(EmptyContext),
            acceptor: Arc::new(AcceptAll),
        }
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.inner.engine
    }

    pub fn local_id(&self) -> &str {
        self.inner.engine.local_id()
    }

    fn registry(&self) -> &SharedRegistry {
        self.inner.engine.registry()
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Start routing inbound messages and the auto-sync loop. Idempotent.
    pub fn start(&self) {
        let Some(mut rx) = lock(&self.inner.inbound).take() else {
            return;
        };

        let ctx = self.clone();
        let router = tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                ctx.route(inbound).await;
            }
        });

        let ctx = self.clone();
        let mut stop = self.inner.shutdown.subscribe();
        let ticker = tokio::spawn(async move {
            loop {
                let interval = ctx.inner.engine.settings().sync_interval_ms.max(1);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(interval)) => {
                        ctx.tick().await;
                    }
                    _ = stop.changed() => break,
                }
            }
            debug!("auto-sync loop stopped");
        });

        lock(&self.inner.tasks).extend([router, ticker]);
        info!(device = %self.local_id(), "sync context started");
    }

    /// Stop background tasks and flush persisted state.
    pub fn shutdown(&self) -> CommsyncResult<()> {
        let _ = self.inner.shutdown.send(true);
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
        self.persist()?;
        info!(device = %self.local_id(), "sync context stopped");
        Ok(())
    }

    /// One auto-sync step: heartbeat, silence demotion, due retries, sync pass.
    pub async fn tick(&self) -> SyncPassReport {
        let engine = &self.inner.engine;
        if engine.local_online() {
            engine.heartbeat().await;
        }
        engine.demote_silent();

        let report = if engine.settings().auto_sync {
            engine.run_due_retries().await;
            engine.run_sync_pass().await
        } else {
            SyncPassReport::skipped()
        };

        if let Err(e) = self.persist() {
            warn!("persisting sync state: {e}");
        }
        report
    }

    /// Feed a host lifecycle signal into the local device's status.
    pub async fn handle_lifecycle(&self, signal: LifecycleSignal) -> CommsyncResult<()> {
        let engine = &self.inner.engine;
        engine.mark_status(self.local_id(), signal.status())?;
        info!(%signal, "lifecycle signal");

        if signal.triggers_sync() {
            let known: Vec<String> = lock(self.registry())
                .devices()
                .filter(|d| !d.is_local)
                .map(|d| d.id.clone())
                .collect();
            for id in known {
                if let Err(e) = engine.introduce(&id).await {
                    debug!(device = %id, "re-announce failed: {e}");
                }
            }
            engine.run_sync_pass().await;
        }
        Ok(())
    }

    /// Write devices and versions to the state file, if one is configured.
    pub fn persist(&self) -> CommsyncResult<()> {
        let snapshot = self.inner.engine.snapshot();
        if let Some(store) = lock(&self.inner.store).as_mut() {
            store.update(snapshot);
            store.flush()?;
        }
        Ok(())
    }

    // ── Devices ──────────────────────────────────────────────────────────────

    /// Add or update a remote device and introduce ourselves if it is online.
    pub fn register_device(&self, device: Device) -> CommsyncResult<RegistryEvent> {
        let reachable = device.status.is_reachable();
        let device_id = device.id.clone();
        let event = lock(self.registry()).register(device)?;
        self.inner.engine.emit(SyncEvent::Device(event.clone()));

        if reachable && !event.device().is_local {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let engine = self.inner.engine.clone();
                handle.spawn(async move {
                    if let Err(e) = engine.introduce(&device_id).await {
                        debug!(device = %device_id, "introduction failed: {e}");
                    }
                });
            }
        }
        Ok(event)
    }

    /// Mark a device offline and drop its channel.
    pub async fn disconnect_device(&self, device_id: &str) -> CommsyncResult<()> {
        if device_id == self.local_id() {
            return Err(CommsyncError::LocalDeviceImmutable(device_id.to_string()));
        }
        self.inner.engine.mark_status(device_id, DeviceStatus::Offline)?;
        self.inner.engine.transport().disconnect(device_id).await;
        info!(device = %device_id, "device disconnected");
        Ok(())
    }

    /// Online devices, highest sync priority first.
    pub fn get_connected_devices(&self) -> Vec<Device> {
        lock(self.registry()).list_online(true)
    }

    pub fn device(&self, device_id: &str) -> Option<Device> {
        lock(self.registry()).get(device_id).cloned()
    }

    /// Register everything the transport can find and introduce ourselves.
    pub async fn discover_peers(&self) -> usize {
        let found: Vec<Device> = self.inner.engine.transport().discover().collect().await;
        let mut registered = 0;
        for mut device in found {
            if device.id == self.local_id() {
                continue;
            }
            device.is_local = false;
            device.status = DeviceStatus::Online;
            device.last_seen = Utc::now();
            let id = device.id.clone();

            let result = lock(self.registry()).register(device);
            match result {
                Ok(event) => {
                    self.inner.engine.emit(SyncEvent::Device(event));
                    registered += 1;
                    if let Err(e) = self.inner.engine.introduce(&id).await {
                        warn!(device = %id, "introduction failed: {e}");
                    }
                }
                Err(e) => warn!(device = %id, "discovered device rejected: {e}"),
            }
        }
        info!(found = registered, "discovery finished");
        registered
    }

    // ── Data ─────────────────────────────────────────────────────────────────

    pub fn publish(&self, kind: DataKind, payload: Value) -> SyncRecord {
        self.inner.engine.publish(kind, payload)
    }

    pub fn on_data_changed(&self, kind: DataKind, handler: ChangeHandler) {
        self.inner.engine.on_data_changed(kind, handler);
    }

    pub fn register_merge(&self, kind: DataKind, merge: MergeFn) {
        self.inner.engine.register_merge(kind, merge);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.engine.subscribe()
    }

    pub fn current(&self, kind: DataKind) -> Option<SyncRecord> {
        self.inner.engine.current(kind)
    }

    pub fn get_sync_status(&self) -> SyncStatus {
        self.inner.engine.status()
    }

    pub fn sync_settings(&self) -> SyncSettings {
        self.inner.engine.settings()
    }

    pub fn configure_sync_settings(&self, settings: SyncSettings) {
        self.inner.engine.configure(settings);
    }

    pub async fn force_sync_now(&self) -> SyncPassReport {
        self.inner.engine.run_sync_pass().await
    }

    pub fn submit_resolution(
        &self,
        kind: DataKind,
        choice: ManualChoice,
    ) -> CommsyncResult<SyncRecord> {
        self.inner.engine.submit_resolution(kind, choice)
    }

    pub fn unresolved_errors(&self) -> Vec<SyncError> {
        self.inner.engine.unresolved_errors()
    }

    pub fn acknowledge_error(&self, id: u64) -> bool {
        self.inner.engine.acknowledge_error(id)
    }

    pub fn reset(&self) {
        self.inner.engine.reset();
    }

    // ── Handoff ──────────────────────────────────────────────────────────────

    pub async fn initiate_handoff(&self, target: &str) -> CommsyncResult<HandoffOutcome> {
        let outcome = self.inner.handoff.initiate(target).await?;
        if outcome.is_success() {
            self.local_entry_changed();
        }
        self.inner.engine.emit(SyncEvent::Handoff {
            target: target.to_string(),
            outcome: outcome.clone(),
        });
        Ok(outcome)
    }

    /// Our own registry entry changed (priority handover); collaborators
    /// that advertise it need the new copy.
    fn local_entry_changed(&self) {
        let me = lock(self.registry()).local().cloned();
        if let Ok(me) = me {
            self.inner
                .engine
                .emit(SyncEvent::Device(RegistryEvent::DeviceUpdated(me)));
        }
    }

    pub fn handoff_state(&self, target: &str) -> HandoffState {
        self.inner.handoff.state(target)
    }

    pub fn set_handoff_timeout(&self, timeout: Duration) {
        self.inner.handoff.set_timeout(timeout);
    }

    // ── Inbound routing ──────────────────────────────────────────────────────

    async fn route(&self, inbound: Inbound) {
        let Inbound { from, message } = inbound;
        if from == self.local_id() {
            return;
        }
        let engine = &self.inner.engine;
        debug!(from = %from, msg = message.type_name(), "inbound");

        match message.body {
            MessageBody::DeviceUpdate(device) => self.on_announcement(&from, device).await,
            body => {
                if lock(self.registry()).contains(&from) {
                    engine.touch(&from);
                }
                match body {
                    MessageBody::SyncData(record) => {
                        engine.apply_incoming(&from, record).await;
                    }
                    MessageBody::SyncRequest { versions } => {
                        if let Err(e) = engine.answer_sync_request(&from, versions).await {
                            debug!(device = %from, "sync request not answered: {e}");
                        }
                    }
                    MessageBody::UpdateRequest { kinds } => {
                        if let Err(e) = engine.answer_update_request(&from, &kinds).await {
                            debug!(device = %from, "update request not answered: {e}");
                        }
                    }
                    MessageBody::HandoffRequest(request) => {
                        match self.inner.handoff.handle_request(request).await {
                            Ok(true) => self.local_entry_changed(),
                            Ok(false) => {}
                            Err(e) => warn!(device = %from, "handoff request failed: {e}"),
                        }
                    }
                    MessageBody::HandoffConfirm { correlation_id } => {
                        self.inner.handoff.handle_confirm(&from, &correlation_id);
                    }
                    MessageBody::HandoffCancel { correlation_id } => {
                        match self.inner.handoff.handle_cancel(&from, &correlation_id) {
                            Ok(true) => self.local_entry_changed(),
                            Ok(false) => {}
                            Err(e) => warn!(device = %from, "handoff cancel failed: {e}"),
                        }
                    }
                    MessageBody::DeviceUpdate(_) => {}
                }
            }
        }
    }

    /// A peer announced itself: register it online and, if it is new or was
    /// unreachable, introduce ourselves back.
    async fn on_announcement(&self, from: &str, device: Device) {
        if device.id != from {
            warn!(from = %from, announced = %device.id, "announcement for another device ignored");
            return;
        }
        let mut device = device;
        device.is_local = false;
        device.status = DeviceStatus::Online;
        device.last_seen = Utc::now();

        let (was_reachable, result) = {
            let mut reg = lock(self.registry());
            let was_reachable = reg.get(from).map(|d| d.status.is_reachable());
            (was_reachable, reg.register(device))
        };
        let event = match result {
            Ok(event) => event,
            Err(e) => {
                warn!(device = %from, "announcement rejected: {e}");
                return;
            }
        };
        let fresh = was_reachable != Some(true);
        self.inner.engine.emit(SyncEvent::Device(event));

        if fresh {
            info!(device = %from, "device online");
            if let Err(e) = self.inner.engine.introduce(from).await {
                debug!(device = %from, "introduction failed: {e}");
            }
        }
    }
}
