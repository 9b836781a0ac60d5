//! Daemon lifecycle: device identity, NATS transport, sync context, metrics,
//! signal-driven shutdown

use anyhow::{Context, Result};
use prometheus_client::registry::Registry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use commsync_core::config::{expand_home, CommsyncConfig};
use commsync_sync::{Device, NatsOptions, NatsTransport, RegistryEvent, SyncContext, SyncEvent};

use crate::metrics::{HealthState, SyncMetrics};

pub async fn run(config: CommsyncConfig) -> Result<()> {
    info!("daemon starting");

    // ── Device identity ──────────────────────────────────────────────────
    let state_path = expand_home(&config.sync.state_path);
    let local = local_device(&config, &id_path(&state_path))?;
    info!(
        device = %local.id,
        name = %local.name,
        class = ?local.class,
        priority = local.sync_priority,
        "device identity ready"
    );

    // ── Transport + sync context ─────────────────────────────────────────
    let transport =
        Arc::new(NatsTransport::connect(NatsOptions::from(&config), local.clone()).await?);
    let ctx = SyncContext::builder(local, transport.clone())
        .config(&config)
        .build()
        .context("building sync context")?;
    spawn_announcement_feed(&ctx, transport);
    ctx.start();

    let found = ctx.discover_peers().await;
    info!(peers = found, policy = ?config.sync.conflict_policy, "fleet discovery done");

    // ── Metrics ──────────────────────────────────────────────────────────
    let metrics = SyncMetrics::default();
    let mut registry = Registry::default();
    metrics.register(&mut registry);
    metrics.refresh(&ctx.get_sync_status());
    spawn_metrics_feed(&ctx, metrics);

    if let Some(addr) = config.daemon.metrics_addr.clone() {
        let state = HealthState {
            registry: Arc::new(registry),
            ctx: ctx.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = crate::metrics::serve(addr, state).await {
                error!("metrics server failed: {e}");
            }
        });
    }

    notify_ready();

    shutdown_signal().await;
    info!("shutdown requested");
    ctx.shutdown().context("flushing sync state")?;
    Ok(())
}

/// The device id lives next to the state file; generated once on first run
/// unless the config pins one.
fn id_path(state_path: &Path) -> PathBuf {
    state_path.with_file_name("device-id")
}

fn local_device(config: &CommsyncConfig, id_path: &Path) -> Result<Device> {
    let dev = &config.device;
    let id = match &dev.id {
        Some(id) => id.clone(),
        None => load_or_create_id(id_path)?,
    };
    let mut device =
        Device::local(id, dev.resolved_name(), dev.class).with_priority(dev.sync_priority);
    device.platform = dev.platform.clone();
    device.capabilities = dev.capabilities;
    Ok(device)
}

fn load_or_create_id(path: &Path) -> Result<String> {
    if let Ok(existing) = std::fs::read_to_string(path) {
        let existing = existing.trim();
        if !existing.is_empty() {
            return Ok(existing.to_string());
        }
    }
    let id = uuid::Uuid::new_v4().to_string();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(path, &id).with_context(|| format!("writing {}", path.display()))?;
    info!(id = %id, path = %path.display(), "device auto-enrolled");
    Ok(id)
}

fn spawn_metrics_feed(ctx: &SyncContext, metrics: SyncMetrics) {
    let mut events = ctx.subscribe();
    let ctx = ctx.clone();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => metrics.observe(&event),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "metrics feed lagged"),
                Err(RecvError::Closed) => break,
            }
            metrics.refresh(&ctx.get_sync_status());
        }
    });
}

/// Whether `event` changed what this device advertises about itself.
fn changes_local_entry(event: &SyncEvent, local_id: &str) -> bool {
    match event {
        SyncEvent::Device(RegistryEvent::DeviceUpdated(device)) => device.id == local_id,
        SyncEvent::StatusChanged { device, .. } => device == local_id,
        _ => false,
    }
}

/// Keep discovery replies in step with the local registry entry.
fn spawn_announcement_feed(ctx: &SyncContext, transport: Arc<NatsTransport>) {
    let mut events = ctx.subscribe();
    let ctx = ctx.clone();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if changes_local_entry(&event, ctx.local_id()) => {
                    if let Some(me) = ctx.device(ctx.local_id()) {
                        debug!(priority = me.sync_priority, status = ?me.status, "announcement updated");
                        transport.set_announcement(me);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => {
                    warn!(skipped = n, "announcement feed lagged");
                    if let Some(me) = ctx.device(ctx.local_id()) {
                        transport.set_announcement(me);
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("ctrl-c handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn notify_ready() {
    // sd_notify(READY=1) when running under systemd; no-op without $NOTIFY_SOCKET
    #[cfg(unix)]
    if let Ok(socket) = std::env::var("NOTIFY_SOCKET") {
        use std::os::unix::net::UnixDatagram;
        if let Ok(sock) = UnixDatagram::unbound() {
            let _ = sock.send_to(b"READY=1\n", &socket);
            debug!(notify_socket = %socket, "sent systemd READY=1");
        }
    }
}
