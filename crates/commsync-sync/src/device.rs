//! Device registry: every endpoint in the user's ecosystem, its capabilities,
//! connectivity status and sync priority.
//!
//! Exactly one entry carries `is_local`; it is fixed at construction and can
//! never be removed or overwritten by a remote announcement.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use commsync_core::types::{Capabilities, DeviceClass, DeviceStatus};
use commsync_core::{CommsyncError, CommsyncResult};

/// A known device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    /// Human-readable name (e.g., "kitchen tablet")
    pub name: String,
    pub class: DeviceClass,
    /// Platform tag, e.g. "ios" or "linux"
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub capabilities: Capabilities,
    pub status: DeviceStatus,
    pub last_seen: DateTime<Utc>,
    /// Higher is preferred for handoff targets and conflict tie-breaks
    #[serde(default)]
    pub sync_priority: i32,
    #[serde(default)]
    pub is_local: bool,
}

impl Device {
    /// A remote device as first learned about, online as of now.
    pub fn new(id: impl Into<String>, name: impl Into<String>, class: DeviceClass) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            class,
            platform: String::new(),
            capabilities: Capabilities::default(),
            status: DeviceStatus::Online,
            last_seen: Utc::now(),
            sync_priority: 0,
            is_local: false,
        }
    }

    pub fn local(id: impl Into<String>, name: impl Into<String>, class: DeviceClass) -> Self {
        Self {
            is_local: true,
            ..Self::new(id, name, class)
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.sync_priority = priority;
        self
    }

    pub fn with_status(mut self, status: DeviceStatus) -> Self {
        self.status = status;
        self
    }
}

/// Emitted by [`DeviceRegistry::register`] so callers can broadcast it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    DeviceAdded(Device),
    DeviceUpdated(Device),
}

impl RegistryEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            RegistryEvent::DeviceAdded(_) => "device_added",
            RegistryEvent::DeviceUpdated(_) => "device_updated",
        }
    }

    pub fn device(&self) -> &Device {
        match self {
            RegistryEvent::DeviceAdded(d) | RegistryEvent::DeviceUpdated(d) => d,
        }
    }
}

/// A status change that actually happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub from: DeviceStatus,
    pub to: DeviceStatus,
}

impl StatusChange {
    pub fn went_offline(&self) -> bool {
        self.to == DeviceStatus::Offline
    }

    pub fn came_online(&self) -> bool {
        !self.from.is_reachable() && self.to.is_reachable()
    }
}

/// `syncing` may only be entered from `online`; every other move between
/// online, sleeping and offline is allowed.
pub fn can_transition(from: DeviceStatus, to: DeviceStatus) -> bool {
    match to {
        DeviceStatus::Syncing => matches!(from, DeviceStatus::Online | DeviceStatus::Syncing),
        _ => true,
    }
}

/// Registry shared between the sync engine and the handoff coordinator
pub type SharedRegistry = Arc<Mutex<DeviceRegistry>>;

/// Registry of all devices known to this process
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, Device>,
    local_id: String,
}

impl DeviceRegistry {
    pub fn new(mut local: Device) -> Self {
        local.is_local = true;
        let local_id = local.id.clone();
        let mut devices = BTreeMap::new();
        devices.insert(local_id.clone(), local);
        Self { devices, local_id }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn local(&self) -> CommsyncResult<&Device> {
        self.devices
            .get(&self.local_id)
            .ok_or_else(|| CommsyncError::NotFound("local device".into()))
    }

    pub fn get(&self, device_id: &str) -> Option<&Device> {
        self.devices.get(device_id)
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Insert or update a device by id.
    ///
    /// A second device flagged `is_local` is rejected, as is any attempt to
    /// overwrite the local entry with a non-local one.
    pub fn register(&mut self, device: Device) -> CommsyncResult<RegistryEvent> {
        if device.id == self.local_id {
            if !device.is_local {
                return Err(CommsyncError::LocalDeviceImmutable(device.id));
            }
        } else if device.is_local {
            return Err(CommsyncError::DuplicateLocalDevice {
                existing: self.local_id.clone(),
                attempted: device.id,
            });
        }

        let event = if self.devices.contains_key(&device.id) {
            debug!(device = %device.id, status = %device.status, "device updated");
            RegistryEvent::DeviceUpdated(device.clone())
        } else {
            info!(device = %device.id, name = %device.name, class = ?device.class, "device added");
            RegistryEvent::DeviceAdded(device.clone())
        };
        self.devices.insert(device.id.clone(), device);
        Ok(event)
    }

    /// Remove a remote device entirely.
    pub fn remove(&mut self, device_id: &str) -> CommsyncResult<Device> {
        if device_id == self.local_id {
            return Err(CommsyncError::LocalDeviceImmutable(device_id.to_string()));
        }
        self.devices
            .remove(device_id)
            .ok_or_else(|| CommsyncError::UnknownDevice(device_id.to_string()))
    }

    /// Reachable remote devices, optionally ordered by descending priority
    /// with most-recently-seen first among equals.
    pub fn list_online(&self, priority_order: bool) -> Vec<Device> {
        let mut online: Vec<Device> = self
            .devices
            .values()
            .filter(|d| !d.is_local && d.status.is_reachable())
            .cloned()
            .collect();
        if priority_order {
            online.sort_by(|a, b| {
                b.sync_priority
                    .cmp(&a.sync_priority)
                    .then(b.last_seen.cmp(&a.last_seen))
                    .then(a.id.cmp(&b.id))
            });
        }
        online
    }

    /// Transition a device's status. Returns `None` when nothing changed.
    pub fn mark_status(
        &mut self,
        device_id: &str,
        status: DeviceStatus,
    ) -> CommsyncResult<Option<StatusChange>> {
        let device = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| CommsyncError::UnknownDevice(device_id.to_string()))?;

        let from = device.status;
        if from == status {
            return Ok(None);
        }
        if !can_transition(from, status) {
            return Err(CommsyncError::InvalidTransition {
                device: device_id.to_string(),
                from,
                to: status,
            });
        }
        device.status = status;
        if status.is_reachable() {
            device.last_seen = Utc::now();
        }
        debug!(device = %device_id, %from, to = %status, "status transition");
        Ok(Some(StatusChange { from, to: status }))
    }

    /// Record a heartbeat: refresh `last_seen` and wake the device if it was
    /// sleeping or offline.
    pub fn touch(&mut self, device_id: &str, now: DateTime<Utc>) -> Option<StatusChange> {
        let device = self.devices.get_mut(device_id)?;
        device.last_seen = device.last_seen.max(now);
        if device.status.is_reachable() {
            return None;
        }
        let from = device.status;
        device.status = DeviceStatus::Online;
        Some(StatusChange {
            from,
            to: DeviceStatus::Online,
        })
    }

    /// Demote remote devices not heard from within `window` to offline.
    pub fn demote_silent(
        &mut self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Vec<(String, StatusChange)> {
        let mut demoted = Vec::new();
        for device in self.devices.values_mut() {
            if device.is_local || device.status == DeviceStatus::Offline {
                continue;
            }
            if now - device.last_seen > window {
                info!(device = %device.id, last_seen = %device.last_seen, "silent too long, marking offline");
                let change = StatusChange {
                    from: device.status,
                    to: DeviceStatus::Offline,
                };
                device.status = DeviceStatus::Offline;
                demoted.push((device.id.clone(), change));
            }
        }
        demoted
    }

    pub fn priority_of(&self, device_id: &str) -> i32 {
        self.devices
            .get(device_id)
            .map(|d| d.sync_priority)
            .unwrap_or(0)
    }

    pub fn max_priority(&self) -> i32 {
        self.devices
            .values()
            .map(|d| d.sync_priority)
            .max()
            .unwrap_or(0)
    }

    pub fn set_priority(&mut self, device_id: &str, priority: i32) -> CommsyncResult<()> {
        let device = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| CommsyncError::UnknownDevice(device_id.to_string()))?;
        device.sync_priority = priority;
        Ok(())
    }

    /// Make `target` the preferred device and step `source` down.
    ///
    /// Target ends strictly above every other device; source drops by one.
    pub fn promote(&mut self, target: &str, source: &str) -> CommsyncResult<()> {
        if !self.contains(target) {
            return Err(CommsyncError::UnknownDevice(target.to_string()));
        }
        if !self.contains(source) {
            return Err(CommsyncError::UnknownDevice(source.to_string()));
        }
        let top = self
            .devices
            .values()
            .filter(|d| d.id != target)
            .map(|d| d.sync_priority)
            .max()
            .unwrap_or(0);
        let source_priority = self.priority_of(source).saturating_sub(1);
        self.set_priority(source, source_priority)?;
        let target_priority = self.priority_of(target).max(top.saturating_add(1));
        self.set_priority(target, target_priority)?;
        info!(
            to = %target,
            to_priority = target_priority,
            from = %source,
            from_priority = source_priority,
            "sync priority handed over"
        );
        Ok(())
    }
}
