use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::types::{Capabilities, ConflictPolicy, DeviceClass};

/// Top-level configuration (loaded from commsync.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommsyncConfig {
    pub daemon: DaemonConfig,
    pub device: DeviceConfig,
    pub sync: SyncConfig,
    pub transport: TransportConfig,
}

impl CommsyncConfig {
    /// Parse a TOML document, filling omitted fields with defaults.
    pub fn from_toml(content: &str) -> Result<Self, crate::CommsyncError> {
        toml::from_str(content).map_err(|e| crate::CommsyncError::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Prometheus metrics + health endpoint (default: 127.0.0.1:9464)
    pub metrics_addr: Option<String>,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

/// Identity of the device this process runs on
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Stable device identifier (generated on first run when absent)
    pub id: Option<String>,
    /// Display name (defaults to $HOSTNAME)
    pub name: Option<String>,
    pub class: DeviceClass,
    /// Free-form platform tag, e.g. "ios", "android", "linux"
    pub platform: String,
    pub sync_priority: i32,
    pub capabilities: Capabilities,
}

impl DeviceConfig {
    pub fn resolved_name(&self) -> String {
        self.name.clone().unwrap_or_else(default_device_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Send published changes immediately and run periodic sync passes
    pub auto_sync: bool,
    /// Auto-sync tick interval
    pub sync_interval_ms: u64,
    /// Retry limit for failed sends
    pub max_retries: u32,
    /// Backoff unit: the n-th retry waits `retry_base_ms * n`
    pub retry_base_ms: u64,
    pub conflict_policy: ConflictPolicy,
    /// Remote devices silent for longer than this are demoted to offline
    pub silence_window_ms: u64,
    /// Bound on a single connection handshake
    pub connect_timeout_ms: u64,
    /// Bound on waiting for a handoff confirmation
    pub handoff_timeout_ms: u64,
    /// JSON file holding the device list and version table
    pub state_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// NATS server used for signaling and message delivery
    pub nats_url: String,
    /// Subject prefix shared by all devices of one user
    pub subject_prefix: String,
    /// How long discovery collects announcements
    pub discovery_window_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            metrics_addr: Some("127.0.0.1:9464".into()),
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: None,
            name: None,
            class: DeviceClass::Computer,
            platform: std::env::consts::OS.into(),
            sync_priority: 0,
            capabilities: Capabilities {
                has_screen: true,
                ..Capabilities::default()
            },
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_sync: true,
            sync_interval_ms: 30_000,
            max_retries: 3,
            retry_base_ms: 5_000,
            conflict_policy: ConflictPolicy::LastWriteWins,
            silence_window_ms: 90_000,
            connect_timeout_ms: 5_000,
            handoff_timeout_ms: 10_000,
            state_path: PathBuf::from("~/.local/share/commsync/state.json"),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            nats_url: "nats://localhost:4222".into(),
            subject_prefix: "commsync".into(),
            discovery_window_ms: 1_500,
        }
    }
}

/// Expand a leading `~/` using `$HOME`
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

/// Get the default hostname for device naming
pub fn default_device_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown-device".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[daemon]
metrics_addr = "0.0.0.0:9500"
log_level = "debug"
log_format = "json"

[device]
id = "tablet-1"
name = "kitchen tablet"
class = "tablet"
platform = "android"
sync_priority = 5

[device.capabilities]
has_screen = true
has_touch = true
has_eye_tracking = true

[sync]
auto_sync = false
sync_interval_ms = 1000
max_retries = 7
conflict_policy = "manual"
handoff_timeout_ms = 2500

[transport]
nats_url = "tls://nats.example.com:4222"
subject_prefix = "user-42"
"#;
        let config = CommsyncConfig::from_toml(toml_str).unwrap();

        assert_eq!(config.daemon.metrics_addr.as_deref(), Some("0.0.0.0:9500"));
        assert_eq!(config.daemon.log_format, "json");
        assert_eq!(config.device.id.as_deref(), Some("tablet-1"));
        assert_eq!(config.device.class, DeviceClass::Tablet);
        assert_eq!(config.device.sync_priority, 5);
        assert!(config.device.capabilities.has_eye_tracking);
        assert!(!config.device.capabilities.has_haptics);
        assert!(!config.sync.auto_sync);
        assert_eq!(config.sync.max_retries, 7);
        assert_eq!(config.sync.conflict_policy, ConflictPolicy::Manual);
        assert_eq!(config.sync.handoff_timeout_ms, 2500);
        // untouched field keeps its default
        assert_eq!(config.sync.retry_base_ms, 5_000);
        assert_eq!(config.transport.subject_prefix, "user-42");
    }

    #[test]
    fn test_parse_defaults() {
        let config = CommsyncConfig::from_toml("").unwrap();

        assert_eq!(config.daemon.log_level, "info");
        assert!(config.sync.auto_sync);
        assert_eq!(config.sync.sync_interval_ms, 30_000);
        assert_eq!(config.sync.max_retries, 3);
        assert_eq!(config.sync.conflict_policy, ConflictPolicy::LastWriteWins);
        assert_eq!(config.transport.nats_url, "nats://localhost:4222");
        assert!(config.device.capabilities.has_screen);
    }

    #[test]
    fn test_expand_home() {
        let p = expand_home(Path::new("/var/lib/commsync/state.json"));
        assert_eq!(p, PathBuf::from("/var/lib/commsync/state.json"));
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(
                expand_home(Path::new("~/state.json")),
                PathBuf::from(home).join("state.json")
            );
        }
    }

    #[test]
    fn test_invalid_policy_is_config_error() {
        let err = CommsyncConfig::from_toml("[sync]\nconflict_policy = \"coin_flip\"\n").unwrap_err();
        assert!(matches!(err, crate::CommsyncError::Config(_)));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = CommsyncConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed = CommsyncConfig::from_toml(&toml_str).unwrap();

        assert_eq!(config.sync.state_path, parsed.sync.state_path);
        assert_eq!(config.transport.nats_url, parsed.transport.nats_url);
        assert_eq!(config.device.class, parsed.device.class);
    }
}
