use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Category of synchronized state. Versions are counted per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Vocabulary,
    Settings,
    CommunicationHistory,
    Predictions,
    Emergency,
    Clinical,
}

impl DataKind {
    pub const ALL: [DataKind; 6] = [
        DataKind::Vocabulary,
        DataKind::Settings,
        DataKind::CommunicationHistory,
        DataKind::Predictions,
        DataKind::Emergency,
        DataKind::Clinical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Vocabulary => "vocabulary",
            DataKind::Settings => "settings",
            DataKind::CommunicationHistory => "communication_history",
            DataKind::Predictions => "predictions",
            DataKind::Emergency => "emergency",
            DataKind::Clinical => "clinical",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DataKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown data kind: {s}"))
    }
}

/// Form factor of a device in the user's ecosystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Tablet,
    Phone,
    Wearable,
    SmartSpeaker,
    Computer,
    Tv,
}

/// Connectivity status of a device.
///
/// `Syncing` is a sub-state of `Online`, held only while a sync pass is
/// talking to that device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    Offline,
    Sleeping,
    Syncing,
}

impl DeviceStatus {
    /// Online or syncing.
    pub fn is_reachable(&self) -> bool {
        matches!(self, DeviceStatus::Online | DeviceStatus::Syncing)
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Sleeping => "sleeping",
            DeviceStatus::Syncing => "syncing",
        };
        f.write_str(s)
    }
}

/// Input/output capabilities advertised by a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub has_screen: bool,
    pub has_touch: bool,
    pub has_voice_input: bool,
    pub has_voice_output: bool,
    pub has_eye_tracking: bool,
    pub has_haptics: bool,
}

/// How concurrent writes to the same kind and version are settled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    LastWriteWins,
    Merge,
    Manual,
}
