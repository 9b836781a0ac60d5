//! Host lifecycle signals (app foreground/background, network up/down)
//! mapped onto the local device's status.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use commsync_core::types::DeviceStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleSignal {
    Foreground,
    Background,
    NetworkUp,
    NetworkDown,
}

impl LifecycleSignal {
    /// Status the local device takes on this signal.
    pub fn status(&self) -> DeviceStatus {
        match self {
            LifecycleSignal::Foreground | LifecycleSignal::NetworkUp => DeviceStatus::Online,
            LifecycleSignal::Background => DeviceStatus::Sleeping,
            LifecycleSignal::NetworkDown => DeviceStatus::Offline,
        }
    }

    /// Regaining the network re-announces and syncs right away.
    pub fn triggers_sync(&self) -> bool {
        matches!(self, LifecycleSignal::NetworkUp)
    }
}

impl fmt::Display for LifecycleSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleSignal::Foreground => "foreground",
            LifecycleSignal::Background => "background",
            LifecycleSignal::NetworkUp => "network_up",
            LifecycleSignal::NetworkDown => "network_down",
        })
    }
}

impl FromStr for LifecycleSignal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "foreground" => Ok(LifecycleSignal::Foreground),
            "background" => Ok(LifecycleSignal::Background),
            "network_up" => Ok(LifecycleSignal::NetworkUp),
            "network_down" => Ok(LifecycleSignal::NetworkDown),
            other => Err(format!("unknown lifecycle signal: {other}")),
        }
    }
}
