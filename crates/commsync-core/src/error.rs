use thiserror::Error;

use crate::types::DeviceStatus;

pub type CommsyncResult<T> = Result<T, CommsyncError>;

#[derive(Debug, Error)]
pub enum CommsyncError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("a local device is already registered ({existing}); refusing {attempted}")]
    DuplicateLocalDevice { existing: String, attempted: String },

    #[error("the local device cannot be removed or replaced: {0}")]
    LocalDeviceImmutable(String),

    #[error("invalid status transition for {device}: {from} -> {to}")]
    InvalidTransition {
        device: String,
        from: DeviceStatus,
        to: DeviceStatus,
    },

    #[error("handoff already in progress for target {0}")]
    HandoffInProgress(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
