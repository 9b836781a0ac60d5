//! Versioned sync records and their payload checksums.
//!
//! Payloads are opaque JSON. The checksum is the BLAKE3 hex digest of the
//! payload's serialized bytes; `serde_json` maps are key-sorted, so equal
//! values always hash equally regardless of the device that produced them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use commsync_core::types::DataKind;

/// One logical unit of synchronized state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub id: String,
    pub kind: DataKind,
    /// Per-kind counter; only ever increases
    pub version: u64,
    pub payload: Value,
    /// Time of the write that produced this version
    pub timestamp: DateTime<Utc>,
    /// Device that performed the write
    pub origin: String,
    /// BLAKE3 of `payload` (hex)
    pub checksum: String,
}

impl SyncRecord {
    /// Build a record stamped now, with a fresh id and computed checksum.
    pub fn new(kind: DataKind, version: u64, payload: Value, origin: impl Into<String>) -> Self {
        Self::at(kind, version, payload, origin, Utc::now())
    }

    pub fn at(
        kind: DataKind,
        version: u64,
        payload: Value,
        origin: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let checksum = checksum(&payload);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            version,
            payload,
            timestamp,
            origin: origin.into(),
            checksum,
        }
    }

    /// True if the stored checksum matches the payload.
    pub fn verify(&self) -> bool {
        checksum(&self.payload) == self.checksum
    }
}

/// BLAKE3 hex digest of a JSON payload
pub fn checksum(payload: &Value) -> String {
    // Value serialization cannot fail: all keys are strings
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}
