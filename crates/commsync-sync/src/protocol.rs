//! Peer-to-peer wire messages.
//!
//! Every message is a JSON object:
//!
//! ```text
//! { "type": "sync_data", "from": "<device-id>", "timestamp": "<ISO-8601>", "payload": { ... } }
//! ```

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use commsync_core::types::DataKind;

use crate::device::Device;
use crate::handoff::HandoffRequest;
use crate::record::SyncRecord;

/// Value of the `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    DeviceUpdate,
    SyncData,
    SyncRequest,
    UpdateRequest,
    HandoffRequest,
    HandoffConfirm,
    HandoffCancel,
}

/// Typed message payload
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    /// Announcement or heartbeat carrying the sender's own device entry.
    DeviceUpdate(Device),
    SyncData(SyncRecord),
    /// The sender's version table; the receiver answers with anything newer.
    SyncRequest { versions: BTreeMap<DataKind, u64> },
    /// Ask for the receiver's authoritative records of these kinds.
    UpdateRequest { kinds: Vec<DataKind> },
    HandoffRequest(HandoffRequest),
    HandoffConfirm { correlation_id: String },
    /// The source gave up waiting; a target that already took over rolls back.
    HandoffCancel { correlation_id: String },
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::DeviceUpdate(_) => MessageType::DeviceUpdate,
            MessageBody::SyncData(_) => MessageType::SyncData,
            MessageBody::SyncRequest { .. } => MessageType::SyncRequest,
            MessageBody::UpdateRequest { .. } => MessageType::UpdateRequest,
            MessageBody::HandoffRequest(_) => MessageType::HandoffRequest,
            MessageBody::HandoffConfirm { .. } => MessageType::HandoffConfirm,
            MessageBody::HandoffCancel { .. } => MessageType::HandoffCancel,
        }
    }
}

/// A message exchanged between devices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMessage", into = "RawMessage")]
pub struct WireMessage {
    pub from: String,
    pub timestamp: DateTime<Utc>,
    pub body: MessageBody,
}

impl WireMessage {
    pub fn new(from: impl Into<String>, body: MessageBody) -> Self {
        Self {
            from: from.into(),
            timestamp: Utc::now(),
            body,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    pub fn type_name(&self) -> &'static str {
        match self.message_type() {
            MessageType::DeviceUpdate => "device_update",
            MessageType::SyncData => "sync_data",
            MessageType::SyncRequest => "sync_request",
            MessageType::UpdateRequest => "update_request",
            MessageType::HandoffRequest => "handoff_request",
            MessageType::HandoffConfirm => "handoff_confirm",
            MessageType::HandoffCancel => "handoff_cancel",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| anyhow::anyhow!("serializing WireMessage: {e}"))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| anyhow::anyhow!("deserializing WireMessage: {e}"))
    }
}

#[derive(Serialize, Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: MessageType,
    from: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    payload: Value,
}

#[derive(Serialize, Deserialize)]
struct VersionsPayload {
    versions: BTreeMap<DataKind, u64>,
}

#[derive(Serialize, Deserialize)]
struct KindsPayload {
    kinds: Vec<DataKind>,
}

#[derive(Serialize, Deserialize)]
struct ConfirmPayload {
    correlation_id: String,
}

impl From<WireMessage> for RawMessage {
    fn from(msg: WireMessage) -> Self {
        let kind = msg.message_type();
        let payload = match msg.body {
            MessageBody::DeviceUpdate(device) => serde_json::to_value(device),
            MessageBody::SyncData(record) => serde_json::to_value(record),
            MessageBody::SyncRequest { versions } => {
                serde_json::to_value(VersionsPayload { versions })
            }
            MessageBody::UpdateRequest { kinds } => serde_json::to_value(KindsPayload { kinds }),
            MessageBody::HandoffRequest(req) => serde_json::to_value(req),
            MessageBody::HandoffConfirm { correlation_id }
            | MessageBody::HandoffCancel { correlation_id } => {
                serde_json::to_value(ConfirmPayload { correlation_id })
            }
        }
        .unwrap_or(Value::Null);

        RawMessage {
            kind,
            from: msg.from,
            timestamp: msg.timestamp,
            payload,
        }
    }
}

impl TryFrom<RawMessage> for WireMessage {
    type Error = String;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        fn decode<T: serde::de::DeserializeOwned>(v: Value, what: &str) -> Result<T, String> {
            serde_json::from_value(v).map_err(|e| format!("invalid {what} payload: {e}"))
        }

        let body = match raw.kind {
            MessageType::DeviceUpdate => {
                MessageBody::DeviceUpdate(decode(raw.payload, "device_update")?)
            }
            MessageType::SyncData => MessageBody::SyncData(decode(raw.payload, "sync_data")?),
            MessageType::SyncRequest => {
                let p: VersionsPayload = decode(raw.payload, "sync_request")?;
                MessageBody::SyncRequest {
                    versions: p.versions,
                }
            }
            MessageType::UpdateRequest => {
                let p: KindsPayload = decode(raw.payload, "update_request")?;
                MessageBody::UpdateRequest { kinds: p.kinds }
            }
            MessageType::HandoffRequest => {
                MessageBody::HandoffRequest(decode(raw.payload, "handoff_request")?)
            }
            MessageType::HandoffConfirm => {
                let p: ConfirmPayload = decode(raw.payload, "handoff_confirm")?;
                MessageBody::HandoffConfirm {
                    correlation_id: p.correlation_id,
                }
            }
            MessageType::HandoffCancel => {
                let p: ConfirmPayload = decode(raw.payload, "handoff_cancel")?;
                MessageBody::HandoffCancel {
                    correlation_id: p.correlation_id,
                }
            }
        };

        Ok(WireMessage {
            from: raw.from,
            timestamp: raw.timestamp,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commsync_core::types::DeviceClass;
    use serde_json::json;

    #[test]
    fn sync_data_envelope_shape() {
        let record = SyncRecord::new(DataKind::Settings, 1, json!({"volume": 5}), "tablet");
        let msg = WireMessage::new("tablet", MessageBody::SyncData(record.clone()));
        let v: Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();

        assert_eq!(v["type"], "sync_data");
        assert_eq!(v["from"], "tablet");
        assert!(v["timestamp"].as_str().unwrap().contains('T'));
        assert_eq!(v["payload"]["kind"], "settings");
        assert_eq!(v["payload"]["version"], 1);
        assert_eq!(v["payload"]["checksum"], record.checksum.as_str());
    }

    #[test]
    fn sync_request_versions_keyed_by_kind() {
        let mut versions = BTreeMap::new();
        versions.insert(DataKind::Vocabulary, 3);
        versions.insert(DataKind::CommunicationHistory, 12);
        let msg = WireMessage::new("phone", MessageBody::SyncRequest { versions });
        let v: Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(v["payload"]["versions"]["vocabulary"], 3);
        assert_eq!(v["payload"]["versions"]["communication_history"], 12);

        let back = WireMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn parses_handwritten_confirm() {
        let raw = r#"{"type":"handoff_confirm","from":"watch","timestamp":"2026-03-01T10:00:00Z","payload":{"correlation_id":"abc"}}"#;
        let msg = WireMessage::from_bytes(raw.as_bytes()).unwrap();
        assert_eq!(msg.from, "watch");
        assert_eq!(
            msg.body,
            MessageBody::HandoffConfirm {
                correlation_id: "abc".into()
            }
        );
    }

    #[test]
    fn handoff_cancel_shares_confirm_payload() {
        let msg = WireMessage::new(
            "tablet",
            MessageBody::HandoffCancel {
                correlation_id: "abc".into(),
            },
        );
        let v: Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(v["type"], "handoff_cancel");
        assert_eq!(v["payload"]["correlation_id"], "abc");
        assert_eq!(msg.type_name(), "handoff_cancel");
    }

    #[test]
    fn device_update_carries_device() {
        let dev = Device::new("tv", "living room", DeviceClass::Tv);
        let msg = WireMessage::new("tv", MessageBody::DeviceUpdate(dev.clone()));
        assert_eq!(msg.type_name(), "device_update");
        let back = WireMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(back.body, MessageBody::DeviceUpdate(dev));
    }

    #[test]
    fn rejects_unknown_type_and_bad_payload() {
        let unknown = r#"{"type":"gossip","from":"x","timestamp":"2026-03-01T10:00:00Z","payload":{}}"#;
        assert!(WireMessage::from_bytes(unknown.as_bytes()).is_err());

        let bad = r#"{"type":"sync_data","from":"x","timestamp":"2026-03-01T10:00:00Z","payload":{"kind":"settings"}}"#;
        assert!(WireMessage::from_bytes(bad.as_bytes()).is_err());
    }
}
