//! Transport contract between the local device and its peers.
//!
//! A transport delivers [`WireMessage`]s point-to-point, in send order per
//! peer pair, and offers a discovery facility for devices not yet connected.
//! Two adapters exist:
//!   - [`memory::MemoryTransport`]: in-process hub, used by tests and demos
//!   - `nats::NatsTransport` (feature `nats`): NATS subjects per device

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::sync::Arc;
use thiserror::Error;

use crate::device::Device;
use crate::protocol::WireMessage;

pub mod memory;
pub mod nats;

pub use memory::{Delivery, DeliveryHook, MemoryNetwork, MemoryTransport};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection to {device} failed: {reason}")]
    ConnectionFailed { device: String, reason: String },

    #[error("no channel to {0}; connect first")]
    NotConnected(String),

    #[error("transport closed")]
    Closed,

    #[error("codec error: {0}")]
    Codec(String),
}

impl TransportError {
    pub fn connection_failed(device: &str, reason: impl Into<String>) -> Self {
        TransportError::ConnectionFailed {
            device: device.to_string(),
            reason: reason.into(),
        }
    }
}

/// An established channel to a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub device_id: String,
    pub established_at: DateTime<Utc>,
}

/// A message received from a peer, tagged with the sender's id
#[derive(Debug, Clone)]
pub struct Inbound {
    pub from: String,
    pub message: WireMessage,
}

/// Callback for inbound messages
pub type MessageHandler = Arc<dyn Fn(Inbound) + Send + Sync>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish (or reuse) a channel to `device_id`.
    ///
    /// Fails with [`TransportError::ConnectionFailed`] if the peer does not
    /// answer within the transport's connect timeout.
    async fn connect(&self, device_id: &str) -> Result<Channel, TransportError>;

    /// Deliver a message on an existing channel. `Ok` means the peer has
    /// received it; the engine treats that as confirmation.
    async fn send(&self, device_id: &str, message: WireMessage) -> Result<(), TransportError>;

    /// Register the handler invoked for every inbound message.
    fn on_message(&self, handler: MessageHandler);

    /// Devices reachable through local network or directory lookup.
    /// The stream is finite and may be empty.
    fn discover(&self) -> BoxStream<'static, Device>;

    /// Drop the channel to `device_id`, if any.
    async fn disconnect(&self, device_id: &str);
}
