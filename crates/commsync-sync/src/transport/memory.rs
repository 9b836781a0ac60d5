//! In-process transport. A [`MemoryNetwork`] is a hub that every attached
//! [`MemoryTransport`] registers with; delivery calls the receiver's handler
//! synchronously, which preserves send order per peer pair.
//!
//! Devices can be taken off the network with [`MemoryNetwork::set_reachable`]
//! to simulate partitions and powered-off peers.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::{Channel, Inbound, MessageHandler, Transport, TransportError};
use crate::device::Device;
use crate::lock;
use crate::protocol::{MessageType, WireMessage};

struct Endpoint {
    announcement: Device,
    handler: Option<MessageHandler>,
    reachable: bool,
}

/// A delivered message, kept for inspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub from: String,
    pub to: String,
    pub message_type: MessageType,
}

/// Runs after each delivery, once the receiver's handler has returned
pub type DeliveryHook = Arc<dyn Fn(&Delivery) + Send + Sync>;

#[derive(Default)]
struct NetworkInner {
    endpoints: HashMap<String, Endpoint>,
    deliveries: Vec<Delivery>,
    hook: Option<DeliveryHook>,
}

/// Shared in-memory hub
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device; `announcement` is what peers see on discovery.
    pub fn attach(&self, announcement: Device) -> MemoryTransport {
        let mut announcement = announcement;
        announcement.is_local = false;
        let device_id = announcement.id.clone();
        lock(&self.inner).endpoints.insert(
            device_id.clone(),
            Endpoint {
                announcement,
                handler: None,
                reachable: true,
            },
        );
        MemoryTransport {
            local_id: device_id,
            network: self.clone(),
            channels: Mutex::new(HashSet::new()),
        }
    }

    /// Take a device on or off the network.
    pub fn set_reachable(&self, device_id: &str, reachable: bool) {
        if let Some(ep) = lock(&self.inner).endpoints.get_mut(device_id) {
            ep.reachable = reachable;
        }
    }

    pub fn is_reachable(&self, device_id: &str) -> bool {
        lock(&self.inner)
            .endpoints
            .get(device_id)
            .map(|ep| ep.reachable)
            .unwrap_or(false)
    }

    /// Observe deliveries as they happen, e.g. to change the world mid-send.
    pub fn on_deliver(&self, hook: DeliveryHook) {
        lock(&self.inner).hook = Some(hook);
    }

    /// Every message delivered so far, in delivery order.
    pub fn deliveries(&self) -> Vec<Delivery> {
        lock(&self.inner).deliveries.clone()
    }

    /// Number of messages of `message_type` delivered from `from`.
    pub fn count_sent(&self, from: &str, message_type: MessageType) -> usize {
        lock(&self.inner)
            .deliveries
            .iter()
            .filter(|d| d.from == from && d.message_type == message_type)
            .count()
    }
}

/// One device's view of a [`MemoryNetwork`]
pub struct MemoryTransport {
    local_id: String,
    network: MemoryNetwork,
    channels: Mutex<HashSet<String>>,
}

impl MemoryTransport {
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        lock(&self.channels).contains(device_id)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, device_id: &str) -> Result<Channel, TransportError> {
        let reachable =
            self.network.is_reachable(&self.local_id) && self.network.is_reachable(device_id);
        if !reachable {
            lock(&self.channels).remove(device_id);
            return Err(TransportError::connection_failed(device_id, "peer unreachable"));
        }
        lock(&self.channels).insert(device_id.to_string());
        Ok(Channel {
            device_id: device_id.to_string(),
            established_at: Utc::now(),
        })
    }

    async fn send(&self, device_id: &str, message: WireMessage) -> Result<(), TransportError> {
        if !self.is_connected(device_id) {
            return Err(TransportError::NotConnected(device_id.to_string()));
        }

        let (handler, hook, delivery) = {
            let mut net = lock(&self.network.inner);
            let sender_up = net
                .endpoints
                .get(&self.local_id)
                .map(|ep| ep.reachable)
                .unwrap_or(false);
            let target = net
                .endpoints
                .get(device_id)
                .filter(|ep| ep.reachable && sender_up)
                .map(|ep| ep.handler.clone());
            let Some(handler) = target else {
                drop(net);
                lock(&self.channels).remove(device_id);
                return Err(TransportError::connection_failed(device_id, "peer went away"));
            };
            let delivery = Delivery {
                from: self.local_id.clone(),
                to: device_id.to_string(),
                message_type: message.message_type(),
            };
            net.deliveries.push(delivery.clone());
            (handler, net.hook.clone(), delivery)
        };

        debug!(from = %self.local_id, to = %device_id, msg = message.type_name(), "memory delivery");
        if let Some(handler) = handler {
            handler(Inbound {
                from: self.local_id.clone(),
                message,
            });
        }
        if let Some(hook) = hook {
            hook(&delivery);
        }
        Ok(())
    }

    fn on_message(&self, handler: MessageHandler) {
        if let Some(ep) = lock(&self.network.inner).endpoints.get_mut(&self.local_id) {
            ep.handler = Some(handler);
        }
    }

    fn discover(&self) -> BoxStream<'static, Device> {
        let found: Vec<Device> = lock(&self.network.inner)
            .endpoints
            .values()
            .filter(|ep| ep.reachable && ep.announcement.id != self.local_id)
            .map(|ep| ep.announcement.clone())
            .collect();
        stream::iter(found).boxed()
    }

    async fn disconnect(&self, device_id: &str) {
        lock(&self.channels).remove(device_id);
    }
}
