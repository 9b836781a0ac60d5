//! NATS-backed transport.
//!
//! Subjects (all under the per-user `prefix`):
//!   {prefix}.dev.{device_id}   direct inbox (request/reply); the receiver acks each
//!                              message once its handler has it, so `send` only
//!                              succeeds for messages the peer actually took
//!   {prefix}.ping.{device_id}  connect handshake (request/reply)
//!   {prefix}.discover          discovery request, every listener replies with its Device
//!
//! Requires feature `nats` (async-nats optional dep).

#[cfg(feature = "nats")]
pub use inner::*;

#[cfg(feature = "nats")]
mod inner {
    use anyhow::Result;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::Utc;
    use futures::stream::{self, BoxStream, StreamExt};
    use serde::{Deserialize, Serialize};
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tracing::{debug, info, warn};

    use crate::device::Device;
    use crate::lock;
    use crate::protocol::WireMessage;
    use crate::transport::{Channel, Inbound, MessageHandler, Transport, TransportError};

    /// Body of a discovery request
    #[derive(Debug, Serialize, Deserialize)]
    struct DiscoverRequest {
        requester: String,
    }

    /// Options for [`NatsTransport::connect`]
    #[derive(Debug, Clone)]
    pub struct NatsOptions {
        pub url: String,
        pub subject_prefix: String,
        pub connect_timeout: Duration,
        pub discovery_window: Duration,
    }

    impl From<&commsync_core::config::CommsyncConfig> for NatsOptions {
        fn from(config: &commsync_core::config::CommsyncConfig) -> Self {
            Self {
                url: config.transport.nats_url.clone(),
                subject_prefix: config.transport.subject_prefix.clone(),
                connect_timeout: Duration::from_millis(config.sync.connect_timeout_ms),
                discovery_window: Duration::from_millis(config.transport.discovery_window_ms),
            }
        }
    }

    pub struct NatsTransport {
        client: async_nats::Client,
        local_id: String,
        announcement: Arc<Mutex<Device>>,
        opts: NatsOptions,
        channels: Mutex<HashSet<String>>,
        handler: Arc<Mutex<Option<MessageHandler>>>,
        tasks: Mutex<Vec<JoinHandle<()>>>,
    }

    impl NatsTransport {
        /// Connect to NATS and start serving this device's inbox, ping and
        /// discovery subjects.
        pub async fn connect(opts: NatsOptions, announcement: Device) -> Result<Self> {
            let client = async_nats::connect(&opts.url)
                .await
                .map_err(|e| anyhow::anyhow!("connecting to NATS at {}: {e}", opts.url))?;
            info!(url = %opts.url, prefix = %opts.subject_prefix, "NATS: connected");

            let mut announcement = announcement;
            announcement.is_local = false;
            let transport = NatsTransport {
                client,
                local_id: announcement.id.clone(),
                announcement: Arc::new(Mutex::new(announcement)),
                opts,
                channels: Mutex::new(HashSet::new()),
                handler: Arc::new(Mutex::new(None)),
                tasks: Mutex::new(Vec::new()),
            };
            transport.serve().await?;
            Ok(transport)
        }

        /// Update what this device answers to discovery requests with.
        pub fn set_announcement(&self, device: Device) {
            let mut device = device;
            device.is_local = false;
            *lock(&self.announcement) = device;
        }

        fn subject(&self, kind: &str, device_id: &str) -> String {
            format!("{}.{}.{}", self.opts.subject_prefix, kind, device_id)
        }

        fn discover_subject(&self) -> String {
            format!("{}.discover", self.opts.subject_prefix)
        }

        async fn serve(&self) -> Result<()> {
            let mut inbox = self
                .client
                .subscribe(self.subject("dev", &self.local_id))
                .await
                .map_err(|e| anyhow::anyhow!("subscribing to inbox: {e}"))?;
            let mut pings = self
                .client
                .subscribe(self.subject("ping", &self.local_id))
                .await
                .map_err(|e| anyhow::anyhow!("subscribing to ping subject: {e}"))?;
            let mut discovery = self
                .client
                .subscribe(self.discover_subject())
                .await
                .map_err(|e| anyhow::anyhow!("subscribing to discovery subject: {e}"))?;

            let handler = self.handler.clone();
            let client = self.client.clone();
            let inbox_task = tokio::spawn(async move {
                while let Some(msg) = inbox.next().await {
                    let message = match WireMessage::from_bytes(&msg.payload) {
                        Ok(m) => m,
                        Err(e) => {
                            warn!("dropping undecodable message: {e}");
                            continue;
                        }
                    };
                    let current = lock(&handler).clone();
                    let Some(h) = current else {
                        debug!(from = %message.from, "no handler yet, message not acked");
                        continue;
                    };
                    h(Inbound {
                        from: message.from.clone(),
                        message,
                    });
                    if let Some(reply) = msg.reply {
                        if let Err(e) = client.publish(reply, Bytes::from_static(b"ack")).await {
                            debug!("inbox ack failed: {e}");
                        }
                    }
                }
            });

            let client = self.client.clone();
            let ping_task = tokio::spawn(async move {
                while let Some(msg) = pings.next().await {
                    if let Some(reply) = msg.reply {
                        if let Err(e) = client.publish(reply, Bytes::from_static(b"pong")).await {
                            debug!("ping reply failed: {e}");
                        }
                    }
                }
            });

            let client = self.client.clone();
            let announcement = self.announcement.clone();
            let local_id = self.local_id.clone();
            let discovery_task = tokio::spawn(async move {
                while let Some(msg) = discovery.next().await {
                    let asked_by_self = serde_json::from_slice::<DiscoverRequest>(&msg.payload)
                        .map(|r| r.requester == local_id)
                        .unwrap_or(false);
                    let Some(reply) = msg.reply else { continue };
                    if asked_by_self {
                        continue;
                    }
                    let body = match serde_json::to_vec(&*lock(&announcement)) {
                        Ok(b) => b,
                        Err(e) => {
                            warn!("serializing announcement: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = client.publish(reply, Bytes::from(body)).await {
                        debug!("discovery reply failed: {e}");
                    }
                }
            });

            lock(&self.tasks).extend([inbox_task, ping_task, discovery_task]);
            Ok(())
        }
    }

    impl Drop for NatsTransport {
        fn drop(&mut self) {
            for task in lock(&self.tasks).drain(..) {
                task.abort();
            }
        }
    }

    #[async_trait]
    impl Transport for NatsTransport {
        async fn connect(&self, device_id: &str) -> Result<Channel, TransportError> {
            if lock(&self.channels).contains(device_id) {
                return Ok(Channel {
                    device_id: device_id.to_string(),
                    established_at: Utc::now(),
                });
            }

            let request = self
                .client
                .request(self.subject("ping", device_id), Bytes::from_static(b"ping"));
            match tokio::time::timeout(self.opts.connect_timeout, request).await {
                Ok(Ok(_)) => {
                    lock(&self.channels).insert(device_id.to_string());
                    debug!(device = %device_id, "NATS: channel established");
                    Ok(Channel {
                        device_id: device_id.to_string(),
                        established_at: Utc::now(),
                    })
                }
                Ok(Err(e)) => Err(TransportError::connection_failed(device_id, e.to_string())),
                Err(_) => Err(TransportError::connection_failed(
                    device_id,
                    format!("no answer within {:?}", self.opts.connect_timeout),
                )),
            }
        }

        async fn send(&self, device_id: &str, message: WireMessage) -> Result<(), TransportError> {
            if !lock(&self.channels).contains(device_id) {
                return Err(TransportError::NotConnected(device_id.to_string()));
            }
            let payload = message
                .to_bytes()
                .map_err(|e| TransportError::Codec(e.to_string()))?;

            // Core publish is fire-and-forget; wait for the peer's ack instead.
            let request = self
                .client
                .request(self.subject("dev", device_id), Bytes::from(payload));
            let failure = match tokio::time::timeout(self.opts.connect_timeout, request).await {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("no ack within {:?}", self.opts.connect_timeout),
            };
            lock(&self.channels).remove(device_id);
            debug!(device = %device_id, "NATS: channel dropped: {failure}");
            Err(TransportError::connection_failed(device_id, failure))
        }

        fn on_message(&self, handler: MessageHandler) {
            *lock(&self.handler) = Some(handler);
        }

        fn discover(&self) -> BoxStream<'static, Device> {
            let client = self.client.clone();
            let subject = self.discover_subject();
            let window = self.opts.discovery_window;
            let local_id = self.local_id.clone();

            let setup = async move {
                let inbox = client.new_inbox();
                let replies = match client.subscribe(inbox.clone()).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("discovery subscribe failed: {e}");
                        return stream::empty().boxed();
                    }
                };
                let request = serde_json::to_vec(&DiscoverRequest {
                    requester: local_id.clone(),
                })
                .unwrap_or_default();
                if let Err(e) = client
                    .publish_with_reply(subject, inbox, Bytes::from(request))
                    .await
                {
                    warn!("discovery request failed: {e}");
                    return stream::empty().boxed();
                }

                replies
                    .take_until(tokio::time::sleep(window))
                    .filter_map(move |msg| {
                        let local_id = local_id.clone();
                        async move {
                            let mut device: Device = serde_json::from_slice(&msg.payload).ok()?;
                            if device.id == local_id {
                                return None;
                            }
                            device.is_local = false;
                            Some(device)
                        }
                    })
                    .boxed()
            };

            stream::once(setup).flatten().boxed()
        }

        async fn disconnect(&self, device_id: &str) {
            lock(&self.channels).remove(device_id);
        }
    }

}
