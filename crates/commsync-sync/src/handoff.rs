//! Session handoff: move the user's active communication context to another
//! device and make that device the preferred one.
//!
//! Source side: capture context → send `handoff_request` → wait for a
//! matching `handoff_confirm` within the handoff timeout. Priorities change
//! only on confirmation; on expiry the source sends `handoff_cancel`.
//! Target side: activate the context through the [`HandoffAcceptor`], reply
//! with `handoff_confirm`, apply the same priority change locally, and undo
//! it if a matching `handoff_cancel` follows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use commsync_core::{CommsyncError, CommsyncResult};

use crate::device::SharedRegistry;
use crate::lock;
use crate::protocol::{MessageBody, WireMessage};
use crate::transport::Transport;

/// The user's in-progress session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandoffContext {
    pub current_view: Option<String>,
    /// Partially composed utterance
    pub composition_buffer: String,
    pub recent_predictions: Vec<String>,
    #[serde(default)]
    pub session_metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffRequest {
    pub correlation_id: String,
    pub source: String,
    pub target: String,
    pub context: HandoffContext,
    pub timestamp: DateTime<Utc>,
}

/// Per-target progress of a handoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffState {
    Idle,
    Requested,
    Sent,
    AwaitingConfirmation,
    Confirmed,
    Expired,
}

/// How an initiated handoff ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffOutcome {
    Confirmed,
    /// No confirmation arrived in time; nothing was adopted
    Expired,
    /// Target was not reachable; no request was sent
    TargetOffline,
    SendFailed(String),
}

impl HandoffOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, HandoffOutcome::Confirmed)
    }
}

impl fmt::Display for HandoffOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandoffOutcome::Confirmed => f.write_str("confirmed"),
            HandoffOutcome::Expired => f.write_str("expired"),
            HandoffOutcome::TargetOffline => f.write_str("target offline"),
            HandoffOutcome::SendFailed(reason) => write!(f, "send failed: {reason}"),
        }
    }
}

// ── Collaborator hooks ────────────────────────────────────────────────────────

/// Supplies the session to hand off (UI state lives outside this crate).
pub trait ContextProvider: Send + Sync {
    fn capture(&self) -> HandoffContext;
}

/// Activates a received session; returning `false` declines the handoff.
pub trait HandoffAcceptor: Send + Sync {
    fn activate(&self, request: &HandoffRequest) -> bool;
}

/// Provider that hands off an empty context
pub struct EmptyContext;

impl ContextProvider for EmptyContext {
    fn capture(&self) -> HandoffContext {
        HandoffContext::default()
    }
}

/// Acceptor that takes every handoff
pub struct AcceptAll;

impl HandoffAcceptor for AcceptAll {
    fn activate(&self, _request: &HandoffRequest) -> bool {
        true
    }
}

// ── Coordinator ───────────────────────────────────────────────────────────────

struct Pending {
    correlation_id: String,
    confirm: oneshot::Sender<()>,
}

/// Priorities the target held before taking over from `source`
struct Takeover {
    correlation_id: String,
    local_priority: i32,
    source_priority: i32,
}

pub struct HandoffCoordinator {
    local_id: String,
    registry: SharedRegistry,
    transport: Arc<dyn Transport>,
    timeout: Mutex<Duration>,
    provider: Arc<dyn ContextProvider>,
    acceptor: Arc<dyn HandoffAcceptor>,
    pending: Mutex<HashMap<String, Pending>>,
    states: Mutex<HashMap<String, HandoffState>>,
    /// source → latest takeover, kept for a possible cancel
    takeovers: Mutex<HashMap<String, Takeover>>,
}

impl HandoffCoordinator {
    pub fn new(
        registry: SharedRegistry,
        transport: Arc<dyn Transport>,
        timeout: Duration,
        provider: Arc<dyn ContextProvider>,
        acceptor: Arc<dyn HandoffAcceptor>,
    ) -> Self {
        let local_id = lock(&registry).local_id().to_string();
        Self {
            local_id,
            registry,
            transport,
            timeout: Mutex::new(timeout),
            provider,
            acceptor,
            pending: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            takeovers: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_timeout(&self, timeout: Duration) {
        *lock(&self.timeout) = timeout;
    }

    pub fn state(&self, target: &str) -> HandoffState {
        lock(&self.states)
            .get(target)
            .copied()
            .unwrap_or(HandoffState::Idle)
    }

    /// Correlation id of the handoff currently awaiting `target`, if any.
    pub fn pending_correlation(&self, target: &str) -> Option<String> {
        lock(&self.pending)
            .get(target)
            .map(|p| p.correlation_id.clone())
    }

    fn set_state(&self, target: &str, state: HandoffState) {
        debug!(target_device = %target, ?state, "handoff state");
        lock(&self.states).insert(target.to_string(), state);
    }

    /// Hand the current session to `target` and wait for its confirmation.
    ///
    /// Errors only for an unknown target or when a handoff to the same target
    /// is already in flight; every other ending is a [`HandoffOutcome`].
    pub async fn initiate(&self, target: &str) -> CommsyncResult<HandoffOutcome> {
        let reachable = {
            let registry = lock(&self.registry);
            let device = registry
                .get(target)
                .ok_or_else(|| CommsyncError::UnknownDevice(target.to_string()))?;
            device.status.is_reachable()
        };
        if !reachable {
            info!(target_device = %target, "handoff skipped: target offline");
            return Ok(HandoffOutcome::TargetOffline);
        }

        let correlation_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if pending.contains_key(target) {
                return Err(CommsyncError::HandoffInProgress(target.to_string()));
            }
            pending.insert(
                target.to_string(),
                Pending {
                    correlation_id: correlation_id.clone(),
                    confirm: tx,
                },
            );
        }
        self.set_state(target, HandoffState::Requested);

        let request = HandoffRequest {
            correlation_id: correlation_id.clone(),
            source: self.local_id.clone(),
            target: target.to_string(),
            context: self.provider.capture(),
            timestamp: Utc::now(),
        };
        let message = WireMessage::new(&self.local_id, MessageBody::HandoffRequest(request));

        let sent = match self.transport.connect(target).await {
            Ok(_) => self.transport.send(target, message).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!(target_device = %target, "handoff request not delivered: {e}");
            lock(&self.pending).remove(target);
            self.set_state(target, HandoffState::Expired);
            return Ok(HandoffOutcome::SendFailed(e.to_string()));
        }
        self.set_state(target, HandoffState::Sent);
        self.set_state(target, HandoffState::AwaitingConfirmation);

        let timeout = *lock(&self.timeout);
        let confirmed = matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(())));
        lock(&self.pending).remove(target);

        if !confirmed {
            warn!(target_device = %target, correlation_id = %correlation_id, ?timeout, "handoff expired");
            self.set_state(target, HandoffState::Expired);
            self.send_cancel(target, correlation_id).await;
            return Ok(HandoffOutcome::Expired);
        }

        lock(&self.registry).promote(target, &self.local_id)?;
        self.set_state(target, HandoffState::Confirmed);
        info!(target_device = %target, correlation_id = %correlation_id, "handoff confirmed");
        Ok(HandoffOutcome::Confirmed)
    }

    /// Tell a target that may still accept late to stand down.
    async fn send_cancel(&self, target: &str, correlation_id: String) {
        let cancel = WireMessage::new(
            &self.local_id,
            MessageBody::HandoffCancel { correlation_id },
        );
        let sent = match self.transport.connect(target).await {
            Ok(_) => self.transport.send(target, cancel).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!(target_device = %target, "handoff cancel not delivered: {e}");
        }
    }

    /// Match a `handoff_confirm` from `from` against the pending handoff.
    pub fn handle_confirm(&self, from: &str, correlation_id: &str) -> bool {
        let mut pending = lock(&self.pending);
        match pending.get(from) {
            Some(p) if p.correlation_id == correlation_id => {}
            _ => {
                debug!(from = %from, correlation_id = %correlation_id, "ignoring unmatched handoff confirm");
                return false;
            }
        }
        let Some(p) = pending.remove(from) else {
            return false;
        };
        p.confirm.send(()).is_ok()
    }

    /// Target side: activate the session, confirm, then take over priority.
    pub async fn handle_request(&self, request: HandoffRequest) -> CommsyncResult<bool> {
        if request.target != self.local_id {
            debug!(target_device = %request.target, "handoff request not addressed to us");
            return Ok(false);
        }
        if !self.acceptor.activate(&request) {
            info!(source = %request.source, "handoff declined");
            return Ok(false);
        }

        let confirm = WireMessage::new(
            &self.local_id,
            MessageBody::HandoffConfirm {
                correlation_id: request.correlation_id.clone(),
            },
        );
        let sent = match self.transport.connect(&request.source).await {
            Ok(_) => self.transport.send(&request.source, confirm).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!(source = %request.source, "handoff confirm not delivered: {e}");
            return Ok(false);
        }

        let mut registry = lock(&self.registry);
        if registry.contains(&request.source) {
            let takeover = Takeover {
                correlation_id: request.correlation_id.clone(),
                local_priority: registry.priority_of(&self.local_id),
                source_priority: registry.priority_of(&request.source),
            };
            registry.promote(&self.local_id, &request.source)?;
            lock(&self.takeovers).insert(request.source.clone(), takeover);
        }
        info!(source = %request.source, correlation_id = %request.correlation_id, "handoff accepted");
        Ok(true)
    }

    /// Target side: the source gave up on `correlation_id`. Restores the
    /// priorities held before the takeover; `false` if nothing matched.
    pub fn handle_cancel(&self, from: &str, correlation_id: &str) -> CommsyncResult<bool> {
        let takeover = {
            let mut takeovers = lock(&self.takeovers);
            match takeovers.get(from) {
                Some(t) if t.correlation_id == correlation_id => takeovers.remove(from),
                _ => None,
            }
        };
        let Some(takeover) = takeover else {
            debug!(from = %from, correlation_id = %correlation_id, "ignoring unmatched handoff cancel");
            return Ok(false);
        };

        let mut registry = lock(&self.registry);
        registry.set_priority(&self.local_id, takeover.local_priority)?;
        registry.set_priority(from, takeover.source_priority)?;
        warn!(source = %from, correlation_id = %correlation_id, "handoff cancelled by source, priorities restored");
        Ok(true)
    }
}
