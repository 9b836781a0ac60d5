//! commsync-sync: device registry, transports, sync engine, conflict
//! resolution and session handoff for a user's communication devices.
//!
//! [`SyncContext`] wires everything together; hosts construct one per
//! process and feed it lifecycle signals.

pub mod conflict;
pub mod context;
pub mod device;
pub mod engine;
pub mod handoff;
pub mod lifecycle;
pub mod protocol;
pub mod record;
pub mod state;
pub mod store;
pub mod transport;

use std::sync::{Mutex, MutexGuard};

pub use context::{SyncContext, SyncContextBuilder};
pub use device::{Device, DeviceRegistry, RegistryEvent};
pub use engine::{ApplyOutcome, SyncEngine, SyncEvent, SyncPassReport, SyncSettings, SyncStatus};
pub use handoff::{HandoffContext, HandoffOutcome, HandoffRequest};
pub use lifecycle::LifecycleSignal;
pub use record::SyncRecord;
pub use transport::{Transport, TransportError};

#[cfg(feature = "nats")]
pub use transport::nats::{NatsOptions, NatsTransport};

/// Lock ignoring poisoning; guarded state stays consistent between statements.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
