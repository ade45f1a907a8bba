//! The discovery collaborator interface consumed by the core. The core
//! makes no assumption about how instances are found (consensus store,
//! gossip, static file, polling); it only needs online/offline push
//! notifications and the selector's snapshot query. Both notifications
//! are idempotent and safe to receive redundantly.
//!
//! There is deliberately no process-wide discovery singleton: a backend
//! obtains a [DiscoveryHandle] from [channel] and the receiving end is
//! threaded into [crate::client::RpcClient] at construction.

use crossfire::{MAsyncRx, MTx};

use crate::selector::ServiceInstance;

#[derive(Debug)]
pub enum DiscoveryEvent {
    /// An instance appeared or re-announced itself.
    InstanceOnline(ServiceInstance),
    /// The instance with this destination key is gone.
    InstanceOffline(String),
}

/// Push side handed to a discovery backend. Cloneable; events may come
/// from several watchers.
pub struct DiscoveryHandle {
    tx: MTx<DiscoveryEvent>,
}

impl Clone for DiscoveryHandle {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl DiscoveryHandle {
    pub fn online(&self, ins: ServiceInstance) {
        let _ = self.tx.send(DiscoveryEvent::InstanceOnline(ins));
    }

    pub fn offline(&self, key: impl Into<String>) {
        let _ = self.tx.send(DiscoveryEvent::InstanceOffline(key.into()));
    }
}

/// Build the push handle and the event stream a client consumes.
pub fn channel() -> (DiscoveryHandle, MAsyncRx<DiscoveryEvent>) {
    let (tx, rx) = crossfire::mpmc::unbounded_async();
    (DiscoveryHandle { tx }, rx)
}
