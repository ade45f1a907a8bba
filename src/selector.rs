//! Instance registry and selection. The selector owns the live set of
//! service instances per logical name, mutated only by discovery
//! notifications, and picks a target per call while excluding fused
//! destinations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rand::Rng;
use serde_derive::{Deserialize, Serialize};

use crate::breaker::Breaker;
use crate::error::{self, CallError};

/// Selection mode requested by the caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    /// Uniform pick among non-fused instances; fail on first error.
    #[default]
    Random,
    /// Fan out over non-fused instances until one succeeds.
    Range,
    /// Consistent hashing; not supported, fails explicitly.
    Hash,
    /// Extension point; defaults to Random.
    Custom,
}

/// One advertised method of a service instance.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MethodInfo {
    pub name: String,
    pub level: i8,
    pub is_auth: bool,
    pub explain: String,
}

/// Discovery-sourced description of one live endpoint.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Stable destination key, typically `address:port`.
    pub key: String,
    /// Logical service name.
    pub name: String,
    pub address: String,
    pub port: u16,
    pub methods: Vec<MethodInfo>,
    /// Liveness timestamp, unix seconds of the last announcement.
    pub time: i64,
}

impl ServiceInstance {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

fn no_available_service() -> CallError {
    CallError::new(error::INTERNAL_SERVER_ERROR, "no available service")
}

#[derive(Default)]
pub struct Selector {
    // name -> key -> instance
    services: RwLock<HashMap<String, HashMap<String, Arc<ServiceInstance>>>>,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instance-online notification. A re-announcement replaces the
    /// record wholesale; receiving it redundantly is safe.
    pub fn add_service(&self, ins: ServiceInstance) {
        let mut services = self.services.write().unwrap();
        trace!("selector: instance {} online for {}", ins.key, ins.name);
        services
            .entry(ins.name.clone())
            .or_default()
            .insert(ins.key.clone(), Arc::new(ins));
    }

    /// Instance-offline notification, idempotent.
    pub fn del_service(&self, key: &str) {
        let mut services = self.services.write().unwrap();
        for (name, instances) in services.iter_mut() {
            if instances.remove(key).is_some() {
                trace!("selector: instance {} offline for {}", key, name);
            }
        }
        services.retain(|_, instances| !instances.is_empty());
    }

    /// Snapshot of every live instance of one logical name, for
    /// diagnostics and admin listing.
    pub fn snapshot(&self, name: &str) -> Vec<Arc<ServiceInstance>> {
        let services = self.services.read().unwrap();
        services.get(name).map(|m| m.values().cloned().collect()).unwrap_or_default()
    }

    /// Live instances of `name` that are not fused for `method`, in
    /// arbitrary order. Errs when none qualify.
    pub fn filtered(
        &self, breaker: &Breaker, name: &str, method: &str,
    ) -> Result<Vec<Arc<ServiceInstance>>, CallError> {
        let candidates: Vec<Arc<ServiceInstance>> = {
            let services = self.services.read().unwrap();
            match services.get(name) {
                None => Vec::new(),
                Some(instances) => instances
                    .values()
                    .filter(|ins| !breaker.is_fusing(&ins.key, method))
                    .cloned()
                    .collect(),
            }
        };
        if candidates.is_empty() {
            return Err(no_available_service());
        }
        Ok(candidates)
    }

    pub fn random_mode(
        &self, breaker: &Breaker, name: &str, method: &str,
    ) -> Result<Arc<ServiceInstance>, CallError> {
        let candidates = self.filtered(breaker, name, method)?;
        let index = rand::thread_rng().gen_range(0..candidates.len());
        Ok(candidates[index].clone())
    }

    pub fn hash_mode(
        &self, _breaker: &Breaker, _name: &str, _method: &str,
    ) -> Result<Arc<ServiceInstance>, CallError> {
        Err(CallError::new(error::INTERNAL_SERVER_ERROR, "hash mode not supported"))
    }

    pub fn custom_mode(
        &self, breaker: &Breaker, name: &str, method: &str,
    ) -> Result<Arc<ServiceInstance>, CallError> {
        self.random_mode(breaker, name, method)
    }

    /// The one non-fused instance bound to `address`.
    pub fn by_address(
        &self, breaker: &Breaker, name: &str, method: &str, address: &str,
    ) -> Result<Arc<ServiceInstance>, CallError> {
        let candidates = self.filtered(breaker, name, method)?;
        for ins in candidates {
            if ins.addr() == address {
                return Ok(ins);
            }
        }
        Err(no_available_service())
    }
}
