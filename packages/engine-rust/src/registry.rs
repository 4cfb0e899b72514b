use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use soapflow_core::{Handler, QName};
use tracing::debug;

use crate::deployment::{Flows, ServiceChains};

// ---------------------------------------------------------------------------
// DeployedService
// ---------------------------------------------------------------------------

/// A service as deployed on an engine.
///
/// The chains sit behind an [`ArcSwap`]: a dispatch loads one snapshot and
/// keeps it for the whole call, so re-resolving the chains (for example when
/// a global handler is engaged) never changes a chain mid-execution.
///
/// Handler cleanup runs when the last reference is released. A redeployed or
/// undeployed service therefore stays intact until in-flight dispatches that
/// still hold it have finished. Handlers handed over to a successor
/// deployment are left to that successor.
pub struct DeployedService {
    name: QName,
    operations: Vec<QName>,
    flows: Flows,
    chains: ArcSwap<ServiceChains>,
    handed_over: Mutex<Vec<Arc<dyn Handler>>>,
}

impl DeployedService {
    #[must_use]
    pub fn new(name: QName, operations: Vec<QName>, flows: Flows, chains: ServiceChains) -> Self {
        Self {
            name,
            operations,
            flows,
            chains: ArcSwap::from_pointee(chains),
            handed_over: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &QName {
        &self.name
    }

    #[must_use]
    pub fn operations(&self) -> &[QName] {
        &self.operations
    }

    /// Whether `operation` may be dispatched to this service.
    #[must_use]
    pub fn accepts(&self, operation: &QName) -> bool {
        self.operations.is_empty() || self.operations.contains(operation)
    }

    /// The service's own handler descriptors, without global handlers.
    #[must_use]
    pub fn flows(&self) -> &Flows {
        &self.flows
    }

    /// Current chain snapshot.
    #[must_use]
    pub fn chains(&self) -> Arc<ServiceChains> {
        self.chains.load_full()
    }

    /// Publishes re-resolved chains. Dispatches already holding the previous
    /// snapshot keep running it.
    pub fn replace_chains(&self, chains: ServiceChains) {
        self.chains.store(Arc::new(chains));
    }

    /// Handler instances of this deployment that `successor` uses too.
    #[must_use]
    pub fn shared_handlers(&self, successor: &Flows) -> Vec<Arc<dyn Handler>> {
        let theirs = successor.unique_handlers();
        self.flows
            .unique_handlers()
            .into_iter()
            .map(|(_, handler)| handler)
            .filter(|handler| theirs.iter().any(|(_, h)| Arc::ptr_eq(h, handler)))
            .collect()
    }

    /// Transfers the lifecycle of `handlers` to a successor deployment: this
    /// deployment will not clean them up when released.
    pub fn hand_over(&self, handlers: &[Arc<dyn Handler>]) {
        self.handed_over.lock().extend(handlers.iter().cloned());
    }
}

impl Drop for DeployedService {
    fn drop(&mut self) {
        let handed_over = self.handed_over.get_mut();
        for (name, handler) in self.flows.unique_handlers().iter().rev() {
            if handed_over.iter().any(|h| Arc::ptr_eq(h, handler)) {
                debug!(service = %self.name, handler = %name, "handler kept by successor");
                continue;
            }
            debug!(service = %self.name, handler = %name, "cleaning up handler");
            handler.cleanup();
        }
    }
}

impl std::fmt::Debug for DeployedService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeployedService")
            .field("name", &self.name)
            .field("operations", &self.operations)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

/// Deployed services by name, plus their deployment order.
///
/// Shutdown releases services in reverse deployment order.
pub struct ServiceRegistry {
    by_name: DashMap<QName, Arc<DeployedService>>,
    deploy_order: RwLock<Vec<QName>>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_name: DashMap::new(),
            deploy_order: RwLock::new(Vec::new()),
        }
    }

    /// Inserts `service`, returning the deployment it replaced.
    ///
    /// A replacement keeps the original deployment position.
    pub fn insert(&self, service: Arc<DeployedService>) -> Option<Arc<DeployedService>> {
        let name = service.name().clone();
        let previous = self.by_name.insert(name.clone(), service);
        if previous.is_none() {
            self.deploy_order.write().push(name);
        }
        previous
    }

    #[must_use]
    pub fn get(&self, name: &QName) -> Option<Arc<DeployedService>> {
        self.by_name.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, name: &QName) -> Option<Arc<DeployedService>> {
        let (_, service) = self.by_name.remove(name)?;
        self.deploy_order.write().retain(|n| n != name);
        Some(service)
    }

    /// Service names in deployment order.
    #[must_use]
    pub fn names(&self) -> Vec<QName> {
        self.deploy_order.read().clone()
    }

    /// Services in deployment order.
    #[must_use]
    pub fn services(&self) -> Vec<Arc<DeployedService>> {
        self.names().iter().filter_map(|name| self.get(name)).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Removes every service in reverse deployment order.
    pub fn shutdown_all(&self) {
        let order = self.deploy_order.read().clone();
        for name in order.iter().rev() {
            if self.remove(name).is_some() {
                debug!(service = %name, "service released");
            }
        }
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
