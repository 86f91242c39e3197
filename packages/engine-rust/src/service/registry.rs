use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::config::EngineConfig;

// ---------------------------------------------------------------------------
// ServiceContext
// ---------------------------------------------------------------------------

/// Context provided to services when they start.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub config: Arc<EngineConfig>,
}

// ---------------------------------------------------------------------------
// ManagedService trait
// ---------------------------------------------------------------------------

/// Lifecycle-managed service, started in registration order and stopped in
/// reverse. Route consumers are registered as managed services.
#[async_trait]
pub trait ManagedService: Send + Sync {
    /// Unique name of this service (e.g. `"route:orders"`).
    fn name(&self) -> &str;

    async fn start(&self, ctx: &ServiceContext) -> anyhow::Result<()>;

    /// Stops the service. If `terminate` is true, skip graceful cleanup.
    async fn stop(&self, terminate: bool) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

pub struct ServiceRegistry {
    by_name: DashMap<String, Arc<dyn ManagedService>>,
    /// Registration order for deterministic start/stop sequencing.
    order: RwLock<Vec<String>>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_name: DashMap::new(),
            order: RwLock::new(Vec::new()),
        }
    }

    /// Registers a service. Registration order determines start/stop order.
    pub fn register(&self, service: Arc<dyn ManagedService>) {
        let name = service.name().to_string();
        if self.by_name.insert(name.clone(), service).is_none() {
            self.order.write().push(name);
        }
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn ManagedService>> {
        self.by_name.get(name).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.order.read().clone()
    }

    /// Starts all services in registration order.
    ///
    /// # Errors
    ///
    /// Returns the first `start()` failure; later services are not started.
    pub async fn start_all(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        let order = self.order.read().clone();
        for name in &order {
            if let Some(service) = self.get_by_name(name) {
                debug!(service = %name, "starting service");
                service.start(ctx).await?;
            }
        }
        Ok(())
    }

    /// Stops all services in reverse registration order. Every service is
    /// asked to stop even if an earlier one fails; the first failure is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns the first `stop()` failure.
    pub async fn stop_all(&self, terminate: bool) -> anyhow::Result<()> {
        let order = self.order.read().clone();
        let mut first_error = None;
        for name in order.iter().rev() {
            if let Some(service) = self.get_by_name(name) {
                debug!(service = %name, "stopping service");
                if let Err(e) = service.stop(terminate).await {
                    warn!(service = %name, error = %e, "service failed to stop");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
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
