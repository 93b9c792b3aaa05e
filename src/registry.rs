//! Device kind to manager lookup

use crate::fabric::Fabric;
use crate::managers::{SiteManager, SwitchManager};
use crate::node::{Manager, Properties};
use crate::pool::PortPool;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Append-only list of managers, safe to share between tasks
#[derive(Default)]
pub struct Registry {
    managers: RwLock<Vec<Arc<dyn Manager>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the site and switch managers
    pub fn with_builtin(fabric: Arc<dyn Fabric>, pool: Arc<PortPool>) -> Self {
        let registry = Self::new();
        registry.register(Arc::new(SiteManager::new(fabric.clone(), pool.clone())));
        registry.register(Arc::new(SwitchManager::new(fabric, pool)));
        registry
    }

    /// Add a manager. A later registration for an already known device kind
    /// is ignored.
    pub fn register(&self, manager: Arc<dyn Manager>) -> bool {
        let mut managers = self.managers.write();
        if managers.iter().any(|m| m.device() == manager.device()) {
            warn!("Manager for device '{}' already registered", manager.device());
            return false;
        }
        info!("Registered manager for device '{}'", manager.device());
        managers.push(manager);
        true
    }

    pub fn get(&self, device: &str) -> Result<Arc<dyn Manager>> {
        self.managers
            .read()
            .iter()
            .find(|m| m.device() == device)
            .cloned()
            .ok_or_else(|| Error::ManagerNotFound(device.to_string()))
    }

    /// Registered device kinds, in registration order
    pub fn devices(&self) -> Vec<String> {
        self.managers
            .read()
            .iter()
            .map(|m| m.device().to_string())
            .collect()
    }

    pub fn managers(&self) -> Vec<Arc<dyn Manager>> {
        self.managers.read().clone()
    }

    /// Run `setup` on every manager with its section of `configs`. Failures
    /// leave that kind unusable and are logged, not returned. Returns the
    /// number of managers that set up successfully.
    pub async fn setup_all(&self, configs: &HashMap<String, Properties>) -> usize {
        let mut ready = 0;
        for manager in self.managers() {
            let config = configs.get(manager.device()).cloned().unwrap_or_default();
            match manager.setup(&config).await {
                Ok(()) => ready += 1,
                Err(e) => warn!("Setup of manager '{}' failed: {}", manager.device(), e),
            }
        }
        ready
    }
}
