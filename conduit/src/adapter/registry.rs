use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::adapter::base::Adapter;
use crate::bail;
use crate::error::{ConduitResult, ErrorKind};

/// Adapters by system id, shared by everything that resolves schema references.
#[derive(Debug, Clone, Default)]
pub struct AdapterRegistry {
    adapters: Arc<RwLock<HashMap<String, Arc<dyn Adapter>>>>,
}

impl AdapterRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter under its system id, returning the one it replaces.
    pub fn register(&self, adapter: Arc<dyn Adapter>) -> Option<Arc<dyn Adapter>> {
        let mut adapters = self.adapters.write().unwrap_or_else(|err| err.into_inner());
        adapters.insert(adapter.system_id().to_string(), adapter)
    }

    /// Returns the adapter of `system_id`, or `NotFound`.
    pub fn get(&self, system_id: &str) -> ConduitResult<Arc<dyn Adapter>> {
        let adapters = self.adapters.read().unwrap_or_else(|err| err.into_inner());
        match adapters.get(system_id) {
            Some(adapter) => Ok(Arc::clone(adapter)),
            None => bail!(
                ErrorKind::NotFound,
                "No adapter registered for system",
                system_id.to_string()
            ),
        }
    }

    /// Removes and returns the adapter of `system_id`.
    pub fn remove(&self, system_id: &str) -> Option<Arc<dyn Adapter>> {
        let mut adapters = self.adapters.write().unwrap_or_else(|err| err.into_inner());
        adapters.remove(system_id)
    }

    /// Returns the registered system ids in sorted order.
    pub fn system_ids(&self) -> Vec<String> {
        let adapters = self.adapters.read().unwrap_or_else(|err| err.into_inner());
        let mut ids: Vec<String> = adapters.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Cleans up every adapter. Failures are logged and do not stop the others.
    pub async fn cleanup_all(&self) {
        let adapters: Vec<Arc<dyn Adapter>> = {
            let adapters = self.adapters.read().unwrap_or_else(|err| err.into_inner());
            adapters.values().cloned().collect()
        };

        for adapter in adapters {
            if let Err(err) = adapter.cleanup().await {
                warn!(system_id = adapter.system_id(), error = %err, "adapter cleanup failed");
            }
        }
    }
}
