//! Named XA resources known to this coordinator.
//!
//! Enlistment looks resources up by name, and every recovery round scans all
//! of them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::ports::outbound::XaResource;

#[derive(Default)]
pub struct ResourceRegistry {
    resources: RwLock<HashMap<String, Arc<dyn XaResource>>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `resource` under `name`, returning the one it replaced.
    pub fn register(
        &self,
        name: impl Into<String>,
        resource: Arc<dyn XaResource>,
    ) -> Option<Arc<dyn XaResource>> {
        let name = name.into();
        info!(resource = %name, "Resource registered");
        self.resources.write().insert(name, resource)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn XaResource>> {
        self.resources.read().get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.resources.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.resources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockXaResource;

    #[test]
    fn test_register_and_lookup() {
        let registry = ResourceRegistry::new();
        assert!(registry.is_empty());
        assert!(registry
            .register("db-b", Arc::new(MockXaResource::new("db-b")))
            .is_none());
        registry.register("db-a", Arc::new(MockXaResource::new("db-a")));
        assert!(registry
            .register("db-a", Arc::new(MockXaResource::new("db-a")))
            .is_some());

        assert_eq!(registry.names(), vec!["db-a", "db-b"]);
        assert_eq!(registry.len(), 2);
        assert!(registry.get("db-a").is_some());
        assert!(registry.get("db-c").is_none());
    }
}
