//! Service registry.
//!
//! Tracks services by server alias and model name. Services of different
//! transport types share one table; lookups downcast back to the concrete
//! `Service<T>`.

use std::any::Any;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use crate::config::ConfigError;
use crate::service::Service;
use crate::transport::Transport;

type Key = (String, String);

/// Services keyed by `(server alias, model name)`.
///
/// Thread-safe and can be shared across tasks via `Arc`.
#[derive(Default)]
pub struct Registry {
    services: DashMap<Key, Arc<dyn Any + Send + Sync>>,
    /// Reject a second registration under the same key
    strict: bool,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("services", &self.names())
            .field("strict", &self.strict)
            .finish()
    }
}

impl Registry {
    /// Create a registry. A non-strict registry replaces duplicates.
    pub fn new(strict: bool) -> Self {
        Self {
            services: DashMap::new(),
            strict,
        }
    }

    /// Register a service under its options' server alias and its model name.
    pub fn register<T: Transport>(&self, service: Service<T>) -> Result<(), ConfigError> {
        let alias = service.options().server_alias.clone();
        let name = service.name().to_string();
        let key = (alias.clone(), name.clone());

        if self.strict && self.services.contains_key(&key) {
            return Err(ConfigError::DuplicateModel { alias, name });
        }

        self.services.insert(key, Arc::new(service));
        tracing::debug!(alias = %alias, service = %name, "Service registered");
        Ok(())
    }

    /// Look a service up. `None` when missing or registered with another
    /// transport type.
    pub fn get<T: Transport>(&self, alias: &str, name: &str) -> Option<Service<T>> {
        let entry = self
            .services
            .get(&(alias.to_string(), name.to_string()))?;
        entry.value().downcast_ref::<Service<T>>().cloned()
    }

    pub fn contains(&self, alias: &str, name: &str) -> bool {
        self.services
            .contains_key(&(alias.to_string(), name.to_string()))
    }

    pub fn remove(&self, alias: &str, name: &str) -> bool {
        let removed = self
            .services
            .remove(&(alias.to_string(), name.to_string()))
            .is_some();
        if removed {
            tracing::debug!(alias = %alias, service = %name, "Service unregistered");
        }
        removed
    }

    /// Registered `(alias, name)` pairs, sorted.
    pub fn names(&self) -> Vec<(String, String)> {
        let mut names: Vec<_> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn clear(&self) {
        self.services.clear();
    }
}

static GLOBAL: OnceLock<Registry> = OnceLock::new();

/// Initialize the process-wide registry. Returns `false` when it already
/// exists, in which case the strict flag is unchanged.
pub fn init(strict: bool) -> bool {
    let mut created = false;
    GLOBAL.get_or_init(|| {
        created = true;
        Registry::new(strict)
    });
    created
}

/// The process-wide registry, created non-strict on first use.
pub fn global() -> &'static Registry {
    GLOBAL.get_or_init(|| Registry::new(false))
}

/// Drop every service from the process-wide registry.
pub fn clear() {
    if let Some(registry) = GLOBAL.get() {
        registry.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use crate::service::ServiceBuilder;
    use crate::ServiceOptions;
    use perch_engine::Model;

    fn service(name: &str, alias: &str) -> Service<MemoryTransport> {
        ServiceBuilder::new(Model::new(name))
            .options(ServiceOptions {
                server_alias: alias.to_string(),
                ..ServiceOptions::default()
            })
            .transport(MemoryTransport::new())
            .build()
            .unwrap()
    }

    #[test]
    fn register_and_get() {
        let registry = Registry::new(true);
        registry.register(service("Todo", "api")).unwrap();
        registry.register(service("Todo", "admin")).unwrap();

        assert_eq!(registry.len(), 2);
        let todo = registry.get::<MemoryTransport>("api", "Todo").unwrap();
        assert_eq!(todo.name(), "Todo");
        assert!(registry.get::<MemoryTransport>("api", "User").is_none());
        assert_eq!(
            registry.names(),
            vec![
                ("admin".to_string(), "Todo".to_string()),
                ("api".to_string(), "Todo".to_string())
            ]
        );
    }

    #[test]
    fn strict_registry_rejects_duplicates() {
        let registry = Registry::new(true);
        registry.register(service("Todo", "api")).unwrap();
        let err = registry.register(service("Todo", "api")).unwrap_err();
        assert_eq!(
            err,
            ConfigError::DuplicateModel {
                alias: "api".into(),
                name: "Todo".into()
            }
        );
    }

    #[test]
    fn lenient_registry_replaces() {
        let registry = Registry::new(false);
        let first = service("Todo", "api");
        first.instantiate(serde_json::json!({"id": 1})).unwrap();
        registry.register(first).unwrap();
        registry.register(service("Todo", "api")).unwrap();

        assert_eq!(registry.len(), 1);
        let current = registry.get::<MemoryTransport>("api", "Todo").unwrap();
        assert!(current.get_from_store(1, &Default::default()).unwrap().is_none());
    }

    #[test]
    fn remove_and_clear() {
        let registry = Registry::new(true);
        registry.register(service("Todo", "api")).unwrap();
        registry.register(service("User", "api")).unwrap();

        assert!(registry.remove("api", "Todo"));
        assert!(!registry.remove("api", "Todo"));
        assert!(registry.contains("api", "User"));

        registry.clear();
        assert!(registry.is_empty());
    }
}
