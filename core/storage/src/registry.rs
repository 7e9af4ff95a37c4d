//! Backend registry for resolving key/value backends by name.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::KeyValueStore;
use tablesync_common::{Error, Result};

/// Factory function type for creating backends.
pub type BackendFactory = Box<dyn Fn(Value) -> Result<Arc<dyn KeyValueStore>> + Send + Sync>;

/// Registry for key/value backend factories.
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a backend factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: BackendFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::InvalidInput(format!(
                "Backend '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a backend by name and configuration.
    ///
    /// # Errors
    /// - Backend not found
    /// - Configuration invalid
    pub fn resolve(&self, name: &str, config: Value) -> Result<Arc<dyn KeyValueStore>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Backend '{}' is not registered", name)))?;
        factory(config)
    }

    /// Get list of registered backend names.
    pub fn backends(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the built-in backends.
///
/// - `memory`: no configuration
/// - `file`: `{"path": "<directory>"}`
pub fn create_default_registry() -> BackendRegistry {
    let mut factories: HashMap<String, BackendFactory> = HashMap::new();

    factories.insert(
        "memory".to_string(),
        Box::new(|_config| -> Result<Arc<dyn KeyValueStore>> {
            Ok(Arc::new(crate::memory::MemoryBackend::new()))
        }),
    );

    factories.insert(
        "file".to_string(),
        Box::new(|config| -> Result<Arc<dyn KeyValueStore>> {
            let path = config
                .get("path")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    Error::InvalidInput("File backend requires 'path'".to_string())
                })?;
            Ok(Arc::new(crate::local::FileBackend::new(path)?))
        }),
    );

    BackendRegistry { factories }
}
