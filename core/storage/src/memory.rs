//! In-memory key/value backend.

use async_trait::async_trait;
use indexmap::IndexMap;
use std::sync::RwLock;

use crate::backend::KeyValueStore;
use tablesync_common::{Error, Result};

/// In-memory backend.
///
/// Useful for testing and for hosts that rebuild their mirror on every
/// start. All data is lost on drop.
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<IndexMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    /// Create a new empty memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> Error {
        Error::Storage("memory backend lock poisoned".to_string())
    }
}

#[async_trait]
impl KeyValueStore for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        entries.shift_remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
