//! Key/value backend trait definition.

use async_trait::async_trait;

use tablesync_common::Result;

/// Raw key/value persistence used by the local store.
///
/// Keys are plain strings; values are opaque bytes. Implementations must
/// return prefix scans in insertion order of the keys, and overwriting an
/// existing key must keep its original position.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get the backend name (e.g., "memory", "file").
    fn name(&self) -> &str;

    /// Read the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// All entries whose key starts with `prefix`, in insertion order.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Check if a key exists.
    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
}
