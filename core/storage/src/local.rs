//! Local filesystem key/value backend.

use async_trait::async_trait;
use indexmap::IndexSet;
use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

use crate::backend::KeyValueStore;
use tablesync_common::{Error, Result};

const INDEX_FILE: &str = "index.json";
const VALUES_DIR: &str = "values";

/// Filesystem backend.
///
/// Every value lives in its own file below `<root>/values`, named after the
/// percent-encoded key. The key order is persisted in `<root>/index.json`
/// so prefix scans survive restarts in insertion order.
pub struct FileBackend {
    root: PathBuf,
    keys: Mutex<IndexSet<String>>,
}

impl FileBackend {
    /// Open (or create) a file backend rooted at `root`.
    ///
    /// # Postconditions
    /// - Root and value directories exist
    /// - The persisted key order is loaded
    ///
    /// # Errors
    /// - Permission denied
    /// - Corrupt index file
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        // Sync for constructor
        std::fs::create_dir_all(root.join(VALUES_DIR))?;

        let index_path = root.join(INDEX_FILE);
        let keys = if index_path.exists() {
            let content = std::fs::read_to_string(&index_path)?;
            serde_json::from_str::<Vec<String>>(&content)?
                .into_iter()
                .collect()
        } else {
            IndexSet::new()
        };

        Ok(Self {
            root,
            keys: Mutex::new(keys),
        })
    }

    fn value_path(&self, key: &str) -> PathBuf {
        let name = percent_encode(key.as_bytes(), NON_ALPHANUMERIC).to_string();
        self.root.join(VALUES_DIR).join(name)
    }

    async fn persist_index(&self, keys: &IndexSet<String>) -> Result<()> {
        let ordered: Vec<&String> = keys.iter().collect();
        let content = serde_json::to_vec(&ordered)?;
        write_atomic(&self.root.join(INDEX_FILE), &content).await
    }
}

/// Write through a temporary file and rename over the target.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl KeyValueStore for FileBackend {
    fn name(&self) -> &str {
        "file"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let keys = self.keys.lock().await;
        if !keys.contains(key) {
            return Ok(None);
        }
        match fs::read(self.value_path(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::Storage(format!(
                "Value file missing for indexed key {}",
                key
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut keys = self.keys.lock().await;
        write_atomic(&self.value_path(key), &value).await?;
        if keys.insert(key.to_string()) {
            self.persist_index(&keys).await?;
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut keys = self.keys.lock().await;
        if !keys.shift_remove(key) {
            return Ok(());
        }
        self.persist_index(&keys).await?;
        match fs::remove_file(self.value_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let keys = self.keys.lock().await;
        let mut results = Vec::new();
        for key in keys.iter().filter(|k| k.starts_with(prefix)) {
            let data = fs::read(self.value_path(key)).await?;
            results.push((key.clone(), data));
        }
        Ok(results)
    }
}
