use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{PushgError, Result};

/// Small key/value capability used for subscriber state and resume cursors.
///
/// Keys are namespaced by a `schema` (one per connector). Implementations
/// must be safe for concurrent use; no atomicity across keys is required.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn put(&self, schema: &str, key: &str, value: &[u8]) -> Result<()>;
    async fn get(&self, schema: &str, key: &str) -> Result<Option<Vec<u8>>>;
    async fn delete(&self, schema: &str, key: &str) -> Result<()>;
    /// All entries of a schema as `(key, value)` pairs, in key order.
    async fn iterate(&self, schema: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

/// In-memory [`KvStore`], used in tests and for brokers that do not need
/// subscriber state to survive a restart.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn put(&self, schema: &str, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        entries
            .entry(schema.to_owned())
            .or_default()
            .insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    async fn get(&self, schema: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.read().unwrap();
        Ok(entries.get(schema).and_then(|s| s.get(key)).cloned())
    }

    async fn delete(&self, schema: &str, key: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        if let Some(s) = entries.get_mut(schema) {
            s.remove(key);
        }
        Ok(())
    }

    async fn iterate(&self, schema: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let entries = self.entries.read().unwrap();
        Ok(entries
            .get(schema)
            .map(|s| s.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}

/// File-backed [`KvStore`] persisting all schemas into a single JSON file.
///
/// Values are base64-encoded. Every mutation is written through; the store
/// is meant for the low-rate subscriber/cursor traffic of connectors, not as
/// a general database.
pub struct FileKvStore {
    path: PathBuf,
    entries: tokio::sync::RwLock<HashMap<String, BTreeMap<String, String>>>,
}

impl FileKvStore {
    /// Opens the store, loading existing content if the file is present.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(data) => serde_json::from_slice(&data)
                .map_err(|e| PushgError::Corrupt(format!("kv file {}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), "opened kv store");
        Ok(Self {
            path,
            entries: tokio::sync::RwLock::new(entries),
        })
    }

    async fn flush(&self, entries: &HashMap<String, BTreeMap<String, String>>) -> Result<()> {
        let data = serde_json::to_vec_pretty(entries)
            .map_err(|e| PushgError::Corrupt(format!("kv encode: {}", e)))?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, data).await?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn put(&self, schema: &str, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries
            .entry(schema.to_owned())
            .or_default()
            .insert(key.to_owned(), general_purpose::STANDARD.encode(value));
        self.flush(&entries).await
    }

    async fn get(&self, schema: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.read().await;
        match entries.get(schema).and_then(|s| s.get(key)) {
            Some(encoded) => match general_purpose::STANDARD.decode(encoded) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    warn!(schema, key, error = %e, "undecodable kv value");
                    Err(PushgError::Corrupt(format!("kv value {}/{}", schema, key)))
                }
            },
            None => Ok(None),
        }
    }

    async fn delete(&self, schema: &str, key: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        if let Some(s) = entries.get_mut(schema) {
            s.remove(key);
        }
        self.flush(&entries).await
    }

    async fn iterate(&self, schema: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let entries = self.entries.read().await;
        let Some(schema_entries) = entries.get(schema) else {
            return Ok(Vec::new());
        };
        let mut result = Vec::with_capacity(schema_entries.len());
        for (key, encoded) in schema_entries {
            let value = general_purpose::STANDARD
                .decode(encoded)
                .map_err(|_| PushgError::Corrupt(format!("kv value {}/{}", schema, key)))?;
            result.push((key.clone(), value));
        }
        Ok(result)
    }
}
