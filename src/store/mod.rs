//! Partitioned append-only message store.
//!
//! Every topic partition owns a directory of segment file pairs
//! (`<partition>-<startID>.log` / `.idx`). Appends are buffered writes: a
//! message is visible to readers as soon as the append returns, but a crash
//! may lose the tail written since the last sync. Callers must not assume
//! sync-on-append.

mod fetch;
mod partition;

pub use fetch::{FetchDirection, FetchRequest, FetchResult, FetchedMessage};
pub use partition::{MessagePartition, INDEX_ENTRY_SIZE, MESSAGES_PER_FILE};

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path as FsPath, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::error::{PushgError, Result};
use crate::protocol::Message;

/// Fraction of filesystem space that must remain free for `check` to pass.
const MIN_FREE_SPACE: f64 = 0.05;

/// Capability interface of the message store, as seen by the router and the
/// connectors. Implementations must be safe for concurrent use; partitions
/// are independent of each other.
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    /// Persists the message in the partition of its path. When the broker
    /// runs standalone (`node_id == 0`) or the message carries no ID yet, an
    /// ID and timestamp are assigned first. Returns the stored byte count.
    async fn store_message(&self, message: &mut Message, node_id: u8) -> Result<usize>;

    /// Allocates the next `(id, timestamp)` pair of a partition.
    async fn generate_next_id(&self, partition: &str, node_id: u8) -> Result<(u64, i64)>;

    /// Highest ID ever stored in the partition, `0` if it is empty.
    async fn max_message_id(&self, partition: &str) -> Result<u64>;

    /// Starts an asynchronous historical read; see [`FetchResult`] for the
    /// consumer contract.
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResult>;

    /// Succeeds while the backing filesystem has enough free space.
    async fn check(&self) -> Result<()>;

    /// Flushes and closes all partitions, aggregating any errors.
    async fn stop(&self) -> Result<()>;
}

/// File-based [`MessageStore`] with one lazily opened
/// [`MessagePartition`] per topic partition.
pub struct FileMessageStore {
    basedir: PathBuf,
    partitions: RwLock<HashMap<String, Arc<MessagePartition>>>,
}

impl FileMessageStore {
    pub fn new(basedir: impl Into<PathBuf>) -> Self {
        Self {
            basedir: basedir.into(),
            partitions: RwLock::new(HashMap::new()),
        }
    }

    fn partition(&self, name: &str) -> Result<Arc<MessagePartition>> {
        {
            let partitions = self.partitions.read().unwrap();
            if let Some(p) = partitions.get(name) {
                return Ok(p.clone());
            }
        }
        let mut partitions = self.partitions.write().unwrap();
        if let Some(p) = partitions.get(name) {
            return Ok(p.clone());
        }
        let partition = Arc::new(MessagePartition::open(&self.basedir, name)?);
        partitions.insert(name.to_owned(), partition.clone());
        debug!(partition = name, "opened partition store");
        Ok(partition)
    }
}

#[async_trait]
impl MessageStore for FileMessageStore {
    async fn store_message(&self, message: &mut Message, node_id: u8) -> Result<usize> {
        let partition = self.partition(message.path.partition())?;
        partition.store_message(message, node_id)
    }

    async fn generate_next_id(&self, partition: &str, node_id: u8) -> Result<(u64, i64)> {
        Ok(self.partition(partition)?.generate_next_id(node_id))
    }

    async fn max_message_id(&self, partition: &str) -> Result<u64> {
        Ok(self.partition(partition)?.max_id())
    }

    async fn fetch(&self, request: FetchRequest) -> Result<FetchResult> {
        let partition = self.partition(&request.partition)?;
        Ok(fetch::run(partition, request))
    }

    async fn check(&self) -> Result<()> {
        let ratio = free_space_ratio(&self.basedir)?;
        if ratio < MIN_FREE_SPACE {
            warn!(free = ratio, "storage is almost full");
            return Err(PushgError::StorageAlmostFull);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        info!("stopping message store");
        let partitions: Vec<(String, Arc<MessagePartition>)> = {
            let mut map = self.partitions.write().unwrap();
            map.drain().collect()
        };
        let mut errors = Vec::new();
        for (name, partition) in partitions {
            if let Err(err) = partition.close() {
                warn!(partition = %name, error = %err, "error closing partition");
                errors.push(format!("{}: {}", name, err));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(PushgError::Aggregate(errors))
        }
    }
}

/// Free space on the filesystem holding `path`, as a fraction of its total
/// size.
fn free_space_ratio(path: &FsPath) -> Result<f64> {
    use std::os::unix::ffi::OsStrExt;

    std::fs::create_dir_all(path)?;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| PushgError::InvalidPath(path.display().to_string()))?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    let free = stat.f_bavail as u64 * stat.f_frsize as u64;
    let total = stat.f_blocks as u64 * stat.f_frsize as u64;
    if total == 0 {
        return Ok(1.0);
    }
    Ok(free as f64 / total as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Path;
    use tempfile::TempDir;

    fn message(path: &str) -> Message {
        Message::new(Path::new(path).unwrap(), "payload")
    }

    #[tokio::test]
    async fn partitions_are_independent() {
        let dir = TempDir::new().unwrap();
        let store = FileMessageStore::new(dir.path());

        let mut a = message("/alpha/x");
        let mut b = message("/beta/y");
        store.store_message(&mut a, 0).await.unwrap();
        store.store_message(&mut b, 0).await.unwrap();

        assert_eq!(a.id, 1);
        assert_eq!(b.id, 1);
        assert_eq!(store.max_message_id("alpha").await.unwrap(), 1);
        assert_eq!(store.max_message_id("beta").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn max_id_of_untouched_partition_is_zero() {
        let dir = TempDir::new().unwrap();
        let store = FileMessageStore::new(dir.path());
        assert_eq!(store.max_message_id("nothing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn check_passes_on_a_normal_filesystem() {
        let dir = TempDir::new().unwrap();
        let store = FileMessageStore::new(dir.path());
        store.check().await.unwrap();
    }

    #[tokio::test]
    async fn stop_closes_partitions() {
        let dir = TempDir::new().unwrap();
        let store = FileMessageStore::new(dir.path());
        store.store_message(&mut message("/p/x"), 0).await.unwrap();
        store.stop().await.unwrap();
        assert!(dir.path().join("p").join("p-1.log").exists());
    }
}
