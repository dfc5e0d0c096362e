use bytes::Bytes;
use chrono::Utc;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::io::Write;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{PushgError, Result};
use crate::protocol::Message;

/// Number of messages per segment; when the current segment reaches this
/// count it is sealed and a new one begins at the next ID.
pub const MESSAGES_PER_FILE: u64 = 10_000;

/// Fixed size of one index record: offset (8 bytes), size (4 bytes),
/// node id (4 bytes, padded).
pub const INDEX_ENTRY_SIZE: u64 = 16;

/// One topic partition: an ordered set of segment file pairs
/// (`<partition>-<startID>.log` / `.idx`) plus the in-memory counters that
/// drive ID generation.
///
/// A single read/write lock protects the mutable state. The whole
/// allocate-ID + append + update-max sequence runs under one write-lock
/// acquisition, which is what makes IDs and timestamps co-monotonic.
pub struct MessagePartition {
    name: String,
    dir: PathBuf,
    inner: RwLock<PartitionInner>,
}

struct PartitionInner {
    /// Segment start IDs, ascending; the last one is the writable segment.
    segment_starts: Vec<u64>,
    append_log: File,
    append_idx: File,
    cur_start: u64,
    cur_entries: u64,
    cur_size: u64,
    /// Highest ID handed out or stored. The on-disk high-water mark is
    /// derived from the segment state instead (`stored_high`), so the two
    /// cannot drift apart.
    max_id: u64,
    /// Publication time of the newest appended message
    max_time: i64,
}

/// Highest ID present on disk, `0` when nothing was stored yet. IDs are
/// dense, so this is fully determined by the writable segment's start and
/// entry count.
fn stored_high(inner: &PartitionInner) -> u64 {
    if inner.cur_entries > 0 {
        inner.cur_start + inner.cur_entries - 1
    } else {
        inner.cur_start - 1
    }
}

impl MessagePartition {
    /// Opens (or creates) the partition directory under `basedir`, scanning
    /// existing segments and recovering the counters from the newest one.
    /// A dangling index tail (entry without its full data record) is
    /// dropped; the index is authoritative for everything it fully covers.
    pub fn open(basedir: &std::path::Path, name: &str) -> Result<Self> {
        let dir = basedir.join(name);
        fs::create_dir_all(&dir)?;

        let mut starts = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            if let Some(start) = parse_segment_start(&file_name.to_string_lossy(), name) {
                starts.push(start);
            }
        }
        starts.sort_unstable();
        starts.dedup();
        if starts.is_empty() {
            starts.push(1);
        }
        let cur_start = starts.last().copied().unwrap_or(1);

        let idx_path = segment_path(&dir, name, cur_start, "idx");
        let log_path = segment_path(&dir, name, cur_start, "log");
        let append_idx = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&idx_path)?;
        let append_log = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&log_path)?;

        let idx_len = append_idx.metadata()?.len();
        if idx_len % INDEX_ENTRY_SIZE != 0 {
            warn!(
                partition = name,
                segment = cur_start,
                len = idx_len,
                "index length is not a multiple of the entry size, truncating"
            );
        }
        let mut cur_entries = idx_len / INDEX_ENTRY_SIZE;
        let data_len = append_log.metadata()?.len();
        let mut cur_size = data_len;

        // Drop index entries whose data record is incomplete, then trim the
        // data file back to the end of the last fully indexed record.
        while cur_entries > 0 {
            let (offset, size, _) = read_index_entry(&append_idx, cur_entries - 1)?;
            let end = offset + size as u64;
            if data_len >= end {
                if data_len > end {
                    warn!(
                        partition = name,
                        segment = cur_start,
                        "data file has a partial trailing record, truncating"
                    );
                    append_log.set_len(end)?;
                }
                cur_size = end;
                break;
            }
            warn!(
                partition = name,
                segment = cur_start,
                entry = cur_entries - 1,
                "dropping index entry without a complete data record"
            );
            cur_entries -= 1;
        }
        append_idx.set_len(cur_entries * INDEX_ENTRY_SIZE)?;
        if cur_entries == 0 {
            append_log.set_len(0)?;
            cur_size = 0;
        }

        let max_id = if cur_entries > 0 {
            cur_start + cur_entries - 1
        } else {
            cur_start - 1
        };
        debug!(partition = name, max_id, segments = starts.len(), "opened partition");

        Ok(Self {
            name: name.to_owned(),
            dir,
            inner: RwLock::new(PartitionInner {
                segment_starts: starts,
                append_log,
                append_idx,
                cur_start,
                cur_entries,
                cur_size,
                max_id,
                max_time: 0,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Highest message ID ever stored, `0` when the partition is empty.
    pub fn max_id(&self) -> u64 {
        stored_high(&self.inner.read().unwrap())
    }

    /// Lowest stored message ID, `0` when the partition is empty.
    pub fn min_id(&self) -> u64 {
        let inner = self.inner.read().unwrap();
        if stored_high(&inner) == 0 {
            0
        } else {
            inner.segment_starts.first().copied().unwrap_or(0)
        }
    }

    /// Publication time of the newest stored message.
    pub fn max_timestamp(&self) -> i64 {
        self.inner.read().unwrap().max_time
    }

    /// Allocates the next message ID, capturing the timestamp inside the
    /// lock so IDs and times are co-monotonic. The allocated ID has to be
    /// appended next, before any other message.
    pub fn generate_next_id(&self, node_id: u8) -> (u64, i64) {
        let mut inner = self.inner.write().unwrap();
        inner.max_id += 1;
        let id = inner.max_id;
        let ts = Utc::now().timestamp();
        debug!(partition = %self.name, id, node_id, "generated message id");
        (id, ts)
    }

    /// Assigns an ID (unless the message already carries one from another
    /// cluster node) and appends the message. Returns the stored byte count.
    pub fn store_message(&self, message: &mut Message, node_id: u8) -> Result<usize> {
        let mut inner = self.inner.write().unwrap();

        if node_id == 0 || message.id == 0 {
            // assign the next slot the log will actually write; an unused
            // allocation from generate_next_id is taken over instead of
            // leaving a hole in the sequence
            let id = stored_high(&inner) + 1;
            inner.max_id = inner.max_id.max(id);
            message.id = id;
            message.time = Utc::now().timestamp();
            message.node_id = node_id;
        }
        let data = message.bytes();
        self.append_locked(&mut inner, message.id, message.node_id, &data)?;
        inner.max_time = message.time;
        Ok(data.len())
    }

    /// Appends pre-serialized message bytes under an explicit ID. The ID has
    /// to be the partition's next sequential one.
    pub fn store(&self, id: u64, node_id: u8, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        self.append_locked(&mut inner, id, node_id, data)
    }

    fn append_locked(
        &self,
        inner: &mut PartitionInner,
        id: u64,
        node_id: u8,
        data: &[u8],
    ) -> Result<()> {
        let next = stored_high(inner) + 1;
        if id != next {
            return Err(PushgError::InvalidMessage(format!(
                "non-sequential message id {} for partition {} (expected {})",
                id, self.name, next
            )));
        }

        if inner.cur_entries >= MESSAGES_PER_FILE {
            let log_path = segment_path(&self.dir, &self.name, id, "log");
            let idx_path = segment_path(&self.dir, &self.name, id, "idx");
            inner.append_log = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)?;
            inner.append_idx = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&idx_path)?;
            inner.cur_start = id;
            inner.cur_entries = 0;
            inner.cur_size = 0;
            inner.segment_starts.push(id);
            debug!(partition = %self.name, segment = id, "rolled over to new segment");
        }

        let offset = inner.cur_size;
        inner.append_log.write_all(data)?;

        let mut entry = [0u8; INDEX_ENTRY_SIZE as usize];
        entry[..8].copy_from_slice(&offset.to_le_bytes());
        entry[8..12].copy_from_slice(&(data.len() as u32).to_le_bytes());
        entry[12..16].copy_from_slice(&(node_id as u32).to_le_bytes());
        inner.append_idx.write_all(&entry)?;

        inner.cur_size += data.len() as u64;
        inner.cur_entries += 1;
        inner.max_id = inner.max_id.max(id);
        Ok(())
    }

    /// Reads up to `limit` consecutive messages starting at `first_id`, in
    /// ascending order. The read never crosses a segment boundary; callers
    /// loop to walk further. A partial trailing data record ends the result
    /// early; index corruption is an error.
    pub fn read_range(&self, first_id: u64, limit: usize) -> Result<Vec<(u64, Bytes)>> {
        let inner = self.inner.read().unwrap();
        let max = stored_high(&inner);
        if first_id == 0 || limit == 0 || first_id > max {
            return Ok(Vec::new());
        }

        let pos = inner.segment_starts.partition_point(|s| *s <= first_id);
        if pos == 0 {
            return Err(PushgError::NotFound(format!(
                "message {} in partition {}",
                first_id, self.name
            )));
        }
        let seg_start = inner.segment_starts[pos - 1];
        let seg_last = inner
            .segment_starts
            .get(pos)
            .map(|next| next - 1)
            .unwrap_or(max)
            .min(max);
        let count = ((seg_last - first_id + 1) as usize).min(limit);
        self.read_entries(seg_start, first_id, count)
    }

    /// Reads up to `limit` consecutive messages ending at `last_id`, in
    /// ascending order. The counterpart of `read_range` for backward walks:
    /// the result is anchored on `last_id` and confined to the segment
    /// holding it, so callers continue below the returned first ID.
    pub fn read_range_back(&self, last_id: u64, limit: usize) -> Result<Vec<(u64, Bytes)>> {
        let inner = self.inner.read().unwrap();
        let max = stored_high(&inner);
        if last_id == 0 || limit == 0 || max == 0 {
            return Ok(Vec::new());
        }
        let last = last_id.min(max);

        let pos = inner.segment_starts.partition_point(|s| *s <= last);
        if pos == 0 {
            return Err(PushgError::NotFound(format!(
                "message {} in partition {}",
                last, self.name
            )));
        }
        let seg_start = inner.segment_starts[pos - 1];
        let first = last.saturating_sub(limit as u64 - 1).max(seg_start);
        self.read_entries(seg_start, first, (last - first + 1) as usize)
    }

    fn read_entries(&self, seg_start: u64, first_id: u64, count: usize) -> Result<Vec<(u64, Bytes)>> {
        let idx = File::open(segment_path(&self.dir, &self.name, seg_start, "idx"))?;
        let mut log = File::open(segment_path(&self.dir, &self.name, seg_start, "log"))?;

        let mut result = Vec::with_capacity(count);
        for k in 0..count as u64 {
            let id = first_id + k;
            let (offset, size, _node) = read_index_entry(&idx, id - seg_start)?;
            log.seek(SeekFrom::Start(offset))?;
            let mut data = vec![0u8; size as usize];
            match log.read_exact(&mut data) {
                Ok(()) => result.push((id, Bytes::from(data))),
                // partial trailing record: the message is treated as absent
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(result)
    }

    /// Flushes the writable segment's handles to disk.
    pub fn close(&self) -> Result<()> {
        let inner = self.inner.write().unwrap();
        inner.append_log.sync_all()?;
        inner.append_idx.sync_all()?;
        Ok(())
    }
}

fn segment_path(dir: &std::path::Path, partition: &str, start: u64, ext: &str) -> PathBuf {
    dir.join(format!("{}-{}.{}", partition, start, ext))
}

fn parse_segment_start(file_name: &str, partition: &str) -> Option<u64> {
    file_name
        .strip_prefix(partition)?
        .strip_prefix('-')?
        .strip_suffix(".idx")?
        .parse()
        .ok()
}

/// Reads index entry `k` of a segment: `(offset, size, node_id)`.
/// Short or unreadable entries are reported as corruption.
fn read_index_entry(idx: &File, k: u64) -> Result<(u64, u32, u32)> {
    let mut buf = [0u8; INDEX_ENTRY_SIZE as usize];
    let mut handle = idx;
    handle.seek(SeekFrom::Start(k * INDEX_ENTRY_SIZE))?;
    handle
        .read_exact(&mut buf)
        .map_err(|_| PushgError::Corrupt(format!("short index entry {}", k)))?;
    let offset = u64::from_le_bytes(buf[..8].try_into().unwrap_or_default());
    let size = u32::from_le_bytes(buf[8..12].try_into().unwrap_or_default());
    let node = u32::from_le_bytes(buf[12..16].try_into().unwrap_or_default());
    Ok((offset, size, node))
}
