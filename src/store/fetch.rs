use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::error::PushgError;
use crate::store::partition::MessagePartition;

/// Messages read per file-seek batch while streaming a fetch.
const FETCH_BATCH: usize = 100;

/// Capacity of the message channel handed to fetch consumers.
const FETCH_CHANNEL_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDirection {
    Forward,
    Backward,
}

/// A request for an asynchronous, bounded, ordered historical read.
///
/// `count == 0` means unbounded: everything available from `start_id` in
/// `direction`. The request is cheap to clone; channels are created when it
/// is submitted to the store.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub partition: String,
    pub start_id: u64,
    pub direction: FetchDirection,
    pub count: usize,
}

impl FetchRequest {
    pub fn new(
        partition: impl Into<String>,
        start_id: u64,
        count: usize,
        direction: FetchDirection,
    ) -> Self {
        Self {
            partition: partition.into(),
            start_id,
            direction,
            count,
        }
    }
}

/// One fetched message: its ID and the raw serialized bytes as stored.
/// Callers re-parse with [`crate::protocol::parse_message`] when needed.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub id: u64,
    pub bytes: Bytes,
}

/// Consumer side of a running fetch.
///
/// `start_c` resolves once with the number of messages the fetch will
/// produce; `message_c` then streams exactly that many messages in request
/// order and closes. A fatal error arrives on `error_c` instead, after which
/// both channels are closed.
pub struct FetchResult {
    pub start_c: oneshot::Receiver<usize>,
    pub message_c: mpsc::Receiver<FetchedMessage>,
    pub error_c: oneshot::Receiver<PushgError>,
}

/// Runs a fetch against one partition on the blocking thread pool and
/// returns the consumer channels immediately.
pub(crate) fn run(partition: Arc<MessagePartition>, request: FetchRequest) -> FetchResult {
    let (start_tx, start_rx) = oneshot::channel();
    let (message_tx, message_rx) = mpsc::channel(FETCH_CHANNEL_SIZE);
    let (error_tx, error_rx) = oneshot::channel();

    tokio::task::spawn_blocking(move || {
        if let Err(err) = stream(&partition, &request, start_tx, &message_tx) {
            error!(
                partition = %request.partition,
                start_id = request.start_id,
                error = %err,
                "fetch failed"
            );
            let _ = error_tx.send(err);
        }
    });

    FetchResult {
        start_c: start_rx,
        message_c: message_rx,
        error_c: error_rx,
    }
}

fn stream(
    partition: &MessagePartition,
    request: &FetchRequest,
    start_tx: oneshot::Sender<usize>,
    message_tx: &mpsc::Sender<FetchedMessage>,
) -> Result<(), PushgError> {
    // Snapshot the partition bounds at entry; messages committed after
    // submission are not required to appear.
    let max_id = partition.max_id();
    let min_id = partition.min_id();

    let (first, available) = match request.direction {
        FetchDirection::Forward => {
            if max_id == 0 || request.start_id > max_id {
                (request.start_id, 0)
            } else {
                let first = request.start_id.max(min_id);
                (first, (max_id - first + 1) as usize)
            }
        }
        FetchDirection::Backward => {
            if max_id == 0 || request.start_id < min_id {
                (request.start_id, 0)
            } else {
                let start = request.start_id.min(max_id);
                (start, (start - min_id + 1) as usize)
            }
        }
    };
    let total = if request.count == 0 {
        available
    } else {
        available.min(request.count)
    };

    if start_tx.send(total).is_err() {
        // consumer is gone before the fetch even started
        return Ok(());
    }
    debug!(
        partition = %request.partition,
        start_id = request.start_id,
        total,
        "starting fetch"
    );

    let mut produced = 0usize;
    match request.direction {
        FetchDirection::Forward => {
            let mut next = first;
            while produced < total {
                let batch = partition.read_range(next, FETCH_BATCH.min(total - produced))?;
                if batch.is_empty() {
                    break;
                }
                for (id, bytes) in batch {
                    next = id + 1;
                    produced += 1;
                    if message_tx.blocking_send(FetchedMessage { id, bytes }).is_err() {
                        return Ok(());
                    }
                }
            }
        }
        FetchDirection::Backward => {
            // anchor each read on the upper end so a window straddling a
            // segment boundary drains the newer segment first
            let mut upper = first;
            while produced < total {
                let batch = partition.read_range_back(upper, FETCH_BATCH.min(total - produced))?;
                let Some(batch_first) = batch.first().map(|(id, _)| *id) else {
                    break;
                };
                for (id, bytes) in batch.into_iter().rev() {
                    produced += 1;
                    if message_tx.blocking_send(FetchedMessage { id, bytes }).is_err() {
                        return Ok(());
                    }
                }
                if batch_first <= min_id {
                    break;
                }
                upper = batch_first - 1;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Message, Path};
    use tempfile::TempDir;

    fn partition_with(n: usize) -> (TempDir, Arc<MessagePartition>) {
        let dir = TempDir::new().unwrap();
        let partition = Arc::new(MessagePartition::open(dir.path(), "foo").unwrap());
        for i in 0..n {
            let mut m = Message::new(Path::new("/foo/bar").unwrap(), format!("m{}", i));
            partition.store_message(&mut m, 0).unwrap();
        }
        (dir, partition)
    }

    #[tokio::test]
    async fn forward_fetch_streams_in_order() {
        let (_dir, partition) = partition_with(3);
        let mut result = run(
            partition,
            FetchRequest::new("foo", 1, 100, FetchDirection::Forward),
        );

        assert_eq!(result.start_c.await.unwrap(), 3);
        let mut ids = Vec::new();
        while let Some(m) = result.message_c.recv().await {
            ids.push(m.id);
        }
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn backward_fetch_streams_in_reverse() {
        let (_dir, partition) = partition_with(5);
        let mut result = run(
            partition,
            FetchRequest::new("foo", 4, 3, FetchDirection::Backward),
        );

        assert_eq!(result.start_c.await.unwrap(), 3);
        let mut ids = Vec::new();
        while let Some(m) = result.message_c.recv().await {
            ids.push(m.id);
        }
        assert_eq!(ids, vec![4, 3, 2]);
    }

    #[tokio::test]
    async fn fetch_beyond_max_yields_nothing() {
        let (_dir, partition) = partition_with(2);
        let mut result = run(
            partition,
            FetchRequest::new("foo", 10, 100, FetchDirection::Forward),
        );

        assert_eq!(result.start_c.await.unwrap(), 0);
        assert!(result.message_c.recv().await.is_none());
    }

    #[tokio::test]
    async fn unbounded_count_fetches_everything() {
        let (_dir, partition) = partition_with(7);
        let mut result = run(
            partition,
            FetchRequest::new("foo", 1, 0, FetchDirection::Forward),
        );

        assert_eq!(result.start_c.await.unwrap(), 7);
        let mut n = 0;
        while result.message_c.recv().await.is_some() {
            n += 1;
        }
        assert_eq!(n, 7);
    }

    #[tokio::test]
    async fn fetched_bytes_reparse_to_the_message() {
        let (_dir, partition) = partition_with(1);
        let mut result = run(
            partition,
            FetchRequest::new("foo", 1, 1, FetchDirection::Forward),
        );

        assert_eq!(result.start_c.await.unwrap(), 1);
        let fetched = result.message_c.recv().await.unwrap();
        let message = crate::protocol::parse_message(&fetched.bytes).unwrap();
        assert_eq!(message.id, fetched.id);
        assert_eq!(message.body_as_string(), "m0");
    }
}
