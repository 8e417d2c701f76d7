//! Persistence of queued and pending changes so they survive restarts

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use simperium_api::ChangeOperation;
use tracing::warn;

use super::file::{read_json, write_json};
use crate::channel::Change;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueStatus {
    /// Waiting to be sent
    #[serde(rename = "Q")]
    Queued,
    /// Sent, waiting for acknowledgement
    #[serde(rename = "P")]
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct QueueRow {
    bucket: String,
    key: String,
    status: QueueStatus,
    operation: ChangeOperation,
    ccid: String,
}

impl QueueRow {
    fn new(status: QueueStatus, change: &Change) -> Self {
        Self {
            bucket: change.bucket_name().to_string(),
            key: change.key().to_string(),
            status,
            operation: change.operation(),
            ccid: change.ccid().to_string(),
        }
    }

    fn is_change(&self, change: &Change) -> bool {
        self.bucket == change.bucket_name() && self.ccid == change.ccid()
    }
}

/// Changes restored for a bucket
#[derive(Debug, Default)]
pub struct SerializedQueue {
    /// Sent changes by object key
    pub pending: HashMap<String, Change>,
    /// Unsent changes in queue order
    pub queued: Vec<Change>,
}

/// Records the lifecycle of local changes
pub trait QueueSerializer: Send + Sync {
    fn restore(&self, bucket: &str) -> SerializedQueue;

    fn reset(&self, bucket: &str);

    /// Change was queued
    fn on_queue_change(&self, change: &Change);

    /// Change was dropped before being sent
    fn on_dequeue_change(&self, change: &Change);

    /// Change was sent and awaits acknowledgement
    fn on_send_change(&self, change: &Change);

    fn on_acknowledge_change(&self, change: &Change);
}

#[derive(Default)]
struct QueueRows {
    rows: Vec<QueueRow>,
}

impl QueueRows {
    fn restore(&self, bucket: &str) -> SerializedQueue {
        let mut queue = SerializedQueue::default();
        for row in self.rows.iter().filter(|row| row.bucket == bucket) {
            let change = Change::restore(row.operation, &row.ccid, &row.bucket, &row.key);
            match row.status {
                QueueStatus::Queued => queue.queued.push(change),
                QueueStatus::Pending => {
                    queue.pending.insert(row.key.clone(), change);
                }
            }
        }
        queue
    }

    fn reset(&mut self, bucket: &str) {
        self.rows.retain(|row| row.bucket != bucket);
    }

    fn insert(&mut self, status: QueueStatus, change: &Change) {
        self.rows.push(QueueRow::new(status, change));
    }

    fn update(&mut self, status: QueueStatus, change: &Change) {
        for row in self.rows.iter_mut().filter(|row| row.is_change(change)) {
            row.status = status;
        }
    }

    fn remove(&mut self, change: &Change) {
        self.rows.retain(|row| !row.is_change(change));
    }
}

#[derive(Default)]
pub struct MemoryQueueSerializer {
    rows: Mutex<QueueRows>,
}

impl MemoryQueueSerializer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueSerializer for MemoryQueueSerializer {
    fn restore(&self, bucket: &str) -> SerializedQueue {
        self.rows.lock().restore(bucket)
    }

    fn reset(&self, bucket: &str) {
        self.rows.lock().reset(bucket);
    }

    fn on_queue_change(&self, change: &Change) {
        self.rows.lock().insert(QueueStatus::Queued, change);
    }

    fn on_dequeue_change(&self, change: &Change) {
        self.rows.lock().remove(change);
    }

    fn on_send_change(&self, change: &Change) {
        self.rows.lock().update(QueueStatus::Pending, change);
    }

    fn on_acknowledge_change(&self, change: &Change) {
        self.rows.lock().remove(change);
    }
}

/// Queue rows kept in `queue.json`
pub struct FileQueueSerializer {
    path: PathBuf,
    rows: Mutex<QueueRows>,
}

impl FileQueueSerializer {
    pub const FILE_NAME: &'static str = "queue.json";

    pub fn open(data_dir: impl AsRef<Path>) -> Self {
        let path = data_dir.as_ref().join(Self::FILE_NAME);
        let rows = read_json::<Vec<QueueRow>>(&path).unwrap_or_default();
        Self {
            path,
            rows: Mutex::new(QueueRows { rows }),
        }
    }

    fn update(&self, apply: impl FnOnce(&mut QueueRows)) {
        let mut rows = self.rows.lock();
        apply(&mut rows);
        if let Err(e) = write_json(&self.path, &rows.rows) {
            warn!("Unable to save change queue to {}: {}", self.path.display(), e);
        }
    }
}

impl QueueSerializer for FileQueueSerializer {
    fn restore(&self, bucket: &str) -> SerializedQueue {
        self.rows.lock().restore(bucket)
    }

    fn reset(&self, bucket: &str) {
        self.update(|rows| rows.reset(bucket));
    }

    fn on_queue_change(&self, change: &Change) {
        self.update(|rows| rows.insert(QueueStatus::Queued, change));
    }

    fn on_dequeue_change(&self, change: &Change) {
        self.update(|rows| rows.remove(change));
    }

    fn on_send_change(&self, change: &Change) {
        self.update(|rows| rows.update(QueueStatus::Pending, change));
    }

    fn on_acknowledge_change(&self, change: &Change) {
        self.update(|rows| rows.remove(change));
    }
}
