//! Storage for objects, ghosts and the change queue
//!
//! Every store has an in-memory implementation and a JSON file
//! implementation that snapshots to the configured data directory.

mod file;
mod memory;
mod queue;

pub use file::{FileGhostStore, FileStorage};
pub use memory::{MemoryBucketStore, MemoryGhostStore, MemoryStorage};
pub use queue::{FileQueueSerializer, MemoryQueueSerializer, QueueSerializer, QueueStatus, SerializedQueue};

use std::sync::Arc;

use simperium_api::Ghost;

use crate::bucket::{BucketObject, BucketSchema, Index, Query, QueryRow};
use crate::error::Result;

/// Last synced server state: per bucket change version and object ghosts
pub trait GhostStore: Send + Sync {
    fn has_change_version(&self, bucket: &str) -> bool;

    /// Whether the saved change version equals `version`
    fn has_change_version_of(&self, bucket: &str, version: &str) -> bool {
        self.get_change_version(bucket).as_deref() == Some(version)
    }

    fn get_change_version(&self, bucket: &str) -> Option<String>;

    /// Saves the change version; an empty version is ignored.
    fn set_change_version(&self, bucket: &str, version: &str) -> Result<()>;

    fn has_ghost(&self, bucket: &str, key: &str) -> bool;

    /// Fails with `GhostMissing` when there is no ghost for `key`
    fn get_ghost(&self, bucket: &str, key: &str) -> Result<Ghost>;

    fn get_ghost_version(&self, bucket: &str, key: &str) -> Result<u64> {
        self.get_ghost(bucket, key).map(|ghost| ghost.version)
    }

    fn save_ghost(&self, bucket: &str, ghost: &Ghost) -> Result<()>;

    fn delete_ghost(&self, bucket: &str, key: &str) -> Result<()>;

    /// Drops all ghosts and the change version of the bucket
    fn reset_bucket(&self, bucket: &str) -> Result<()>;
}

/// Objects of one bucket
pub trait BucketStore: Send + Sync {
    /// Adds or replaces the object with its index values
    fn save(&self, object: &BucketObject, indexes: &[Index]) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;

    fn reset(&self) -> Result<()>;

    fn get(&self, key: &str) -> Option<BucketObject>;

    /// All objects ordered by key
    fn all(&self) -> Vec<BucketObject>;

    fn search(&self, query: &Query) -> Vec<QueryRow>;

    fn count(&self, query: &Query) -> usize;
}

/// Creates the store backing a bucket
pub trait StorageProvider: Send + Sync {
    fn create_store(&self, bucket_name: &str, schema: &BucketSchema) -> Result<Arc<dyn BucketStore>>;
}
