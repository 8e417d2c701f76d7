//! JSON snapshot stores under the data directory
//!
//! Layout:
//! - `ghosts/{bucket}.json`: change version and ghosts
//! - `objects/{bucket}.json`: bucket objects
//!
//! The in-memory stores do the work; every mutation rewrites the bucket's
//! snapshot through a temporary file. Writers to one snapshot are serialized
//! so a newer snapshot is never replaced by an older one.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use simperium_api::Ghost;
use tracing::{debug, warn};

use super::memory::{BucketGhosts, MemoryBucketStore, MemoryGhostStore};
use super::{BucketStore, GhostStore, StorageProvider};
use crate::bucket::{BucketObject, BucketSchema, Index, Query, QueryRow};
use crate::error::Result;

const GHOSTS_DIR: &str = "ghosts";
const OBJECTS_DIR: &str = "objects";

pub(crate) fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&serde_json::to_vec(value)?)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Reads a snapshot; a missing or unreadable file yields `None`.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = fs::read(path).ok()?;
    match serde_json::from_slice(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring unreadable snapshot {}: {}", path.display(), e);
            None
        }
    }
}

fn snapshot_path(dir: &Path, bucket: &str) -> PathBuf {
    dir.join(format!("{bucket}.json"))
}

pub struct FileGhostStore {
    dir: PathBuf,
    inner: MemoryGhostStore,
    write_lock: Mutex<()>,
}

impl FileGhostStore {
    /// Opens the store, loading every saved bucket.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref().join(GHOSTS_DIR);
        fs::create_dir_all(&dir)?;

        let inner = MemoryGhostStore::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(bucket) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if let Some(ghosts) = read_json::<BucketGhosts>(&path) {
                debug!("Loaded {} ghosts for bucket {}", ghosts.ghosts.len(), bucket);
                inner.load(bucket, ghosts);
            }
        }

        Ok(Self {
            dir,
            inner,
            write_lock: Mutex::new(()),
        })
    }

    fn persist(&self, bucket: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        write_json(&snapshot_path(&self.dir, bucket), &self.inner.snapshot(bucket))
    }
}

impl GhostStore for FileGhostStore {
    fn has_change_version(&self, bucket: &str) -> bool {
        self.inner.has_change_version(bucket)
    }

    fn get_change_version(&self, bucket: &str) -> Option<String> {
        self.inner.get_change_version(bucket)
    }

    fn set_change_version(&self, bucket: &str, version: &str) -> Result<()> {
        if version.is_empty() {
            return Ok(());
        }
        self.inner.set_change_version(bucket, version)?;
        self.persist(bucket)
    }

    fn has_ghost(&self, bucket: &str, key: &str) -> bool {
        self.inner.has_ghost(bucket, key)
    }

    fn get_ghost(&self, bucket: &str, key: &str) -> Result<Ghost> {
        self.inner.get_ghost(bucket, key)
    }

    fn save_ghost(&self, bucket: &str, ghost: &Ghost) -> Result<()> {
        self.inner.save_ghost(bucket, ghost)?;
        self.persist(bucket)
    }

    fn delete_ghost(&self, bucket: &str, key: &str) -> Result<()> {
        self.inner.delete_ghost(bucket, key)?;
        self.persist(bucket)
    }

    fn reset_bucket(&self, bucket: &str) -> Result<()> {
        self.inner.reset_bucket(bucket)?;
        let _guard = self.write_lock.lock();
        let path = snapshot_path(&self.dir, bucket);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

struct FileBucketStore {
    path: PathBuf,
    inner: MemoryBucketStore,
    write_lock: Mutex<()>,
}

impl FileBucketStore {
    fn open(path: PathBuf, schema: &BucketSchema) -> Result<Self> {
        let inner = MemoryBucketStore::new(schema);
        if let Some(objects) = read_json::<Vec<BucketObject>>(&path) {
            for object in objects {
                inner.save(&object, &schema.indexes_for(&object))?;
            }
        }
        Ok(Self {
            path,
            inner,
            write_lock: Mutex::new(()),
        })
    }

    fn persist(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        write_json(&self.path, &self.inner.all())
    }
}

impl BucketStore for FileBucketStore {
    fn save(&self, object: &BucketObject, indexes: &[Index]) -> Result<()> {
        self.inner.save(object, indexes)?;
        self.persist()
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key)?;
        self.persist()
    }

    fn reset(&self) -> Result<()> {
        self.inner.reset()?;
        self.persist()
    }

    fn get(&self, key: &str) -> Option<BucketObject> {
        self.inner.get(key)
    }

    fn all(&self) -> Vec<BucketObject> {
        self.inner.all()
    }

    fn search(&self, query: &Query) -> Vec<QueryRow> {
        self.inner.search(query)
    }

    fn count(&self, query: &Query) -> usize {
        self.inner.count(query)
    }
}

/// Bucket objects persisted as JSON snapshots
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: data_dir.as_ref().join(OBJECTS_DIR),
        }
    }
}

impl StorageProvider for FileStorage {
    fn create_store(&self, bucket_name: &str, schema: &BucketSchema) -> Result<Arc<dyn BucketStore>> {
        let store = FileBucketStore::open(snapshot_path(&self.dir, bucket_name), schema)?;
        Ok(Arc::new(store))
    }
}
