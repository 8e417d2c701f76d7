//! Buckets: named collections of synced objects
//!
//! A `Bucket` owns the local copy of its objects (`BucketStore`) and the
//! last known server state (`GhostStore`). Local edits go through `sync` and
//! `remove`, which queue changes on the bucket's channel. The channel calls
//! back into the bucket to apply remote changes and acknowledgements.

mod listener;
mod object;
mod query;
mod schema;

pub use listener::{BucketListener, ChangeType, RevisionsCallbacks};
pub use object::BucketObject;
pub use query::{
    ComparisonType, Condition, IndexedValues, Query, QueryRow, SortType, Sorter, compare_values,
};
pub use schema::{AutoIndexer, BucketSchema, FullTextIndex, Index, Indexer};

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use moka::sync::Cache;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use simperium_api::jsondiff::{self, JsonDiff, VALUE_KEY};
use simperium_api::protocol::LOG_DEBUG;
use simperium_api::{Ghost, RemoteChange, validate_bucket_name, validate_object_key};
use tracing::{debug, warn};

use crate::channel::Change;
use crate::config::DEFAULT_OBJECT_CACHE_SIZE;
use crate::error::{ClientError, Result};
use crate::storage::{BucketStore, GhostStore};
use crate::user::User;

/// Default age after which backup copies may be cleared
pub const BACKUP_STORE_RESET_DELAY: Duration = Duration::from_millis(5000);

fn object_cache(size: u64) -> Cache<String, BucketObject> {
    Cache::builder().max_capacity(size).build()
}

/// What a bucket needs from the channel that syncs it
pub trait BucketChannel: Send + Sync {
    /// Queues a modification of the object saved under `key`
    fn queue_local_change(&self, key: &str);

    fn queue_local_deletion(&self, key: &str);

    fn log(&self, level: i32, message: &str);

    fn start(&self);

    fn stop(&self);

    fn reset(&self);

    /// No local changes are queued or waiting for acknowledgement
    fn is_idle(&self) -> bool;

    fn get_revisions(
        &self,
        key: &str,
        since_version: u64,
        max_count: u64,
        callbacks: Arc<dyn RevisionsCallbacks>,
    );
}

/// Copies of recently saved objects, so a change can still be sent after the
/// object was deleted from storage. Cleared once the channel is idle and the
/// last copy is older than the reset delay.
struct BackupStore {
    objects: HashMap<String, BucketObject>,
    updated_at: Instant,
    clear_delay: Duration,
}

impl BackupStore {
    fn new(clear_delay: Duration) -> Self {
        Self {
            objects: HashMap::new(),
            updated_at: Instant::now(),
            clear_delay,
        }
    }

    fn put(&mut self, object: BucketObject, channel_idle: bool) {
        if channel_idle && self.updated_at.elapsed() > self.clear_delay {
            self.objects.clear();
        }
        self.objects.insert(object.key().to_string(), object);
        self.updated_at = Instant::now();
    }

    fn get(&self, key: &str) -> Option<BucketObject> {
        self.objects.get(key).cloned()
    }

    fn update_ghost(&mut self, ghost: &Ghost) {
        if let Some(object) = self.objects.get_mut(&ghost.key) {
            object.set_ghost(ghost.clone());
        }
    }
}

pub struct Bucket {
    name: String,
    schema: BucketSchema,
    user: Arc<User>,
    store: Arc<dyn BucketStore>,
    ghost_store: Arc<dyn GhostStore>,
    differ: JsonDiff,
    channel: RwLock<Option<Weak<dyn BucketChannel>>>,
    listeners: RwLock<Vec<Arc<dyn BucketListener>>>,
    backup: Mutex<BackupStore>,
    key_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Recently read or saved objects, without their ghosts
    cache: Cache<String, BucketObject>,
}

impl Bucket {
    pub fn new(
        name: &str,
        schema: BucketSchema,
        user: Arc<User>,
        store: Arc<dyn BucketStore>,
        ghost_store: Arc<dyn GhostStore>,
        differ: JsonDiff,
    ) -> Result<Self> {
        validate_bucket_name(name).map_err(|_| ClientError::BucketNameInvalid(name.to_string()))?;

        Ok(Self {
            name: name.to_string(),
            schema,
            user,
            store,
            ghost_store,
            differ,
            channel: RwLock::new(None),
            listeners: RwLock::new(Vec::new()),
            backup: Mutex::new(BackupStore::new(BACKUP_STORE_RESET_DELAY)),
            key_locks: DashMap::new(),
            cache: object_cache(DEFAULT_OBJECT_CACHE_SIZE),
        })
    }

    pub fn with_backup_clear_delay(self, delay: Duration) -> Self {
        *self.backup.lock() = BackupStore::new(delay);
        self
    }

    pub fn with_object_cache_size(mut self, size: u64) -> Self {
        self.cache = object_cache(size);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bucket name used on the server
    pub fn remote_name(&self) -> &str {
        self.schema.remote_name(&self.name)
    }

    pub fn schema(&self) -> &BucketSchema {
        &self.schema
    }

    pub fn user(&self) -> &Arc<User> {
        &self.user
    }

    pub fn differ(&self) -> &JsonDiff {
        &self.differ
    }

    pub fn set_channel(&self, channel: Weak<dyn BucketChannel>) {
        *self.channel.write() = Some(channel);
    }

    fn channel(&self) -> Option<Arc<dyn BucketChannel>> {
        self.channel.read().as_ref().and_then(Weak::upgrade)
    }

    pub fn log_level(&self, level: i32, message: &str) {
        if let Some(channel) = self.channel() {
            channel.log(level, message);
        }
    }

    pub fn log(&self, message: &str) {
        self.log_level(LOG_DEBUG, message);
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.key_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ============== Local edits ==============

    /// Saves the object and queues its changes for syncing. Save listeners
    /// are notified when the object differs from its ghost.
    pub fn sync(&self, object: &BucketObject) -> Result<()> {
        let key = object.key().to_string();
        let lock = self.key_lock(&key);
        let _guard = lock.lock();

        let modified = object.is_modified();
        self.save_object(object)?;
        self.store_backup_copy(object);

        match self.channel() {
            Some(channel) => channel.queue_local_change(&key),
            None => warn!("Bucket {} has no channel, change to {} not queued", self.name, key),
        }

        if modified {
            self.notify_listeners(|listener| listener.on_save_object(self, object));
        }
        Ok(())
    }

    /// Deletes the object and queues its removal on the server
    pub fn remove(&self, object: &BucketObject) -> Result<()> {
        let key = object.key().to_string();
        let lock = self.key_lock(&key);
        let _guard = lock.lock();

        if let Some(channel) = self.channel() {
            channel.queue_local_deletion(&key);
        }
        self.delete_object(&key)?;
        self.notify_listeners(|listener| listener.on_delete_object(self, object));
        Ok(())
    }

    fn store_backup_copy(&self, object: &BucketObject) {
        let idle = self.is_idle();
        self.backup.lock().put(object.clone(), idle);
    }

    fn update_backup_ghost(&self, ghost: &Ghost) {
        self.backup.lock().update_ghost(ghost);
    }

    // ============== Reading ==============

    /// Fetches the object with its current ghost
    pub fn get(&self, key: &str) -> Result<BucketObject> {
        let ghost = self
            .ghost_store
            .get_ghost(&self.name, key)
            .map_err(|_| ClientError::object_missing(&self.name, key))?;
        let mut object = match self.cache.get(key) {
            Some(object) => object,
            None => {
                let object = self
                    .store
                    .get(key)
                    .ok_or_else(|| ClientError::object_missing(&self.name, key))?;
                self.cache.insert(key.to_string(), object.clone());
                object
            }
        };

        object.set_ghost(ghost.clone());
        self.update_backup_ghost(&ghost);
        Ok(object)
    }

    /// Like `get`, falling back to a recently saved copy
    pub fn get_object_or_backup(&self, key: &str) -> Result<BucketObject> {
        match self.get(key) {
            Ok(object) => Ok(object),
            Err(e) => {
                let backup = self.backup.lock().get(key);
                match backup {
                    Some(object) => {
                        debug!("Fetched backup copy for {}", key);
                        Ok(object)
                    }
                    None => Err(e),
                }
            }
        }
    }

    pub fn get_ghost(&self, key: &str) -> Result<Ghost> {
        self.ghost_store.get_ghost(&self.name, key)
    }

    pub fn query(&self) -> Query {
        Query::new()
    }

    fn attach_ghost(&self, mut object: BucketObject) -> BucketObject {
        let ghost = self
            .ghost_store
            .get_ghost(&self.name, object.key())
            .unwrap_or_else(|_| Ghost::empty(object.key()));
        object.set_ghost(ghost);
        object
    }

    pub fn search(&self, query: &Query) -> Vec<QueryRow> {
        self.store
            .search(query)
            .into_iter()
            .map(|row| QueryRow {
                object: self.attach_ghost(row.object),
                fields: row.fields,
            })
            .collect()
    }

    pub fn count(&self, query: &Query) -> usize {
        self.store.count(query)
    }

    pub fn all_objects(&self) -> Vec<BucketObject> {
        self.store
            .all()
            .into_iter()
            .map(|object| self.attach_ghost(object))
            .collect()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.ghost_store.has_ghost(&self.name, key)
    }

    pub fn has_key_version(&self, key: &str, version: u64) -> bool {
        self.ghost_store
            .get_ghost(&self.name, key)
            .is_ok_and(|ghost| ghost.version == version)
    }

    pub fn get_key_version(&self, key: &str) -> Result<u64> {
        self.ghost_store.get_ghost_version(&self.name, key)
    }

    // ============== Creating objects ==============

    /// Key not used by any object in the bucket
    pub fn uuid(&self) -> String {
        loop {
            let key = crate::channel::new_ccid();
            if !self.contains_key(&key) {
                return key;
            }
        }
    }

    pub fn new_object(&self) -> Result<BucketObject> {
        self.insert_object(&self.uuid(), Map::new())
    }

    pub fn new_object_with_key(&self, key: &str) -> Result<BucketObject> {
        self.insert_object(key, Map::new())
    }

    /// Builds a new object with defaults applied and an empty ghost. The
    /// object is stored once it is synced.
    pub fn insert_object(&self, key: &str, properties: Map<String, Value>) -> Result<BucketObject> {
        let key = validate_object_key(key).map_err(|_| ClientError::ObjectKeyInvalid(key.to_string()))?;
        let object = self.schema.build(key, properties);
        self.ghost_store.save_ghost(&self.name, object.ghost())?;
        Ok(object)
    }

    /// Object built from a ghost, with defaults applied
    pub(crate) fn build_object(&self, ghost: Ghost) -> BucketObject {
        let mut object = self.schema.build(&ghost.key, ghost.properties.clone());
        object.set_ghost(ghost);
        object
    }

    fn save_object(&self, object: &BucketObject) -> Result<()> {
        let saved = self.store.save(object, &self.schema.indexes_for(object));
        match &saved {
            Ok(()) => self.cache.insert(object.key().to_string(), object.clone()),
            Err(_) => self.cache.invalidate(object.key()),
        }
        saved
    }

    fn delete_object(&self, key: &str) -> Result<()> {
        self.cache.invalidate(key);
        self.store.delete(key)
    }

    /// Stores an object downloaded while indexing
    pub fn add_object_with_ghost(&self, ghost: Ghost) -> Result<()> {
        self.ghost_store.save_ghost(&self.name, &ghost)?;
        let object = self.build_object(ghost);
        self.save_object(&object)
    }

    fn update_object_with_ghost(&self, ghost: &Ghost) -> Result<()> {
        self.ghost_store.save_ghost(&self.name, ghost)?;
        let object = self.schema.build(&ghost.key, ghost.properties.clone());
        self.save_object(&object)
    }

    /// Replaces the ghost with a newer server version, keeping local
    /// modifications that were not sent yet.
    pub fn update_ghost(&self, ghost: Ghost) -> Result<()> {
        let mut object = match self.get(&ghost.key) {
            Ok(object) => object,
            Err(_) => return self.update_object_with_ghost(&ghost),
        };

        if object.is_modified() {
            let local_ghost = object.ghost().properties.clone();
            match self.merge_local_modifications(&local_ghost, object.properties(), &ghost) {
                Ok(properties) => {
                    self.schema.update(&mut object, properties);
                    self.ghost_store.save_ghost(&self.name, &ghost)?;
                    object.set_ghost(ghost);
                    self.save_object(&object)?;
                }
                Err(e) => {
                    debug!("Dropping local modifications to {}: {}", ghost.key, e);
                    self.update_object_with_ghost(&ghost)?;
                }
            }
        } else {
            self.update_object_with_ghost(&ghost)?;
        }

        self.notify_network_change(ChangeType::Modify, Some(object.key()));
        Ok(())
    }

    /// Rebases the local diff from `origin` onto the properties of `ghost`
    fn merge_local_modifications(
        &self,
        origin: &Map<String, Value>,
        local: &Map<String, Value>,
        ghost: &Ghost,
    ) -> Result<Map<String, Value>> {
        let local_patch = patch_of(self.differ.diff_objects(origin, local));
        let remote_patch = patch_of(self.differ.diff_objects(origin, &ghost.properties));
        let transformed = self.differ.transform_object(&local_patch, &remote_patch, origin)?;
        Ok(jsondiff::apply_object(&ghost.properties, &transformed)?)
    }

    // ============== Remote changes ==============

    /// Records the server's acknowledgement of a local change
    pub fn acknowledge_change(&self, remote: &RemoteChange, change: &Change) -> Result<Option<Ghost>> {
        let invalid = |e: ClientError| ClientError::RemoteChangeInvalid(format!("{remote}: {e}"));

        let ghost = if remote.is_remove() {
            self.ghost_store.delete_ghost(&self.name, &remote.key)?;
            None
        } else {
            let object = self.get_object_or_backup(&remote.key).map_err(invalid)?;
            let ghost = remote.apply(object.ghost()).map_err(|e| invalid(e.into()))?;
            self.ghost_store.save_ghost(&self.name, &ghost)?;
            self.update_backup_ghost(&ghost);
            Some(ghost)
        };

        debug!("Acknowledged {} for {}", change, remote);
        self.set_change_version(remote.change_version())?;
        Ok(ghost)
    }

    /// Applies another client's change, merging it into unsent local
    /// modifications of the object.
    pub fn apply_remote_change(&self, remote: &RemoteChange) -> Result<Option<Ghost>> {
        let invalid = |e: ClientError| ClientError::RemoteChangeInvalid(format!("{remote}: {e}"));

        let updated_ghost = if remote.is_remove() {
            let object = self.get(&remote.key).map_err(invalid)?;
            self.delete_object(object.key())?;
            self.ghost_store.delete_ghost(&self.name, &remote.key)?;
            None
        } else if remote.is_add() {
            let key = validate_object_key(&remote.key)
                .map_err(|_| invalid(ClientError::ObjectKeyInvalid(remote.key.clone())))?;
            let ghost = remote
                .apply(&Ghost::empty(key))
                .map_err(|e| invalid(e.into()))?;
            self.ghost_store.save_ghost(&self.name, &ghost)?;
            self.update_backup_ghost(&ghost);
            let object = self.build_object(ghost.clone());
            self.save_object(&object)?;
            Some(ghost)
        } else {
            let mut object = self.get_object_or_backup(&remote.key).map_err(invalid)?;
            self.notify_listeners(|listener| listener.on_before_update_object(self, &object));

            let origin = object.ghost().properties.clone();
            let local_diff = self.differ.diff_objects(&origin, object.properties());
            let ghost = remote.apply(object.ghost()).map_err(|e| invalid(e.into()))?;

            self.ghost_store.save_ghost(&self.name, &ghost)?;
            self.update_backup_ghost(&ghost);

            let mut properties = ghost.properties.clone();
            if let (Some(local_diff), Some(remote_patch)) = (local_diff, remote.patch.as_ref()) {
                let local_patch = patch_of(Some(local_diff));
                match self
                    .differ
                    .transform_object(&local_patch, remote_patch, &origin)
                    .and_then(|transformed| jsondiff::apply_object(&properties, &transformed))
                {
                    Ok(merged) => properties = merged,
                    Err(e) => debug!("Local modifications to {} cannot be merged: {}", remote.key, e),
                }
            }

            self.schema.update(&mut object, properties);
            object.set_ghost(ghost.clone());
            self.save_object(&object)?;
            Some(ghost)
        };

        self.set_change_version(remote.change_version())?;

        let change_type = if remote.is_add() {
            ChangeType::Insert
        } else if remote.is_remove() {
            ChangeType::Remove
        } else {
            ChangeType::Modify
        };
        self.notify_network_change(change_type, Some(&remote.key));
        Ok(updated_ghost)
    }

    // ============== Change version ==============

    pub fn has_change_version(&self) -> bool {
        self.ghost_store.has_change_version(&self.name)
    }

    /// Current change version, empty when the bucket was never indexed
    pub fn get_change_version(&self) -> String {
        self.ghost_store.get_change_version(&self.name).unwrap_or_default()
    }

    pub fn set_change_version(&self, version: &str) -> Result<()> {
        self.ghost_store.set_change_version(&self.name, version)
    }

    pub fn index_complete(&self, change_version: &str) -> Result<()> {
        self.set_change_version(change_version)?;
        self.notify_network_change(ChangeType::Index, None);
        Ok(())
    }

    // ============== Lifecycle ==============

    pub fn start(&self) {
        if let Some(channel) = self.channel() {
            channel.start();
        }
    }

    pub fn stop(&self) {
        if let Some(channel) = self.channel() {
            channel.stop();
        }
    }

    /// Whether every local change has been sent and acknowledged
    pub fn is_idle(&self) -> bool {
        self.channel().is_none_or(|channel| channel.is_idle())
    }

    /// Drops all local data and stops syncing
    pub fn reset(&self) -> Result<()> {
        self.cache.invalidate_all();
        self.store.reset()?;
        self.ghost_store.reset_bucket(&self.name)?;
        if let Some(channel) = self.channel() {
            channel.reset();
        }
        self.stop();
        self.notify_network_change(ChangeType::Reset, None);
        Ok(())
    }

    /// Requests up to `max_count` earlier versions of the object; 0 means all
    pub fn get_revisions(&self, key: &str, max_count: u64, callbacks: Arc<dyn RevisionsCallbacks>) -> Result<()> {
        let version = match self.ghost_store.get_ghost_version(&self.name, key) {
            Ok(version) => version,
            Err(e) => {
                callbacks.on_error(ClientError::ghost_missing(&self.name, key));
                return Err(e);
            }
        };
        self.get_revisions_since(key, version, max_count, callbacks);
        Ok(())
    }

    pub fn get_revisions_since(
        &self,
        key: &str,
        since_version: u64,
        max_count: u64,
        callbacks: Arc<dyn RevisionsCallbacks>,
    ) {
        match self.channel() {
            Some(channel) => channel.get_revisions(key, since_version, max_count, callbacks),
            None => callbacks.on_error(ClientError::NotConnected),
        }
    }

    // ============== Listeners ==============

    pub fn add_listener(&self, listener: Arc<dyn BucketListener>) {
        self.listeners.write().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn BucketListener>) {
        self.listeners
            .write()
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    /// Calls every listener; a panicking listener is logged and skipped.
    fn notify_listeners(&self, notify: impl Fn(&dyn BucketListener)) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| notify(listener.as_ref()))).is_err() {
                warn!("Listener for bucket {} panicked", self.name);
            }
        }
    }

    pub fn notify_network_change(&self, change_type: ChangeType, key: Option<&str>) {
        self.notify_listeners(|listener| listener.on_network_change(self, change_type, key));
    }
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("name", &self.name)
            .field("remote_name", &self.remote_name())
            .finish()
    }
}

/// Body of an object diff, empty when there is no diff
fn patch_of(diff: Option<Value>) -> Map<String, Value> {
    match diff.and_then(|mut diff| diff.get_mut(VALUE_KEY).map(Value::take)) {
        Some(Value::Object(patch)) => patch,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryBucketStore, MemoryGhostStore};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingChannel {
        changes: Mutex<Vec<String>>,
        deletions: Mutex<Vec<String>>,
    }

    impl BucketChannel for RecordingChannel {
        fn queue_local_change(&self, key: &str) {
            self.changes.lock().push(key.to_string());
        }
        fn queue_local_deletion(&self, key: &str) {
            self.deletions.lock().push(key.to_string());
        }
        fn log(&self, _level: i32, _message: &str) {}
        fn start(&self) {}
        fn stop(&self) {}
        fn reset(&self) {}
        fn is_idle(&self) -> bool {
            true
        }
        fn get_revisions(&self, _key: &str, _since: u64, _max: u64, callbacks: Arc<dyn RevisionsCallbacks>) {
            callbacks.on_complete(Default::default());
        }
    }

    #[derive(Default)]
    struct CountingListener {
        saves: AtomicUsize,
        deletes: AtomicUsize,
        network: Mutex<Vec<(ChangeType, Option<String>)>>,
    }

    impl BucketListener for CountingListener {
        fn on_save_object(&self, _bucket: &Bucket, _object: &BucketObject) {
            self.saves.fetch_add(1, Ordering::SeqCst);
        }
        fn on_delete_object(&self, _bucket: &Bucket, _object: &BucketObject) {
            self.deletes.fetch_add(1, Ordering::SeqCst);
        }
        fn on_network_change(&self, _bucket: &Bucket, change_type: ChangeType, key: Option<&str>) {
            self.network.lock().push((change_type, key.map(str::to_string)));
        }
    }

    fn props(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn bucket() -> (Bucket, Arc<RecordingChannel>) {
        let schema = BucketSchema::new().auto_index();
        let bucket = Bucket::new(
            "notes",
            schema.clone(),
            Arc::new(User::new()),
            Arc::new(MemoryBucketStore::new(&schema)),
            Arc::new(MemoryGhostStore::new()),
            JsonDiff::new(),
        )
        .unwrap();
        let channel = Arc::new(RecordingChannel::default());
        let weak: Weak<dyn BucketChannel> = Arc::downgrade(&(channel.clone() as Arc<dyn BucketChannel>));
        bucket.set_channel(weak);
        (bucket, channel)
    }

    fn remote(value: Value) -> RemoteChange {
        RemoteChange::from_value(value).unwrap()
    }

    #[test]
    fn test_invalid_names() {
        let schema = BucketSchema::new();
        let result = Bucket::new(
            "bad name",
            schema.clone(),
            Arc::new(User::new()),
            Arc::new(MemoryBucketStore::new(&schema)),
            Arc::new(MemoryGhostStore::new()),
            JsonDiff::new(),
        );
        assert!(matches!(result, Err(ClientError::BucketNameInvalid(_))));

        let (bucket, _) = bucket();
        assert!(matches!(
            bucket.insert_object("bad key!", Map::new()),
            Err(ClientError::ObjectKeyInvalid(_))
        ));
        assert_eq!(bucket.insert_object("  padded ", Map::new()).unwrap().key(), "padded");
    }

    #[test]
    fn test_sync_queues_change_and_notifies() {
        let (bucket, channel) = bucket();
        let listener = Arc::new(CountingListener::default());
        bucket.add_listener(listener.clone());

        let mut object = bucket.new_object_with_key("a").unwrap();
        object.set("title", "Hello").unwrap();
        bucket.sync(&object).unwrap();

        assert_eq!(channel.changes.lock().as_slice(), ["a".to_string()]);
        assert_eq!(listener.saves.load(Ordering::SeqCst), 1);
        assert_eq!(bucket.get("a").unwrap().get("title"), Some(&json!("Hello")));

        let unchanged = bucket.get("a").unwrap();
        let mut ghost_synced = unchanged.clone();
        ghost_synced.set_ghost(Ghost::new("a", 1, unchanged.properties().clone()));
        bucket.sync(&ghost_synced).unwrap();
        assert_eq!(listener.saves.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_queues_deletion() {
        let (bucket, channel) = bucket();
        let listener = Arc::new(CountingListener::default());
        bucket.add_listener(listener.clone());

        let object = bucket.new_object_with_key("a").unwrap();
        bucket.sync(&object).unwrap();
        bucket.remove(&object).unwrap();

        assert_eq!(channel.deletions.lock().as_slice(), ["a".to_string()]);
        assert_eq!(listener.deletes.load(Ordering::SeqCst), 1);
        assert!(bucket.get("a").is_err());
        assert_eq!(bucket.get_object_or_backup("a").unwrap().key(), "a");
    }

    #[test]
    fn test_apply_remote_add_modify_remove() {
        let (bucket, _) = bucket();
        let listener = Arc::new(CountingListener::default());
        bucket.add_listener(listener.clone());

        bucket
            .apply_remote_change(&remote(json!({
                "id": "n", "o": "M", "ev": 1, "cv": "cv1",
                "v": {"title": {"o": "+", "v": "Hi"}}
            })))
            .unwrap();
        assert_eq!(bucket.get("n").unwrap().get("title"), Some(&json!("Hi")));
        assert_eq!(bucket.get_change_version(), "cv1");

        bucket
            .apply_remote_change(&remote(json!({
                "id": "n", "o": "M", "sv": 1, "ev": 2, "cv": "cv2",
                "v": {"title": {"o": "d", "v": "=2\t+!"}}
            })))
            .unwrap();
        assert_eq!(bucket.get("n").unwrap().get("title"), Some(&json!("Hi!")));
        assert!(bucket.has_key_version("n", 2));

        bucket
            .apply_remote_change(&remote(json!({"id": "n", "o": "-", "ev": 3, "cv": "cv3"})))
            .unwrap();
        assert!(!bucket.contains_key("n"));

        let events: Vec<ChangeType> = listener.network.lock().iter().map(|(t, _)| *t).collect();
        assert_eq!(events, vec![ChangeType::Insert, ChangeType::Modify, ChangeType::Remove]);
    }

    #[test]
    fn test_remote_modify_merges_local_edits() {
        let (bucket, _) = bucket();
        bucket
            .add_object_with_ghost(Ghost::new("n", 1, props(json!({"title": "Hello", "body": "x"}))))
            .unwrap();

        let mut local = bucket.get("n").unwrap();
        local.set("body", "local body").unwrap();
        bucket.sync(&local).unwrap();

        bucket
            .apply_remote_change(&remote(json!({
                "id": "n", "o": "M", "sv": 1, "ev": 2, "cv": "cv2",
                "v": {"title": {"o": "r", "v": "Remote"}}
            })))
            .unwrap();

        let merged = bucket.get("n").unwrap();
        assert_eq!(merged.get("title"), Some(&json!("Remote")));
        assert_eq!(merged.get("body"), Some(&json!("local body")));
        assert_eq!(merged.version(), 2);
        assert!(merged.is_modified());
    }

    #[test]
    fn test_remote_string_conflict_keeps_other_local_edits() {
        let (bucket, _) = bucket();
        bucket
            .add_object_with_ghost(Ghost::new("n", 1, props(json!({"title": "abcdef", "body": "x"}))))
            .unwrap();

        let mut local = bucket.get("n").unwrap();
        local.set("title", "abXef").unwrap();
        local.set("body", "local body").unwrap();
        bucket.sync(&local).unwrap();

        bucket
            .apply_remote_change(&remote(json!({
                "id": "n", "o": "M", "sv": 1, "ev": 2, "cv": "cv2",
                "v": {"title": {"o": "d", "v": "=1\t-3\t=2"}}
            })))
            .unwrap();

        let merged = bucket.get("n").unwrap();
        assert_eq!(merged.get("title"), Some(&json!("aef")));
        assert_eq!(merged.get("body"), Some(&json!("local body")));
        assert!(merged.is_modified());
    }

    #[test]
    fn test_remote_deletion_next_to_local_insert_merges() {
        let (bucket, _) = bucket();
        bucket
            .add_object_with_ghost(Ghost::new("n", 1, props(json!({"title": "abc", "body": "x"}))))
            .unwrap();

        let mut local = bucket.get("n").unwrap();
        local.set("title", "abcd").unwrap();
        local.set("body", "local body").unwrap();
        bucket.sync(&local).unwrap();

        bucket
            .apply_remote_change(&remote(json!({
                "id": "n", "o": "M", "sv": 1, "ev": 2, "cv": "cv2",
                "v": {"title": {"o": "d", "v": "=2\t-1"}}
            })))
            .unwrap();

        let merged = bucket.get("n").unwrap();
        assert_eq!(merged.get("title"), Some(&json!("abd")));
        assert_eq!(merged.get("body"), Some(&json!("local body")));
    }

    #[test]
    fn test_cached_objects_follow_store() {
        let (bucket, _) = bucket();
        let mut object = bucket.new_object_with_key("a").unwrap();
        object.set("title", "First").unwrap();
        bucket.sync(&object).unwrap();
        assert_eq!(bucket.cache.get("a").unwrap().get("title"), Some(&json!("First")));

        object.set("title", "Second").unwrap();
        bucket.sync(&object).unwrap();
        assert_eq!(bucket.get("a").unwrap().get("title"), Some(&json!("Second")));

        bucket.remove(&object).unwrap();
        assert!(bucket.cache.get("a").is_none());
        assert!(bucket.get("a").is_err());
    }

    #[test]
    fn test_remote_remove_of_unknown_object_is_invalid() {
        let (bucket, _) = bucket();
        let result = bucket.apply_remote_change(&remote(json!({"id": "x", "o": "-", "ev": 2})));
        assert!(matches!(result, Err(ClientError::RemoteChangeInvalid(_))));
    }

    #[test]
    fn test_acknowledge_change_updates_ghost() {
        let (bucket, _) = bucket();
        let mut object = bucket.new_object_with_key("a").unwrap();
        object.set("title", "Hi").unwrap();
        bucket.sync(&object).unwrap();

        let change = Change::modify("notes", "a");
        let ack = remote(json!({
            "id": "a", "o": "M", "ev": 1, "cv": "cv1", "ccids": [change.ccid()],
            "v": {"title": {"o": "+", "v": "Hi"}}
        }));
        let ghost = bucket.acknowledge_change(&ack, &change).unwrap().unwrap();
        assert_eq!(ghost.version, 1);

        let acknowledged = bucket.get("a").unwrap();
        assert!(!acknowledged.is_modified());
        assert_eq!(bucket.get_change_version(), "cv1");
    }

    #[test]
    fn test_update_ghost_keeps_local_modifications() {
        let (bucket, _) = bucket();
        bucket
            .add_object_with_ghost(Ghost::new("n", 1, props(json!({"a": 1, "b": 1}))))
            .unwrap();
        let mut local = bucket.get("n").unwrap();
        local.set("a", 2).unwrap();
        bucket.sync(&local).unwrap();

        bucket
            .update_ghost(Ghost::new("n", 3, props(json!({"a": 1, "b": 5}))))
            .unwrap();
        let updated = bucket.get("n").unwrap();
        assert_eq!(updated.version(), 3);
        assert_eq!(updated.get("a"), Some(&json!(2)));
        assert_eq!(updated.get("b"), Some(&json!(5)));
    }

    #[test]
    fn test_reset_clears_data() {
        let (bucket, _) = bucket();
        let listener = Arc::new(CountingListener::default());
        bucket.add_listener(listener.clone());
        bucket.add_object_with_ghost(Ghost::new("n", 1, Map::new())).unwrap();
        bucket.set_change_version("cv").unwrap();

        bucket.reset().unwrap();
        assert!(!bucket.has_change_version());
        assert!(bucket.all_objects().is_empty());
        assert_eq!(listener.network.lock().last().map(|(t, _)| *t), Some(ChangeType::Reset));
    }

    #[test]
    fn test_panicking_listener_is_skipped() {
        struct Panics;
        impl BucketListener for Panics {
            fn on_network_change(&self, _bucket: &Bucket, _change_type: ChangeType, _key: Option<&str>) {
                panic!("listener failure");
            }
        }

        let (bucket, _) = bucket();
        let counting = Arc::new(CountingListener::default());
        bucket.add_listener(Arc::new(Panics));
        bucket.add_listener(counting.clone());
        bucket.index_complete("cv").unwrap();
        assert_eq!(counting.network.lock().len(), 1);
    }

    #[test]
    fn test_revisions_without_ghost_fail() {
        struct Callbacks(AtomicUsize);
        impl RevisionsCallbacks for Callbacks {
            fn on_complete(&self, _revisions: std::collections::BTreeMap<u64, BucketObject>) {}
            fn on_error(&self, _error: ClientError) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (bucket, _) = bucket();
        let callbacks = Arc::new(Callbacks(AtomicUsize::new(0)));
        assert!(bucket.get_revisions("missing", 0, callbacks.clone()).is_err());
        assert_eq!(callbacks.0.load(Ordering::SeqCst), 1);
    }
}
