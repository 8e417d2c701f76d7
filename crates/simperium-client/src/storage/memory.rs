use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use simperium_api::Ghost;

use super::{BucketStore, GhostStore, StorageProvider};
use crate::bucket::{BucketObject, BucketSchema, FullTextIndex, Index, IndexedValues, Query, QueryRow};
use crate::error::{ClientError, Result};

/// Ghosts and change version of one bucket
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketGhosts {
    #[serde(default)]
    pub change_version: Option<String>,
    #[serde(default)]
    pub ghosts: HashMap<String, Ghost>,
}

#[derive(Default)]
pub struct MemoryGhostStore {
    buckets: RwLock<HashMap<String, BucketGhosts>>,
}

impl MemoryGhostStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn snapshot(&self, bucket: &str) -> BucketGhosts {
        self.buckets.read().get(bucket).cloned().unwrap_or_default()
    }

    pub(crate) fn load(&self, bucket: &str, ghosts: BucketGhosts) {
        self.buckets.write().insert(bucket.to_string(), ghosts);
    }
}

impl GhostStore for MemoryGhostStore {
    fn has_change_version(&self, bucket: &str) -> bool {
        self.buckets
            .read()
            .get(bucket)
            .is_some_and(|ghosts| ghosts.change_version.is_some())
    }

    fn get_change_version(&self, bucket: &str) -> Option<String> {
        self.buckets
            .read()
            .get(bucket)
            .and_then(|ghosts| ghosts.change_version.clone())
    }

    fn set_change_version(&self, bucket: &str, version: &str) -> Result<()> {
        if version.is_empty() {
            return Ok(());
        }
        self.buckets
            .write()
            .entry(bucket.to_string())
            .or_default()
            .change_version = Some(version.to_string());
        Ok(())
    }

    fn has_ghost(&self, bucket: &str, key: &str) -> bool {
        self.buckets
            .read()
            .get(bucket)
            .is_some_and(|ghosts| ghosts.ghosts.contains_key(key))
    }

    fn get_ghost(&self, bucket: &str, key: &str) -> Result<Ghost> {
        self.buckets
            .read()
            .get(bucket)
            .and_then(|ghosts| ghosts.ghosts.get(key).cloned())
            .ok_or_else(|| ClientError::ghost_missing(bucket, key))
    }

    fn save_ghost(&self, bucket: &str, ghost: &Ghost) -> Result<()> {
        self.buckets
            .write()
            .entry(bucket.to_string())
            .or_default()
            .ghosts
            .insert(ghost.key.clone(), ghost.clone());
        Ok(())
    }

    fn delete_ghost(&self, bucket: &str, key: &str) -> Result<()> {
        if let Some(ghosts) = self.buckets.write().get_mut(bucket) {
            ghosts.ghosts.remove(key);
        }
        Ok(())
    }

    fn reset_bucket(&self, bucket: &str) -> Result<()> {
        self.buckets.write().remove(bucket);
        Ok(())
    }
}

struct StoredObject {
    object: BucketObject,
    indexes: Vec<Index>,
    full_text: BTreeMap<String, String>,
}

impl StoredObject {
    fn values(&self) -> IndexedValues<'_> {
        IndexedValues {
            indexes: &self.indexes,
            full_text: &self.full_text,
        }
    }
}

/// Objects of a bucket kept in memory; queries are evaluated against the
/// saved index values.
pub struct MemoryBucketStore {
    full_text_index: Option<FullTextIndex>,
    objects: RwLock<BTreeMap<String, StoredObject>>,
}

impl MemoryBucketStore {
    pub fn new(schema: &BucketSchema) -> Self {
        Self {
            full_text_index: schema.full_text_index().cloned(),
            objects: RwLock::new(BTreeMap::new()),
        }
    }
}

impl BucketStore for MemoryBucketStore {
    fn save(&self, object: &BucketObject, indexes: &[Index]) -> Result<()> {
        let full_text = self
            .full_text_index
            .as_ref()
            .map(|index| index.index(object))
            .unwrap_or_default();
        self.objects.write().insert(
            object.key().to_string(),
            StoredObject {
                object: object.clone(),
                indexes: indexes.to_vec(),
                full_text,
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.objects.write().remove(key);
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        self.objects.write().clear();
        Ok(())
    }

    fn get(&self, key: &str) -> Option<BucketObject> {
        self.objects.read().get(key).map(|stored| stored.object.clone())
    }

    fn all(&self) -> Vec<BucketObject> {
        self.objects
            .read()
            .values()
            .map(|stored| stored.object.clone())
            .collect()
    }

    fn search(&self, query: &Query) -> Vec<QueryRow> {
        let objects = self.objects.read();
        let mut matches: Vec<&StoredObject> = objects
            .values()
            .filter(|stored| query.matches(&stored.values()))
            .collect();
        matches.sort_by(|a, b| {
            query.compare((&a.object, &a.values()), (&b.object, &b.values()))
        });
        query
            .page(matches)
            .into_iter()
            .map(|stored| query.row(&stored.object, &stored.values()))
            .collect()
    }

    fn count(&self, query: &Query) -> usize {
        let objects = self.objects.read();
        let count = objects
            .values()
            .filter(|stored| query.matches(&stored.values()))
            .count();
        let count = count.saturating_sub(query.get_offset().unwrap_or(0));
        query.get_limit().map_or(count, |limit| count.min(limit))
    }
}

#[derive(Default)]
pub struct MemoryStorage;

impl MemoryStorage {
    pub fn new() -> Self {
        Self
    }
}

impl StorageProvider for MemoryStorage {
    fn create_store(&self, _bucket_name: &str, schema: &BucketSchema) -> Result<Arc<dyn BucketStore>> {
        Ok(Arc::new(MemoryBucketStore::new(schema)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{ComparisonType, SortType};
    use serde_json::{Map, Value, json};

    fn object(key: &str, value: Value) -> BucketObject {
        BucketObject::new(key, value.as_object().cloned().unwrap_or_else(Map::new))
    }

    #[test]
    fn test_ghost_store() {
        let store = MemoryGhostStore::new();
        assert!(!store.has_change_version("notes"));

        store.set_change_version("notes", "").unwrap();
        assert!(!store.has_change_version("notes"));

        store.set_change_version("notes", "cv1").unwrap();
        assert!(store.has_change_version_of("notes", "cv1"));
        assert!(!store.has_change_version_of("notes", "cv2"));

        store.save_ghost("notes", &Ghost::new("a", 2, Map::new())).unwrap();
        assert!(store.has_ghost("notes", "a"));
        assert_eq!(store.get_ghost_version("notes", "a").unwrap(), 2);
        assert!(!store.has_ghost("todos", "a"));

        store.delete_ghost("notes", "a").unwrap();
        assert!(matches!(
            store.get_ghost("notes", "a"),
            Err(ClientError::GhostMissing { .. })
        ));

        store.save_ghost("notes", &Ghost::new("b", 1, Map::new())).unwrap();
        store.reset_bucket("notes").unwrap();
        assert!(!store.has_ghost("notes", "b"));
        assert!(store.get_change_version("notes").is_none());
    }

    #[test]
    fn test_bucket_store_search() {
        let schema = BucketSchema::new().auto_index();
        let store = MemoryBucketStore::new(&schema);
        for (key, value) in [
            ("a", json!({"title": "Alpha", "rank": 3, "pinned": true})),
            ("b", json!({"title": "Beta", "rank": 1})),
            ("c", json!({"title": "Gamma", "rank": 2, "pinned": false})),
        ] {
            let object = object(key, value);
            store.save(&object, &schema.indexes_for(&object)).unwrap();
        }

        let query = Query::new().order("rank", SortType::Ascending);
        let keys: Vec<String> = store.search(&query).into_iter().map(|row| row.object.key().to_string()).collect();
        assert_eq!(keys, vec!["b", "c", "a"]);

        let query = Query::new().condition("pinned", ComparisonType::NotEqualTo, json!(true));
        assert_eq!(store.count(&query), 2);

        let query = Query::new().condition("title", ComparisonType::Like, json!("%a")).limit(1);
        assert_eq!(store.count(&query), 1);
        assert_eq!(store.search(&query)[0].object.key(), "a");

        store.delete("a").unwrap();
        assert_eq!(store.all().len(), 2);
        store.reset().unwrap();
        assert!(store.get("b").is_none());
    }

    #[test]
    fn test_bucket_store_full_text() {
        let schema = BucketSchema::new().with_full_text_index(&["content"]);
        let store = MemoryBucketStore::new(&schema);
        let note = object("n", json!({"content": "Buy milk and eggs"}));
        store.save(&note, &[]).unwrap();

        assert_eq!(store.count(&Query::new().matching("milk")), 1);
        assert_eq!(store.count(&Query::new().matching("bread")), 0);
    }
}
