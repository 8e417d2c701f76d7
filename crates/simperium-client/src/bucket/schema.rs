//! Bucket schema: default values, indexers and full text indexing

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use serde_json::{Map, Value};

use super::object::BucketObject;

/// Named value stored next to an object so queries can filter and sort on it
#[derive(Debug, Clone, PartialEq)]
pub struct Index {
    pub name: String,
    pub value: Value,
}

impl Index {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

impl Display for Index {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} : {}", self.name, self.value)
    }
}

/// Produces index values for an object
pub trait Indexer: Send + Sync {
    fn index(&self, object: &BucketObject) -> Vec<Index>;
}

impl<F> Indexer for F
where
    F: Fn(&BucketObject) -> Vec<Index> + Send + Sync,
{
    fn index(&self, object: &BucketObject) -> Vec<Index> {
        self(object)
    }
}

/// Indexes every top level property. Arrays produce one entry per element.
pub struct AutoIndexer;

impl AutoIndexer {
    fn add_index(indexes: &mut Vec<Index>, name: &str, value: &Value) {
        match value {
            Value::Array(items) => {
                for item in items {
                    Self::add_index(indexes, name, item);
                }
            }
            other => indexes.push(Index::new(name, other.clone())),
        }
    }
}

impl Indexer for AutoIndexer {
    fn index(&self, object: &BucketObject) -> Vec<Index> {
        let mut indexes = Vec::with_capacity(object.properties().len());
        for (name, value) in object.properties() {
            Self::add_index(&mut indexes, name, value);
        }
        indexes
    }
}

/// Properties copied into the full text index as text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullTextIndex {
    keys: Vec<String>,
}

impl FullTextIndex {
    pub fn new(keys: &[&str]) -> Self {
        Self {
            keys: keys.iter().map(|key| key.to_string()).collect(),
        }
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn index(&self, object: &BucketObject) -> BTreeMap<String, String> {
        self.keys
            .iter()
            .filter_map(|key| {
                let text = match object.get(key)? {
                    Value::Null => return None,
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                Some((key.clone(), text))
            })
            .collect()
    }
}

/// Describes how objects of a bucket are built and indexed.
#[derive(Clone, Default)]
pub struct BucketSchema {
    remote_name: Option<String>,
    defaults: Map<String, Value>,
    indexers: Vec<Arc<dyn Indexer>>,
    full_text_index: Option<FullTextIndex>,
}

impl BucketSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Syncs with a server bucket whose name differs from the local one
    pub fn with_remote_name(mut self, name: &str) -> Self {
        self.remote_name = Some(name.to_string());
        self
    }

    /// Value set on built objects that lack the property
    pub fn with_default(mut self, name: &str, value: Value) -> Self {
        self.defaults.insert(name.to_string(), value);
        self
    }

    pub fn with_indexer(mut self, indexer: Arc<dyn Indexer>) -> Self {
        self.indexers.push(indexer);
        self
    }

    /// Indexes every property; runs before the other indexers.
    pub fn auto_index(mut self) -> Self {
        self.indexers.insert(0, Arc::new(AutoIndexer));
        self
    }

    pub fn with_full_text_index(mut self, keys: &[&str]) -> Self {
        self.full_text_index = Some(FullTextIndex::new(keys));
        self
    }

    /// Server bucket name; falls back to the local bucket name.
    pub fn remote_name<'a>(&'a self, bucket_name: &'a str) -> &'a str {
        self.remote_name.as_deref().unwrap_or(bucket_name)
    }

    pub fn full_text_index(&self) -> Option<&FullTextIndex> {
        self.full_text_index.as_ref()
    }

    fn apply_defaults(&self, properties: &mut Map<String, Value>) {
        for (name, value) in &self.defaults {
            if !properties.contains_key(name) {
                properties.insert(name.clone(), value.clone());
            }
        }
    }

    /// Builds an object with default values filled in
    pub fn build(&self, key: &str, mut properties: Map<String, Value>) -> BucketObject {
        self.apply_defaults(&mut properties);
        BucketObject::new(key, properties)
    }

    /// Replaces the object's properties, filling in default values
    pub fn update(&self, object: &mut BucketObject, mut properties: Map<String, Value>) {
        self.apply_defaults(&mut properties);
        object.set_properties(properties);
    }

    pub fn indexes_for(&self, object: &BucketObject) -> Vec<Index> {
        self.indexers
            .iter()
            .flat_map(|indexer| indexer.index(object))
            .collect()
    }
}

impl std::fmt::Debug for BucketSchema {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketSchema")
            .field("remote_name", &self.remote_name)
            .field("defaults", &self.defaults)
            .field("indexers", &self.indexers.len())
            .field("full_text_index", &self.full_text_index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_defaults_do_not_override() {
        let schema = BucketSchema::new()
            .with_default("tags", json!([]))
            .with_default("title", json!("untitled"));
        let object = schema.build("a", props(json!({"title": "Mine"})));
        assert_eq!(object.get("title"), Some(&json!("Mine")));
        assert_eq!(object.get("tags"), Some(&json!([])));
    }

    #[test]
    fn test_auto_index_expands_arrays() {
        let schema = BucketSchema::new().auto_index();
        let object = BucketObject::new("a", props(json!({"title": "Hi", "tags": ["x", "y"]})));
        let mut indexes = schema.indexes_for(&object);
        indexes.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
        assert_eq!(
            indexes,
            vec![
                Index::new("tags", json!("x")),
                Index::new("tags", json!("y")),
                Index::new("title", json!("Hi")),
            ]
        );
    }

    #[test]
    fn test_custom_indexer_runs_after_auto_index() {
        let schema = BucketSchema::new()
            .with_indexer(Arc::new(|object: &BucketObject| {
                let length = object.get("title").and_then(Value::as_str).map_or(0, str::len);
                vec![Index::new("title_length", json!(length))]
            }))
            .auto_index();
        let object = BucketObject::new("a", props(json!({"title": "Hello"})));
        let indexes = schema.indexes_for(&object);
        assert_eq!(indexes.first(), Some(&Index::new("title", json!("Hello"))));
        assert_eq!(indexes.last(), Some(&Index::new("title_length", json!(5))));
    }

    #[test]
    fn test_full_text_index() {
        let schema = BucketSchema::new().with_full_text_index(&["title", "count", "missing"]);
        let object = BucketObject::new("a", props(json!({"title": "Hello", "count": 3})));
        let values = schema.full_text_index().unwrap().index(&object);
        assert_eq!(values.get("title").map(String::as_str), Some("Hello"));
        assert_eq!(values.get("count").map(String::as_str), Some("3"));
        assert!(!values.contains_key("missing"));
    }

    #[test]
    fn test_remote_name() {
        assert_eq!(BucketSchema::new().remote_name("notes"), "notes");
        assert_eq!(BucketSchema::new().with_remote_name("n").remote_name("notes"), "n");
    }
}
