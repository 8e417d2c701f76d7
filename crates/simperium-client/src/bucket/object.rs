use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use simperium_api::Ghost;
use simperium_api::jsondiff::{self, JsonDiff};

use crate::error::Result;

/// A JSON object stored in a bucket together with the ghost it was last
/// synced from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketObject {
    key: String,
    #[serde(default)]
    properties: Map<String, Value>,
    ghost: Ghost,
}

impl BucketObject {
    pub fn new(key: impl Into<String>, properties: Map<String, Value>) -> Self {
        let key = key.into();
        Self {
            ghost: Ghost::empty(key.clone()),
            key,
            properties,
        }
    }

    /// Object whose properties are the ghost's
    pub fn from_ghost(ghost: Ghost) -> Self {
        Self {
            key: ghost.key.clone(),
            properties: ghost.properties.clone(),
            ghost,
        }
    }

    /// Builds an object from any serializable value.
    pub fn from_typed<T: Serialize>(key: impl Into<String>, value: &T) -> Result<Self> {
        let properties = match serde_json::to_value(value)? {
            Value::Object(properties) => properties,
            other => {
                let mut properties = Map::new();
                properties.insert("value".to_string(), other);
                properties
            }
        };
        Ok(Self::new(key, properties))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.properties
    }

    pub fn set_properties(&mut self, properties: Map<String, Value>) {
        self.properties = properties;
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Reads a property into a typed value, `None` when missing or of
    /// another shape.
    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.properties
            .get(name)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn set(&mut self, name: &str, value: impl Serialize) -> Result<()> {
        self.properties.insert(name.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.properties.remove(name)
    }

    /// Deserializes all properties into `T`.
    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.properties.clone()))?)
    }

    pub fn ghost(&self) -> &Ghost {
        &self.ghost
    }

    pub fn set_ghost(&mut self, ghost: Ghost) {
        self.ghost = ghost;
    }

    pub fn version(&self) -> u64 {
        self.ghost.version
    }

    pub fn version_id(&self) -> String {
        self.ghost.version_id()
    }

    /// Never acknowledged by the server
    pub fn is_new(&self) -> bool {
        self.ghost.version == 0
    }

    /// Whether the properties differ from the last synced copy
    pub fn is_modified(&self) -> bool {
        !jsondiff::equals(
            &Value::Object(self.properties.clone()),
            &Value::Object(self.ghost.properties.clone()),
        )
    }

    /// Object diff from the ghost to the current properties
    pub fn diff(&self, differ: &JsonDiff) -> Option<Value> {
        differ.diff_objects(&self.ghost.properties, &self.properties)
    }
}

impl Display for BucketObject {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "BucketObject<{}>", self.version_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        title: String,
        tags: Vec<String>,
    }

    #[test]
    fn test_typed_roundtrip() {
        let note = Note {
            title: "Hello".to_string(),
            tags: vec!["a".to_string()],
        };
        let mut object = BucketObject::from_typed("n1", &note).unwrap();
        assert_eq!(object.get_as::<String>("title").as_deref(), Some("Hello"));
        assert_eq!(object.get_as::<u32>("title"), None);

        object.set("title", "Updated").unwrap();
        let updated: Note = object.to_typed().unwrap();
        assert_eq!(updated.title, "Updated");
    }

    #[test]
    fn test_is_modified() {
        let ghost = Ghost::new("n1", 2, json!({"title": "Hi"}).as_object().cloned().unwrap());
        let mut object = BucketObject::from_ghost(ghost);
        assert!(!object.is_modified());
        assert!(!object.is_new());
        assert_eq!(object.version_id(), "n1.2");

        object.set("title", "Hi!").unwrap();
        assert!(object.is_modified());

        let diff = object.diff(&JsonDiff::new()).unwrap();
        assert_eq!(diff["v"]["title"]["o"], json!("d"));
    }

    #[test]
    fn test_new_object_is_new() {
        let object = BucketObject::new("n2", Map::new());
        assert!(object.is_new());
        assert_eq!(object.ghost().key, "n2");
        assert!(!object.is_modified());
    }
}
