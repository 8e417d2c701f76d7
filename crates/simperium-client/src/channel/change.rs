//! Local change waiting to be sent or acknowledged

use std::fmt::{Display, Formatter};

use serde_json::{Map, Value};
use simperium_api::jsondiff::{JsonDiff, VALUE_KEY};
use simperium_api::{ChangeOperation, Ghost};
use uuid::Uuid;

use crate::error::{ClientError, Result};

/// Times a rejected change is resent with the full object
pub const RETRY_LIMIT: u32 = 1;

const ID_KEY: &str = "id";
const CHANGE_ID_KEY: &str = "ccid";
const OPERATION_KEY: &str = "o";
const SOURCE_VERSION_KEY: &str = "sv";
const OBJECT_DATA_KEY: &str = "d";

#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    operation: ChangeOperation,
    ccid: String,
    bucket_name: String,
    key: String,
    retry_count: u32,
    send_full_object: bool,
    pending: bool,
    acknowledged: bool,
    sent: bool,
}

/// New client change id: a v4 uuid without hyphens
pub fn new_ccid() -> String {
    Uuid::new_v4().simple().to_string()
}

impl Change {
    pub fn new(operation: ChangeOperation, bucket_name: &str, key: &str) -> Self {
        Self::restore(operation, &new_ccid(), bucket_name, key)
    }

    /// Rebuilds a change saved by a queue serializer
    pub fn restore(operation: ChangeOperation, ccid: &str, bucket_name: &str, key: &str) -> Self {
        Self {
            operation,
            ccid: ccid.to_string(),
            bucket_name: bucket_name.to_string(),
            key: key.to_string(),
            retry_count: 0,
            send_full_object: false,
            pending: true,
            acknowledged: false,
            sent: false,
        }
    }

    pub fn modify(bucket_name: &str, key: &str) -> Self {
        Self::new(ChangeOperation::Modify, bucket_name, key)
    }

    pub fn remove(bucket_name: &str, key: &str) -> Self {
        Self::new(ChangeOperation::Remove, bucket_name, key)
    }

    pub fn operation(&self) -> ChangeOperation {
        self.operation
    }

    pub fn ccid(&self) -> &str {
        &self.ccid
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket_name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_modify(&self) -> bool {
        self.operation == ChangeOperation::Modify
    }

    pub fn is_remove(&self) -> bool {
        self.operation == ChangeOperation::Remove
    }

    pub fn key_matches(&self, other: &Change) -> bool {
        self.key == other.key
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn is_complete(&self) -> bool {
        !self.pending
    }

    pub fn is_sent(&self) -> bool {
        self.sent
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }

    pub fn set_sent(&mut self) {
        self.sent = true;
    }

    pub fn set_acknowledged(&mut self) {
        self.acknowledged = true;
    }

    pub fn set_complete(&mut self) {
        self.pending = false;
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn increment_retry_count(&mut self) {
        self.retry_count += 1;
    }

    pub fn reached_retry_limit(&self) -> bool {
        self.retry_count >= RETRY_LIMIT
    }

    pub fn send_full_object(&self) -> bool {
        self.send_full_object
    }

    pub fn set_send_full_object(&mut self, send_full_object: bool) {
        self.send_full_object = send_full_object;
    }

    /// Builds the `c:` payload for this change.
    ///
    /// A modification diffs `target` against `ghost` and fails with
    /// `ChangeEmpty` when nothing changed. Removals ignore `target`.
    pub fn to_message(
        &self,
        differ: &JsonDiff,
        target: Option<&Map<String, Value>>,
        ghost: &Ghost,
    ) -> Result<Map<String, Value>> {
        let mut message = Map::new();
        message.insert(ID_KEY.to_string(), Value::String(self.key.clone()));
        message.insert(CHANGE_ID_KEY.to_string(), Value::String(self.ccid.clone()));
        message.insert(
            OPERATION_KEY.to_string(),
            Value::String(self.operation.as_str().to_string()),
        );

        if self.is_remove() {
            return Ok(message);
        }

        if ghost.version > 0 {
            message.insert(SOURCE_VERSION_KEY.to_string(), Value::from(ghost.version));
        }

        let target = target.ok_or_else(|| ClientError::object_missing(&self.bucket_name, &self.key))?;
        let diff = differ
            .diff_objects(&ghost.properties, target)
            .and_then(|mut diff| diff.get_mut(VALUE_KEY).map(Value::take))
            .ok_or_else(|| ClientError::ChangeEmpty(self.key.clone()))?;
        message.insert(VALUE_KEY.to_string(), diff);

        if self.send_full_object {
            message.insert(OBJECT_DATA_KEY.to_string(), Value::Object(target.clone()));
        }

        Ok(message)
    }
}

impl Display for Change {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Change {} {} {}", self.ccid, self.key, self.operation)
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
    fn test_ccid_format() {
        let change = Change::modify("notes", "a");
        assert_eq!(change.ccid().len(), 32);
        assert!(!change.ccid().contains('-'));
        assert!(change.is_pending());
        assert!(!change.is_sent());
    }

    #[test]
    fn test_modify_message() {
        let change = Change::modify("notes", "a");
        let ghost = Ghost::new("a", 3, props(json!({"title": "Hi"})));
        let target = props(json!({"title": "Hi", "pinned": true}));

        let message = change.to_message(&JsonDiff::new(), Some(&target), &ghost).unwrap();
        assert_eq!(message["id"], json!("a"));
        assert_eq!(message["o"], json!("M"));
        assert_eq!(message["sv"], json!(3));
        assert_eq!(message["v"], json!({"pinned": {"o": "+", "v": true}}));
        assert!(!message.contains_key("d"));
    }

    #[test]
    fn test_new_object_has_no_source_version() {
        let mut change = Change::modify("notes", "a");
        change.set_send_full_object(true);
        let target = props(json!({"title": "Hi"}));

        let message = change.to_message(&JsonDiff::new(), Some(&target), &Ghost::empty("a")).unwrap();
        assert!(!message.contains_key("sv"));
        assert_eq!(message["d"], json!({"title": "Hi"}));
    }

    #[test]
    fn test_empty_modification_fails() {
        let change = Change::modify("notes", "a");
        let ghost = Ghost::new("a", 1, props(json!({"title": "Hi"})));
        let err = change
            .to_message(&JsonDiff::new(), Some(&ghost.properties.clone()), &ghost)
            .unwrap_err();
        assert!(matches!(err, ClientError::ChangeEmpty(key) if key == "a"));
    }

    #[test]
    fn test_remove_message_needs_no_target() {
        let change = Change::remove("notes", "a");
        let ghost = Ghost::new("a", 4, Map::new());
        let message = change.to_message(&JsonDiff::new(), None, &ghost).unwrap();
        assert_eq!(message["o"], json!("-"));
        assert!(!message.contains_key("sv"));
        assert!(!message.contains_key("v"));
    }

    #[test]
    fn test_retry_limit() {
        let mut change = Change::modify("notes", "a");
        assert!(!change.reached_retry_limit());
        change.increment_retry_count();
        assert!(change.reached_retry_limit());
    }
}
