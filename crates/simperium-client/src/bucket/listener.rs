use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde_json::{Map, Value};

use super::Bucket;
use super::object::BucketObject;
use crate::error::ClientError;

/// What a network change did to the bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Remove,
    Modify,
    Index,
    Reset,
    Insert,
}

impl Display for ChangeType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChangeType::Remove => "REMOVE",
            ChangeType::Modify => "MODIFY",
            ChangeType::Index => "INDEX",
            ChangeType::Reset => "RESET",
            ChangeType::Insert => "INSERT",
        };
        f.write_str(name)
    }
}

/// Bucket event callbacks. Every method defaults to a no-op.
///
/// Callbacks run on the thread that caused the event: the caller for local
/// saves and deletes, a sync task for network changes.
pub trait BucketListener: Send + Sync {
    /// A local save modified the object
    fn on_save_object(&self, _bucket: &Bucket, _object: &BucketObject) {}

    /// The object was removed locally
    fn on_delete_object(&self, _bucket: &Bucket, _object: &BucketObject) {}

    /// A remote change is about to modify the object
    fn on_before_update_object(&self, _bucket: &Bucket, _object: &BucketObject) {}

    /// Data changed because of the network; `key` is unset for bucket wide
    /// events
    fn on_network_change(&self, _bucket: &Bucket, _change_type: ChangeType, _key: Option<&str>) {}
}

/// Receives the result of a revisions request
pub trait RevisionsCallbacks: Send + Sync {
    fn on_revision(&self, _key: &str, _version: u64, _properties: &Map<String, Value>) {}

    /// All requested revisions arrived or failed; keyed by version
    fn on_complete(&self, revisions: BTreeMap<u64, BucketObject>);

    fn on_error(&self, error: ClientError);
}
