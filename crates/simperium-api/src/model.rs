//! Data exchanged with the Simperium service
//!
//! This module defines:
//! - `Ghost`: last known server copy of an object
//! - `ObjectVersion` / `ObjectVersionData`: `e:` command payloads
//! - `RemoteChange`: elements of a `c:` command
//! - `ResponseCode`: error codes attached to remote changes
//! - index page and index status documents

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ProtocolError, Result};
use crate::jsondiff;

/// Payload sent by the server when it has no data for a request
pub const RESPONSE_UNKNOWN: &str = "?";

/// Key holding the object body in `e:` responses
pub const ENTITY_DATA_KEY: &str = "data";

/// Last known version of an object as stored on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ghost {
    pub key: String,
    pub version: u64,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl Ghost {
    pub fn new(key: impl Into<String>, version: u64, properties: Map<String, Value>) -> Self {
        Self {
            key: key.into(),
            version,
            properties,
        }
    }

    /// Ghost of an object the server has never seen.
    pub fn empty(key: impl Into<String>) -> Self {
        Self::new(key, 0, Map::new())
    }

    pub fn version_id(&self) -> String {
        format!("{}.{}", self.key, self.version)
    }
}

/// `key.version` pair; the version follows the last dot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectVersion {
    pub key: String,
    pub version: u64,
}

impl ObjectVersion {
    pub fn new(key: impl Into<String>, version: u64) -> Self {
        Self {
            key: key.into(),
            version,
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        let (key, version) = value
            .rsplit_once('.')
            .ok_or_else(|| ProtocolError::InvalidObjectVersion(value.to_string()))?;
        let version = version
            .trim()
            .parse::<u64>()
            .map_err(|_| ProtocolError::InvalidObjectVersion(value.to_string()))?;
        Ok(Self::new(key, version))
    }
}

impl Display for ObjectVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.key, self.version)
    }
}

/// Object body received for a `key.version` request.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectVersionData {
    pub version: ObjectVersion,
    pub data: Map<String, Value>,
}

impl ObjectVersionData {
    /// Parses `key.v\n{"data":{...}}`.
    pub fn parse(value: &str) -> Result<Self> {
        let (prefix, payload) = value
            .split_once('\n')
            .ok_or_else(|| ProtocolError::InvalidObjectVersion(value.to_string()))?;
        let version = ObjectVersion::parse(prefix)?;

        if payload.trim() == RESPONSE_UNKNOWN {
            return Err(ProtocolError::UnknownObjectVersion(version.to_string()));
        }

        let data = serde_json::from_str::<Value>(payload)
            .ok()
            .and_then(|body| match body {
                Value::Object(mut body) => match body.remove(ENTITY_DATA_KEY) {
                    Some(Value::Object(data)) => Some(data),
                    _ => None,
                },
                _ => None,
            })
            .ok_or_else(|| ProtocolError::MalformedObjectData(version.to_string()))?;

        Ok(Self { version, data })
    }

    pub fn key(&self) -> &str {
        &self.version.key
    }

    pub fn to_ghost(&self) -> Ghost {
        Ghost::new(self.version.key.clone(), self.version.version, self.data.clone())
    }
}

/// Operation of a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOperation {
    #[serde(rename = "M")]
    Modify,
    #[serde(rename = "-")]
    Remove,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Modify => "M",
            ChangeOperation::Remove => "-",
        }
    }
}

impl Display for ChangeOperation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error codes carried by remote changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Ok,
    InvalidId,
    Unauthorized,
    NotFound,
    InvalidVersion,
    DuplicateChange,
    EmptyChange,
    ExceedsMaxSize,
    InvalidDiff,
    Unknown(i64),
}

impl ResponseCode {
    pub fn from_code(code: i64) -> Self {
        match code {
            200 => ResponseCode::Ok,
            400 => ResponseCode::InvalidId,
            401 => ResponseCode::Unauthorized,
            404 => ResponseCode::NotFound,
            405 => ResponseCode::InvalidVersion,
            409 => ResponseCode::DuplicateChange,
            412 => ResponseCode::EmptyChange,
            413 => ResponseCode::ExceedsMaxSize,
            440 => ResponseCode::InvalidDiff,
            other => ResponseCode::Unknown(other),
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            ResponseCode::Ok => 200,
            ResponseCode::InvalidId => 400,
            ResponseCode::Unauthorized => 401,
            ResponseCode::NotFound => 404,
            ResponseCode::InvalidVersion => 405,
            ResponseCode::DuplicateChange => 409,
            ResponseCode::EmptyChange => 412,
            ResponseCode::ExceedsMaxSize => 413,
            ResponseCode::InvalidDiff => 440,
            ResponseCode::Unknown(code) => *code,
        }
    }

    /// Whether the change should be resent with the full object.
    pub fn requires_full_object(&self) -> bool {
        matches!(self, ResponseCode::InvalidVersion | ResponseCode::InvalidDiff)
    }
}

/// A change broadcast by the server, either another client's edit or the
/// acknowledgement of one of ours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    #[serde(rename = "clientid", default)]
    pub client_id: String,
    #[serde(rename = "id")]
    pub key: String,
    #[serde(default)]
    pub ccids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sv: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ev: Option<u64>,
    #[serde(rename = "o", default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<ChangeOperation>,
    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<i64>,
}

impl RemoteChange {
    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn response_code(&self) -> ResponseCode {
        self.error.map_or(ResponseCode::Ok, ResponseCode::from_code)
    }

    pub fn is_remove(&self) -> bool {
        self.operation == Some(ChangeOperation::Remove)
    }

    /// A modification of an object that does not exist yet on this client.
    pub fn is_add(&self) -> bool {
        self.operation == Some(ChangeOperation::Modify) && self.sv.is_none_or(|sv| sv == 0)
    }

    pub fn is_modify(&self) -> bool {
        self.operation == Some(ChangeOperation::Modify) && self.sv.is_some_and(|sv| sv > 0)
    }

    pub fn is_acknowledged_by(&self, ccid: &str) -> bool {
        self.ccids.iter().any(|id| id == ccid)
    }

    pub fn change_version(&self) -> &str {
        self.cv.as_deref().unwrap_or_default()
    }

    pub fn object_version(&self) -> ObjectVersion {
        ObjectVersion::new(self.key.clone(), self.ev.unwrap_or_default())
    }

    fn invalid(&self, reason: impl Into<String>) -> ProtocolError {
        ProtocolError::InvalidRemoteChange {
            key: self.key.clone(),
            reason: reason.into(),
        }
    }

    /// Applies the change to `ghost`, returning the ghost at the end version.
    pub fn apply(&self, ghost: &Ghost) -> Result<Ghost> {
        if self.is_remove() {
            return Err(self.invalid("removals do not produce a ghost"));
        }
        if ghost.key != self.key {
            return Err(self.invalid(format!(
                "local ghost key {} does not match",
                ghost.key
            )));
        }
        if self.is_modify() && self.sv != Some(ghost.version) {
            return Err(self.invalid(format!(
                "local ghost version {} does not match source version {}",
                ghost.version,
                self.sv.unwrap_or_default()
            )));
        }
        if self.is_add() && ghost.version > 0 {
            return Err(self.invalid(format!(
                "local ghost version {} is not 0 for a new object",
                ghost.version
            )));
        }

        let end_version = self.ev.ok_or_else(|| self.invalid("missing end version"))?;
        let patch = self.patch.as_ref().ok_or_else(|| self.invalid("missing patch"))?;
        let properties = jsondiff::apply_object(&ghost.properties, patch)?;
        Ok(Ghost::new(self.key.clone(), end_version, properties))
    }
}

impl Display for RemoteChange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.error {
            Some(code) => write!(f, "RemoteChange<{} error {}>", self.key, code),
            None => write!(
                f,
                "RemoteChange<{} {} cv:{}>",
                self.key,
                self.operation.map(|op| op.as_str()).unwrap_or("?"),
                self.change_version()
            ),
        }
    }
}

/// One `{id, v}` entry of an index page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub v: u64,
}

/// Page of the bucket index received with `i:`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct IndexPage {
    #[serde(default)]
    pub current: Option<String>,
    #[serde(default)]
    pub index: Vec<IndexEntry>,
    #[serde(default)]
    pub mark: Option<String>,
}

impl IndexPage {
    pub fn current_version(&self) -> &str {
        self.current.as_deref().unwrap_or_default()
    }

    /// Cursor of the next page, if any.
    pub fn next_mark(&self) -> Option<&str> {
        self.mark.as_deref().filter(|mark| !mark.is_empty())
    }
}

/// `{id, ccid}` entry of a pending change in the index status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub id: String,
    pub ccid: String,
}

/// Client details attached to the index status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexExtra {
    #[serde(rename = "bucketName")]
    pub bucket_name: String,
    pub build: String,
    pub version: String,
    pub client: String,
}

/// Reply to the server's `index` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStatus {
    pub index: Vec<IndexEntry>,
    pub current: String,
    pub pending: Vec<PendingEntry>,
    pub extra: IndexExtra,
}
