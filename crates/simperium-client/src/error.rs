//! Client error types for the Simperium SDK

use simperium_api::{DiffError, ProtocolError};

use crate::auth::AuthError;

/// Error type for Simperium client operations
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid bucket name '{0}'")]
    BucketNameInvalid(String),

    #[error("invalid object key '{0}'")]
    ObjectKeyInvalid(String),

    #[error("bucket {bucket} does not have object {key}")]
    ObjectMissing { bucket: String, key: String },

    #[error("bucket {bucket} does not have a ghost for {key}")]
    GhostMissing { bucket: String, key: String },

    #[error("change for {0} is empty")]
    ChangeEmpty(String),

    #[error("remote change could not be applied: {0}")]
    RemoteChangeInvalid(String),

    #[error("revisions request failed: {0}")]
    Revisions(String),

    #[error("auth failed: {0}")]
    Auth(#[from] AuthError),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("connection not ready")]
    NotConnected,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Diff(#[from] DiffError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ClientError {
    pub(crate) fn object_missing(bucket: &str, key: &str) -> Self {
        ClientError::ObjectMissing {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }

    pub(crate) fn ghost_missing(bucket: &str, key: &str) -> Self {
        ClientError::GhostMissing {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ClientError::NotConnected;
        assert_eq!(err.to_string(), "connection not ready");

        let err = ClientError::object_missing("notes", "abc");
        assert_eq!(err.to_string(), "bucket notes does not have object abc");

        let err = ClientError::ghost_missing("notes", "abc");
        assert_eq!(err.to_string(), "bucket notes does not have a ghost for abc");

        let err = ClientError::BucketNameInvalid("bad name".to_string());
        assert_eq!(err.to_string(), "invalid bucket name 'bad name'");
    }

    #[test]
    fn test_from_protocol_error() {
        let err: ClientError = ProtocolError::InvalidObjectVersion("x".to_string()).into();
        assert!(matches!(err, ClientError::Protocol(_)));

        let err: ClientError = DiffError::Conflict { position: 1 }.into();
        assert!(matches!(err, ClientError::Diff(_)));
    }
}
