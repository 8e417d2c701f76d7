//! Error types for the Simperium wire model

use crate::jsondiff::DiffError;

/// Errors raised while parsing or applying protocol messages
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid object version '{0}'")]
    InvalidObjectVersion(String),

    #[error("object version {0} does not exist")]
    UnknownObjectVersion(String),

    #[error("object data for {0} is malformed")]
    MalformedObjectData(String),

    #[error("invalid remote change for '{key}': {reason}")]
    InvalidRemoteChange { key: String, reason: String },

    #[error("invalid channel message '{0}'")]
    InvalidMessage(String),

    #[error(transparent)]
    Diff(#[from] DiffError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::InvalidObjectVersion("note".to_string());
        assert_eq!(err.to_string(), "invalid object version 'note'");

        let err = ProtocolError::InvalidRemoteChange {
            key: "note".to_string(),
            reason: "ghost version mismatch".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid remote change for 'note': ghost version mismatch"
        );

        let err: ProtocolError = DiffError::Conflict { position: 3 }.into();
        assert_eq!(err.to_string(), "edits conflict at position 3");
    }
}
