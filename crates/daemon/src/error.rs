// Engine-level error taxonomy.
//
// Store helpers return `anyhow::Result`; everything crossing the engine API
// is mapped into `EngineError` so callers can tell terminal failures
// (validation, authorization) from transient ones.

use thiserror::Error;

use crate::engine::CrdtError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid attributes: {0}")]
    InvalidAttributes(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("entity `{0}` not found")]
    NotFound(String),
    #[error("entity `{0}` already exists")]
    AlreadyExists(String),
    #[error("entity `{0}` has been deleted")]
    Tombstoned(String),
    #[error("unknown entity type `{0}`")]
    UnknownType(String),
    #[error("gave up after {attempts} attempts on `{entity_id}`: concurrent writers kept winning")]
    RetryExhausted { entity_id: String, attempts: u32 },
    #[error("malformed replica data: {0}")]
    Malformed(String),
    #[error("remote error: {0}")]
    Remote(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether repeating the same call later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. } | Self::Remote(_) | Self::Storage(_))
    }

    /// Short machine-readable code, used in logs and events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidAttributes(_) => "INVALID_ATTRIBUTES",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::AlreadyExists(_) => "ALREADY_EXISTS",
            Self::Tombstoned(_) => "TOMBSTONED",
            Self::UnknownType(_) => "UNKNOWN_TYPE",
            Self::RetryExhausted { .. } => "FAILED",
            Self::Malformed(_) => "MALFORMED",
            Self::Remote(_) => "REMOTE_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }
}

impl From<CrdtError> for EngineError {
    fn from(error: CrdtError) -> Self {
        match error {
            CrdtError::InvalidAttributes(message) => Self::InvalidAttributes(message),
            other => Self::Malformed(other.to_string()),
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_errors_are_not_retryable() {
        assert!(!EngineError::Unauthorized("no role".into()).is_retryable());
        assert!(!EngineError::InvalidAttributes("bad".into()).is_retryable());
        assert!(!EngineError::Tombstoned("n1".into()).is_retryable());
    }

    #[test]
    fn transient_errors_are_retryable() {
        let exhausted = EngineError::RetryExhausted { entity_id: "n1".into(), attempts: 10 };
        assert!(exhausted.is_retryable());
        assert_eq!(exhausted.code(), "FAILED");
        assert!(EngineError::Storage(anyhow::anyhow!("disk full")).is_retryable());
    }

    #[test]
    fn crdt_validation_maps_to_invalid_attributes() {
        let error: EngineError = CrdtError::InvalidAttributes("name is required".into()).into();
        assert!(matches!(error, EngineError::InvalidAttributes(message) if message == "name is required"));

        let error: EngineError = CrdtError::MalformedDelta("truncated".into()).into();
        assert_eq!(error.code(), "MALFORMED");
    }
}
