use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every failure a Parley operation can surface to its caller.
///
/// Validation and authorization failures are produced locally and never reach
/// the transport. Everything else originates from a round trip.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatError {
    /// Malformed input: negative size, missing field, empty payload.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The caller does not hold the identity the operation requires.
    #[error("Authorization error: {0}")]
    Authorization(String),

    /// Unknown channel, or a metadata key absent on update.
    #[error("Not found: {0}")]
    NotFound(String),

    /// `create` on a key that already exists.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Network, timeout or server-side failure.
    #[error("Transport error: {message}")]
    Transport { message: String, retriable: bool },

    /// A send was cancelled before the transport acknowledged it.
    #[error("Send cancelled before acknowledgment")]
    Cancelled,
}

/// Discriminant of [`ChatError`], convenient for matching in tests and UIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    Authorization,
    NotFound,
    Conflict,
    Transport,
    Cancelled,
}

impl ChatError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn authorization(msg: impl Into<String>) -> Self {
        Self::Authorization(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn transport(msg: impl Into<String>, retriable: bool) -> Self {
        Self::Transport {
            message: msg.into(),
            retriable,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Authorization(_) => ErrorKind::Authorization,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Only transport failures flagged by the server or the timeout guard are
    /// worth retrying. Retrying is always the caller's decision.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transport { retriable: true, .. })
    }
}

/// Failure to encode or decode a wire envelope.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encoding failed: {0}")]
    Encode(bincode::Error),

    #[error("Decoding failed: {0}")]
    Decode(bincode::Error),

    #[error("Malformed JSON document: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<CodecError> for ChatError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Json(e) => ChatError::Validation(format!("malformed document: {e}")),
            other => ChatError::transport(other.to_string(), false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_flagged_transport_errors_are_retriable() {
        assert!(ChatError::transport("timeout", true).is_retriable());
        assert!(!ChatError::transport("bad gateway", false).is_retriable());
        assert!(!ChatError::validation("size").is_retriable());
        assert!(!ChatError::Cancelled.is_retriable());
    }

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(ChatError::conflict("k").kind(), ErrorKind::Conflict);
        assert_eq!(ChatError::not_found("k").kind(), ErrorKind::NotFound);
        assert_eq!(ChatError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_json_codec_error_is_validation() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let chat: ChatError = CodecError::Json(err).into();
        assert_eq!(chat.kind(), ErrorKind::Validation);
    }
}
