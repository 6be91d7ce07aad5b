//! Error types for Hive core library.

use serde::Serialize;
use thiserror::Error;

/// Result type alias using Hive Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for Hive operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Agent cache error
    #[error("Agent cache error: {0}")]
    Cache(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification every domain error maps onto.
///
/// The hub turns it into an HTTP status and the MCP adapter into the
/// `data.kind` field of a JSON-RPC error, so callers can react without
/// parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input or an illegal state transition. Never retried.
    Validation,
    /// The referenced entity does not exist.
    NotFound,
    /// The request collides with existing state (duplicate name, port held).
    Conflict,
    /// A git/process/network hiccup; the same call may succeed later.
    Transient,
    /// Missing binary or unrecoverable filesystem failure.
    Fatal,
}

impl ErrorKind {
    /// Stable lowercase name, as serialized.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::NotFound).unwrap_or_default();
        assert_eq!(json, "\"not_found\"");
        assert_eq!(ErrorKind::NotFound.to_string(), "not_found");
    }

    #[test]
    fn io_error_converts() {
        let err: Error = std::io::Error::other("disk gone").into();
        assert!(err.to_string().contains("disk gone"));
    }
}
