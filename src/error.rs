//! Crate-wide error types.
//!
//! Errors are serializable so the UI shell can render them structurally, and
//! cloneable so a shared in-flight fetch can hand the same failure to every
//! awaiting caller.

use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the synchronization layer.
///
/// All variants serialize to a structured JSON object for frontend consumption.
#[derive(Debug, Clone, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum SyncError {
    /// Forge API request failed.
    #[error("Forge API error: {message}")]
    Api {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status_code: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },

    /// Known API constraint rejected the request (e.g. requesting a review
    /// from the PR author). Expected; surfaced as a warning, not a failure.
    #[error("Constraint: {message}")]
    Constraint { message: String },

    /// External tracker request failed.
    #[error("Tracker error: {message}")]
    Tracker { message: String },

    /// Network request failed.
    #[error("Network error: {message}")]
    Network { message: String },

    /// Settings database operation failed.
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        operation: Option<String>,
    },

    /// Requested resource not found.
    #[error("Not found: {resource}")]
    NotFound {
        resource: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    /// Invalid input provided.
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    /// Internal error.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Constraint messages the forge returns for requests that are expected to be
/// rejected under normal use. Matched as substrings of the response body.
const CONSTRAINT_MESSAGES: &[&str] = &[
    "cannot be requested from pull request author",
    "review has already been requested",
    "label does not exist",
];

impl SyncError {
    /// Create a forge API error.
    pub fn api(message: impl Into<String>) -> Self {
        Self::Api {
            message: message.into(),
            status_code: None,
            endpoint: None,
        }
    }

    /// Create a forge API error with status code and endpoint.
    ///
    /// Known constraint messages are classified as [`SyncError::Constraint`]
    /// here so callers never have to string-match themselves.
    pub fn api_full(
        message: impl Into<String>,
        status_code: u16,
        endpoint: impl Into<String>,
    ) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();
        if CONSTRAINT_MESSAGES.iter().any(|m| lowered.contains(m)) {
            return Self::Constraint { message };
        }
        Self::Api {
            message,
            status_code: Some(status_code),
            endpoint: Some(endpoint.into()),
        }
    }

    /// Create a constraint error.
    pub fn constraint(message: impl Into<String>) -> Self {
        Self::Constraint {
            message: message.into(),
        }
    }

    /// Create a tracker error.
    pub fn tracker(message: impl Into<String>) -> Self {
        Self::Tracker {
            message: message.into(),
        }
    }

    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            operation: None,
        }
    }

    /// Create a database error with operation context.
    pub fn database_with_op(message: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            operation: Some(operation.into()),
        }
    }

    /// Create a not found error.
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: None,
        }
    }

    /// Create a not found error with ID.
    pub fn not_found_with_id(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: Some(id.into()),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if this is an expected API constraint rather than a failure.
    pub fn is_constraint(&self) -> bool {
        matches!(self, Self::Constraint { .. })
    }
}

// Conversions from common error types

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::network("Request timed out")
        } else if err.is_connect() {
            Self::network("Failed to connect to server")
        } else if err.is_status() {
            Self::api(format!("HTTP error: {}", err))
        } else {
            Self::network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("JSON error: {}", err))
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        Self::database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_serialization() {
        let err = SyncError::api("rate limit exceeded");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"type\":\"Api\""));
        assert!(json.contains("rate limit exceeded"));
    }

    #[test]
    fn test_api_error_full() {
        let err = SyncError::api_full("Not Found", 404, "/repos/acme/widgets/pulls");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"status_code\":404"));
        assert!(json.contains("/repos/acme/widgets/pulls"));
    }

    #[test]
    fn test_author_review_request_classified_as_constraint() {
        let err = SyncError::api_full(
            "Review cannot be requested from pull request author.",
            422,
            "/repos/acme/widgets/pulls/7/requested_reviewers",
        );
        assert!(err.is_constraint());
    }

    #[test]
    fn test_duplicate_review_request_classified_as_constraint() {
        let err = SyncError::api_full(
            "Review has already been requested for this user.",
            422,
            "/repos/acme/widgets/pulls/7/requested_reviewers",
        );
        assert!(err.is_constraint());
    }

    #[test]
    fn test_plain_api_error_is_not_constraint() {
        let err = SyncError::api_full("Server Error", 500, "/repos/acme/widgets/pulls");
        assert!(!err.is_constraint());
    }

    #[test]
    fn test_optional_fields_not_serialized() {
        let err = SyncError::database("error");
        let json = serde_json::to_string(&err).unwrap();
        assert!(!json.contains("operation"));
    }
}
