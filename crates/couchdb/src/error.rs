//! Error types for the CouchDB state store client.
//!
//! Every failure is reported through [`CouchError`], which keeps the five
//! kinds a caller has to tell apart:
//!
//! - [`CouchError::Validation`] - malformed input rejected before (or instead of) a remote effect
//! - [`CouchError::Conflict`] - revision mismatch on a write or delete
//! - [`CouchError::NotFound`] - the targeted database or document does not exist
//! - [`CouchError::Connection`] - transport failure, timeout or unreachable endpoint
//! - [`CouchError::Server`] - the store answered with an error status
//!
//! # Example
//!
//! ```
//! use statedb_couchdb::{CouchError, Result};
//!
//! fn parse_port(raw: &str) -> Result<u16> {
//!     raw.parse().map_err(|_| CouchError::validation(format!("invalid port '{raw}'")))
//! }
//! ```

use std::{sync::Arc, time::Duration};

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

/// A shareable boxed error used for source chains.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for CouchDB client operations.
pub type Result<T> = std::result::Result<T, CouchError>;

/// Reason string CouchDB reports when the addressed database is missing.
const MISSING_DATABASE_REASON: &str = "Database does not exist.";

/// Errors produced by the CouchDB client.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CouchError {
    /// Caller input was rejected: a malformed address, a body that is not
    /// a JSON object, or a request the store refused as bad.
    #[error("Validation error: {message}")]
    Validation {
        /// Description of the rejected input.
        message: String,
    },

    /// Optimistic concurrency failure.
    ///
    /// The supplied revision is not the document's current revision (or the
    /// document already exists and no revision was supplied). Re-read and
    /// retry if appropriate; the client never resolves this on its own.
    #[error("Document update conflict: {reason}")]
    Conflict {
        /// Reason reported by the store.
        reason: String,
    },

    /// The targeted database or document does not exist.
    #[error("Not found: {resource} ({reason})")]
    NotFound {
        /// Path of the resource that was addressed.
        resource: String,
        /// Reason reported by the store.
        reason: String,
    },

    /// The store could not be reached, refused the connection, or did not
    /// answer within the configured timeout.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the transport failure.
        message: String,
        /// Underlying transport error, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// The store reported a failure that is not one of the kinds above.
    #[error("Server error ({status}): {error}: {reason}")]
    Server {
        /// HTTP status code of the response.
        status: u16,
        /// Short error name reported by the store.
        error: String,
        /// Human readable reason reported by the store.
        reason: String,
    },
}

/// Error body returned by CouchDB for non-2xx responses.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    reason: String,
}

impl CouchError {
    /// Creates a new `Validation` error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    /// Creates a new `Conflict` error.
    #[must_use]
    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict { reason: reason.into() }
    }

    /// Creates a new `NotFound` error.
    #[must_use]
    pub fn not_found(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NotFound { resource: resource.into(), reason: reason.into() }
    }

    /// Creates a new `Connection` error with the given message.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Creates a new `Connection` error with a message and source error.
    #[must_use]
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a `Connection` error for a request that exceeded its deadline.
    #[must_use]
    pub fn timed_out(after: Duration) -> Self {
        Self::connection(format!("request timed out after {}ms", after.as_millis()))
    }

    /// Creates a new `Server` error.
    #[must_use]
    pub fn server(status: u16, error: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Server { status, error: error.into(), reason: reason.into() }
    }

    /// Returns `true` for failures worth retrying on an idempotent request:
    /// connection problems and 5xx responses.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns `true` when the error reports that the database itself is
    /// missing, as opposed to a single document.
    #[must_use]
    pub fn is_missing_database(&self) -> bool {
        matches!(self, Self::NotFound { reason, .. } if reason == MISSING_DATABASE_REASON)
    }

    /// Maps a non-2xx response to the matching error kind.
    ///
    /// `resource` names the addressed path and is only used for `NotFound`.
    pub(crate) fn from_response(status: StatusCode, resource: &str, body: &[u8]) -> Self {
        let ErrorBody { error, reason } = serde_json::from_slice(body).unwrap_or_default();
        let reason = if reason.is_empty() {
            status.canonical_reason().unwrap_or("unknown").to_owned()
        } else {
            reason
        };

        match status {
            StatusCode::BAD_REQUEST => Self::validation(reason),
            StatusCode::NOT_FOUND => Self::not_found(resource, reason),
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => Self::conflict(reason),
            _ => {
                if status.is_server_error() {
                    tracing::warn!(
                        status = status.as_u16(),
                        %error,
                        %reason,
                        "store reported a server error"
                    );
                }
                Self::server(status.as_u16(), error, reason)
            },
        }
    }
}

impl From<reqwest::Error> for CouchError {
    fn from(err: reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            "request timed out".to_owned()
        } else if err.is_connect() {
            "unable to connect to the store".to_owned()
        } else if err.is_builder() {
            return Self::validation(format!("invalid request: {err}"));
        } else {
            "transport failure".to_owned()
        };
        Self::connection_with_source(message, err)
    }
}
