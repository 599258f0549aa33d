//! CouchDB-backed versioned key-value store client.
//!
//! This crate talks to a CouchDB server over its HTTP API and exposes the
//! operations a versioned state store needs: revision-checked writes, point
//! reads, ordered range scans, batch writes, metadata lookups and selector
//! queries.
//!
//! # Data Model
//!
//! - A [`CouchInstance`] is one configured endpoint. It is cheap to clone and
//!   safe to share between tasks.
//! - A [`CouchDatabase`] is a named database on an instance.
//! - Every document carries a [`Revision`]. Updating or deleting a document
//!   requires its current revision; a stale one yields
//!   [`CouchError::Conflict`].
//! - A document value is either a JSON object or raw bytes stored in the
//!   [`VALUE_ATTACHMENT`] attachment ([`CouchDoc::value_bytes`]).
//!
//! # Quick Start
//!
//! ```no_run
//! // Requires a running CouchDB server.
//! use statedb_couchdb::{CouchDoc, CouchInstance, prefix_range_end};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let instance = CouchInstance::new("localhost:5984", "admin", "adminpw")?;
//!     instance.verify_connection().await?;
//!
//!     let db = instance.database("mychannel_marbles")?;
//!     db.create_if_not_exist().await?;
//!
//!     let rev = db.save_doc("marble1", None, &CouchDoc::json(r#"{"color":"blue"}"#)).await?;
//!     let rev = db.save_doc("marble1", Some(&rev), &CouchDoc::json(r#"{"color":"red"}"#)).await?;
//!
//!     let stored = db.read_doc("marble1").await?;
//!     assert_eq!(stored.map(|d| d.revision), Some(rev));
//!
//!     let marbles = db.read_doc_range("marble", &prefix_range_end("marble"), 0, 0).await?;
//!     println!("{} marbles", marbles.len());
//!     Ok(())
//! }
//! ```
//!
//! # Key Ordering
//!
//! Range scans order ids by Unicode code point and treat the end bound as
//! exclusive. [`prefix_range_end`] builds the end bound that covers every id
//! starting with a prefix.
//!
//! # Failure Handling
//!
//! Every request is bounded by the configured request timeout. Transient
//! failures (connection errors, timeouts and 5xx responses) are retried
//! with exponential backoff and jitter. Document creations and batch writes
//! are sent once so a lost response cannot turn into a spurious conflict.
//! Updates against a revision are retried, but when a retry conflicts after
//! a failed attempt the outcome is unknown and the update fails with
//! [`CouchError::Connection`]; re-read the document before deciding.
//!
//! # Metrics
//!
//! Each instance counts requests, errors, latencies and retries per
//! operation. See [`CouchInstance::metrics_snapshot`].
//!
//! # Testing
//!
//! The `testutil` feature provides `testutil::MockCouchServer`, an
//! in-process [`Transport`] emulating the server. The `failpoints` feature
//! enables the `couchdb-before-send` and `retry-before-sleep` fail points.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod attachment;
mod batch;
mod config;
mod connection;
mod database;
mod document;
mod error;
mod instance;
mod keys;
mod metrics;
mod query;
mod range;
mod retry;
mod transport;
mod types;

/// Shared test utilities for CouchDB client testing.
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;

/// Named binary payloads stored with a document.
pub use attachment::{Attachment, DEFAULT_ATTACHMENT_TYPE, VALUE_ATTACHMENT};
/// Configuration types and default constants.
pub use config::{
    CouchDbConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_BACKOFF,
    DEFAULT_MAX_PAGE_SIZE, DEFAULT_MAX_RETRIES, DEFAULT_REQUEST_TIMEOUT, DeleteRevisionPolicy,
    RetryConfig,
};
/// Parsed endpoint address and credentials.
pub use connection::ConnectionDefinition;
/// Database handle.
pub use database::CouchDatabase;
/// Error types and result alias.
pub use error::{BoxError, CouchError, Result};
/// Instance handle.
pub use instance::CouchInstance;
/// Key range helpers.
pub use keys::{MAX_KEY_CHAR, prefix_range_end};
/// Request metrics.
pub use metrics::{LatencyPercentiles, Metrics, MetricsSnapshot, OperationSnapshot};
/// Selector query results.
pub use query::QueryResult;
/// Paged range scans.
pub use range::RangeCursor;
/// The HTTP seam.
pub use transport::{CouchRequest, CouchResponse, HttpTransport, Transport};
/// Document and response types.
pub use types::{
    BatchDoc, BatchUpdateResponse, ConnectionInfo, CouchDoc, DbInfo, DbSizes, DocMetadata,
    Revision, StoredDoc, VendorInfo,
};
