//! Common types passed to and returned from store operations.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::attachment::Attachment;

/// Opaque version token minted by the store on every successful write.
///
/// Writes and deletes against an existing document must present the current
/// revision; the store rejects stale ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    /// Wraps a revision string.
    #[must_use]
    pub fn new(revision: impl Into<String>) -> Self {
        Self(revision.into())
    }

    /// Returns the revision as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the generation counter, the `N` in `N-hash`.
    #[must_use]
    pub fn generation(&self) -> Option<u64> {
        self.0.split_once('-').and_then(|(generation, _)| generation.parse().ok())
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Revision {
    fn from(revision: String) -> Self {
        Self(revision)
    }
}

impl From<&str> for Revision {
    fn from(revision: &str) -> Self {
        Self(revision.to_owned())
    }
}

impl AsRef<str> for Revision {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A document to be written.
///
/// The JSON body is kept as the caller's raw bytes and validated when the
/// document is saved. When the document carries the value attachment
/// ([`VALUE_ATTACHMENT`](crate::VALUE_ATTACHMENT)), reads return the
/// attachment bytes and the JSON body only holds metadata.
///
/// # Example
///
/// ```
/// use statedb_couchdb::{Attachment, CouchDoc};
///
/// let json = CouchDoc::json(r#"{"asset_name":"marble1","owner":"jerry"}"#);
/// assert!(json.attachments().is_empty());
///
/// let binary = CouchDoc::value_bytes(vec![0u8, 159, 146, 150], "application/octet-stream");
/// assert!(binary.json_bytes().is_none());
/// assert!(binary.attachments()[0].is_value());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CouchDoc {
    json: Option<Bytes>,
    attachments: Vec<Attachment>,
}

impl CouchDoc {
    /// Creates a document from raw JSON bytes.
    #[must_use]
    pub fn json(body: impl Into<Bytes>) -> Self {
        Self { json: Some(body.into()), attachments: Vec::new() }
    }

    /// Creates a document from a JSON value.
    #[must_use]
    pub fn from_value(value: &serde_json::Value) -> Self {
        Self::json(value.to_string())
    }

    /// Creates a document whose value is `data`, stored as the value attachment.
    #[must_use]
    pub fn value_bytes(data: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self { json: None, attachments: vec![Attachment::value(data, content_type)] }
    }

    /// Creates a document from an optional JSON body and attachments.
    #[must_use]
    pub fn with_parts(json: Option<Bytes>, attachments: Vec<Attachment>) -> Self {
        Self { json, attachments }
    }

    /// Adds an attachment.
    #[must_use]
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Returns the raw JSON body, if any.
    #[must_use]
    pub fn json_bytes(&self) -> Option<&Bytes> {
        self.json.as_ref()
    }

    /// Returns the attachments.
    #[must_use]
    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }
}

/// A document as read back from the store.
///
/// `content` follows the promotion rule: the value attachment's bytes when
/// present, otherwise the JSON body with the store's `_`-prefixed
/// bookkeeping fields removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDoc {
    /// Document id, exactly as written.
    pub id: String,
    /// Current revision.
    pub revision: Revision,
    /// Primary value of the document.
    pub content: Bytes,
    /// Attachments returned with the document.
    pub attachments: Vec<Attachment>,
}

/// Id and current revision of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocMetadata {
    /// Document id.
    pub id: String,
    /// Current revision.
    pub revision: Revision,
}

/// Server welcome information returned by a connection check.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectionInfo {
    /// Greeting, normally `"Welcome"`.
    pub couchdb: String,
    /// Server version.
    #[serde(default)]
    pub version: String,
    /// Vendor details.
    #[serde(default)]
    pub vendor: Option<VendorInfo>,
}

/// Vendor block of [`ConnectionInfo`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VendorInfo {
    /// Vendor name.
    #[serde(default)]
    pub name: String,
    /// Vendor version, when reported.
    #[serde(default)]
    pub version: Option<String>,
}

/// Database information.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DbInfo {
    /// Database name.
    pub db_name: String,
    /// Number of live documents.
    #[serde(default)]
    pub doc_count: u64,
    /// Number of deleted documents.
    #[serde(default)]
    pub doc_del_count: u64,
    /// Update sequence; a number or an opaque string depending on the server.
    #[serde(default)]
    pub update_seq: serde_json::Value,
    /// Purge sequence.
    #[serde(default)]
    pub purge_seq: serde_json::Value,
    /// Whether a compaction is running.
    #[serde(default)]
    pub compact_running: bool,
    /// Size reporting of newer servers.
    #[serde(default)]
    pub sizes: Option<DbSizes>,
    /// File size reported by older servers.
    #[serde(default)]
    pub disk_size: Option<u64>,
    /// Live data size reported by older servers.
    #[serde(default)]
    pub data_size: Option<u64>,
    /// Disk format version.
    #[serde(default)]
    pub disk_format_version: Option<u64>,
    /// Instance start time.
    #[serde(default)]
    pub instance_start_time: Option<String>,
}

impl DbInfo {
    /// Returns the on-disk size in bytes, whichever format the server uses.
    #[must_use]
    pub fn file_size(&self) -> Option<u64> {
        self.sizes.as_ref().map(|s| s.file).or(self.disk_size)
    }
}

/// Sizes block of [`DbInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DbSizes {
    /// Bytes on disk.
    #[serde(default)]
    pub file: u64,
    /// Uncompressed size of the live data.
    #[serde(default)]
    pub external: u64,
    /// Bytes of live data inside the file.
    #[serde(default)]
    pub active: u64,
}

/// One document of a batch update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDoc {
    /// Document id.
    pub id: String,
    /// Current revision; `None` creates the document.
    pub revision: Option<Revision>,
    /// Body and attachments; ignored for deletions.
    pub doc: CouchDoc,
    /// Whether this entry deletes the document.
    pub deleted: bool,
}

impl BatchDoc {
    /// Creates an entry that writes `doc`.
    #[must_use]
    pub fn save(id: impl Into<String>, revision: Option<Revision>, doc: CouchDoc) -> Self {
        Self { id: id.into(), revision, doc, deleted: false }
    }

    /// Creates an entry that deletes the document at `revision`.
    #[must_use]
    pub fn delete(id: impl Into<String>, revision: Revision) -> Self {
        Self { id: id.into(), revision: Some(revision), doc: CouchDoc::default(), deleted: true }
    }
}

/// Outcome of one document of a batch update.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BatchUpdateResponse {
    /// Document id.
    pub id: String,
    /// New revision on success.
    #[serde(default, rename = "rev")]
    pub revision: Option<Revision>,
    /// Error name on failure, e.g. `conflict`.
    #[serde(default)]
    pub error: Option<String>,
    /// Error reason on failure.
    #[serde(default)]
    pub reason: Option<String>,
}

impl BatchUpdateResponse {
    /// Returns `true` when the document was written.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.revision.is_some()
    }

    /// Returns `true` when the document was rejected for a stale revision.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        self.error.as_deref() == Some("conflict")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_revision_generation() {
        assert_eq!(Revision::from("3-917fa2381192822767f010b95b45325b").generation(), Some(3));
        assert_eq!(Revision::from("garbage").generation(), None);
        assert_eq!(Revision::new("1-a").to_string(), "1-a");
    }

    #[test]
    fn test_from_value_is_compact_json() {
        let doc = CouchDoc::from_value(&json!({"owner": "jerry", "size": "35"}));
        assert_eq!(doc.json_bytes().unwrap().as_ref(), br#"{"owner":"jerry","size":"35"}"#);
    }

    #[test]
    fn test_db_info_accepts_both_size_formats() {
        let newer: DbInfo = serde_json::from_value(json!({
            "db_name": "db",
            "doc_count": 2,
            "update_seq": "2-g1AAAA",
            "sizes": { "file": 4096, "external": 100, "active": 200 }
        }))
        .unwrap();
        assert_eq!(newer.file_size(), Some(4096));

        let older: DbInfo = serde_json::from_value(json!({
            "db_name": "db",
            "update_seq": 7,
            "disk_size": 8192
        }))
        .unwrap();
        assert_eq!(older.file_size(), Some(8192));
        assert_eq!(older.doc_count, 0);
    }

    #[test]
    fn test_batch_update_response() {
        let ok: BatchUpdateResponse =
            serde_json::from_value(json!({"ok": true, "id": "a", "rev": "1-x"})).unwrap();
        assert!(ok.is_ok());
        assert!(!ok.is_conflict());

        let conflict: BatchUpdateResponse = serde_json::from_value(
            json!({"id": "b", "error": "conflict", "reason": "Document update conflict."}),
        )
        .unwrap();
        assert!(!conflict.is_ok());
        assert!(conflict.is_conflict());
    }
}
