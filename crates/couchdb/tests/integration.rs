//! Integration tests for the CouchDB client.
//!
//! These tests run the public API against [`MockCouchServer`], which emulates
//! the store's HTTP semantics in process, so no CouchDB server is needed.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use serde_json::json;
use statedb_couchdb::{
    Attachment, BatchDoc, CouchDatabase, CouchDbConfig, CouchDoc, CouchError, CouchInstance,
    CouchRequest, CouchResponse, DeleteRevisionPolicy, MAX_KEY_CHAR, Revision, RetryConfig,
    Transport, VALUE_ATTACHMENT, prefix_range_end,
    testutil::{MockCouchServer, create_test_database, create_test_instance, test_config},
};
use tokio::task::JoinSet;

// ============================================================================
// Test Helpers
// ============================================================================

fn config_with(max_page_size: u32, delete_revision: DeleteRevisionPolicy) -> CouchDbConfig {
    CouchDbConfig::builder()
        .address("localhost:5984")
        .request_timeout(Duration::from_millis(500))
        .retry(
            RetryConfig::builder()
                .max_retries(2)
                .initial_backoff(Duration::from_millis(1))
                .max_backoff(Duration::from_millis(5))
                .build()
                .expect("valid retry config"),
        )
        .max_page_size(max_page_size)
        .delete_revision(delete_revision)
        .build()
        .expect("valid config")
}

async fn database_with(
    server: &MockCouchServer,
    name: &str,
    config: &CouchDbConfig,
) -> CouchDatabase {
    let instance = CouchInstance::with_transport(config, server.transport()).expect("instance");
    let db = instance.database(name).expect("database handle");
    db.create_if_not_exist().await.expect("create database");
    db
}

fn ids(docs: &[statedb_couchdb::StoredDoc]) -> Vec<&str> {
    docs.iter().map(|d| d.id.as_str()).collect()
}

/// Forwards to the mock server. Once armed, the next request with `method`
/// is applied by the server but its response is replaced by a connection
/// error, as if the reply had been lost on the way back.
#[derive(Debug)]
struct LostResponseTransport {
    server: MockCouchServer,
    method: Method,
    armed: AtomicBool,
}

impl LostResponseTransport {
    fn new(server: &MockCouchServer, method: Method) -> Arc<Self> {
        Arc::new(Self { server: server.clone(), method, armed: AtomicBool::new(false) })
    }

    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for LostResponseTransport {
    async fn send(&self, request: &CouchRequest) -> statedb_couchdb::Result<CouchResponse> {
        let response = self.server.send(request).await?;
        if request.method == self.method && self.armed.swap(false, Ordering::SeqCst) {
            return Err(CouchError::connection("connection reset by peer"));
        }
        Ok(response)
    }
}

async fn database_over(transport: Arc<LostResponseTransport>, name: &str) -> CouchDatabase {
    let instance = CouchInstance::with_transport(&test_config(), transport).expect("instance");
    let db = instance.database(name).expect("database handle");
    db.create_if_not_exist().await.expect("create database");
    db
}

// ============================================================================
// Connection Definition
// ============================================================================

#[test]
fn test_valid_addresses_accepted() {
    for address in
        ["localhost:5984", "127.0.0.1:5984", "http://couch.example.com:80", "https://[::1]:6984"]
    {
        assert!(CouchInstance::new(address, "", "").is_ok(), "{address} should be accepted");
    }
}

#[test]
fn test_malformed_addresses_rejected() {
    for address in ["^^^localhost:5984", "localhost", "localhost:port", "", "ftp://localhost:21"] {
        let result = CouchInstance::new(address, "admin", "adminpw");
        let rejected = matches!(result, Err(CouchError::Validation { .. }));
        assert!(rejected, "{address} should be rejected");
    }
}

#[tokio::test]
async fn test_verify_connection_reports_version() {
    let server = MockCouchServer::new();
    let instance = create_test_instance(&server);

    let info = instance.verify_connection().await.expect("verify");
    assert_eq!(info.couchdb, "Welcome");
    assert_eq!(info.version, statedb_couchdb::testutil::MOCK_VERSION);
}

// ============================================================================
// Database Lifecycle
// ============================================================================

#[tokio::test]
async fn test_create_if_not_exist_twice() {
    let server = MockCouchServer::new();
    let db = create_test_instance(&server).database("lifecycle").unwrap();

    assert!(db.create_if_not_exist().await.unwrap());
    let writes = server.write_count();
    assert!(!db.create_if_not_exist().await.unwrap());

    assert_eq!(server.write_count(), writes, "second call must not mutate");
    assert_eq!(server.database_names(), ["lifecycle"]);
}

#[tokio::test]
async fn test_info_counts_documents() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "info").await;
    db.save_doc("a", None, &CouchDoc::json("{}")).await.unwrap();
    db.save_doc("b", None, &CouchDoc::json("{}")).await.unwrap();
    db.delete_doc("b", None).await.unwrap();

    let info = db.info().await.unwrap();
    assert_eq!(info.db_name, "info");
    assert_eq!(info.doc_count, 1);
    assert_eq!(info.doc_del_count, 1);
    assert!(info.file_size().is_some());
}

#[tokio::test]
async fn test_drop_then_info_is_not_found() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "dropme").await;

    db.drop().await.unwrap();
    let err = db.info().await.unwrap_err();
    assert!(matches!(err, CouchError::NotFound { .. }), "got {err:?}");
    assert!(err.is_missing_database());

    assert!(matches!(db.drop().await, Err(CouchError::NotFound { .. })));
}

#[tokio::test]
async fn test_recreate_after_drop_is_empty() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "cycle").await;
    db.save_doc("k", None, &CouchDoc::json("{}")).await.unwrap();

    db.drop().await.unwrap();
    assert!(db.create_if_not_exist().await.unwrap());
    assert!(db.read_doc("k").await.unwrap().is_none());
}

#[tokio::test]
async fn test_ensure_full_commit() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "commit").await;
    db.ensure_full_commit().await.unwrap();
}

// ============================================================================
// Documents
// ============================================================================

#[tokio::test]
async fn test_save_and_read_roundtrip() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "docs").await;
    let body = r#"{"asset_name":"marble1","color":"blue","size":35}"#;

    let rev = db.save_doc("marble1", None, &CouchDoc::json(body)).await.unwrap();
    assert!(!rev.as_str().is_empty());

    let stored = db.read_doc("marble1").await.unwrap().expect("document exists");
    assert_eq!(stored.id, "marble1");
    assert_eq!(stored.revision, rev);
    assert_eq!(stored.content.as_ref(), body.as_bytes());
}

#[tokio::test]
async fn test_id_with_slash_addresses_one_document() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "docs").await;

    db.save_doc("idWith/slash", None, &CouchDoc::json(r#"{"v":1}"#)).await.unwrap();
    let stored = db.read_doc("idWith/slash").await.unwrap().expect("document exists");
    assert_eq!(stored.id, "idWith/slash");
    assert_eq!(server.document_ids("docs"), ["idWith/slash"]);
}

#[tokio::test]
async fn test_update_requires_current_revision() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "docs").await;

    let first = db.save_doc("k", None, &CouchDoc::json(r#"{"v":1}"#)).await.unwrap();
    let read = db.read_doc("k").await.unwrap().unwrap();
    let second =
        db.save_doc("k", Some(&read.revision), &CouchDoc::json(r#"{"v":2}"#)).await.unwrap();
    assert_ne!(first, second);
    assert_eq!(second.generation(), Some(2));

    let stale = db.save_doc("k", Some(&first), &CouchDoc::json(r#"{"v":3}"#)).await;
    assert!(matches!(stale, Err(CouchError::Conflict { .. })), "stale revision: {stale:?}");

    let empty = db.save_doc("k", None, &CouchDoc::json(r#"{"v":3}"#)).await;
    assert!(matches!(empty, Err(CouchError::Conflict { .. })), "missing revision: {empty:?}");

    let content = db.read_doc("k").await.unwrap().unwrap().content;
    assert_eq!(content.as_ref(), br#"{"v":2}"#);
}

#[tokio::test]
async fn test_update_of_absent_document_conflicts() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "docs").await;

    let result = db.save_doc("ghost", Some(&Revision::from("1-abc")), &CouchDoc::json("{}")).await;
    assert!(matches!(result, Err(CouchError::Conflict { .. })));
}

#[tokio::test]
async fn test_body_revision_is_used() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "docs").await;
    let rev = db.save_doc("k", None, &CouchDoc::json(r#"{"v":1}"#)).await.unwrap();

    let body = json!({ "_rev": rev.as_str(), "v": 2 });
    let next = db.save_doc("k", None, &CouchDoc::from_value(&body)).await.unwrap();
    assert_eq!(next.generation(), Some(2));
    assert_eq!(db.read_doc("k").await.unwrap().unwrap().content.as_ref(), br#"{"v":2}"#);
}

#[tokio::test]
async fn test_malformed_json_is_validation_error() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "docs").await;
    let writes = server.write_count();

    let result = db.save_doc("bad", None, &CouchDoc::json(r#"{"asset_name"}"#)).await;
    assert!(matches!(result, Err(CouchError::Validation { .. })), "got {result:?}");
    assert_eq!(server.write_count(), writes, "nothing may be written");
    assert!(db.read_doc("bad").await.unwrap().is_none());
}

#[tokio::test]
async fn test_reserved_field_rejected_by_store() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "docs").await;

    let result = db.save_doc("k", None, &CouchDoc::json(r#"{"_secret":1}"#)).await;
    assert!(matches!(result, Err(CouchError::Validation { .. })), "got {result:?}");
}

#[tokio::test]
async fn test_read_missing_document_is_none() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "docs").await;
    assert!(db.read_doc("never").await.unwrap().is_none());
    assert!(db.get_document_revision("never").await.unwrap().is_none());
}

#[tokio::test]
async fn test_read_from_missing_database_is_not_found() {
    let server = MockCouchServer::new();
    let db = create_test_instance(&server).database("nowhere").unwrap();

    let err = db.read_doc("k").await.unwrap_err();
    assert!(err.is_missing_database(), "got {err:?}");
}

#[tokio::test]
async fn test_get_document_revision_matches_read() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "docs").await;
    let rev = db.save_doc("k", None, &CouchDoc::json("{}")).await.unwrap();

    assert_eq!(db.get_document_revision("k").await.unwrap(), Some(rev));
}

// ============================================================================
// Delete
// ============================================================================

#[tokio::test]
async fn test_delete_nonexistent_succeeds() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "docs").await;
    db.delete_doc("never-created", None).await.unwrap();
}

#[tokio::test]
async fn test_delete_then_read_is_absent() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "docs").await;
    let rev = db.save_doc("k", None, &CouchDoc::json("{}")).await.unwrap();

    db.delete_doc("k", Some(&rev)).await.unwrap();
    assert!(db.read_doc("k").await.unwrap().is_none());

    // deleting again is still fine
    db.delete_doc("k", None).await.unwrap();
    db.delete_doc("k", Some(&rev)).await.unwrap();
}

#[tokio::test]
async fn test_delete_resolves_revision() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "docs").await;
    db.save_doc("k", None, &CouchDoc::json("{}")).await.unwrap();

    db.delete_doc("k", None).await.unwrap();
    assert!(db.read_doc("k").await.unwrap().is_none());
}

#[tokio::test]
async fn test_delete_with_stale_revision_conflicts() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "docs").await;
    let first = db.save_doc("k", None, &CouchDoc::json(r#"{"v":1}"#)).await.unwrap();
    db.save_doc("k", Some(&first), &CouchDoc::json(r#"{"v":2}"#)).await.unwrap();

    let result = db.delete_doc("k", Some(&first)).await;
    assert!(matches!(result, Err(CouchError::Conflict { .. })));
    assert!(db.read_doc("k").await.unwrap().is_some());
}

#[tokio::test]
async fn test_delete_requires_revision_under_strict_policy() {
    let server = MockCouchServer::new();
    let config = config_with(1000, DeleteRevisionPolicy::Require);
    let db = database_with(&server, "strict", &config).await;
    db.save_doc("k", None, &CouchDoc::json("{}")).await.unwrap();

    let result = db.delete_doc("k", None).await;
    assert!(matches!(result, Err(CouchError::Validation { .. })));
}

#[tokio::test]
async fn test_recreate_after_delete() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "docs").await;
    db.save_doc("k", None, &CouchDoc::json(r#"{"v":1}"#)).await.unwrap();
    db.delete_doc("k", None).await.unwrap();

    let rev = db.save_doc("k", None, &CouchDoc::json(r#"{"v":2}"#)).await.unwrap();
    assert_eq!(rev.generation(), Some(3));
    assert_eq!(db.read_doc("k").await.unwrap().unwrap().content.as_ref(), br#"{"v":2}"#);
}

// ============================================================================
// Attachments
// ============================================================================

#[tokio::test]
async fn test_attachment_roundtrip_is_byte_identical() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "attachments").await;
    let raw: Vec<u8> = (0..=255u8).chain(b"\r\n--boundary\r\n".iter().copied()).collect();

    db.save_doc("bin", None, &CouchDoc::value_bytes(raw.clone(), "")).await.unwrap();

    let stored = db.read_doc("bin").await.unwrap().expect("document exists");
    assert_eq!(stored.content.as_ref(), raw.as_slice());
    assert_eq!(stored.attachments.len(), 1);
    assert_eq!(stored.attachments[0].name, VALUE_ATTACHMENT);
    assert_eq!(stored.attachments[0].content_type, "application/octet-stream");
}

#[tokio::test]
async fn test_value_attachment_wins_over_metadata() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "attachments").await;
    let doc = CouchDoc::json(r#"{"kind":"blob"}"#)
        .with_attachment(Attachment::value(&b"payload"[..], "text/plain"));

    let rev = db.save_doc("k", None, &doc).await.unwrap();
    let stored = db.read_doc("k").await.unwrap().unwrap();
    assert_eq!(stored.revision, rev);
    assert_eq!(stored.content.as_ref(), b"payload");
    assert_eq!(stored.attachments[0].content_type, "text/plain");
}

#[tokio::test]
async fn test_attachment_update_replaces_bytes() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "attachments").await;
    let rev = db.save_doc("k", None, &CouchDoc::value_bytes(&b"one"[..], "")).await.unwrap();

    db.save_doc("k", Some(&rev), &CouchDoc::value_bytes(&b"two"[..], "")).await.unwrap();
    assert_eq!(db.read_doc("k").await.unwrap().unwrap().content.as_ref(), b"two");
}

#[tokio::test]
async fn test_invalid_attachment_name_rejected_before_send() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "attachments").await;
    let before = server.request_count();

    let doc = CouchDoc::json("{}")
        .with_attachment(Attachment::new("_reserved", "text/plain", Bytes::new()));
    assert!(matches!(db.save_doc("k", None, &doc).await, Err(CouchError::Validation { .. })));
    assert_eq!(server.request_count(), before);
}

// ============================================================================
// Range Scans
// ============================================================================

#[tokio::test]
async fn test_range_scan_with_sentinel_suffixes() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "range").await;
    let prefix = "key";
    let low = "\u{0}";
    let high = "\u{10FFFE}";
    let suffixes = [low, "mid", high];

    for i in 0..20 {
        for suffix in suffixes {
            let id = format!("{prefix}{i}{suffix}");
            let doc = CouchDoc::from_value(&json!({ "asset_name": &id }));
            db.save_doc(&id, None, &doc).await.unwrap();
        }
    }

    let start = format!("{prefix}10");
    let end = format!("{start}{MAX_KEY_CHAR}");
    let docs = db.read_doc_range(&start, &end, 1000, 0).await.unwrap();

    let expected = [format!("{start}{low}"), format!("{start}mid"), format!("{start}{high}")];
    assert_eq!(ids(&docs), expected);
    assert_eq!(end, prefix_range_end(&start));
}

#[tokio::test]
async fn test_range_scan_empty_interval() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "range").await;
    db.save_doc("a", None, &CouchDoc::json("{}")).await.unwrap();

    assert!(db.read_doc_range("x", "z", 0, 0).await.unwrap().is_empty());
    assert!(db.read_doc_range("a", "a", 0, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_range_scan_is_restartable() {
    let server = MockCouchServer::new();
    let config = config_with(4, DeleteRevisionPolicy::AutoResolve);
    let db = database_with(&server, "range", &config).await;
    for i in 0..15 {
        db.save_doc(&format!("k{i:02}"), None, &CouchDoc::json("{}")).await.unwrap();
    }

    let first = db.read_doc_range("", "", 0, 0).await.unwrap();
    let second = db.read_doc_range("", "", 0, 0).await.unwrap();
    assert_eq!(first.len(), 15);
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_range_scan_skips_deleted_documents() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "range").await;
    for id in ["a", "b", "c"] {
        db.save_doc(id, None, &CouchDoc::json("{}")).await.unwrap();
    }
    db.delete_doc("b", None).await.unwrap();

    assert_eq!(ids(&db.read_doc_range("", "", 0, 0).await.unwrap()), ["a", "c"]);
}

#[tokio::test]
async fn test_range_scan_promotes_attachment_values() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "range").await;
    db.save_doc("bin", None, &CouchDoc::value_bytes(vec![0u8, 159, 146, 150], "")).await.unwrap();
    db.save_doc("json", None, &CouchDoc::json(r#"{"v":1}"#)).await.unwrap();

    let docs = db.read_doc_range("", "", 0, 0).await.unwrap();
    assert_eq!(docs[0].content.as_ref(), [0u8, 159, 146, 150]);
    assert_eq!(docs[1].content.as_ref(), br#"{"v":1}"#);
}

#[tokio::test]
async fn test_range_pagination_with_skip() {
    let server = MockCouchServer::new();
    let config = config_with(3, DeleteRevisionPolicy::AutoResolve);
    let db = database_with(&server, "range", &config).await;
    for i in 0..10 {
        db.save_doc(&format!("k{i}"), None, &CouchDoc::json("{}")).await.unwrap();
    }

    let page = db.read_doc_range("k0", "k9", 4, 2).await.unwrap();
    assert_eq!(ids(&page), ["k2", "k3", "k4", "k5"]);
}

// ============================================================================
// Batch Operations and Queries
// ============================================================================

#[tokio::test]
async fn test_batch_update_and_metadata() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "batch").await;

    let results = db
        .batch_update_documents(&[
            BatchDoc::save("a", None, CouchDoc::json(r#"{"v":1}"#)),
            BatchDoc::save("b", None, CouchDoc::value_bytes(&b"bytes"[..], "")),
        ])
        .await
        .unwrap();
    assert!(results.iter().all(|r| r.is_ok()));

    let metadata = db.batch_retrieve_document_metadata(&["a", "b", "c"]).await.unwrap();
    assert_eq!(metadata.len(), 2);
    assert_eq!(Some(&metadata[0].revision), results[0].revision.as_ref());

    let updates = db
        .batch_update_documents(&[
            BatchDoc::save("a", Some(metadata[0].revision.clone()), CouchDoc::json(r#"{"v":2}"#)),
            BatchDoc::delete("b", metadata[1].revision.clone()),
        ])
        .await
        .unwrap();
    assert!(updates.iter().all(|r| r.is_ok()));
    assert_eq!(db.read_doc("a").await.unwrap().unwrap().content.as_ref(), br#"{"v":2}"#);
    assert!(db.read_doc("b").await.unwrap().is_none());
}

#[tokio::test]
async fn test_query_documents_with_operators() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "query").await;
    for (id, size) in [("m1", 10), ("m2", 20), ("m3", 30)] {
        let doc = CouchDoc::from_value(&json!({ "size": size, "owner": "tom" }));
        db.save_doc(id, None, &doc).await.unwrap();
    }

    let query = json!({ "selector": { "size": { "$gte": 20 } } });
    let result = db.query_documents(&query).await.unwrap();
    assert_eq!(ids(&result.docs), ["m2", "m3"]);
    assert!(result.warning.is_some());

    let projected = db
        .query_documents(&json!({ "selector": { "owner": "tom" }, "fields": ["size"], "limit": 1 }))
        .await
        .unwrap();
    assert_eq!(ids(&projected.docs), ["m1"]);
    assert_eq!(projected.docs[0].content.as_ref(), br#"{"size":10}"#);
}

#[tokio::test]
async fn test_query_with_invalid_operator_is_validation_error() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "query").await;

    let result = db.query_documents(&json!({ "selector": { "size": { "$bogus": 1 } } })).await;
    assert!(matches!(result, Err(CouchError::Validation { .. })));
}

// ============================================================================
// Failures, Retries and Timeouts
// ============================================================================

#[tokio::test]
async fn test_unreachable_store_is_connection_error() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "down").await;
    server.set_unavailable(true);

    for result in [
        db.info().await.map(|_| ()),
        db.read_doc("k").await.map(|_| ()),
        db.delete_doc("k", None).await,
        db.read_doc_range("", "", 0, 0).await.map(|_| ()),
        db.save_doc("k", None, &CouchDoc::json("{}")).await.map(|_| ()),
    ] {
        assert!(matches!(result, Err(CouchError::Connection { .. })), "got {result:?}");
    }
}

#[tokio::test]
async fn test_reads_retry_transient_failures() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "retry").await;
    db.save_doc("k", None, &CouchDoc::json("{}")).await.unwrap();

    server.fail_next(2, 503);
    assert!(db.read_doc("k").await.unwrap().is_some());
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "retry").await;
    let before = server.request_count();

    server.fail_next(10, 500);
    let err = db.info().await.unwrap_err();
    assert!(matches!(err, CouchError::Server { status: 500, .. }), "got {err:?}");
    assert_eq!(server.request_count() - before, 3, "one attempt plus two retries");
}

#[tokio::test]
async fn test_creates_are_not_retried() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "retry").await;
    let before = server.request_count();

    server.fail_next(1, 503);
    let result = db.save_doc("new", None, &CouchDoc::json("{}")).await;
    assert!(matches!(result, Err(CouchError::Server { status: 503, .. })));
    assert_eq!(server.request_count() - before, 1);
}

#[tokio::test]
async fn test_updates_with_revision_are_retried() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "retry").await;
    let rev = db.save_doc("k", None, &CouchDoc::json(r#"{"v":1}"#)).await.unwrap();

    server.fail_next(1, 503);
    let next = db.save_doc("k", Some(&rev), &CouchDoc::json(r#"{"v":2}"#)).await.unwrap();
    assert_eq!(next.generation(), Some(2));
}

#[tokio::test]
async fn test_update_with_lost_response_reports_unknown_outcome() {
    let server = MockCouchServer::new();
    let transport = LostResponseTransport::new(&server, Method::PUT);
    let db = database_over(Arc::clone(&transport), "lost").await;
    let rev = db.save_doc("k", None, &CouchDoc::json(r#"{"v":1}"#)).await.unwrap();

    transport.arm();
    let result = db.save_doc("k", Some(&rev), &CouchDoc::json(r#"{"v":2}"#)).await;

    match result {
        Err(CouchError::Connection { message, .. }) => {
            assert!(message.contains("unknown"), "{message}");
        },
        other => panic!("a landed update must not look like a conflict, got {other:?}"),
    }
    let stored = db.read_doc("k").await.unwrap().expect("document exists");
    assert_eq!(stored.content.as_ref(), br#"{"v":2}"#);
    assert_eq!(stored.revision.generation(), Some(2));
}

#[tokio::test]
async fn test_update_conflict_without_failure_stays_a_conflict() {
    let server = MockCouchServer::new();
    let transport = LostResponseTransport::new(&server, Method::PUT);
    let db = database_over(transport, "lost").await;
    let rev = db.save_doc("k", None, &CouchDoc::json("{}")).await.unwrap();
    db.save_doc("k", Some(&rev), &CouchDoc::json("{}")).await.unwrap();

    let result = db.save_doc("k", Some(&rev), &CouchDoc::json("{}")).await;
    assert!(matches!(result, Err(CouchError::Conflict { .. })), "got {result:?}");
}

#[tokio::test]
async fn test_delete_with_lost_response_succeeds() {
    let server = MockCouchServer::new();
    let transport = LostResponseTransport::new(&server, Method::DELETE);
    let db = database_over(Arc::clone(&transport), "lost").await;
    let rev = db.save_doc("k", None, &CouchDoc::json("{}")).await.unwrap();

    transport.arm();
    db.delete_doc("k", Some(&rev)).await.unwrap();
    assert!(db.read_doc("k").await.unwrap().is_none());
}

#[tokio::test]
async fn test_stale_delete_of_deleted_document_succeeds() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "tombstone").await;
    let rev = db.save_doc("k", None, &CouchDoc::json("{}")).await.unwrap();
    db.delete_doc("k", Some(&rev)).await.unwrap();

    // The store answers 409 for the old revision; the document is gone either way.
    db.delete_doc("k", Some(&rev)).await.unwrap();
    assert_eq!(db.get_document_revision("k").await.unwrap(), None);
}

#[tokio::test]
async fn test_batches_are_not_retried() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "retry").await;
    let rev = db.save_doc("a", None, &CouchDoc::json("{}")).await.unwrap();
    let before = server.request_count();

    server.fail_next(1, 503);
    let batch = [BatchDoc::save("a", Some(rev), CouchDoc::json("{}"))];
    let result = db.batch_update_documents(&batch).await;
    assert!(matches!(result, Err(CouchError::Server { status: 503, .. })), "got {result:?}");
    assert_eq!(server.request_count() - before, 1);
}

#[tokio::test]
async fn test_slow_store_times_out() {
    let server = MockCouchServer::new();
    let config = config_with(1000, DeleteRevisionPolicy::AutoResolve);
    let db = database_with(&server, "slow", &config).await;

    server.set_delay(Some(Duration::from_secs(5)));
    let result = db.read_doc("k").await;
    assert!(matches!(result, Err(CouchError::Connection { .. })), "got {result:?}");
}

// ============================================================================
// Metrics
// ============================================================================

#[tokio::test]
async fn test_metrics_count_operations_retries_and_errors() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "metrics").await;
    let metrics = db.instance().metrics();
    metrics.reset();

    let rev = db.save_doc("k", None, &CouchDoc::json("{}")).await.unwrap();
    assert!(db.read_doc("missing").await.unwrap().is_none());
    server.fail_next(1, 503);
    assert!(db.read_doc("k").await.unwrap().is_some());
    db.save_doc("k", Some(&Revision::from("1-stale")), &CouchDoc::json("{}")).await.unwrap_err();
    db.delete_doc("k", Some(&rev)).await.unwrap();

    let snapshot = db.instance().metrics_snapshot();
    assert_eq!(snapshot.request_count, 5);
    assert_eq!(snapshot.error_count, 1, "only the stale update failed");
    assert_eq!(snapshot.conflict_count, 1);
    assert_eq!(snapshot.retry_count, 1);
    assert_eq!(snapshot.retry_exhausted_count, 0);

    let reads = snapshot.operation("read_doc").expect("reads recorded");
    assert_eq!(reads.count, 2);
    assert_eq!(reads.error_count, 0);
    assert_eq!(snapshot.operation("save_doc").map(|op| op.count), Some(2));
    assert_eq!(snapshot.operation("delete_doc").map(|op| op.count), Some(1));
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_one_winner_per_revision() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "race").await;
    let rev = db.save_doc("shared", None, &CouchDoc::json(r#"{"writer":-1}"#)).await.unwrap();

    let mut set = JoinSet::new();
    for writer in 0..16 {
        let db = db.clone();
        let rev = rev.clone();
        set.spawn(async move {
            let doc = CouchDoc::from_value(&json!({ "writer": writer }));
            db.save_doc("shared", Some(&rev), &doc).await
        });
    }

    let mut winners = 0;
    while let Some(joined) = set.join_next().await {
        match joined.expect("task should not panic") {
            Ok(_) => winners += 1,
            Err(CouchError::Conflict { .. }) => {},
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_one_winner() {
    let server = MockCouchServer::new();
    let db = create_test_database(&server, "race").await;

    let mut set = JoinSet::new();
    for _ in 0..8 {
        let db = db.clone();
        set.spawn(async move { db.save_doc("fresh", None, &CouchDoc::json("{}")).await });
    }

    let results: Vec<_> = set.join_all().await;
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().all(|r| matches!(r, Ok(_) | Err(CouchError::Conflict { .. }))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_on_distinct_ids() {
    let server = MockCouchServer::new();
    let config = test_config();
    let db = database_with(&server, "parallel", &config).await;

    let mut set = JoinSet::new();
    for task in 0..8 {
        let db = db.clone();
        set.spawn(async move {
            for i in 0..10 {
                let id = format!("t{task}-{i:02}");
                db.save_doc(&id, None, &CouchDoc::json("{}")).await.expect("save");
            }
        });
    }
    while let Some(joined) = set.join_next().await {
        joined.expect("task should not panic");
    }

    assert_eq!(db.read_doc_range("", "", 0, 0).await.unwrap().len(), 80);
}
