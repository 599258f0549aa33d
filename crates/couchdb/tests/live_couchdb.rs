//! Integration tests against a real CouchDB server.
//!
//! These tests require a running CouchDB. They are skipped unless the
//! `RUN_COUCHDB_INTEGRATION_TESTS` environment variable is set.
//!
//! # Running the tests
//!
//! ```bash
//! # Start CouchDB
//! docker run -d --name couchdb -p 5984:5984 \
//!     -e COUCHDB_USER=admin -e COUCHDB_PASSWORD=adminpw couchdb:3.3
//!
//! # Run tests
//! RUN_COUCHDB_INTEGRATION_TESTS=1 \
//! COUCHDB_ADDRESS=localhost:5984 \
//! COUCHDB_USERNAME=admin \
//! COUCHDB_PASSWORD=adminpw \
//! cargo test -p statedb-couchdb --test live_couchdb -- --test-threads=1
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    env,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use serde_json::json;
use statedb_couchdb::{CouchDatabase, CouchDoc, CouchError, CouchInstance, prefix_range_end};

// ============================================================================
// Test Configuration
// ============================================================================

/// Global counter for generating unique database names per test.
static DB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Check if real CouchDB integration tests should run.
fn should_run() -> bool {
    env::var("RUN_COUCHDB_INTEGRATION_TESTS").is_ok()
}

fn couchdb_address() -> String {
    env::var("COUCHDB_ADDRESS").unwrap_or_else(|_| "localhost:5984".to_string())
}

fn couchdb_username() -> String {
    env::var("COUCHDB_USERNAME").unwrap_or_else(|_| "admin".to_string())
}

fn couchdb_password() -> String {
    env::var("COUCHDB_PASSWORD").unwrap_or_else(|_| "adminpw".to_string())
}

fn instance() -> CouchInstance {
    CouchInstance::new(&couchdb_address(), &couchdb_username(), &couchdb_password())
        .expect("valid CouchDB address")
}

/// Creates a fresh database whose name no other test uses.
async fn fresh_database() -> CouchDatabase {
    let stamp =
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default();
    let name = format!("statedb_test_{stamp}_{}", DB_COUNTER.fetch_add(1, Ordering::SeqCst));
    let db = instance().database(name).expect("database handle");
    db.create_if_not_exist().await.expect("create database");
    db
}

macro_rules! skip_unless_enabled {
    () => {
        if !should_run() {
            eprintln!("skipping: RUN_COUCHDB_INTEGRATION_TESTS not set");
            return;
        }
    };
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn live_verify_connection() {
    skip_unless_enabled!();

    let info = instance().verify_connection().await.expect("verify");
    assert_eq!(info.couchdb, "Welcome");
}

#[tokio::test]
async fn live_database_lifecycle() {
    skip_unless_enabled!();

    let db = fresh_database().await;
    assert!(!db.create_if_not_exist().await.unwrap());
    assert_eq!(db.info().await.unwrap().doc_count, 0);

    db.drop().await.unwrap();
    assert!(matches!(db.info().await, Err(CouchError::NotFound { .. })));
}

#[tokio::test]
async fn live_document_lifecycle() {
    skip_unless_enabled!();

    let db = fresh_database().await;
    let body = r#"{"asset_name":"marble1","color":"blue"}"#;

    let rev = db.save_doc("idWith/slash", None, &CouchDoc::json(body)).await.unwrap();
    let stored = db.read_doc("idWith/slash").await.unwrap().expect("document exists");
    assert_eq!(stored.content.as_ref(), body.as_bytes());
    assert_eq!(stored.revision, rev);

    let next =
        db.save_doc("idWith/slash", Some(&rev), &CouchDoc::json(r#"{"v":2}"#)).await.unwrap();
    assert!(matches!(
        db.save_doc("idWith/slash", Some(&rev), &CouchDoc::json("{}")).await,
        Err(CouchError::Conflict { .. })
    ));
    assert_eq!(db.get_document_revision("idWith/slash").await.unwrap(), Some(next));

    assert!(matches!(
        db.save_doc("bad", None, &CouchDoc::json(r#"{"asset_name"}"#)).await,
        Err(CouchError::Validation { .. })
    ));

    db.delete_doc("idWith/slash", None).await.unwrap();
    assert!(db.read_doc("idWith/slash").await.unwrap().is_none());
    db.delete_doc("idWith/slash", None).await.unwrap();

    db.drop().await.unwrap();
}

#[tokio::test]
async fn live_attachment_roundtrip() {
    skip_unless_enabled!();

    let db = fresh_database().await;
    let raw: Vec<u8> = (0..=255u8).collect();

    db.save_doc("bin", None, &CouchDoc::value_bytes(raw.clone(), "")).await.unwrap();
    let stored = db.read_doc("bin").await.unwrap().expect("document exists");
    assert_eq!(stored.content.as_ref(), raw.as_slice());

    let listed = db.read_doc_range("", "", 0, 0).await.unwrap();
    assert_eq!(listed[0].content.as_ref(), raw.as_slice());

    db.drop().await.unwrap();
}

#[tokio::test]
async fn live_range_scan_with_sentinel_suffixes() {
    skip_unless_enabled!();

    let db = fresh_database().await;
    let suffixes = ["\u{0}", "mid", "\u{10FFFE}"];
    for i in 0..20 {
        for suffix in suffixes {
            let id = format!("key{i}{suffix}");
            let doc = CouchDoc::from_value(&json!({ "asset_name": &id }));
            db.save_doc(&id, None, &doc).await.unwrap();
        }
    }

    let docs = db.read_doc_range("key10", &prefix_range_end("key10"), 1000, 0).await.unwrap();
    let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, ["key10\u{0}", "key10mid", "key10\u{10FFFE}"]);

    db.drop().await.unwrap();
}
