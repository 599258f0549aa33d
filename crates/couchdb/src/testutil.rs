//! Shared test utilities for CouchDB client testing.
//!
//! [`MockCouchServer`] is an in-process [`Transport`] that emulates the parts
//! of the CouchDB HTTP API this crate uses: databases, revisions and
//! conflicts, multipart and inline attachments, `_all_docs` ranges and key
//! lookups, `_bulk_docs`, `_find` selectors and `_ensure_full_commit`. Faults
//! (refused connections, error statuses, slow responses) can be injected, and
//! every request is recorded.
//!
//! It is feature-gated behind `testutil` to prevent leaking into production
//! builds.
//!
//! # Usage
//!
//! In integration tests, enable the feature in `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! statedb-couchdb = { path = "../couchdb", features = ["testutil"] }
//! ```
//!
//! Then import helpers:
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use statedb_couchdb::testutil::{MockCouchServer, create_test_database};
//! ```

use std::{
    cmp::Ordering,
    collections::{BTreeMap, VecDeque},
    fmt,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::{
    Method, StatusCode,
    header::{ACCEPT, CONTENT_TYPE, ETAG, HeaderValue},
};
use serde_json::{Map, Value, json};

use crate::{
    attachment::{
        Attachment, DEFAULT_ATTACHMENT_TYPE, encode_multipart, multipart_boundary, split_multipart,
    },
    config::{CouchDbConfig, RetryConfig},
    database::CouchDatabase,
    error::{CouchError, Result},
    instance::CouchInstance,
    keys::decode_range_key,
    range::DESIGN_PREFIX,
    transport::{APPLICATION_JSON, CouchRequest, CouchResponse, Transport},
};

/// Version reported by the mock's welcome response.
pub const MOCK_VERSION: &str = "3.3.3";

const DEFAULT_FIND_LIMIT: usize = 25;

/// Top-level fields CouchDB accepts in a written document.
const SPECIAL_FIELDS: [&str; 4] = ["_id", "_rev", "_deleted", "_attachments"];

/// A request as seen by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    /// HTTP method.
    pub method: Method,
    /// Decoded path, segments joined with `/`.
    pub path: String,
    /// Query parameters, decoded.
    pub query: Vec<(String, String)>,
}

/// An error answer of the mock.
#[derive(Debug)]
struct Failure {
    status: StatusCode,
    error: &'static str,
    reason: String,
}

impl Failure {
    fn new(status: StatusCode, error: &'static str, reason: impl Into<String>) -> Self {
        Self { status, error, reason: reason.into() }
    }

    fn conflict() -> Self {
        Self::new(StatusCode::CONFLICT, "conflict", "Document update conflict.")
    }

    fn missing(reason: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", reason)
    }

    fn missing_database() -> Self {
        Self::missing("Database does not exist.")
    }

    fn bad_request(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", reason)
    }

    fn response(&self) -> CouchResponse {
        CouchResponse::json(self.status, &json!({ "error": self.error, "reason": self.reason }))
    }
}

type Answer = std::result::Result<CouchResponse, Failure>;

#[derive(Debug, Clone)]
struct MockDoc {
    generation: u64,
    revision: String,
    deleted: bool,
    fields: Map<String, Value>,
    attachments: Vec<Attachment>,
}

impl MockDoc {
    fn identity(&self, id: &str) -> Map<String, Value> {
        let mut doc = Map::new();
        doc.insert("_id".to_owned(), Value::from(id));
        doc.insert("_rev".to_owned(), Value::from(self.revision.as_str()));
        doc.extend(self.fields.clone());
        doc
    }

    /// JSON form with attachments as stubs, or inline base64 when `inline`.
    fn to_json(&self, id: &str, inline: bool) -> Value {
        let mut doc = self.identity(id);
        if !self.attachments.is_empty() {
            let stubs: Map<String, Value> = self
                .attachments
                .iter()
                .map(|a| {
                    let stub = if inline {
                        json!({ "content_type": a.content_type, "data": STANDARD.encode(&a.data) })
                    } else {
                        json!({
                            "content_type": a.content_type,
                            "length": a.data.len(),
                            "stub": true
                        })
                    };
                    (a.name.clone(), stub)
                })
                .collect();
            doc.insert("_attachments".to_owned(), Value::Object(stubs));
        }
        Value::Object(doc)
    }

    fn size(&self) -> u64 {
        let fields = Value::Object(self.fields.clone()).to_string().len();
        let attachments: usize = self.attachments.iter().map(|a| a.data.len()).sum();
        (fields + attachments) as u64
    }
}

/// Parsed body of a document write.
struct WriteBody {
    fields: Map<String, Value>,
    attachments: Vec<Attachment>,
    /// Attachments given as stubs, kept from the previous revision.
    kept: Vec<String>,
}

#[derive(Debug, Default)]
struct MockDatabase {
    docs: BTreeMap<String, MockDoc>,
    update_seq: u64,
}

impl MockDatabase {
    fn info(&self, name: &str) -> Value {
        let live = self.docs.values().filter(|d| !d.deleted).count();
        let size: u64 = self.docs.values().map(MockDoc::size).sum();
        json!({
            "db_name": name,
            "doc_count": live,
            "doc_del_count": self.docs.len() - live,
            "update_seq": format!("{}-mock", self.update_seq),
            "purge_seq": 0,
            "sizes": { "file": size + 4096, "external": size, "active": size },
            "compact_running": false,
            "disk_format_version": 8,
            "instance_start_time": "0"
        })
    }

    /// Applies one write under the store's revision rules and returns the new
    /// revision.
    fn apply_write(&mut self, id: &str, body: WriteBody) -> std::result::Result<String, Failure> {
        let WriteBody { fields, attachments, kept } = body;

        let reserved = |k: &&String| k.starts_with('_') && !SPECIAL_FIELDS.contains(&k.as_str());
        if let Some(bad) = fields.keys().find(reserved) {
            return Err(Failure::new(
                StatusCode::BAD_REQUEST,
                "doc_validation",
                format!("Bad special document member: {bad}"),
            ));
        }

        let rev = fields.get("_rev").and_then(Value::as_str).filter(|r| !r.is_empty());
        let deleted = fields.get("_deleted").and_then(Value::as_bool).unwrap_or(false);
        let existing = self.docs.get(id);

        match (existing, rev) {
            (Some(doc), rev) if !doc.deleted => {
                if rev != Some(doc.revision.as_str()) {
                    return Err(Failure::conflict());
                }
            },
            (Some(doc), Some(rev)) => {
                if rev != doc.revision {
                    return Err(Failure::conflict());
                }
            },
            (None, Some(_)) => return Err(Failure::conflict()),
            (Some(_), None) | (None, None) => {},
        }

        let generation = existing.map_or(0, |d| d.generation) + 1;
        let revision = format!("{generation}-{}", uuid::Uuid::new_v4().simple());

        let mut stored = Vec::new();
        if !deleted {
            if let Some(previous) = existing.filter(|d| !d.deleted) {
                let carried = previous.attachments.iter().filter(|a| kept.contains(&a.name));
                stored.extend(carried.cloned());
            }
            stored.extend(attachments);
            stored.sort_by(|a, b| a.name.cmp(&b.name));
        }
        let user_fields = if deleted {
            Map::new()
        } else {
            fields.into_iter().filter(|(k, _)| !k.starts_with('_')).collect()
        };

        self.docs.insert(
            id.to_owned(),
            MockDoc {
                generation,
                revision: revision.clone(),
                deleted,
                fields: user_fields,
                attachments: stored,
            },
        );
        self.update_seq += 1;
        Ok(revision)
    }

    fn get_document(&self, id: &str, request: &CouchRequest) -> Answer {
        let doc = match self.docs.get(id) {
            None => return Err(Failure::missing("missing")),
            Some(doc) if doc.deleted => return Err(Failure::missing("deleted")),
            Some(doc) => doc,
        };

        let with_attachments = request.query_param("attachments") == Some("true");
        let accepts_multipart = request
            .headers
            .get(ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("multipart/related"));

        let mut response = if with_attachments && accepts_multipart && !doc.attachments.is_empty() {
            let encoded = encode_multipart(doc.identity(id), &doc.attachments).map_err(|e| {
                Failure::new(StatusCode::INTERNAL_SERVER_ERROR, "unknown_error", e.to_string())
            })?;
            CouchResponse::new(StatusCode::OK, Some(&encoded.content_type), encoded.body)
        } else {
            CouchResponse::json(StatusCode::OK, &doc.to_json(id, with_attachments))
        };

        if let Ok(etag) = HeaderValue::from_str(&format!("\"{}\"", doc.revision)) {
            response.headers.insert(ETAG, etag);
        }
        Ok(response)
    }

    fn put_document(&mut self, id: &str, request: &CouchRequest) -> Answer {
        if id.starts_with('_') && !id.starts_with(DESIGN_PREFIX) {
            return Err(Failure::bad_request(
                "Only reserved document ids may start with underscore.",
            ));
        }
        let content_type = request
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(APPLICATION_JSON);
        let mut body = parse_write_body(content_type, &request.body)?;
        if let Some(rev) = request.query_param("rev") {
            body.fields.entry("_rev").or_insert_with(|| Value::from(rev));
        }

        let rev = self.apply_write(id, body)?;
        Ok(CouchResponse::json(StatusCode::CREATED, &json!({ "ok": true, "id": id, "rev": rev })))
    }

    fn delete_document(&mut self, id: &str, request: &CouchRequest) -> Answer {
        // A tombstone answers 404 without a rev; with one it goes through the
        // revision check like any write, so a stale rev conflicts.
        match self.docs.get(id) {
            None => return Err(Failure::missing("missing")),
            Some(doc) if doc.deleted && request.query_param("rev").is_none() => {
                return Err(Failure::missing("deleted"));
            },
            Some(_) => {},
        }
        let Some(rev) = request.query_param("rev") else {
            return Err(Failure::conflict());
        };

        let mut fields = Map::new();
        fields.insert("_rev".to_owned(), Value::from(rev));
        fields.insert("_deleted".to_owned(), Value::Bool(true));
        let body = WriteBody { fields, attachments: Vec::new(), kept: Vec::new() };
        let rev = self.apply_write(id, body)?;
        Ok(CouchResponse::json(StatusCode::OK, &json!({ "ok": true, "id": id, "rev": rev })))
    }

    fn all_docs(&self, request: &CouchRequest) -> Answer {
        let bound = |names: [&str; 2]| -> std::result::Result<Option<String>, Failure> {
            match names.iter().find_map(|name| request.query_param(name)) {
                None => Ok(None),
                Some(raw) => {
                    decode_range_key(raw).map(Some).map_err(|e| Failure::bad_request(e.to_string()))
                },
            }
        };
        let start = bound(["startkey", "start_key"])?;
        let end = bound(["endkey", "end_key"])?;
        let inclusive_end = request.query_param("inclusive_end") != Some("false");
        let limit = parse_count(request.query_param("limit"), "limit")?.unwrap_or(usize::MAX);
        let skip = parse_count(request.query_param("skip"), "skip")?.unwrap_or(0);
        let include_docs = request.query_param("include_docs") == Some("true");
        let inline = request.query_param("attachments") == Some("true");

        if let (Some(start), Some(end)) = (&start, &end) {
            if start > end {
                return Err(Failure::new(
                    StatusCode::BAD_REQUEST,
                    "query_parse_error",
                    "No rows can match your key range, reverse your start_key and end_key or set \
                     descending=true",
                ));
            }
        }

        let live: Vec<(&String, &MockDoc)> = self.docs.iter().filter(|(_, d)| !d.deleted).collect();
        let before_start = live
            .iter()
            .filter(|(id, _)| start.as_deref().is_some_and(|s| id.as_str() < s))
            .count();

        let rows: Vec<Value> = live
            .iter()
            .filter(|(id, _)| start.as_deref().is_none_or(|s| id.as_str() >= s))
            .filter(|(id, _)| {
                end.as_deref()
                    .is_none_or(|e| if inclusive_end { id.as_str() <= e } else { id.as_str() < e })
            })
            .skip(skip)
            .take(limit)
            .map(|(id, doc)| {
                let mut row = json!({ "id": id, "key": id, "value": { "rev": doc.revision } });
                if include_docs {
                    row["doc"] = doc.to_json(id, inline);
                }
                row
            })
            .collect();

        Ok(CouchResponse::json(
            StatusCode::OK,
            &json!({ "total_rows": live.len(), "offset": before_start + skip, "rows": rows }),
        ))
    }

    fn all_docs_by_keys(&self, request: &CouchRequest) -> Answer {
        let body = parse_object(&request.body)?;
        let Some(keys) = body.get("keys").and_then(Value::as_array) else {
            return Err(Failure::bad_request("`keys` member must be an array."));
        };

        let rows: Vec<Value> = keys
            .iter()
            .map(|key| match key.as_str().and_then(|id| self.docs.get(id).map(|doc| (id, doc))) {
                Some((id, doc)) if doc.deleted => json!({
                    "id": id,
                    "key": id,
                    "value": { "rev": doc.revision, "deleted": true },
                    "doc": null
                }),
                Some((id, doc)) => json!({ "id": id, "key": id, "value": { "rev": doc.revision } }),
                None => json!({ "key": key, "error": "not_found" }),
            })
            .collect();

        let body = json!({ "total_rows": self.docs.len(), "rows": rows });
        Ok(CouchResponse::json(StatusCode::OK, &body))
    }

    fn bulk_docs(&mut self, request: &CouchRequest) -> Answer {
        let body = parse_object(&request.body)?;
        let Some(docs) = body.get("docs").and_then(Value::as_array) else {
            return Err(Failure::bad_request("POST body must include `docs` parameter."));
        };

        let mut results = Vec::with_capacity(docs.len());
        for doc in docs {
            let Some(fields) = doc.as_object() else {
                return Err(Failure::bad_request("Document must be a JSON object"));
            };
            let id = fields
                .get("_id")
                .and_then(Value::as_str)
                .map_or_else(|| uuid::Uuid::new_v4().simple().to_string(), str::to_owned);

            let outcome =
                inline_write_body(fields.clone()).and_then(|body| self.apply_write(&id, body));
            results.push(match outcome {
                Ok(rev) => json!({ "ok": true, "id": id, "rev": rev }),
                Err(failure) => {
                    json!({ "id": id, "error": failure.error, "reason": failure.reason })
                },
            });
        }

        Ok(CouchResponse::json(StatusCode::CREATED, &Value::Array(results)))
    }

    fn find(&self, request: &CouchRequest) -> Answer {
        let query = parse_object(&request.body)?;
        let Some(selector) = query.get("selector").and_then(Value::as_object) else {
            return Err(Failure::new(
                StatusCode::BAD_REQUEST,
                "missing_required_key",
                "Missing required key: selector",
            ));
        };
        let limit =
            query.get("limit").and_then(Value::as_u64).map_or(DEFAULT_FIND_LIMIT, |l| l as usize);
        let skip = query.get("skip").and_then(Value::as_u64).map_or(0, |s| s as usize);
        let after = match query.get("bookmark").and_then(Value::as_str) {
            None | Some("nil") => None,
            Some(bookmark) => Some(
                STANDARD
                    .decode(bookmark)
                    .ok()
                    .and_then(|raw| String::from_utf8(raw).ok())
                    .ok_or_else(|| Failure::bad_request("Invalid bookmark value"))?,
            ),
        };
        let projection: Option<Vec<&str>> = match query.get("fields") {
            None => None,
            Some(Value::Array(fields)) => Some(fields.iter().filter_map(Value::as_str).collect()),
            Some(_) => return Err(Failure::bad_request("fields must be an array")),
        };

        let mut matched = Vec::new();
        let mut last_id = None;
        for (id, doc) in &self.docs {
            if doc.deleted
                || id.starts_with(DESIGN_PREFIX)
                || after.as_deref().is_some_and(|after| id.as_str() <= after)
            {
                continue;
            }
            let value = doc.to_json(id, false);
            if !selector_matches(selector, &value)? {
                continue;
            }
            matched.push((id, value));
        }

        let docs: Vec<Value> = matched
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|(id, value)| {
                last_id = Some(id.clone());
                match (&projection, value) {
                    (Some(fields), Value::Object(map)) => Value::Object(
                        map.into_iter().filter(|(k, _)| fields.contains(&k.as_str())).collect(),
                    ),
                    (_, value) => value,
                }
            })
            .collect();

        let bookmark = last_id.map_or_else(|| "nil".to_owned(), |id| STANDARD.encode(id));
        Ok(CouchResponse::json(
            StatusCode::OK,
            &json!({
                "docs": docs,
                "bookmark": bookmark,
                "warning": "No matching index found, create an index to optimize query time."
            }),
        ))
    }
}

fn parse_count(raw: Option<&str>, name: &str) -> std::result::Result<Option<usize>, Failure> {
    raw.map(|value| {
        value.parse().map_err(|_| {
            Failure::new(
                StatusCode::BAD_REQUEST,
                "query_parse_error",
                format!("Invalid value for integer: \"{value}\" ({name})"),
            )
        })
    })
    .transpose()
}

fn parse_object(body: &[u8]) -> std::result::Result<Map<String, Value>, Failure> {
    match serde_json::from_slice(body) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(_) => Err(Failure::bad_request("Document must be a JSON object")),
        Err(_) => Err(Failure::bad_request("invalid UTF-8 JSON")),
    }
}

/// Splits inline `_attachments` into decoded attachments and kept stubs.
fn inline_write_body(mut fields: Map<String, Value>) -> std::result::Result<WriteBody, Failure> {
    let mut attachments = Vec::new();
    let mut kept = Vec::new();

    if let Some(Value::Object(stubs)) = fields.remove("_attachments") {
        for (name, stub) in stubs {
            let content_type = stub
                .get("content_type")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_ATTACHMENT_TYPE)
                .to_owned();
            match stub.get("data").and_then(Value::as_str) {
                Some(data) => {
                    let data = STANDARD.decode(data).map_err(|_| {
                        Failure::bad_request(format!("Invalid attachment data for {name}"))
                    })?;
                    attachments.push(Attachment::new(name, content_type, data));
                },
                None if stub.get("stub").and_then(Value::as_bool) == Some(true) => kept.push(name),
                None => {
                    return Err(Failure::bad_request(format!("Invalid attachment stub for {name}")));
                },
            }
        }
    }
    Ok(WriteBody { fields, attachments, kept })
}

/// Parses a document write, JSON or `multipart/related`.
fn parse_write_body(content_type: &str, body: &Bytes) -> std::result::Result<WriteBody, Failure> {
    let Some(boundary) = multipart_boundary(content_type) else {
        return inline_write_body(parse_object(body)?);
    };

    let parts = split_multipart(body, &boundary).map_err(|e| Failure::bad_request(e.to_string()))?;
    let mut parts = parts.into_iter();
    let json = parts.next().ok_or_else(|| Failure::bad_request("multipart body has no JSON part"))?;
    let mut fields = parse_object(&json.data)?;

    let stubs = match fields.remove("_attachments") {
        Some(Value::Object(stubs)) => stubs,
        _ => Map::new(),
    };
    let mut following = stubs
        .iter()
        .filter(|(_, stub)| stub.get("follows").and_then(Value::as_bool) == Some(true))
        .map(|(name, _)| name.clone())
        .collect::<VecDeque<_>>();

    let mut attachments = Vec::new();
    for part in parts {
        let positional = following.pop_front();
        let Some(name) = part.filename().or(positional) else {
            return Err(Failure::bad_request("attachment part without a matching stub"));
        };
        let content_type = stubs
            .get(&name)
            .and_then(|stub| stub.get("content_type"))
            .and_then(Value::as_str)
            .or_else(|| part.header("content-type"))
            .unwrap_or(DEFAULT_ATTACHMENT_TYPE)
            .to_owned();
        attachments.push(Attachment { name, content_type, data: part.data });
    }
    if !following.is_empty() {
        return Err(Failure::bad_request("multipart body is missing attachment parts"));
    }

    Ok(WriteBody { fields, attachments, kept: Vec::new() })
}

fn field_at<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |value, key| value.get(key))
}

fn compare(actual: &Value, operand: &Value) -> Option<Ordering> {
    match (actual, operand) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn operator_matches(
    op: &str,
    operand: &Value,
    actual: Option<&Value>,
) -> std::result::Result<bool, Failure> {
    let ordered = |accept: fn(Ordering) -> bool| {
        actual.and_then(|a| compare(a, operand)).is_some_and(accept)
    };
    Ok(match op {
        "$eq" => actual == Some(operand),
        "$ne" => actual != Some(operand),
        "$exists" => operand.as_bool() == Some(actual.is_some()),
        "$gt" => ordered(Ordering::is_gt),
        "$gte" => ordered(Ordering::is_ge),
        "$lt" => ordered(Ordering::is_lt),
        "$lte" => ordered(Ordering::is_le),
        "$in" => {
            operand.as_array().is_some_and(|values| actual.is_some_and(|a| values.contains(a)))
        },
        _ => {
            return Err(Failure::new(
                StatusCode::BAD_REQUEST,
                "invalid_operator",
                format!("Invalid operator: {op}"),
            ));
        },
    })
}

fn selector_matches(
    selector: &Map<String, Value>,
    doc: &Value,
) -> std::result::Result<bool, Failure> {
    for (field, condition) in selector {
        let matched = match field.as_str() {
            "$and" | "$or" => {
                let Some(clauses) = condition.as_array() else {
                    return Err(Failure::bad_request(format!("{field} requires an array")));
                };
                let mut results = Vec::with_capacity(clauses.len());
                for clause in clauses {
                    let Some(clause) = clause.as_object() else {
                        let reason = format!("{field} clauses must be objects");
                        return Err(Failure::bad_request(reason));
                    };
                    results.push(selector_matches(clause, doc)?);
                }
                if field == "$and" {
                    results.iter().all(|r| *r)
                } else {
                    results.iter().any(|r| *r)
                }
            },
            _ => {
                let actual = field_at(doc, field);
                match condition {
                    Value::Object(ops)
                        if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) =>
                    {
                        let mut all = true;
                        for (op, operand) in ops {
                            all &= operator_matches(op, operand, actual)?;
                        }
                        all
                    },
                    expected => actual == Some(expected),
                }
            },
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

#[derive(Debug, Default)]
struct ServerState {
    databases: BTreeMap<String, MockDatabase>,
    requests: Vec<RecordedRequest>,
    write_count: usize,
    unavailable: bool,
    delay: Option<Duration>,
    failures: VecDeque<u16>,
}

impl ServerState {
    fn route(&mut self, request: &CouchRequest) -> Answer {
        let method = request.method.as_str();
        let segments: Vec<&str> = request.segments.iter().map(String::as_str).collect();

        match segments.as_slice() {
            [] => match method {
                "GET" | "HEAD" => Ok(CouchResponse::json(
                    StatusCode::OK,
                    &json!({
                        "couchdb": "Welcome",
                        "version": MOCK_VERSION,
                        "vendor": { "name": "The Apache Software Foundation" }
                    }),
                )),
                _ => Err(method_not_allowed()),
            },
            [name] => self.database_request(name, method),
            [name, rest @ ..] => {
                let Some(database) = self.databases.get_mut(*name) else {
                    return Err(Failure::missing_database());
                };
                match (rest, method) {
                    (["_all_docs"], "GET") => database.all_docs(request),
                    (["_all_docs"], "POST") => database.all_docs_by_keys(request),
                    (["_find"], "POST") => database.find(request),
                    (["_bulk_docs"], "POST") => {
                        self.write_count += 1;
                        database.bulk_docs(request)
                    },
                    (["_ensure_full_commit"], "POST") => Ok(CouchResponse::json(
                        StatusCode::CREATED,
                        &json!({ "ok": true, "instance_start_time": "0" }),
                    )),
                    ([id], "GET" | "HEAD") => database.get_document(id, request),
                    ([id], "PUT") => {
                        self.write_count += 1;
                        database.put_document(id, request)
                    },
                    ([id], "DELETE") => {
                        self.write_count += 1;
                        database.delete_document(id, request)
                    },
                    ([_], _) => Err(method_not_allowed()),
                    _ => Err(Failure::missing("missing")),
                }
            },
        }
    }

    fn database_request(&mut self, name: &str, method: &str) -> Answer {
        match method {
            "GET" | "HEAD" => match self.databases.get(name) {
                Some(database) => Ok(CouchResponse::json(StatusCode::OK, &database.info(name))),
                None => Err(Failure::missing_database()),
            },
            "PUT" => {
                self.write_count += 1;
                if self.databases.contains_key(name) {
                    return Err(Failure::new(
                        StatusCode::PRECONDITION_FAILED,
                        "file_exists",
                        "The database could not be created, the file already exists.",
                    ));
                }
                self.databases.insert(name.to_owned(), MockDatabase::default());
                Ok(CouchResponse::json(StatusCode::CREATED, &json!({ "ok": true })))
            },
            "DELETE" => {
                self.write_count += 1;
                match self.databases.remove(name) {
                    Some(_) => Ok(CouchResponse::json(StatusCode::OK, &json!({ "ok": true }))),
                    None => Err(Failure::missing_database()),
                }
            },
            _ => Err(method_not_allowed()),
        }
    }
}

fn method_not_allowed() -> Failure {
    Failure::new(
        StatusCode::METHOD_NOT_ALLOWED,
        "method_not_allowed",
        "Only GET,HEAD,PUT,DELETE allowed",
    )
}

/// In-process emulation of a CouchDB server.
///
/// Clones share state, so a test can keep one handle for inspection and
/// fault injection while the client uses [`transport`](Self::transport).
#[derive(Clone, Default)]
pub struct MockCouchServer {
    state: Arc<Mutex<ServerState>>,
}

impl fmt::Debug for MockCouchServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockCouchServer")
            .field("databases", &state.databases.len())
            .field("requests", &state.requests.len())
            .finish_non_exhaustive()
    }
}

impl MockCouchServer {
    /// Creates an empty server.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a transport that sends requests to this server.
    #[must_use]
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }

    /// Makes every request fail as if the connection was refused.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Delays every response by `delay`.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().delay = delay;
    }

    /// Answers the next `count` requests with `status` instead of handling them.
    pub fn fail_next(&self, count: usize, status: u16) {
        self.state.lock().failures.extend(std::iter::repeat_n(status, count));
    }

    /// Returns the number of requests received, including failed ones.
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.state.lock().requests.len()
    }

    /// Returns the number of mutating requests handled.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.state.lock().write_count
    }

    /// Returns every request received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }

    /// Forgets the recorded requests.
    pub fn clear_requests(&self) {
        self.state.lock().requests.clear();
    }

    /// Returns the names of all databases.
    #[must_use]
    pub fn database_names(&self) -> Vec<String> {
        self.state.lock().databases.keys().cloned().collect()
    }

    /// Returns the ids of the live documents of `database`, in id order.
    #[must_use]
    pub fn document_ids(&self, database: &str) -> Vec<String> {
        self.state
            .lock()
            .databases
            .get(database)
            .map(|db| {
                db.docs.iter().filter(|(_, d)| !d.deleted).map(|(id, _)| id.clone()).collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for MockCouchServer {
    async fn send(&self, request: &CouchRequest) -> Result<CouchResponse> {
        let delay = {
            let mut state = self.state.lock();
            state.requests.push(RecordedRequest {
                method: request.method.clone(),
                path: request.resource(),
                query: request.query.clone(),
            });
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.unavailable {
            return Err(CouchError::connection("connection refused"));
        }
        if let Some(status) = state.failures.pop_front() {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let failure = Failure::new(status, "injected_failure", "injected by MockCouchServer");
            return Ok(failure.response());
        }

        let mut response = state.route(request).unwrap_or_else(|failure| failure.response());
        if request.method == Method::HEAD {
            response.body = Bytes::new();
        }
        Ok(response)
    }
}

/// Returns a configuration suited to tests: short timeouts and fast retries.
///
/// # Panics
///
/// Panics if the builder rejects the values (it should not).
#[must_use]
pub fn test_config() -> CouchDbConfig {
    let retry = RetryConfig::builder()
        .max_retries(2)
        .initial_backoff(Duration::from_millis(1))
        .max_backoff(Duration::from_millis(10))
        .build()
        .expect("valid retry config");

    CouchDbConfig::builder()
        .address("localhost:5984")
        .request_timeout(Duration::from_secs(5))
        .retry(retry)
        .build()
        .expect("valid test config")
}

/// Creates an instance that talks to `server` with [`test_config`].
///
/// # Panics
///
/// Panics if instance creation fails.
#[must_use]
pub fn create_test_instance(server: &MockCouchServer) -> CouchInstance {
    CouchInstance::with_transport(&test_config(), server.transport())
        .expect("instance creation should succeed")
}

/// Creates the database `name` on `server` and returns a handle for it.
///
/// # Panics
///
/// Panics if the database cannot be created.
pub async fn create_test_database(server: &MockCouchServer, name: &str) -> CouchDatabase {
    let db = create_test_instance(server).database(name).expect("valid database name");
    db.create_if_not_exist().await.expect("database creation should succeed");
    db
}
