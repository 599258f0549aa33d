//! Range scans over document ids.
//!
//! Scans read `_all_docs`, which lists documents in ascending code point
//! order of their ids, with bounds `[start, end)`. A scan larger than the
//! configured page cap is fetched in several requests: each follow-up page
//! starts at the last id already returned and skips it, so the caller sees
//! one contiguous sequence. No cursor state lives on the server; re-running a
//! scan over an unchanged database yields the same documents in the same
//! order.
//!
//! `_all_docs` also lists design documents (`_design/...`), which hold index
//! definitions rather than state. Scans leave them out and do not count them
//! against the caller's limit.

use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;

use crate::{
    attachment::decode_value,
    database::CouchDatabase,
    error::{CouchError, Result},
    keys::encode_range_key,
    retry::RetryMode,
    transport::{APPLICATION_JSON, CouchRequest},
    types::{Revision, StoredDoc},
};

/// Id prefix of the store's design documents.
pub(crate) const DESIGN_PREFIX: &str = "_design/";

/// Body of an `_all_docs` response.
#[derive(Debug, Deserialize)]
pub(crate) struct AllDocsResponse {
    #[serde(default)]
    pub(crate) rows: Vec<AllDocsRow>,
}

/// One row of an `_all_docs` response.
#[derive(Debug, Deserialize)]
pub(crate) struct AllDocsRow {
    #[serde(default)]
    pub(crate) id: Option<String>,
    #[serde(default)]
    pub(crate) key: Value,
    #[serde(default)]
    pub(crate) value: Option<RowValue>,
    #[serde(default)]
    pub(crate) doc: Option<Value>,
    #[serde(default)]
    pub(crate) error: Option<String>,
}

/// The `value` of an `_all_docs` row.
#[derive(Debug, Deserialize)]
pub(crate) struct RowValue {
    pub(crate) rev: Revision,
    #[serde(default)]
    pub(crate) deleted: bool,
}

/// A restartable, page-at-a-time scan over `[start, end)`.
///
/// Created by [`CouchDatabase::range_cursor`]. Each
/// [`next_page`](Self::next_page) call issues one request; an empty page
/// means the scan is complete.
///
/// # Example
///
/// ```no_run
/// use statedb_couchdb::{CouchInstance, prefix_range_end};
///
/// # async fn example() -> statedb_couchdb::Result<()> {
/// let db = CouchInstance::new("localhost:5984", "", "")?.database("ledger")?;
/// let mut cursor = db.range_cursor("asset", &prefix_range_end("asset"), 0, 0);
/// loop {
///     let page = cursor.next_page().await?;
///     if page.is_empty() {
///         break;
///     }
///     for doc in page {
///         println!("{} @ {}", doc.id, doc.revision);
///     }
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RangeCursor {
    db: CouchDatabase,
    start: String,
    end: String,
    skip: u32,
    remaining: Option<u64>,
    page_size: u32,
    resume_after: Option<String>,
    exhausted: bool,
}

impl RangeCursor {
    /// Caps the number of documents fetched per request; zero is treated as one.
    #[must_use]
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Returns `true` once the scan has returned everything.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Returns the id of the last document returned so far.
    #[must_use]
    pub fn last_id(&self) -> Option<&str> {
        self.resume_after.as_deref()
    }

    /// Fetches the next page of documents.
    ///
    /// Returns an empty vector once the scan is exhausted. Documents whose
    /// value is an attachment carry the attachment bytes as content.
    ///
    /// # Errors
    ///
    /// Returns [`CouchError::Connection`] if the store stays unreachable.
    #[tracing::instrument(
        skip(self),
        fields(db = %self.db.name(), resume_after = ?self.resume_after)
    )]
    pub async fn next_page(&mut self) -> Result<Vec<StoredDoc>> {
        // A page of only design documents comes back empty; keep going.
        while !self.exhausted {
            let docs = self.fetch_page().await?;
            if !docs.is_empty() {
                return Ok(docs);
            }
        }
        Ok(Vec::new())
    }

    async fn fetch_page(&mut self) -> Result<Vec<StoredDoc>> {
        let fetch = match self.remaining {
            Some(remaining) => remaining.min(u64::from(self.page_size)),
            None => u64::from(self.page_size),
        };

        let mut request = CouchRequest::new(Method::GET, self.db.segments(&["_all_docs"]))
            .query("include_docs", "true")
            .query("attachments", "true")
            .query("inclusive_end", "false")
            .query("limit", fetch.to_string())
            .accept(APPLICATION_JSON);

        match &self.resume_after {
            Some(last) => {
                request = request.query("startkey", encode_range_key(last)?).query("skip", "1");
            },
            None => {
                if !self.start.is_empty() {
                    request = request.query("startkey", encode_range_key(&self.start)?);
                }
                if self.skip > 0 {
                    request = request.query("skip", self.skip.to_string());
                }
            },
        }
        if !self.end.is_empty() {
            request = request.query("endkey", encode_range_key(&self.end)?);
        }

        let sent =
            self.db.instance().execute("read_doc_range", request, RetryMode::Idempotent).await;
        let response = match sent {
            Ok(response) => response,
            Err(CouchError::NotFound { .. }) => {
                tracing::debug!("database not found, range is empty");
                self.exhausted = true;
                return Ok(Vec::new());
            },
            Err(err) => return Err(err),
        };
        let page: AllDocsResponse = response.parse_json()?;

        let fetched = page.rows.len() as u64;
        let design_rows = page
            .rows
            .iter()
            .filter(|row| row.id.as_deref().is_some_and(|id| id.starts_with(DESIGN_PREFIX)))
            .count() as u64;
        if let Some(last) = page.rows.last().and_then(|row| row.id.clone()) {
            self.resume_after = Some(last);
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(fetched - design_rows);
        }
        if fetched < fetch || self.remaining == Some(0) {
            self.exhausted = true;
        }

        let mut docs = Vec::with_capacity(page.rows.len());
        for row in page.rows {
            let (Some(id), Some(doc)) = (row.id, row.doc) else {
                continue;
            };
            if id.starts_with(DESIGN_PREFIX) {
                continue;
            }
            if let Some(stored) = self.db.resolve_document(&id, doc).await? {
                docs.push(stored);
            }
        }

        tracing::debug!(
            fetched,
            returned = docs.len(),
            exhausted = self.exhausted,
            "fetched range page"
        );
        Ok(docs)
    }

    /// Drains the cursor into one vector.
    ///
    /// # Errors
    ///
    /// Returns the first error of any page request.
    pub async fn collect_all(mut self) -> Result<Vec<StoredDoc>> {
        let mut docs = Vec::new();
        while !self.exhausted {
            docs.extend(self.next_page().await?);
        }
        Ok(docs)
    }
}

impl CouchDatabase {
    /// Creates a cursor over the ids in `[start, end)`.
    ///
    /// An empty `start` scans from the first id and an empty `end` through
    /// the last. `limit` caps the total number of documents, zero meaning no
    /// cap; `skip` drops that many leading documents. Requests are capped at
    /// the configured `max_page_size`.
    #[must_use]
    pub fn range_cursor(&self, start: &str, end: &str, limit: u32, skip: u32) -> RangeCursor {
        let inverted = !start.is_empty() && !end.is_empty() && start >= end;
        RangeCursor {
            db: self.clone(),
            start: start.to_owned(),
            end: end.to_owned(),
            skip,
            remaining: (limit > 0).then_some(u64::from(limit)),
            page_size: self.instance().config().max_page_size(),
            resume_after: None,
            exhausted: inverted,
        }
    }

    /// Returns the documents whose ids lie in `[start, end)` in ascending
    /// code point order.
    ///
    /// `limit` caps the number of documents returned (zero means no cap) and
    /// `skip` offsets into the ordered result. Limits above the configured
    /// page cap are served with several requests. A range without matching
    /// documents, or against a missing database, is empty.
    ///
    /// # Errors
    ///
    /// Returns [`CouchError::Connection`] if the store stays unreachable.
    #[tracing::instrument(skip(self), fields(db = %self.name()))]
    pub async fn read_doc_range(
        &self,
        start: &str,
        end: &str,
        limit: u32,
        skip: u32,
    ) -> Result<Vec<StoredDoc>> {
        self.range_cursor(start, end, limit, skip).collect_all().await
    }

    /// Turns a document returned inline by a listing into a [`StoredDoc`].
    ///
    /// Listings that only carry a stub for the value attachment are completed
    /// with a single-document read. Returns `None` for deleted documents.
    pub(crate) async fn resolve_document(&self, id: &str, doc: Value) -> Result<Option<StoredDoc>> {
        let decoded = decode_value(doc)?;
        if decoded.deleted {
            return Ok(None);
        }
        let id = decoded.id.unwrap_or_else(|| id.to_owned());
        if decoded.value_stub {
            return self.read_doc(&id).await;
        }

        let revision = decoded.revision.ok_or_else(|| {
            let reason = format!("listed document '{id}' has no revision");
            CouchError::server(200, "bad_response", reason)
        })?;
        Ok(Some(StoredDoc {
            id,
            revision,
            content: decoded.content,
            attachments: decoded.attachments,
        }))
    }
}
