//! Declarative selector queries (`_find`).

use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;

use crate::{
    database::CouchDatabase,
    error::{CouchError, Result},
    retry::RetryMode,
    transport::{APPLICATION_JSON, CouchRequest},
    types::StoredDoc,
};

/// Fields every query result needs to be turned into a [`StoredDoc`].
const REQUIRED_FIELDS: [&str; 3] = ["_id", "_rev", "_attachments"];

/// Documents matched by [`CouchDatabase::query_documents`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    /// Matching documents in the order the store returned them.
    pub docs: Vec<StoredDoc>,
    /// Token for fetching the next page of the same query.
    pub bookmark: Option<String>,
    /// Advisory message, e.g. that no index matched the selector.
    pub warning: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FindResponse {
    #[serde(default)]
    docs: Vec<Value>,
    #[serde(default)]
    bookmark: Option<String>,
    #[serde(default)]
    warning: Option<String>,
}

/// Adds the bookkeeping fields to a `fields` projection, if one is given.
fn with_required_fields(mut query: Value) -> Result<Value> {
    let Some(object) = query.as_object_mut() else {
        return Err(CouchError::validation("query must be a JSON object"));
    };
    if !object.contains_key("selector") {
        return Err(CouchError::validation("query must contain a selector"));
    }

    if let Some(fields) = object.get_mut("fields") {
        let Some(list) = fields.as_array_mut() else {
            return Err(CouchError::validation("query fields must be an array"));
        };
        for required in REQUIRED_FIELDS {
            if !list.iter().any(|f| f.as_str() == Some(required)) {
                list.push(Value::from(required));
            }
        }
    }
    Ok(query)
}

impl CouchDatabase {
    /// Runs a selector query.
    ///
    /// `query` is a `_find` request body and must contain a `selector`. If it
    /// restricts `fields`, the id and revision fields are added. Documents
    /// whose value is an attachment are re-read so their content is the
    /// attachment bytes, as with [`read_doc_range`](Self::read_doc_range).
    ///
    /// # Errors
    ///
    /// - [`CouchError::Validation`] if the query is malformed or rejected by the store
    /// - [`CouchError::NotFound`] if the database does not exist
    /// - [`CouchError::Connection`] if the store is unreachable
    #[tracing::instrument(skip(self, query), fields(db = %self.name()))]
    pub async fn query_documents(&self, query: &Value) -> Result<QueryResult> {
        let query = with_required_fields(query.clone())?;

        let request = CouchRequest::new(Method::POST, self.segments(&["_find"]))
            .accept(APPLICATION_JSON)
            .json(&query)?;
        let response =
            self.instance().execute("query_documents", request, RetryMode::Idempotent).await?;
        let found: FindResponse = response.parse_json()?;

        if let Some(warning) = &found.warning {
            tracing::debug!(%warning, "query warning");
        }

        let mut docs = Vec::with_capacity(found.docs.len());
        for doc in found.docs {
            let Some(id) = doc.get("_id").and_then(Value::as_str).map(str::to_owned) else {
                continue;
            };
            if let Some(stored) = self.resolve_document(&id, doc).await? {
                docs.push(stored);
            }
        }

        Ok(QueryResult { docs, bookmark: found.bookmark, warning: found.warning })
    }
}
