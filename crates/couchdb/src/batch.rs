//! Multi-document writes and metadata lookups, one round-trip each.

use reqwest::Method;
use serde_json::{Value, json};

use crate::{
    attachment::encode_inline,
    database::CouchDatabase,
    document::{prepare_fields, with_identity},
    error::{CouchError, Result},
    range::AllDocsResponse,
    retry::RetryMode,
    transport::{APPLICATION_JSON, CouchRequest},
    types::{BatchDoc, BatchUpdateResponse, DocMetadata},
};

fn encode_batch_doc(entry: &BatchDoc) -> Result<Value> {
    if entry.id.is_empty() {
        return Err(CouchError::validation("document id must not be empty"));
    }

    if entry.deleted {
        let revision = entry
            .revision
            .as_ref()
            .ok_or_else(|| {
                CouchError::validation(format!("deleting '{}' requires a revision", entry.id))
            })?;
        return Ok(json!({ "_id": entry.id, "_rev": revision.as_str(), "_deleted": true }));
    }

    let (fields, embedded) = prepare_fields(&entry.id, &entry.doc)?;
    let revision = entry.revision.clone().or(embedded);
    let mut doc = with_identity(&entry.id, revision.as_ref(), fields);
    if !entry.doc.attachments().is_empty() {
        doc.insert("_attachments".to_owned(), encode_inline(entry.doc.attachments())?);
    }
    Ok(Value::Object(doc))
}

impl CouchDatabase {
    /// Writes or deletes many documents in one `_bulk_docs` request.
    ///
    /// Every entry is validated before anything is sent. The result has one
    /// entry per document, in input order; a conflict on one document does
    /// not fail the others. The batch is sent once and never retried: a
    /// repeat after a lost response would report conflicts for writes that
    /// were applied.
    ///
    /// # Errors
    ///
    /// - [`CouchError::Validation`] if an entry has a malformed body, or is a delete without a
    ///   revision
    /// - [`CouchError::NotFound`] if the database does not exist
    /// - [`CouchError::Connection`] if the store is unreachable
    #[tracing::instrument(skip(self, docs), fields(db = %self.name(), count = docs.len()))]
    pub async fn batch_update_documents(
        &self,
        docs: &[BatchDoc],
    ) -> Result<Vec<BatchUpdateResponse>> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }

        let encoded = docs.iter().map(encode_batch_doc).collect::<Result<Vec<_>>>()?;

        let request = CouchRequest::new(Method::POST, self.segments(&["_bulk_docs"]))
            .accept(APPLICATION_JSON)
            .json(&json!({ "docs": encoded }))?;
        let response =
            self.instance().execute("batch_update_documents", request, RetryMode::Once).await?;
        let results: Vec<BatchUpdateResponse> = response.parse_json()?;

        let failed = results.iter().filter(|r| !r.is_ok()).count();
        if failed > 0 {
            tracing::debug!(failed, "some documents of the batch were rejected");
        }
        Ok(results)
    }

    /// Returns the current revision of every id in `ids` that exists.
    ///
    /// Ids that were never created or have been deleted are left out. The
    /// result follows the order of `ids`.
    ///
    /// # Errors
    ///
    /// - [`CouchError::NotFound`] if the database does not exist
    /// - [`CouchError::Connection`] if the store is unreachable
    #[tracing::instrument(skip(self, ids), fields(db = %self.name(), count = ids.len()))]
    pub async fn batch_retrieve_document_metadata<S: AsRef<str>>(
        &self,
        ids: &[S],
    ) -> Result<Vec<DocMetadata>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<&str> = ids.iter().map(|id| id.as_ref()).collect();
        let request = CouchRequest::new(Method::POST, self.segments(&["_all_docs"]))
            .accept(APPLICATION_JSON)
            .json(&json!({ "keys": keys }))?;
        let response = self
            .instance()
            .execute("batch_retrieve_document_metadata", request, RetryMode::Idempotent)
            .await?;
        let listing: AllDocsResponse = response.parse_json()?;

        let mut found = Vec::with_capacity(listing.rows.len());
        for row in listing.rows {
            if let Some(error) = row.error {
                tracing::debug!(key = %row.key, %error, "no metadata for key");
                continue;
            }
            match (row.id, row.value) {
                (Some(id), Some(value)) if !value.deleted => {
                    found.push(DocMetadata { id, revision: value.rev });
                },
                _ => {},
            }
        }
        Ok(found)
    }
}
