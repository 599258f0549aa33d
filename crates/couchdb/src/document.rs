//! Single-document reads, writes and deletes.
//!
//! Every document moves through `absent -> present(rev1) -> present(rev2) ->
//! ... -> absent`. Leaving `present` needs the exact current revision; the
//! store rejects stale ones with a conflict and the client never papers over
//! that.

use reqwest::Method;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::{
    attachment::{decode_document, encode_multipart},
    config::DeleteRevisionPolicy,
    database::CouchDatabase,
    error::{CouchError, Result},
    retry::RetryMode,
    transport::{APPLICATION_JSON, CouchRequest},
    types::{CouchDoc, Revision, StoredDoc},
};

const MULTIPART_RELATED: &str = "multipart/related";

/// Body of a successful single-document write.
#[derive(Debug, Deserialize)]
pub(crate) struct WriteResponse {
    pub(crate) rev: Revision,
}

/// Parses the caller's JSON body and lifts out the fields the client manages.
///
/// Returns the remaining fields and the `_rev` embedded in the body, if any.
pub(crate) fn prepare_fields(
    id: &str,
    doc: &CouchDoc,
) -> Result<(Map<String, Value>, Option<Revision>)> {
    let mut fields = match doc.json_bytes() {
        None => Map::new(),
        Some(raw) => match serde_json::from_slice::<Value>(raw) {
            Ok(Value::Object(fields)) => fields,
            Ok(other) => {
                return Err(CouchError::validation(format!(
                    "body of document '{id}' must be a JSON object, got {}",
                    json_kind(&other)
                )));
            },
            Err(e) => {
                return Err(CouchError::validation(format!(
                    "body of document '{id}' is not valid JSON: {e}"
                )));
            },
        },
    };

    let embedded = match fields.remove("_rev") {
        Some(Value::String(rev)) if !rev.is_empty() => Some(Revision::from(rev)),
        Some(Value::String(_) | Value::Null) | None => None,
        Some(other) => {
            return Err(CouchError::validation(format!(
                "_rev of document '{id}' must be a string, got {}",
                json_kind(&other)
            )));
        },
    };
    fields.remove("_id");
    fields.remove("_attachments");

    Ok((fields, embedded))
}

/// Puts `_id` and `_rev` in front of the caller's fields.
pub(crate) fn with_identity(
    id: &str,
    revision: Option<&Revision>,
    fields: Map<String, Value>,
) -> Map<String, Value> {
    let mut doc = Map::with_capacity(fields.len() + 2);
    doc.insert("_id".to_owned(), Value::String(id.to_owned()));
    if let Some(revision) = revision {
        doc.insert("_rev".to_owned(), Value::String(revision.as_str().to_owned()));
    }
    doc.extend(fields);
    doc
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn check_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(CouchError::validation("document id must not be empty"));
    }
    Ok(())
}

impl CouchDatabase {
    /// Writes `doc` under `id` and returns the new revision.
    ///
    /// `revision` must be the document's current revision when it exists.
    /// When it is `None`, a `_rev` field in the JSON body is used instead;
    /// with neither, the document is created. Documents with attachments are
    /// sent as one multipart body, so body and attachments land in the same
    /// revision.
    ///
    /// Creates are sent once and never retried: after an ambiguous failure a
    /// repeat could report a conflict for a write that actually happened.
    /// Updates are retried, but a retry that conflicts after a failed attempt
    /// is reported as [`CouchError::Connection`], since the failed attempt may
    /// have been applied.
    ///
    /// # Errors
    ///
    /// - [`CouchError::Validation`] if the body is not a JSON object; nothing is sent
    /// - [`CouchError::Conflict`] if the revision is stale, or missing for an existing document
    /// - [`CouchError::NotFound`] if the database does not exist
    /// - [`CouchError::Connection`] if the store is unreachable, or the outcome of an update is
    ///   unknown
    #[tracing::instrument(skip(self, revision, doc), fields(db = %self.name(), id = %id))]
    pub async fn save_doc(
        &self,
        id: &str,
        revision: Option<&Revision>,
        doc: &CouchDoc,
    ) -> Result<Revision> {
        check_id(id)?;
        let (fields, embedded) = prepare_fields(id, doc)?;
        let revision = revision.cloned().or(embedded);
        let fields = with_identity(id, revision.as_ref(), fields);

        let request = CouchRequest::new(Method::PUT, self.segments(&[id])).accept(APPLICATION_JSON);
        let request = if doc.attachments().is_empty() {
            request.json(&Value::Object(fields))?
        } else {
            let encoded = encode_multipart(fields, doc.attachments())?;
            request.body(&encoded.content_type, encoded.body)?
        };

        let mode = if revision.is_some() { RetryMode::Conditional } else { RetryMode::Once };
        let response = self.instance().execute("save_doc", request, mode).await?;
        let written: WriteResponse = response.parse_json()?;

        tracing::debug!(rev = %written.rev, "saved document");
        Ok(written.rev)
    }

    /// Reads the document `id`.
    ///
    /// Returns `None` when the document was never created or has been
    /// deleted. The content is the value attachment's bytes when the document
    /// has one, otherwise the JSON body without the store's `_` fields.
    ///
    /// # Errors
    ///
    /// Returns [`CouchError::NotFound`] if the database itself does not exist.
    #[tracing::instrument(skip(self), fields(db = %self.name(), id = %id))]
    pub async fn read_doc(&self, id: &str) -> Result<Option<StoredDoc>> {
        check_id(id)?;
        let request = CouchRequest::new(Method::GET, self.segments(&[id]))
            .query("attachments", "true")
            .accept(MULTIPART_RELATED);

        let Some(response) =
            self.instance().execute_allow_missing("read_doc", request, RetryMode::Idempotent).await?
        else {
            tracing::debug!("document not found");
            return Ok(None);
        };

        let decoded = decode_document(response.content_type(), &response.body)?;
        let revision = match decoded.revision {
            Some(revision) => revision,
            None => response.etag().map(Revision::from).ok_or_else(|| {
                let reason = format!("document '{id}' has no revision");
                CouchError::server(response.status.as_u16(), "bad_response", reason)
            })?,
        };

        Ok(Some(StoredDoc {
            id: decoded.id.unwrap_or_else(|| id.to_owned()),
            revision,
            content: decoded.content,
            attachments: decoded.attachments,
        }))
    }

    /// Returns the current revision of `id` without transferring the body,
    /// or `None` when the document does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`CouchError::Connection`] if the store is unreachable.
    #[tracing::instrument(skip(self), fields(db = %self.name(), id = %id))]
    pub async fn get_document_revision(&self, id: &str) -> Result<Option<Revision>> {
        check_id(id)?;
        let request = CouchRequest::new(Method::HEAD, self.segments(&[id]));

        // HEAD responses carry no body, so a missing database looks like a
        // missing document here.
        let sent =
            self.instance().execute("get_document_revision", request, RetryMode::Idempotent).await;
        let response = match sent {
            Ok(response) => response,
            Err(CouchError::NotFound { .. }) => return Ok(None),
            Err(err) => return Err(err),
        };

        response.etag().map(|etag| Some(Revision::from(etag))).ok_or_else(|| {
            let reason = format!("no ETag returned for '{id}'");
            CouchError::server(response.status.as_u16(), "bad_response", reason)
        })
    }

    /// Deletes the document `id`.
    ///
    /// Deleting a document that does not exist succeeds. Without a
    /// `revision`, the current one is looked up first unless the database's
    /// [`DeleteRevisionPolicy`] is `Require`.
    ///
    /// A conflict is only reported while the document is still present. If
    /// it is already gone, because another writer deleted it or because an
    /// earlier attempt of this call landed before its response was lost, the
    /// delete succeeds.
    ///
    /// # Errors
    ///
    /// - [`CouchError::Conflict`] if `revision` is not the current revision of a live document
    /// - [`CouchError::Validation`] if no revision is given under `Require`
    /// - [`CouchError::Connection`] if the store is unreachable
    #[tracing::instrument(skip(self, revision), fields(db = %self.name(), id = %id))]
    pub async fn delete_doc(&self, id: &str, revision: Option<&Revision>) -> Result<()> {
        check_id(id)?;
        let revision = match revision {
            Some(revision) => revision.clone(),
            None => match self.instance().config().delete_revision() {
                DeleteRevisionPolicy::Require => {
                    let message = format!("deleting '{id}' requires a revision");
                    return Err(CouchError::validation(message));
                },
                DeleteRevisionPolicy::AutoResolve => match self.get_document_revision(id).await? {
                    Some(current) => current,
                    None => {
                        tracing::debug!("document already absent");
                        return Ok(());
                    },
                },
            },
        };

        let request = CouchRequest::new(Method::DELETE, self.segments(&[id]))
            .query("rev", revision.as_str())
            .accept(APPLICATION_JSON);

        match self.instance().execute("delete_doc", request, RetryMode::Idempotent).await {
            Ok(_) => {
                tracing::debug!(rev = %revision, "deleted document");
                Ok(())
            },
            Err(CouchError::NotFound { .. }) => Ok(()),
            Err(err @ CouchError::Conflict { .. }) => match self.get_document_revision(id).await? {
                None => {
                    tracing::debug!(rev = %revision, "document already deleted");
                    Ok(())
                },
                Some(current) => {
                    tracing::debug!(rev = %revision, current = %current, "delete conflicted");
                    Err(err)
                },
            },
            Err(err) => Err(err),
        }
    }
}
