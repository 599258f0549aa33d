//! Attachment codec.
//!
//! Documents with attachments are written as one `multipart/related` body: a
//! JSON part whose `_attachments` stubs are marked `follows`, then one part
//! per attachment in the same order. The store commits the whole body as a
//! single revision. Reads request the same representation; bulk requests and
//! older servers use inline base64 attachments instead, and both are decoded
//! here.
//!
//! A document whose attachments include [`VALUE_ATTACHMENT`] has its primary
//! value in that attachment. Decoding promotes those bytes to the document
//! content; otherwise the JSON body, minus the store's `_`-prefixed fields, is
//! the content.

use std::collections::HashSet;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::{Bytes, BytesMut};
use serde_json::{Map, Value, json};

use crate::{
    error::{CouchError, Result},
    transport::APPLICATION_JSON,
    types::Revision,
};

/// Name of the attachment that carries a document's primary value.
pub const VALUE_ATTACHMENT: &str = "valueBytes";

/// Content type used when a value attachment does not name one.
pub const DEFAULT_ATTACHMENT_TYPE: &str = "application/octet-stream";

const CRLF: &[u8] = b"\r\n";

/// A named binary payload stored with a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Attachment name, unique within the document.
    pub name: String,
    /// MIME type carried alongside the bytes.
    pub content_type: String,
    /// Raw bytes, returned unchanged on read.
    pub data: Bytes,
}

impl Attachment {
    /// Creates an attachment.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self { name: name.into(), content_type: content_type.into(), data: data.into() }
    }

    /// Creates the value attachment; an empty content type falls back to
    /// `application/octet-stream`.
    #[must_use]
    pub fn value(data: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        let content_type = content_type.into();
        let content_type =
            if content_type.is_empty() { DEFAULT_ATTACHMENT_TYPE.to_owned() } else { content_type };
        Self::new(VALUE_ATTACHMENT, content_type, data)
    }

    /// Returns `true` for the attachment carrying the document's value.
    #[must_use]
    pub fn is_value(&self) -> bool {
        self.name == VALUE_ATTACHMENT
    }
}

/// An encoded request body and its content type.
#[derive(Debug)]
pub(crate) struct EncodedBody {
    pub(crate) content_type: String,
    pub(crate) body: Bytes,
}

/// A document decoded from a read response.
#[derive(Debug, Default)]
pub(crate) struct DecodedDoc {
    pub(crate) id: Option<String>,
    pub(crate) revision: Option<Revision>,
    pub(crate) deleted: bool,
    /// The value attachment is listed as a stub without its bytes.
    pub(crate) value_stub: bool,
    pub(crate) content: Bytes,
    pub(crate) attachments: Vec<Attachment>,
}

#[cfg(test)]
impl DecodedDoc {
    /// Returns `true` when the document stores its value as an attachment.
    pub(crate) fn has_value_attachment(&self) -> bool {
        self.attachments.iter().any(Attachment::is_value)
    }
}

/// Checks names and returns the attachments sorted by name.
fn checked_sorted(attachments: &[Attachment]) -> Result<Vec<&Attachment>> {
    let mut seen = HashSet::with_capacity(attachments.len());
    for attachment in attachments {
        let name = attachment.name.as_str();
        if name.is_empty() {
            return Err(CouchError::validation("attachment name must not be empty"));
        }
        if name.starts_with('_') {
            return Err(CouchError::validation(format!(
                "attachment name '{name}' must not start with '_'"
            )));
        }
        if name.contains(['"', '\r', '\n']) {
            return Err(CouchError::validation(format!(
                "attachment name {name:?} contains a quote or line break"
            )));
        }
        if attachment.content_type.contains(['\r', '\n']) {
            return Err(CouchError::validation(format!(
                "content type of attachment '{name}' contains a line break"
            )));
        }
        if !seen.insert(name) {
            return Err(CouchError::validation(format!("duplicate attachment name '{name}'")));
        }
    }

    let mut sorted: Vec<_> = attachments.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(sorted)
}

fn content_type_or_default(attachment: &Attachment) -> &str {
    if attachment.content_type.is_empty() {
        DEFAULT_ATTACHMENT_TYPE
    } else {
        &attachment.content_type
    }
}

/// Packs `fields` and `attachments` into one `multipart/related` body.
///
/// `fields` gets an `_attachments` object listing every part as `follows`;
/// the parts follow in the same order.
pub(crate) fn encode_multipart(
    mut fields: Map<String, Value>,
    attachments: &[Attachment],
) -> Result<EncodedBody> {
    let sorted = checked_sorted(attachments)?;

    let stubs: Map<String, Value> = sorted
        .iter()
        .map(|a| {
            let stub = json!({
                "follows": true,
                "content_type": content_type_or_default(a),
                "length": a.data.len(),
            });
            (a.name.clone(), stub)
        })
        .collect();
    fields.insert("_attachments".to_owned(), Value::Object(stubs));

    let json = serde_json::to_vec(&Value::Object(fields))
        .map_err(|e| CouchError::validation(format!("document cannot be encoded: {e}")))?;

    let boundary = uuid::Uuid::new_v4().simple().to_string();
    let delimiter = format!("--{boundary}");

    let capacity = json.len() + sorted.iter().map(|a| a.data.len() + 160).sum::<usize>() + 128;
    let mut body = BytesMut::with_capacity(capacity);

    body.extend_from_slice(delimiter.as_bytes());
    body.extend_from_slice(CRLF);
    body.extend_from_slice(format!("Content-Type: {APPLICATION_JSON}\r\n\r\n").as_bytes());
    body.extend_from_slice(&json);

    for attachment in sorted {
        body.extend_from_slice(CRLF);
        body.extend_from_slice(delimiter.as_bytes());
        body.extend_from_slice(CRLF);
        let headers = format!(
            "Content-Disposition: attachment; filename=\"{}\"\r\n\
             Content-Type: {}\r\nContent-Length: {}\r\n\r\n",
            attachment.name,
            content_type_or_default(attachment),
            attachment.data.len(),
        );
        body.extend_from_slice(headers.as_bytes());
        body.extend_from_slice(&attachment.data);
    }

    body.extend_from_slice(CRLF);
    body.extend_from_slice(delimiter.as_bytes());
    body.extend_from_slice(b"--");

    Ok(EncodedBody {
        content_type: format!("multipart/related; boundary=\"{boundary}\""),
        body: body.freeze(),
    })
}

/// Builds the inline `_attachments` object used by bulk writes.
pub(crate) fn encode_inline(attachments: &[Attachment]) -> Result<Value> {
    let stubs: Map<String, Value> = checked_sorted(attachments)?
        .into_iter()
        .map(|a| {
            let stub = json!({
                "content_type": content_type_or_default(a),
                "data": STANDARD.encode(&a.data),
            });
            (a.name.clone(), stub)
        })
        .collect();
    Ok(Value::Object(stubs))
}

/// Decodes a document read response, JSON or `multipart/related`.
pub(crate) fn decode_document(content_type: Option<&str>, body: &Bytes) -> Result<DecodedDoc> {
    match content_type.and_then(multipart_boundary) {
        Some(boundary) => decode_multipart(body, &boundary),
        None => {
            let fields = parse_object(body)?;
            decode_fields(fields, Vec::new())
        },
    }
}

/// Decodes an already parsed document object, e.g. one row of a range read.
pub(crate) fn decode_value(value: Value) -> Result<DecodedDoc> {
    match value {
        Value::Object(fields) => decode_fields(fields, Vec::new()),
        other => Err(bad_response(format!("document is not a JSON object: {other}"))),
    }
}

fn decode_multipart(body: &Bytes, boundary: &str) -> Result<DecodedDoc> {
    let mut parts = split_multipart(body, boundary)?.into_iter();
    let first = parts.next().ok_or_else(|| bad_response("multipart body has no parts"))?;
    let fields = parse_object(&first.data)?;

    // Parts without a filename take the names of the `follows` stubs in order.
    let mut following: Vec<String> = fields
        .get("_attachments")
        .and_then(Value::as_object)
        .map(|stubs| {
            stubs
                .iter()
                .filter(|(_, stub)| stub.get("follows").and_then(Value::as_bool).unwrap_or(false))
                .map(|(name, _)| name.clone())
                .collect()
        })
        .unwrap_or_default();
    following.reverse();

    let mut attachments = Vec::new();
    for part in parts {
        let positional = following.pop();
        let name = part
            .filename()
            .or(positional)
            .ok_or_else(|| bad_response("attachment part has no name"))?;
        let content_type = part.header("content-type").map_or_else(
            || stub_content_type(&fields, &name).unwrap_or(DEFAULT_ATTACHMENT_TYPE).to_owned(),
            str::to_owned,
        );
        attachments.push(Attachment { name, content_type, data: part.data });
    }

    decode_fields(fields, attachments)
}

fn stub_content_type<'a>(fields: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    fields.get("_attachments")?.get(name)?.get("content_type")?.as_str()
}

/// Collects inline attachments, then applies the promotion rule.
fn decode_fields(
    mut fields: Map<String, Value>,
    mut attachments: Vec<Attachment>,
) -> Result<DecodedDoc> {
    if let Some(Value::Object(stubs)) = fields.get("_attachments") {
        for (name, stub) in stubs {
            let Some(data) = stub.get("data").and_then(Value::as_str) else {
                continue;
            };
            if attachments.iter().any(|a| &a.name == name) {
                continue;
            }
            let data = STANDARD
                .decode(data)
                .map_err(|e| {
                    bad_response(format!("attachment '{name}' is not valid base64: {e}"))
                })?;
            let content_type =
                stub.get("content_type").and_then(Value::as_str).unwrap_or(DEFAULT_ATTACHMENT_TYPE);
            attachments.push(Attachment::new(name.clone(), content_type, data));
        }
    }

    let id = fields.get("_id").and_then(Value::as_str).map(str::to_owned);
    let revision = fields.get("_rev").and_then(Value::as_str).map(Revision::from);
    let deleted = fields.get("_deleted").and_then(Value::as_bool).unwrap_or(false);
    let value_stub = !attachments.iter().any(Attachment::is_value)
        && fields.get("_attachments").and_then(|stubs| stubs.get(VALUE_ATTACHMENT)).is_some();

    let content = match attachments.iter().find(|a| a.is_value()) {
        Some(value) => value.data.clone(),
        None => {
            fields.retain(|key, _| !key.starts_with('_'));
            let json = serde_json::to_vec(&Value::Object(fields))
                .map_err(|e| bad_response(format!("document cannot be re-encoded: {e}")))?;
            Bytes::from(json)
        },
    };

    Ok(DecodedDoc { id, revision, deleted, value_stub, content, attachments })
}

fn parse_object(body: &[u8]) -> Result<Map<String, Value>> {
    match serde_json::from_slice(body) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(other) => Err(bad_response(format!("document is not a JSON object: {other}"))),
        Err(e) => Err(bad_response(format!("document is not valid JSON: {e}"))),
    }
}

fn bad_response(reason: impl Into<String>) -> CouchError {
    CouchError::server(200, "bad_response", reason)
}

/// Extracts the boundary of a `multipart/*` content type.
pub(crate) fn multipart_boundary(content_type: &str) -> Option<String> {
    let mut params = content_type.split(';');
    let mime = params.next()?.trim();
    if !mime.to_ascii_lowercase().starts_with("multipart/") {
        return None;
    }
    params.find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("boundary")
            .then(|| value.trim().trim_matches('"').to_owned())
    })
}

/// One part of a multipart body.
#[derive(Debug)]
pub(crate) struct Part {
    headers: Vec<(String, String)>,
    pub(crate) data: Bytes,
}

impl Part {
    /// Returns the value of header `name`, given in lower case.
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(key, _)| key == name).map(|(_, value)| value.as_str())
    }

    pub(crate) fn filename(&self) -> Option<String> {
        let disposition = self.header("content-disposition")?;
        disposition.split(';').find_map(|param| {
            let (key, value) = param.split_once('=')?;
            (key.trim() == "filename").then(|| value.trim().trim_matches('"').to_owned())
        })
    }

    fn content_length(&self) -> Option<usize> {
        self.header("content-length").and_then(|v| v.trim().parse().ok())
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..].windows(needle.len()).position(|window| window == needle).map(|pos| pos + from)
}

/// Splits a multipart body into its parts.
///
/// A part with a `Content-Length` header is sliced by length, so payloads
/// that happen to contain the delimiter still decode exactly.
pub(crate) fn split_multipart(body: &Bytes, boundary: &str) -> Result<Vec<Part>> {
    let delimiter = format!("--{boundary}").into_bytes();
    let mut closing = CRLF.to_vec();
    closing.extend_from_slice(&delimiter);

    let malformed = |what: &str| bad_response(format!("malformed multipart body: {what}"));

    let mut pos = find(body, &delimiter, 0).ok_or_else(|| malformed("missing opening boundary"))?
        + delimiter.len();
    let mut parts = Vec::new();

    loop {
        let rest = &body[pos..];
        if rest.starts_with(b"--") {
            return Ok(parts);
        }
        if !rest.starts_with(CRLF) {
            return Err(malformed("boundary not followed by a line break"));
        }
        pos += CRLF.len();

        let headers = if body[pos..].starts_with(CRLF) {
            pos += CRLF.len();
            Vec::new()
        } else {
            let end = find(body, b"\r\n\r\n", pos)
                .ok_or_else(|| malformed("unterminated part headers"))?;
            let headers = parse_headers(&body[pos..end])
                .ok_or_else(|| malformed("unreadable part headers"))?;
            pos = end + 4;
            headers
        };

        let mut part = Part { headers, data: Bytes::new() };
        let end = match part.content_length().map(|length| pos.checked_add(length)) {
            Some(Some(end)) if end <= body.len() => end,
            Some(_) => return Err(malformed("part shorter than its Content-Length")),
            None => find(body, &closing, pos).ok_or_else(|| malformed("unterminated part"))?,
        };
        part.data = body.slice(pos..end);
        parts.push(part);

        if !body[end..].starts_with(&closing) {
            return Err(malformed("part not followed by a boundary"));
        }
        pos = end + closing.len();
    }
}

fn parse_headers(raw: &[u8]) -> Option<Vec<(String, String)>> {
    let text = std::str::from_utf8(raw).ok()?;
    text.split("\r\n")
        .filter(|line| !line.is_empty())
        .map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_ascii_lowercase(), value.trim().to_owned()))
        })
        .collect()
}
