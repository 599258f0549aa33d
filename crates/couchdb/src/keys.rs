//! Document id and range key encoding.
//!
//! Document ids are arbitrary Unicode strings. Two encodings apply to them:
//!
//! - **Path encoding**: an id is always pushed as exactly one percent-encoded
//!   path segment, so `/`, `?`, `%` or the null code point can never address a
//!   different resource than the document itself.
//! - **Range key encoding**: range bounds travel as JSON string literals in the
//!   query string, which keeps control characters and the maximum code point
//!   intact.
//!
//! Ids compare by Unicode code point, which is also the byte order of their
//! UTF-8 encoding and the order `String` uses.

use reqwest::Url;

use crate::error::{CouchError, Result};

/// Largest Unicode scalar value, used as the open upper bound of prefix scans.
pub const MAX_KEY_CHAR: char = char::MAX;

/// Returns the exclusive upper bound for a scan over every id starting with
/// `prefix`.
///
/// ```
/// use statedb_couchdb::prefix_range_end;
///
/// assert_eq!(prefix_range_end("asset"), "asset\u{10FFFF}");
/// ```
#[must_use]
pub fn prefix_range_end(prefix: &str) -> String {
    let mut end = String::with_capacity(prefix.len() + MAX_KEY_CHAR.len_utf8());
    end.push_str(prefix);
    end.push(MAX_KEY_CHAR);
    end
}

/// Builds the URL for `segments` under `base`, encoding every segment as a
/// single path component, then appends `query`.
///
/// `.` and `..` are rejected: URL normalization would drop them instead of
/// addressing a document of that name.
pub(crate) fn request_url(
    base: &Url,
    segments: &[String],
    query: &[(String, String)],
) -> Result<Url> {
    if let Some(dot) = segments.iter().find(|s| matches!(s.as_str(), "." | "..")) {
        return Err(CouchError::validation(format!("'{dot}' cannot be used as a path segment")));
    }

    let mut url = base.clone();
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|()| {
                CouchError::validation(format!("endpoint '{base}' cannot carry a path"))
            })?;
        path.clear();
        path.extend(segments);
    }
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query);
    }
    Ok(url)
}

/// Encodes a range bound as the JSON string literal the store expects.
pub(crate) fn encode_range_key(key: &str) -> Result<String> {
    serde_json::to_string(key)
        .map_err(|e| CouchError::validation(format!("range key cannot be encoded: {e}")))
}

/// Decodes a JSON string literal produced by [`encode_range_key`].
#[cfg_attr(not(any(test, feature = "testutil")), allow(dead_code))]
pub(crate) fn decode_range_key(encoded: &str) -> Result<String> {
    serde_json::from_str(encoded).map_err(|e| {
        CouchError::validation(format!("range key '{encoded}' is not a JSON string: {e}"))
    })
}

/// Returns the document path relative to the endpoint root, for error
/// messages and logs.
pub(crate) fn resource_path(segments: &[String]) -> String {
    segments.join("/")
}
