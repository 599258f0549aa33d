//! HTTP transport seam.
//!
//! Every call the client makes is described by a [`CouchRequest`] and answered
//! by a [`CouchResponse`]. The [`Transport`] trait moves one request over the
//! wire; [`HttpTransport`] does so with a pooled `reqwest` client, and the
//! `testutil` feature provides an in-process store behind the same trait.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{
    Client, Method, StatusCode, Url,
    header::{ACCEPT, CONTENT_TYPE, ETAG, HeaderMap, HeaderValue},
};

use crate::{
    connection::ConnectionDefinition,
    error::{CouchError, Result},
    keys::{request_url, resource_path},
};

/// Content type of JSON request and response bodies.
pub(crate) const APPLICATION_JSON: &str = "application/json";

/// A single request against the store, relative to the endpoint root.
#[derive(Debug, Clone)]
pub struct CouchRequest {
    /// HTTP method.
    pub method: Method,
    /// Raw (unencoded) path segments, e.g. `["db", "doc/id"]`.
    pub segments: Vec<String>,
    /// Query parameters, unencoded.
    pub query: Vec<(String, String)>,
    /// Request headers.
    pub headers: HeaderMap,
    /// Request body; empty for bodiless requests.
    pub body: Bytes,
}

impl CouchRequest {
    /// Creates a bodiless request for `segments`.
    #[must_use]
    pub fn new<I, S>(method: Method, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            method,
            segments: segments.into_iter().map(Into::into).collect(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Adds a query parameter.
    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Sets the `Accept` header.
    #[must_use]
    pub fn accept(mut self, accept: &'static str) -> Self {
        self.headers.insert(ACCEPT, HeaderValue::from_static(accept));
        self
    }

    /// Sets a body together with its content type.
    pub fn body(mut self, content_type: &str, body: impl Into<Bytes>) -> Result<Self> {
        let value = HeaderValue::from_str(content_type).map_err(|e| {
            CouchError::validation(format!("invalid content type '{content_type}': {e}"))
        })?;
        self.headers.insert(CONTENT_TYPE, value);
        self.body = body.into();
        Ok(self)
    }

    /// Sets a JSON body.
    pub fn json(self, body: &serde_json::Value) -> Result<Self> {
        let bytes = serde_json::to_vec(body)
            .map_err(|e| CouchError::validation(format!("request body cannot be encoded: {e}")))?;
        self.body(APPLICATION_JSON, bytes)
    }

    /// Returns the request path joined with `/`, used in errors and logs.
    #[must_use]
    pub fn resource(&self) -> String {
        resource_path(&self.segments)
    }

    /// Returns the value of query parameter `key`, if present.
    #[must_use]
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Returns `true` when the request method does not modify state.
    #[must_use]
    pub fn is_read(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }
}

/// A response from the store.
#[derive(Debug, Clone)]
pub struct CouchResponse {
    /// HTTP status.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Bytes,
}

impl CouchResponse {
    /// Creates a response with the given status, content type and body.
    #[must_use]
    pub fn new(status: StatusCode, content_type: Option<&str>, body: impl Into<Bytes>) -> Self {
        let mut headers = HeaderMap::new();
        if let Some(value) = content_type.and_then(|ct| HeaderValue::from_str(ct).ok()) {
            headers.insert(CONTENT_TYPE, value);
        }
        Self { status, headers, body: body.into() }
    }

    /// Creates a JSON response.
    #[must_use]
    pub fn json(status: StatusCode, body: &serde_json::Value) -> Self {
        Self::new(status, Some(APPLICATION_JSON), serde_json::to_vec(body).unwrap_or_default())
    }

    /// Returns the `Content-Type` header, if present and readable.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    /// Returns the `ETag` header with surrounding quotes removed.
    #[must_use]
    pub fn etag(&self) -> Option<&str> {
        self.headers.get(ETAG).and_then(|v| v.to_str().ok()).map(|v| v.trim_matches('"'))
    }

    /// Deserializes the body as JSON.
    pub fn parse_json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            let reason = format!("unexpected response body: {e}");
            CouchError::server(self.status.as_u16(), "bad_response", reason)
        })
    }

    /// Converts a non-2xx response into the matching error.
    pub(crate) fn error_for_status(self, resource: &str) -> Result<Self> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(CouchError::from_response(self.status, resource, &self.body))
        }
    }
}

/// Sends requests to the store.
///
/// Implementations return `Ok` for every response the store produced,
/// whatever its status; `Err` is reserved for transport failures.
#[async_trait]
pub trait Transport: fmt::Debug + Send + Sync {
    /// Sends `request` and returns the store's response.
    async fn send(&self, request: &CouchRequest) -> Result<CouchResponse>;
}

/// [`Transport`] backed by a pooled `reqwest` client.
///
/// The client, and with it the connection pool, belongs to one transport;
/// differently configured instances never share connections.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: Url,
    connection: ConnectionDefinition,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Builds a transport for `connection`.
    ///
    /// No network I/O happens here.
    ///
    /// # Errors
    ///
    /// Returns [`CouchError::Validation`] if the HTTP client cannot be built.
    pub fn new(
        connection: &ConnectionDefinition,
        request_timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .user_agent(concat!("statedb-couchdb/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CouchError::validation(format!("HTTP client cannot be built: {e}")))?;

        Ok(Self { client, base_url: connection.base_url()?, connection: connection.clone() })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &CouchRequest) -> Result<CouchResponse> {
        let url = request_url(&self.base_url, &request.segments, &request.query)?;

        let mut builder =
            self.client.request(request.method.clone(), url).headers(request.headers.clone());
        if self.connection.has_credentials() {
            let password = Some(self.connection.password());
            builder = builder.basic_auth(self.connection.username(), password);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(CouchResponse { status, headers, body })
    }
}
