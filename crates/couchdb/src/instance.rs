//! Instance handle: one configured endpoint shared by many databases.

use std::{fmt, sync::Arc, time::Instant};

use fail::fail_point;
use reqwest::Method;

use crate::{
    config::CouchDbConfig,
    connection::ConnectionDefinition,
    database::CouchDatabase,
    error::{CouchError, Result},
    metrics::{Metrics, MetricsSnapshot},
    retry::{RetryMode, with_retry},
    transport::{APPLICATION_JSON, CouchRequest, CouchResponse, HttpTransport, Transport},
    types::ConnectionInfo,
};

/// A configured CouchDB endpoint.
///
/// Creating an instance validates the address and builds the HTTP client; it
/// performs no network I/O. Use [`verify_connection`](Self::verify_connection)
/// to check reachability.
///
/// Cloning is cheap and clones share the connection pool and the request
/// [`Metrics`]. Apart from those counters the instance holds no mutable
/// state, so any number of tasks can use it concurrently.
///
/// # Example
///
/// ```no_run
/// use statedb_couchdb::{CouchDoc, CouchInstance};
///
/// # async fn example() -> statedb_couchdb::Result<()> {
/// let instance = CouchInstance::new("localhost:5984", "admin", "adminpw")?;
/// instance.verify_connection().await?;
///
/// let db = instance.database("mychannel_marbles")?;
/// db.create_if_not_exist().await?;
/// let rev = db.save_doc("marble1", None, &CouchDoc::json(r#"{"color":"blue"}"#)).await?;
/// # let _ = rev;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct CouchInstance {
    inner: Arc<InstanceInner>,
}

struct InstanceInner {
    connection: ConnectionDefinition,
    config: CouchDbConfig,
    transport: Arc<dyn Transport>,
    metrics: Metrics,
}

impl fmt::Debug for CouchInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CouchInstance")
            .field("endpoint", &self.inner.connection.to_string())
            .field("transport", &self.inner.transport)
            .finish_non_exhaustive()
    }
}

impl CouchInstance {
    /// Creates an instance for `address` with default tunables.
    ///
    /// # Errors
    ///
    /// Returns [`CouchError::Validation`] if `address` is malformed.
    pub fn new(address: &str, username: &str, password: &str) -> Result<Self> {
        let config = CouchDbConfig::builder()
            .address(address)
            .username(username)
            .password(password)
            .build()?;
        Self::from_config(&config)
    }

    /// Creates an instance from a configuration, backed by [`HttpTransport`].
    ///
    /// # Errors
    ///
    /// Returns [`CouchError::Validation`] if the configuration is invalid.
    pub fn from_config(config: &CouchDbConfig) -> Result<Self> {
        config.validate()?;
        let connection = config.connection()?;
        let transport =
            HttpTransport::new(&connection, config.request_timeout(), config.connect_timeout())?;
        Ok(Self::assemble(connection, config.clone(), Arc::new(transport)))
    }

    /// Creates an instance that sends its requests through `transport`.
    ///
    /// # Errors
    ///
    /// Returns [`CouchError::Validation`] if the configuration is invalid.
    pub fn with_transport(config: &CouchDbConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let connection = config.connection()?;
        Ok(Self::assemble(connection, config.clone(), transport))
    }

    fn assemble(
        connection: ConnectionDefinition,
        config: CouchDbConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let metrics = Metrics::new();
        Self { inner: Arc::new(InstanceInner { connection, config, transport, metrics }) }
    }

    /// Returns the endpoint this instance talks to.
    #[must_use]
    pub fn connection(&self) -> &ConnectionDefinition {
        &self.inner.connection
    }

    /// Returns the configuration this instance was created from.
    #[must_use]
    pub fn config(&self) -> &CouchDbConfig {
        &self.inner.config
    }

    /// Returns the request metrics shared by every database of this instance.
    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Returns a snapshot of the request metrics.
    #[must_use]
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Checks the endpoint and returns the server's welcome information.
    ///
    /// Retried per the retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`CouchError::Connection`] if the endpoint stays unreachable,
    /// or [`CouchError::Server`] if it answers with something other than a
    /// CouchDB welcome.
    #[tracing::instrument(skip(self), fields(endpoint = %self.inner.connection))]
    pub async fn verify_connection(&self) -> Result<ConnectionInfo> {
        let request = CouchRequest::new(Method::GET, Vec::<String>::new()).accept(APPLICATION_JSON);
        let response = self.execute("verify_connection", request, RetryMode::Idempotent).await?;
        let info: ConnectionInfo = response.parse_json()?;
        tracing::debug!(version = %info.version, "connected to CouchDB");
        Ok(info)
    }

    /// Returns a handle for the database `name`.
    ///
    /// No request is made; use
    /// [`create_if_not_exist`](CouchDatabase::create_if_not_exist) to make
    /// sure it exists.
    ///
    /// # Errors
    ///
    /// Returns [`CouchError::Validation`] if `name` is empty.
    pub fn database(&self, name: impl Into<String>) -> Result<CouchDatabase> {
        let name = name.into();
        if name.is_empty() {
            return Err(CouchError::validation("database name must not be empty"));
        }
        Ok(CouchDatabase::new(self.clone(), name))
    }

    /// Sends `request`, bounding every attempt by the request timeout and
    /// retrying transient failures when `mode` allows it.
    ///
    /// Non-2xx responses are converted into errors. The request's latency
    /// and outcome are recorded under `operation`.
    pub(crate) async fn execute(
        &self,
        operation: &str,
        request: CouchRequest,
        mode: RetryMode,
    ) -> Result<CouchResponse> {
        let resource = request.resource();
        let timeout = self.inner.config.request_timeout();
        let transport = &self.inner.transport;
        let metrics = &self.inner.metrics;
        let started = Instant::now();

        let result = with_retry(self.inner.config.retry(), Some(metrics), operation, mode, || {
            let request = &request;
            let resource = resource.as_str();
            async move {
                fail_point!("couchdb-before-send", |_| {
                    Err(CouchError::connection("injected failure before send"))
                });
                let response = tokio::time::timeout(timeout, transport.send(request))
                    .await
                    .map_err(|_| CouchError::timed_out(timeout))??;
                response.error_for_status(resource)
            }
        })
        .await;

        metrics.record_operation(operation, started.elapsed(), result.as_ref().err());
        result
    }

    /// Like [`execute`](Self::execute), but hands back 404 responses instead
    /// of failing on them.
    pub(crate) async fn execute_allow_missing(
        &self,
        operation: &str,
        request: CouchRequest,
        mode: RetryMode,
    ) -> Result<Option<CouchResponse>> {
        match self.execute(operation, request, mode).await {
            Ok(response) => Ok(Some(response)),
            Err(err @ CouchError::NotFound { .. }) if err.is_missing_database() => Err(err),
            Err(CouchError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{config::RetryConfig, testutil::MockCouchServer};

    fn config() -> CouchDbConfig {
        CouchDbConfig::builder()
            .address("localhost:5984")
            .request_timeout(Duration::from_millis(200))
            .retry(
                RetryConfig::builder()
                    .max_retries(2)
                    .initial_backoff(Duration::from_millis(1))
                    .max_backoff(Duration::from_millis(2))
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_new_does_not_touch_the_network() {
        let instance = CouchInstance::new("localhost:1", "", "").unwrap();
        assert_eq!(instance.connection().port(), 1);
    }

    #[test]
    fn test_new_rejects_malformed_address() {
        let result = CouchInstance::new("^^^localhost:5984", "", "");
        assert!(matches!(result, Err(CouchError::Validation { .. })));
    }

    #[test]
    fn test_database_name_must_not_be_empty() {
        let server = MockCouchServer::new();
        let instance = CouchInstance::with_transport(&config(), server.transport()).unwrap();
        assert!(instance.database("").is_err());
        assert_eq!(instance.database("ledger").unwrap().name(), "ledger");
    }

    #[tokio::test]
    async fn test_verify_connection_returns_welcome() {
        let server = MockCouchServer::new();
        let instance = CouchInstance::with_transport(&config(), server.transport()).unwrap();

        let info = instance.verify_connection().await.unwrap();
        assert_eq!(info.couchdb, "Welcome");
        assert!(!info.version.is_empty());
    }

    #[tokio::test]
    async fn test_verify_connection_fails_when_unreachable() {
        let server = MockCouchServer::new();
        server.set_unavailable(true);
        let instance = CouchInstance::with_transport(&config(), server.transport()).unwrap();

        let result = instance.verify_connection().await;
        assert!(matches!(result, Err(CouchError::Connection { .. })));
        assert_eq!(server.request_count(), 3);
    }

    #[tokio::test]
    async fn test_slow_response_times_out() {
        let server = MockCouchServer::new();
        server.set_delay(Some(Duration::from_secs(5)));
        let instance = CouchInstance::with_transport(&config(), server.transport()).unwrap();

        match instance.verify_connection().await {
            Err(CouchError::Connection { message, .. }) => assert!(message.contains("timed out")),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_once_mode_sends_a_single_request() {
        let server = MockCouchServer::new();
        server.fail_next(1, 503);
        let instance = CouchInstance::with_transport(&config(), server.transport()).unwrap();

        let request = CouchRequest::new(Method::GET, Vec::<String>::new());
        let result = instance.execute("welcome", request, RetryMode::Once).await;
        assert!(matches!(result, Err(CouchError::Server { status: 503, .. })));
        assert_eq!(server.request_count(), 1);
    }

    #[tokio::test]
    async fn test_requests_are_recorded_in_metrics() {
        let server = MockCouchServer::new();
        let instance = CouchInstance::with_transport(&config(), server.transport()).unwrap();

        server.fail_next(1, 503);
        instance.verify_connection().await.unwrap();
        server.set_unavailable(true);
        assert!(instance.verify_connection().await.is_err());

        let snapshot = instance.metrics_snapshot();
        assert_eq!(snapshot.request_count, 2);
        assert_eq!(snapshot.error_count, 1);
        assert_eq!(snapshot.retry_count, 3);
        assert_eq!(snapshot.retry_exhausted_count, 1);

        let verify = snapshot.operation("verify_connection").unwrap();
        assert_eq!(verify.count, 2);
        assert_eq!(verify.error_count, 1);
    }

    #[tokio::test]
    async fn test_clones_share_metrics() {
        let server = MockCouchServer::new();
        let instance = CouchInstance::with_transport(&config(), server.transport()).unwrap();
        let clone = instance.clone();

        clone.verify_connection().await.unwrap();
        assert_eq!(instance.metrics().snapshot().request_count, 1);
    }
}
