//! Configuration for the CouchDB state store client.
//!
//! [`CouchDbConfig`] carries the endpoint, credentials and tunables that a
//! [`CouchInstance`](crate::CouchInstance) is created from. It is plain data:
//! loaded once at process start (any serde format works) and handed to the
//! instance explicitly.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    connection::ConnectionDefinition,
    error::{CouchError, Result},
};

/// Default per-request timeout (35 seconds).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(35);

/// Default TCP connect timeout (5 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of retries for idempotent requests.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Default upper bound on a single retry delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Default number of documents fetched per underlying range request.
pub const DEFAULT_MAX_PAGE_SIZE: u32 = 1000;

/// How [`CouchDatabase::delete_doc`](crate::CouchDatabase::delete_doc) treats
/// a call that carries no revision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteRevisionPolicy {
    /// Look up the current revision and delete that.
    #[default]
    AutoResolve,
    /// Reject the call with a validation error.
    Require,
}

/// Retry behaviour for idempotent requests.
///
/// Backoff doubles per attempt starting at `initial_backoff`, is capped at
/// `max_backoff`, and gets up to 50% random jitter on top.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Retries after the first attempt. Zero disables retrying.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry.
    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    pub initial_backoff: Duration,

    /// Upper bound on a single retry delay, before jitter.
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    pub max_backoff: Duration,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_initial_backoff() -> Duration {
    DEFAULT_INITIAL_BACKOFF
}

fn default_max_backoff() -> Duration {
    DEFAULT_MAX_BACKOFF
}

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_max_page_size() -> u32 {
    DEFAULT_MAX_PAGE_SIZE
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

#[bon::bon]
impl RetryConfig {
    /// Creates a retry configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CouchError::Validation`] if `initial_backoff` is zero or
    /// `max_backoff` is smaller than `initial_backoff`.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_MAX_RETRIES)] max_retries: u32,
        #[builder(default = DEFAULT_INITIAL_BACKOFF)] initial_backoff: Duration,
        #[builder(default = DEFAULT_MAX_BACKOFF)] max_backoff: Duration,
    ) -> Result<Self> {
        if initial_backoff.is_zero() {
            return Err(CouchError::validation("initial_backoff must be greater than zero"));
        }
        if max_backoff < initial_backoff {
            return Err(CouchError::validation(format!(
                "max_backoff ({max_backoff:?}) must not be smaller than initial_backoff \
                 ({initial_backoff:?})"
            )));
        }
        Ok(Self { max_retries, initial_backoff, max_backoff })
    }
}

/// Connection settings and tunables for a [`CouchInstance`](crate::CouchInstance).
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use statedb_couchdb::CouchDbConfig;
///
/// let config = CouchDbConfig::builder()
///     .address("localhost:5984")
///     .username("admin")
///     .password("secret")
///     .request_timeout(Duration::from_secs(10))
///     .build()?;
///
/// assert_eq!(config.address(), "localhost:5984");
/// # Ok::<(), statedb_couchdb::CouchError>(())
/// ```
#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CouchDbConfig {
    /// `host:port`, optionally prefixed with `http://` or `https://`.
    pub(crate) address: String,

    /// User name; empty means no authentication.
    #[serde(default)]
    pub(crate) username: String,

    /// Password; only sent when `username` is set.
    #[serde(default, skip_serializing)]
    pub(crate) password: String,

    /// Bound on every single request.
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub(crate) request_timeout: Duration,

    /// Bound on establishing a TCP connection.
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub(crate) connect_timeout: Duration,

    /// Retry policy for idempotent requests.
    #[serde(default)]
    pub(crate) retry: RetryConfig,

    /// Most documents requested from the store in one range fetch.
    #[serde(default = "default_max_page_size")]
    pub(crate) max_page_size: u32,

    /// Behaviour of deletes that carry no revision.
    #[serde(default)]
    pub(crate) delete_revision: DeleteRevisionPolicy,
}

impl fmt::Debug for CouchDbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CouchDbConfig")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("request_timeout", &self.request_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("retry", &self.retry)
            .field("max_page_size", &self.max_page_size)
            .field("delete_revision", &self.delete_revision)
            .finish()
    }
}

#[bon::bon]
impl CouchDbConfig {
    /// Creates a configuration, validating the address and tunables.
    ///
    /// # Errors
    ///
    /// Returns [`CouchError::Validation`] if:
    /// - `address` is not a valid `host:port`
    /// - a timeout is zero
    /// - `max_page_size` is zero
    #[builder]
    pub fn new(
        #[builder(into)] address: String,
        #[builder(into, default)] username: String,
        #[builder(into, default)] password: String,
        #[builder(default = DEFAULT_REQUEST_TIMEOUT)] request_timeout: Duration,
        #[builder(default = DEFAULT_CONNECT_TIMEOUT)] connect_timeout: Duration,
        #[builder(default)] retry: RetryConfig,
        #[builder(default = DEFAULT_MAX_PAGE_SIZE)] max_page_size: u32,
        #[builder(default)] delete_revision: DeleteRevisionPolicy,
    ) -> Result<Self> {
        let config = Self {
            address,
            username,
            password,
            request_timeout,
            connect_timeout,
            retry,
            max_page_size,
            delete_revision,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants [`CouchDbConfig::builder`] enforces.
    ///
    /// Deserialized configurations are not validated on load; this is run
    /// again when an instance is created from them.
    pub fn validate(&self) -> Result<()> {
        ConnectionDefinition::new(&self.address, &self.username, &self.password)?;

        if self.request_timeout.is_zero() {
            return Err(CouchError::validation("request_timeout must be greater than zero"));
        }
        if self.connect_timeout.is_zero() {
            return Err(CouchError::validation("connect_timeout must be greater than zero"));
        }
        if self.max_page_size == 0 {
            return Err(CouchError::validation("max_page_size must be greater than zero"));
        }
        Ok(())
    }

    /// Returns the configured address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Returns the configured user name.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Returns the per-request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Returns the connect timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Returns the retry policy.
    #[must_use]
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Returns the per-fetch page cap used by range scans.
    #[must_use]
    pub fn max_page_size(&self) -> u32 {
        self.max_page_size
    }

    /// Returns the delete revision policy.
    #[must_use]
    pub fn delete_revision(&self) -> DeleteRevisionPolicy {
        self.delete_revision
    }

    /// Parses the address and credentials into a connection definition.
    pub fn connection(&self) -> Result<ConnectionDefinition> {
        ConnectionDefinition::new(&self.address, &self.username, &self.password)
    }
}
