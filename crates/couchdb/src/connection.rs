//! Validated connection endpoints.
//!
//! A [`ConnectionDefinition`] is built from the raw address and credentials
//! triple handed over at startup. Building it never touches the network; it
//! only checks that the address names a scheme, a host and an explicit port.

use std::{fmt, net::Ipv4Addr};

use reqwest::Url;

use crate::error::{CouchError, Result};

/// Scheme used when the address does not name one.
const DEFAULT_SCHEME: &str = "http";

/// A normalized, scheme-qualified CouchDB endpoint plus credentials.
///
/// Immutable once built. Empty credentials mean "no authentication".
///
/// # Example
///
/// ```
/// use statedb_couchdb::ConnectionDefinition;
///
/// let conn = ConnectionDefinition::new("localhost:5984", "", "")?;
/// assert_eq!(conn.scheme(), "http");
/// assert_eq!(conn.host(), "localhost");
/// assert_eq!(conn.port(), 5984);
///
/// assert!(ConnectionDefinition::new("^^^localhost:5984", "", "").is_err());
/// # Ok::<(), statedb_couchdb::CouchError>(())
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDefinition {
    scheme: String,
    host: String,
    port: u16,
    username: String,
    password: String,
}

impl fmt::Debug for ConnectionDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDefinition")
            .field("scheme", &self.scheme)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl ConnectionDefinition {
    /// Parses `address` into an endpoint and attaches the credentials.
    ///
    /// `address` is `host:port`, optionally prefixed with `http://` or
    /// `https://`. A trailing `/` is accepted; any other path, query,
    /// fragment or embedded user info is not.
    ///
    /// # Errors
    ///
    /// Returns [`CouchError::Validation`] naming the offending address when it
    /// does not decompose into a supported scheme, a valid host and a numeric
    /// port.
    pub fn new(address: &str, username: &str, password: &str) -> Result<Self> {
        let invalid =
            |why: &str| CouchError::validation(format!("invalid address '{address}': {why}"));

        let qualified = if address.contains("://") {
            address.to_owned()
        } else {
            format!("{DEFAULT_SCHEME}://{address}")
        };

        let url = Url::parse(&qualified).map_err(|e| invalid(&e.to_string()))?;

        let scheme = url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(invalid(&format!("unsupported scheme '{scheme}'")));
        }

        let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
        if !is_valid_host(host) {
            return Err(invalid("host contains characters that are not allowed"));
        }

        if !has_explicit_port(&qualified) {
            return Err(invalid("missing port"));
        }
        let port = url.port_or_known_default().ok_or_else(|| invalid("missing port"))?;

        if url.path() != "/" || url.query().is_some() || url.fragment().is_some() {
            return Err(invalid("must not contain a path, query or fragment"));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(invalid("credentials must be passed separately"));
        }

        Ok(Self {
            scheme: scheme.to_owned(),
            host: host.to_owned(),
            port,
            username: username.to_owned(),
            password: password.to_owned(),
        })
    }

    /// Returns the URL scheme (`http` or `https`).
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Returns the host name or IP literal.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the user name; empty when no authentication is used.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Returns the password.
    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Returns `true` when requests should carry basic auth.
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }

    /// Returns the endpoint root as `scheme://host:port/`.
    pub fn base_url(&self) -> Result<Url> {
        let raw = format!("{}://{}:{}/", self.scheme, self.host, self.port);
        Url::parse(&raw)
            .map_err(|e| CouchError::validation(format!("invalid endpoint '{raw}': {e}")))
    }
}

impl fmt::Display for ConnectionDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Accepts bracketed IPv6 literals, dotted IPv4 addresses and DNS-style names
/// made of alphanumeric, `-` and `_` labels.
fn is_valid_host(host: &str) -> bool {
    if host.starts_with('[') && host.ends_with(']') {
        return true;
    }
    if host.parse::<Ipv4Addr>().is_ok() {
        return true;
    }
    !host.is_empty()
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        })
}

/// Checks that the authority section of `qualified` ends in `:port`.
///
/// `Url::port` hides ports equal to the scheme default, so the raw text is
/// inspected instead.
fn has_explicit_port(qualified: &str) -> bool {
    let rest = qualified.split_once("://").map_or(qualified, |(_, rest)| rest);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, host_port)| host_port);

    match host_port.rfind(':') {
        Some(colon) => {
            let after_bracket = host_port.rfind(']').is_none_or(|bracket| colon > bracket);
            let digits = &host_port[colon + 1..];
            after_bracket && !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
        },
        None => false,
    }
}
