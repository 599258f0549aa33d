//! Database handle and lifecycle calls.
//!
//! Document, range and batch operations live in their own modules as further
//! `impl CouchDatabase` blocks.

use reqwest::Method;
use serde::Deserialize;

use crate::{
    error::{CouchError, Result},
    instance::CouchInstance,
    retry::RetryMode,
    transport::{APPLICATION_JSON, CouchRequest},
    types::DbInfo,
};

/// Handle for one database of a [`CouchInstance`].
///
/// The handle holds the shared instance and the database name, nothing else.
/// It is cheap to clone and safe to use from many tasks at once; concurrent
/// writers to one document are arbitrated by revisions on the server.
#[derive(Debug, Clone)]
pub struct CouchDatabase {
    instance: CouchInstance,
    name: String,
}

#[derive(Debug, Deserialize)]
struct OkResponse {
    #[serde(default)]
    ok: bool,
}

impl CouchDatabase {
    pub(crate) fn new(instance: CouchInstance, name: String) -> Self {
        Self { instance, name }
    }

    /// Returns the database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the instance this database belongs to.
    #[must_use]
    pub fn instance(&self) -> &CouchInstance {
        &self.instance
    }

    /// Path segments for the database itself or a resource below it.
    pub(crate) fn segments(&self, rest: &[&str]) -> Vec<String> {
        let mut segments = Vec::with_capacity(rest.len() + 1);
        segments.push(self.name.clone());
        segments.extend(rest.iter().map(|s| (*s).to_owned()));
        segments
    }

    /// Creates the database unless it already exists.
    ///
    /// Returns `true` if this call created it. An existing database is
    /// detected with a read first, so the common case issues no write.
    ///
    /// # Errors
    ///
    /// Returns [`CouchError::Connection`] if the store is unreachable, or the
    /// mapped error if it refuses the creation.
    #[tracing::instrument(skip(self), fields(db = %self.name))]
    pub async fn create_if_not_exist(&self) -> Result<bool> {
        match self.info().await {
            Ok(_) => return Ok(false),
            Err(CouchError::NotFound { .. }) => {},
            Err(err) => return Err(err),
        }

        let request = CouchRequest::new(Method::PUT, self.segments(&[]));
        match self.instance.execute("create_database", request, RetryMode::Idempotent).await {
            Ok(_) => {
                tracing::debug!("created database");
                Ok(true)
            },
            // Another writer created it between the check and the PUT.
            Err(CouchError::Conflict { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Returns information about the database.
    ///
    /// # Errors
    ///
    /// Returns [`CouchError::NotFound`] if the database does not exist.
    #[tracing::instrument(skip(self), fields(db = %self.name))]
    pub async fn info(&self) -> Result<DbInfo> {
        let request = CouchRequest::new(Method::GET, self.segments(&[])).accept(APPLICATION_JSON);
        let response =
            self.instance.execute("database_info", request, RetryMode::Idempotent).await?;
        response.parse_json()
    }

    /// Deletes the database and every document in it.
    ///
    /// # Errors
    ///
    /// Returns [`CouchError::NotFound`] if the database does not exist.
    #[tracing::instrument(skip(self), fields(db = %self.name))]
    pub async fn drop(&self) -> Result<()> {
        let request = CouchRequest::new(Method::DELETE, self.segments(&[]));
        self.instance.execute("drop_database", request, RetryMode::Idempotent).await?;
        tracing::debug!("dropped database");
        Ok(())
    }

    /// Asks the store to flush pending writes of this database to disk.
    ///
    /// # Errors
    ///
    /// Returns [`CouchError::NotFound`] if the database does not exist, or
    /// [`CouchError::Server`] if the store does not confirm the commit.
    #[tracing::instrument(skip(self), fields(db = %self.name))]
    pub async fn ensure_full_commit(&self) -> Result<()> {
        let request = CouchRequest::new(Method::POST, self.segments(&["_ensure_full_commit"]))
            .accept(APPLICATION_JSON)
            .body(APPLICATION_JSON, bytes::Bytes::new())?;
        let response =
            self.instance.execute("ensure_full_commit", request, RetryMode::Idempotent).await?;

        let confirmed: OkResponse = response.parse_json()?;
        if !confirmed.ok {
            return Err(CouchError::server(
                response.status.as_u16(),
                "commit_failed",
                format!("full commit of '{}' was not confirmed", self.name),
            ));
        }
        Ok(())
    }
}
