//! Interfaces provided by a backend data source.
//!
//! [`DataSource`] is the glue between the resource view of the data model and its storage: an
//! application (an HTTP layer, a job, a test) talks to resources exclusively through this trait,
//! and a backend such as [`SqlDataSource`](crate::sql::SqlDataSource) implements it.

use super::{request::Request, value::Id, value::Value};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;

/// A page of results.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Page {
    /// The number of resources matching the request, regardless of pagination.
    pub total: usize,
    pub results: Vec<Value>,
}

/// A source of resources.
#[async_trait]
pub trait DataSource {
    /// Create the storage for every resource in the schema.
    ///
    /// This is idempotent: structures, indexes and constraints which already exist are left alone.
    async fn create_structures(&self) -> Result<()>;

    /// Get a page of resources matching `request`.
    async fn search(&self, resource: &str, request: &Request) -> Result<Page>;

    /// Get a page of resources matching `request`, ignoring its full-text query.
    async fn list(&self, resource: &str, request: &Request) -> Result<Page> {
        let request = Request {
            query: None,
            ..request.clone()
        };
        self.search(resource, &request).await
    }

    /// Load a single resource by id.
    ///
    /// Returns [`None`] if there is no such resource (or it has been deleted).
    async fn view(
        &self,
        resource: &str,
        id: &Id,
        fields: &BTreeSet<String>,
        max_depth: usize,
    ) -> Result<Option<Value>>;

    /// Create a new resource from `payload`, returning its generated id.
    async fn create(&self, resource: &str, payload: Value) -> Result<Id>;

    /// Update the fields of an existing resource which are present in `payload`.
    ///
    /// Returns `false` if there is no such resource.
    async fn update(&self, resource: &str, id: &Id, payload: Value) -> Result<bool>;

    /// Delete a resource.
    ///
    /// Returns `false` if there is no such resource.
    async fn delete(&self, resource: &str, id: &Id) -> Result<bool>;
}
