//! The backend-agnostic resource layer.
//!
//! This module contains everything that can be said about resources without reference to how they
//! are stored: the [schema] describing them, the [values](value) they are made of, the
//! [requests](request) clients make, the [layout](metadata) derived from the schema and the
//! [compilation](query) of requests into backend-neutral queries.

pub mod backend;
pub mod metadata;
pub mod query;
pub mod request;
pub mod schema;
pub mod value;

pub use backend::{DataSource, Page};
pub use request::{Filter, Request, SortOrder};
pub use schema::{Array, Node, Object, Resource, Scalar, ScalarType, Schema};
pub use value::{Id, Value};
