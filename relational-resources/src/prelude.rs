//! Common items that you will always want in scope when working with resources.

pub use crate::resource::{
    Array, DataSource, Filter, Id, Node, Object, Page, Request, Resource, Scalar, ScalarType,
    Schema, SortOrder, Value,
};
pub use crate::{Error, Result};
