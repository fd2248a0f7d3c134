//! The normalized error taxonomy.
//!
//! Every operation in this crate fails with an [`Error`]. Request-shape errors (`UNKNOWN_FIELD`,
//! `INVALID_FIELD`, ...) are raised while compiling a request, payload errors while structuring a
//! write, and integrity errors while checking references. Errors reported by the database itself
//! are reparsed into the same taxonomy where possible, so callers never have to inspect
//! backend-specific error text.

use snafu::Snafu;

/// Errors returned by resource operations.
#[derive(Clone, Debug, PartialEq, Snafu)]
pub enum Error {
    /// A requested path (or a path in a payload) does not exist in the schema.
    #[snafu(display("unknown field {path}"))]
    UnknownField { path: String },

    /// A requested path resolves to a structure (object or array of objects) instead of a value.
    #[snafu(display("field {path} is not a leaf and cannot be requested directly"))]
    InvalidField { path: String },

    /// A requested path crosses more relations than the request allows.
    #[snafu(display("field {path} exceeds the maximum depth of {max_depth}"))]
    MaximumDepthExceeded { path: String, max_depth: usize },

    /// Sorting was requested on a path inside an array.
    #[snafu(display("field {path} is inside an array and cannot be sorted on"))]
    UnsortableField { path: String },

    /// Filtering, sorting or searching was requested on a field which is neither indexed nor
    /// unique.
    #[snafu(display("field {path} is not indexed"))]
    UnindexedField { path: String },

    /// A write payload omits a required field.
    #[snafu(display("missing required field {path}"))]
    MissingField { path: String },

    /// A write payload contains a value which violates the field's type or constraints.
    #[snafu(display("invalid value for field {path}: {reason}"))]
    InvalidValue { path: String, reason: String },

    /// A relation in a write payload references a resource which does not exist (or which does
    /// not match the relation's required filters).
    #[snafu(display("no resource with id {id} for field {path}"))]
    NoResource { path: String, id: String },

    /// A resource cannot be deleted because another resource still references it.
    #[snafu(display("resource is still referenced by {resource}.{path}"))]
    ResourceReferenced { resource: String, path: String },

    /// A write would violate a uniqueness constraint.
    #[snafu(display("a resource with {path} = {value} already exists"))]
    DuplicateResource { path: String, value: String },

    /// The backend is not (or no longer) connected.
    #[snafu(display("connection to the database failed: {reason}"))]
    ConnectionFailed { reason: String },

    /// An operation named a resource which is not in the schema.
    #[snafu(display("unknown resource {resource}"))]
    UnknownResource { resource: String },

    /// The schema itself is malformed.
    #[snafu(display("invalid schema: {reason}"))]
    InvalidSchema { reason: String },

    /// Any other error reported by the backend.
    #[snafu(display("{error}"))]
    Backend { error: String },
}

/// A specialized `Result` type for resource operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// The name of this error in the normalized taxonomy, for rendering messages upstream.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownField { .. } => "UNKNOWN_FIELD",
            Self::InvalidField { .. } => "INVALID_FIELD",
            Self::MaximumDepthExceeded { .. } => "MAXIMUM_DEPTH_EXCEEDED",
            Self::UnsortableField { .. } => "UNSORTABLE_FIELD",
            Self::UnindexedField { .. } => "UNINDEXED_FIELD",
            Self::MissingField { .. } => "MISSING_FIELD",
            Self::InvalidValue { .. } => "INVALID_VALUE",
            Self::NoResource { .. } => "NO_RESOURCE",
            Self::ResourceReferenced { .. } => "RESOURCE_REFERENCED",
            Self::DuplicateResource { .. } => "DUPLICATE_RESOURCE",
            Self::ConnectionFailed { .. } => "CONNECTION_FAILED",
            Self::UnknownResource { .. } => "UNKNOWN_RESOURCE",
            Self::InvalidSchema { .. } => "INVALID_SCHEMA",
            Self::Backend { .. } => "BACKEND",
        }
    }

    /// Whether retrying the operation (after reconnecting) could succeed.
    ///
    /// Every error except [`ConnectionFailed`](Self::ConnectionFailed) is a deterministic
    /// validation outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionFailed { .. })
    }

    pub(crate) fn unknown_field(path: impl Into<String>) -> Self {
        Self::UnknownField { path: path.into() }
    }

    pub(crate) fn invalid_value(path: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidValue {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn invalid_schema(reason: impl ToString) -> Self {
        Self::InvalidSchema {
            reason: reason.to_string(),
        }
    }

    pub(crate) fn unknown_resource(resource: impl Into<String>) -> Self {
        Self::UnknownResource {
            resource: resource.into(),
        }
    }
}
