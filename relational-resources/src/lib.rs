//! Relational Resources is a schema-driven query compiler for resource-oriented applications. It
//! translates declarative resource schemas and client requests into queries against a relational
//! database, and translates the flat rows that come back into nested, typed resources. It consists
//! of two sections:
//!
//! * A backend-agnostic [resource] layer. A [schema](resource::schema) describes every resource in
//!   the application: typed scalars, nested objects, arrays and relations to other resources. From
//!   the schema we derive [metadata](resource::metadata) describing how each resource is laid out
//!   in storage, and the [field resolver](resource::query) uses both to compile a
//!   [request](resource::request) into a backend-neutral formatted query plus a projection
//!   describing how to rebuild the results.
//! * A [sql] backend, which turns formatted queries into a typed SQL AST, structures write payloads
//!   into flat rows, checks referential integrity before writes and deletes, and reconstructs
//!   nested resources from query results. It provides a PostgreSQL target as well as a mock
//!   database, which is useful for lightweight testing.
//!
//! The two halves meet at the [`DataSource`](resource::backend::DataSource) trait, so applications
//! can be written against the trait and run against any backend implementing it.

use std::sync::Once;
use tracing_subscriber::EnvFilter;

pub mod error;
pub mod prelude;
pub mod resource;
pub mod sql;

pub use error::{Error, Result};

/// Initialize tracing.
pub fn init_logging() {
    static ONCE: Once = Once::new();

    ONCE.call_once(|| {
        // Another crate (or test harness) may already have installed a report handler or a global
        // subscriber; in that case we just keep theirs.
        color_eyre::install().ok();
        tracing_subscriber::fmt()
            .with_ansi(true)
            .with_env_filter(EnvFilter::from_default_env())
            .try_init()
            .ok();
    });
}
