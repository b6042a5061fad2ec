//! Persistence layer: libSQL-backed storage for parse results, workflows,
//! executions, submissions and tenants.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Database;
