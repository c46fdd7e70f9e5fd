//! Persistence layer: libSQL-backed storage for mailboxes, threads,
//! messages, tasks, rules, and scheduled jobs.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Database;
