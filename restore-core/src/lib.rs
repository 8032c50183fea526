//! Restore Core Library
//!
//! Snapshot metadata synchronization and caching for restic repositories:
//! a subprocess gateway to the backup tool, a SQLite-backed snapshot store,
//! and the cache manager that keeps both in step with what the UI shows.

pub mod cache;
pub mod config;
pub mod connections;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod models;
pub mod session;
pub mod store;
pub mod validate;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use cache::{LoadOutcome, LoadSource, SnapshotCacheManager};
pub use config::Config;
pub use connections::{ConnectionManager, RepositoryConnection};
pub use error::CoreError;
pub type Result<T> = std::result::Result<T, CoreError>;
