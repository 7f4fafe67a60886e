//! Storage: SQLite persistence and the on-disk storage policy

pub mod db;
pub mod policy;

pub use db::{create_pool, get_connection, DbConnection, DbPool};
pub use policy::{LocalStoragePolicy, PathOptions, StoragePolicy, StorageStats};
