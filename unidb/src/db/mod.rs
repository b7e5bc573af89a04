//! Database module for unidb
//!
//! This module handles connection pooling and the per-backend connectors.

pub mod cache;
pub mod connection;
pub mod document;
pub mod executor;
pub mod pool;

// Re-export key types
pub use cache::{open_cache, RedisConnector, RedisSession};
pub use connection::{open_relational, SqlConnector, SqlSession};
pub use document::{open_document_store, MongoConnector, MongoSession};
pub use executor::{Backend, Record, Session};
pub use pool::{ConnectionPool, Connector, PoolSettings, PoolStats, PooledConnection};
