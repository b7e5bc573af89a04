//! Error types for unidb

use std::time::Duration;

use thiserror::Error;

use crate::utils::retry::RetryError;

/// Result type for unidb operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for unidb
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Gave up after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("Cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },

    #[error("Migration discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Migration {version} failed after {applied} applied: {source}")]
    MigrationApply {
        version: u64,
        applied: usize,
        #[source]
        source: Box<Error>,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("Document store error: {0}")]
    DocumentStore(#[from] mongodb::error::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logging setup error: {0}")]
    Logging(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

/// Configuration problems. These are never transient and are never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required value `{key}`")]
    MissingRequired { key: String },

    #[error("invalid value for `{key}`: {message}")]
    InvalidValue { key: String, message: String },
}

impl ConfigError {
    pub fn missing(key: impl Into<String>) -> Self {
        ConfigError::MissingRequired { key: key.into() }
    }

    pub fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Failures of the pool manager.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("failed to connect to {backend}: {message}")]
    DialFailed { backend: String, message: String },

    #[error("timed out after {waited:?} waiting for a connection")]
    Timeout { waited: Duration },

    #[error("all {max_open} connections are in use")]
    PoolExhausted { max_open: usize },

    #[error("pool is closed")]
    Closed,
}

/// Failures while scanning and ordering migration scripts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("invalid migration file name `{file}`: {reason}")]
    InvalidFilename { file: String, reason: String },

    #[error("migration version {version} is used by both `{first}` and `{second}`")]
    DuplicateVersion {
        version: u64,
        first: String,
        second: String,
    },

    #[error("cannot read migration directory `{path}`: {message}")]
    UnreadableDirectory { path: String, message: String },
}

impl From<RetryError<Error>> for Error {
    fn from(error: RetryError<Error>) -> Self {
        match error {
            RetryError::Exhausted { attempts, last } => Error::RetryExhausted {
                attempts,
                source: Box::new(last),
            },
            RetryError::Cancelled { attempts, .. } => Error::Cancelled { attempts },
        }
    }
}

/// Convert Serde JSON errors to unidb errors
impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serialization(error.to_string())
    }
}
