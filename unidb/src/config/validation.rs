//! Configuration invariants
//!
//! Everything in here is pure so it can be exercised on hand-built values.

use crate::config::{non_empty, Config, DatabaseConfig, MongoConfig, ServerConfig, DEFAULT_SERVER_PORT};
use crate::error::ConfigError;

/// URI prefixes accepted for the document store.
pub const DOCUMENT_STORE_SCHEMES: &[&str] = &["mongodb://", "mongodb+srv://"];

/// Validate a resolved configuration.
///
/// The relational descriptor is checked when it is declared, or when no
/// other backend is, since it is then the only candidate primary backend.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    let other_backend = config.mongodb.is_declared() || config.redis.is_declared();
    if config.database.is_declared() || !other_backend {
        validate_database(&config.database)?;
    }

    validate_document_store(&config.mongodb)?;
    validate_server(&config.server)?;

    Ok(())
}

/// A URL, or host + port + database name.
pub fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    if non_empty(&database.url).is_some() {
        return Ok(());
    }

    let host = non_empty(&database.host).is_some();
    let port = database.port.is_some_and(|p| p != 0);
    let name = non_empty(&database.name).is_some();

    match (host, port, name) {
        (true, true, true) => Ok(()),
        (false, false, false) => Err(ConfigError::missing("database.url")),
        (false, _, _) => Err(ConfigError::missing("database.host")),
        (_, false, _) => Err(ConfigError::missing("database.port")),
        (_, _, false) => Err(ConfigError::missing("database.name")),
    }
}

/// The URI, when present, must use a document-store scheme. The database
/// name is optional.
pub fn validate_document_store(mongodb: &MongoConfig) -> Result<(), ConfigError> {
    match non_empty(&mongodb.uri) {
        Some(uri) if !DOCUMENT_STORE_SCHEMES.iter().any(|s| uri.starts_with(s)) => {
            Err(ConfigError::invalid(
                "mongodb.uri",
                format!("must start with one of {:?}", DOCUMENT_STORE_SCHEMES),
            ))
        }
        _ => Ok(()),
    }
}

/// TLS needs both a certificate and a key.
pub fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if !server.tls {
        return Ok(());
    }
    if non_empty(&server.cert_file).is_none() {
        return Err(ConfigError::missing("server.cert_file"));
    }
    if non_empty(&server.key_file).is_none() {
        return Err(ConfigError::missing("server.key_file"));
    }
    Ok(())
}

/// See [`ServerConfig::address`].
pub fn address(server: &ServerConfig) -> String {
    if let Some(addr) = non_empty(&server.addr) {
        return addr.to_string();
    }

    let host = non_empty(&server.host).unwrap_or("");
    let port = server
        .port
        .filter(|p| *p != 0)
        .unwrap_or(DEFAULT_SERVER_PORT);
    format!("{}:{}", host, port)
}
