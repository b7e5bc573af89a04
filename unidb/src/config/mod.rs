//! Configuration handling for unidb
//!
//! A [`Config`] is resolved once at startup (see [`resolver`]), validated
//! (see [`validation`]) and then shared read-only, usually behind an `Arc`.

pub mod resolver;
pub mod validation;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

pub use resolver::{ConfigResolver, EnvSource, ProcessEnv};
pub use validation::validate;

/// Default listen port when the server descriptor names none.
pub const DEFAULT_SERVER_PORT: u16 = 8080;

/// Backend kinds understood by the resolver and the pool manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[serde(alias = "postgresql", alias = "pg")]
    Postgres,
    MySql,
    Sqlite,
    #[serde(alias = "mongo")]
    MongoDb,
    Redis,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Postgres => "postgres",
            BackendKind::MySql => "mysql",
            BackendKind::Sqlite => "sqlite",
            BackendKind::MongoDb => "mongodb",
            BackendKind::Redis => "redis",
        }
    }

    /// True for the kinds served by the SQL connector.
    pub fn is_relational(&self) -> bool {
        matches!(
            self,
            BackendKind::Postgres | BackendKind::MySql | BackendKind::Sqlite
        )
    }

    /// Guess the kind from a connection URL scheme.
    pub fn from_url(url: &str) -> Option<Self> {
        let scheme = url.split("://").next()?.to_ascii_lowercase();
        match scheme.as_str() {
            "postgres" | "postgresql" => Some(BackendKind::Postgres),
            "mysql" | "mariadb" => Some(BackendKind::MySql),
            "sqlite" => Some(BackendKind::Sqlite),
            "mongodb" | "mongodb+srv" => Some(BackendKind::MongoDb),
            "redis" | "rediss" => Some(BackendKind::Redis),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(BackendKind::Postgres),
            "mysql" => Ok(BackendKind::MySql),
            "sqlite" => Ok(BackendKind::Sqlite),
            "mongodb" | "mongo" => Ok(BackendKind::MongoDb),
            "redis" => Ok(BackendKind::Redis),
            other => Err(ConfigError::invalid(
                "database.type",
                format!("unknown backend kind `{}`", other),
            )),
        }
    }
}

/// Represents the complete unidb configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub mongodb: MongoConfig,
    pub redis: RedisConfig,
    pub server: ServerConfig,
    pub logger: LoggerConfig,
    pub migrations: MigrationsConfig,
}

impl Config {
    /// Build a single-backend configuration from the one environment
    /// variable that backend needs.
    pub fn quick(kind: BackendKind, env: &dyn EnvSource) -> Result<Self> {
        resolver::quick(kind, env)
    }

    /// Check every backend invariant; pure.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        validation::validate(self)
    }
}

/// Relational database connection configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    #[serde(rename = "type")]
    pub kind: Option<BackendKind>,
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub name: Option<String>,
    pub sslmode: Option<String>,
    pub max_retries: Option<u32>,
    pub max_pool_size: Option<u32>,
    pub timeout_seconds: Option<u64>,
}

impl DatabaseConfig {
    /// Any field that names a relational endpoint is set.
    pub fn is_declared(&self) -> bool {
        self.kind.is_some()
            || non_empty(&self.url).is_some()
            || non_empty(&self.host).is_some()
            || self.port.is_some()
            || non_empty(&self.name).is_some()
    }

    /// Kind tag, falling back to the URL scheme.
    pub fn effective_kind(&self) -> Option<BackendKind> {
        self.kind
            .or_else(|| non_empty(&self.url).and_then(BackendKind::from_url))
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(3)
    }

    pub fn max_pool_size(&self) -> u32 {
        self.max_pool_size.unwrap_or(10)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.unwrap_or(30))
    }
}

/// Document store configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MongoConfig {
    pub uri: Option<String>,
    pub database: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub max_retries: Option<u32>,
    pub max_pool_size: Option<u32>,
}

impl MongoConfig {
    pub fn is_declared(&self) -> bool {
        non_empty(&self.uri).is_some()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.unwrap_or(10))
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(3)
    }

    pub fn max_pool_size(&self) -> u32 {
        self.max_pool_size.unwrap_or(10)
    }
}

/// Cache configuration; `url` wins over the address tuple.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: Option<String>,
    pub addr: Option<String>,
    pub password: Option<String>,
    pub db: Option<u32>,
    pub max_retries: Option<u32>,
    pub max_pool_size: Option<u32>,
}

impl RedisConfig {
    pub fn is_declared(&self) -> bool {
        non_empty(&self.url).is_some() || non_empty(&self.addr).is_some()
    }

    /// Dial attempts for the cache, independent of the relational descriptor.
    pub fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(3)
    }

    pub fn max_pool_size(&self) -> u32 {
        self.max_pool_size.unwrap_or(10)
    }
}

/// Listen settings for a host program's server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub tls: bool,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl ServerConfig {
    /// Resolved listen address: `addr` verbatim, else `host:port`.
    ///
    /// An empty host listens on every interface, so a zero-valued
    /// descriptor resolves to `":8080"`.
    pub fn address(&self) -> String {
        validation::address(self)
    }

    /// Host to bind when the descriptor leaves it empty.
    pub fn listen_host(&self) -> &str {
        non_empty(&self.host).unwrap_or("0.0.0.0")
    }

    pub fn read_timeout(&self) -> Duration {
        secs_or(self.read_timeout_secs, 5)
    }

    pub fn write_timeout(&self) -> Duration {
        secs_or(self.write_timeout_secs, 10)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        secs_or(self.shutdown_timeout_secs, 10)
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub level: String,
    pub format: String,
    pub file: Option<String>,
    pub stdout: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            file: None,
            stdout: true,
        }
    }
}

/// Migration settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationsConfig {
    pub directory: String,
    pub extension: String,
    pub history_table: String,
    pub track_history: bool,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            directory: "migrations".to_string(),
            extension: "sql".to_string(),
            history_table: "unidb_schema_history".to_string(),
            track_history: true,
        }
    }
}

/// Treat `Some("")` like `None`.
pub(crate) fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn secs_or(secs: u64, default: u64) -> Duration {
    Duration::from_secs(if secs == 0 { default } else { secs })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case("postgres", BackendKind::Postgres)]
    #[case("PostgreSQL", BackendKind::Postgres)]
    #[case("mysql", BackendKind::MySql)]
    #[case("sqlite", BackendKind::Sqlite)]
    #[case("mongo", BackendKind::MongoDb)]
    #[case("redis", BackendKind::Redis)]
    fn test_backend_kind_parsing(#[case] input: &str, #[case] expected: BackendKind) {
        assert_eq!(input.parse::<BackendKind>().unwrap(), expected);
    }

    #[test]
    fn test_unknown_backend_kind() {
        assert!(matches!(
            "oracle".parse::<BackendKind>(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_kind_from_url() {
        assert_eq!(
            BackendKind::from_url("postgres://u:p@localhost/db"),
            Some(BackendKind::Postgres)
        );
        assert_eq!(
            BackendKind::from_url("mongodb+srv://cluster.example"),
            Some(BackendKind::MongoDb)
        );
        assert_eq!(BackendKind::from_url("ftp://nope"), None);
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();

        assert_eq!(config.database.max_retries(), 3);
        assert_eq!(config.database.max_pool_size(), 10);
        assert_eq!(config.logger.level, "info");
        assert_eq!(config.migrations.extension, "sql");
        assert_eq!(config.server.read_timeout(), Duration::from_secs(5));
        assert_eq!(config.server.shutdown_timeout(), Duration::from_secs(10));
        assert_eq!(config.server.listen_host(), "0.0.0.0");
    }

    #[test]
    fn test_toml_section_keys() {
        let config: Config = toml::from_str(
            r#"
            [database]
            type = "postgresql"
            host = "db.internal"
            port = 5432
            name = "app"

            [server]
            tls = true
            "#,
        )
        .unwrap();

        assert_eq!(config.database.kind, Some(BackendKind::Postgres));
        assert_eq!(config.database.port, Some(5432));
        assert!(config.server.tls);
        assert_eq!(config.logger, LoggerConfig::default());
    }
}
