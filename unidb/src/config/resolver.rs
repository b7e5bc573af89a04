//! Configuration resolution
//!
//! Merges an optional config file with environment overrides. Environment
//! always wins; a missing file is not an error.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{debug, info};

use crate::config::{non_empty, validation, BackendKind, Config};
use crate::error::{ConfigError, Error, Result};

/// File names tried by [`ConfigResolver::discover`], in order.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["unidb.toml", "unidb.yaml", "unidb.yml", "unidb.json"];

/// Read access to environment variables.
pub trait EnvSource {
    fn var(&self, key: &str) -> Option<String>;
}

/// The real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

impl<T: EnvSource + ?Sized> EnvSource for &T {
    fn var(&self, key: &str) -> Option<String> {
        (**self).var(key)
    }
}

/// First non-empty variable among `keys`, with the key it came from.
fn first_set(env: &dyn EnvSource, keys: &[&'static str]) -> Option<(&'static str, String)> {
    keys.iter().find_map(|key| {
        env.var(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(|v| (*key, v))
    })
}

/// Builds a [`Config`] from a file and the environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigResolver {
    file: Option<PathBuf>,
}

impl ConfigResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolver using the first of [`DEFAULT_CONFIG_FILES`] present in the
    /// working directory, if any.
    pub fn discover() -> Self {
        let file = DEFAULT_CONFIG_FILES
            .iter()
            .map(PathBuf::from)
            .find(|path| path.is_file());
        Self { file }
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Merge, normalize and validate.
    pub fn resolve(&self, env: &dyn EnvSource) -> Result<Config> {
        let mut config = match &self.file {
            Some(path) if path.is_file() => {
                info!(path = %path.display(), "Loading configuration file");
                load_from_file(path)?
            }
            Some(path) => {
                debug!(path = %path.display(), "Config file not found, using environment only");
                Config::default()
            }
            None => Config::default(),
        };

        apply_env(&mut config, env)?;
        normalize(&mut config);
        validation::validate(&config)?;

        Ok(config)
    }
}

/// Load configuration from a TOML, JSON or YAML file
pub fn load_from_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)?;
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    let key = path.display().to_string();
    let parsed: std::result::Result<Config, String> = match extension.as_deref() {
        Some("toml") => toml::from_str(&contents).map_err(|e| e.to_string()),
        Some("json") => serde_json::from_str(&contents).map_err(|e| e.to_string()),
        Some("yaml") | Some("yml") => serde_yaml::from_str(&contents).map_err(|e| e.to_string()),
        _ => serde_json::from_str(&contents)
            .or_else(|_| serde_yaml::from_str(&contents))
            .map_err(|e| e.to_string())
            .or_else(|_| toml::from_str(&contents).map_err(|e| e.to_string())),
    };

    parsed.map_err(|message| Error::Config(ConfigError::invalid(key, message)))
}

/// Overlay environment variables onto `config`.
pub fn apply_env(config: &mut Config, env: &dyn EnvSource) -> std::result::Result<(), ConfigError> {
    let db = &mut config.database;
    set_parsed(&mut db.kind, env, &["DATABASE_TYPE"])?;
    set_string(&mut db.url, env, &["DATABASE_URL"]);
    set_string(&mut db.host, env, &["DATABASE_HOST"]);
    set_parsed(&mut db.port, env, &["DATABASE_PORT"])?;
    set_string(&mut db.user, env, &["DATABASE_USER"]);
    set_string(&mut db.password, env, &["DATABASE_PASSWORD"]);
    set_string(&mut db.name, env, &["DATABASE_NAME"]);
    set_string(&mut db.sslmode, env, &["DATABASE_SSLMODE"]);
    set_parsed(&mut db.max_retries, env, &["DATABASE_MAX_RETRIES"])?;
    set_parsed(&mut db.max_pool_size, env, &["DATABASE_MAX_POOL_SIZE"])?;

    let mongodb = &mut config.mongodb;
    set_string(&mut mongodb.uri, env, &["MONGO_URI", "MONGODB_URI"]);
    set_string(&mut mongodb.database, env, &["MONGODB_DATABASE"]);
    set_parsed(&mut mongodb.timeout_seconds, env, &["MONGODB_TIMEOUT"])?;
    set_parsed(&mut mongodb.max_retries, env, &["MONGODB_MAX_RETRIES"])?;

    let redis = &mut config.redis;
    set_string(&mut redis.url, env, &["REDIS_URL"]);
    set_string(&mut redis.addr, env, &["REDIS_ADDR"]);
    set_string(&mut redis.password, env, &["REDIS_PASSWORD"]);
    set_parsed(&mut redis.db, env, &["REDIS_DB"])?;
    set_parsed(&mut redis.max_retries, env, &["REDIS_MAX_RETRIES"])?;

    let server = &mut config.server;
    set_string(&mut server.addr, env, &["SERVER_ADDRESS", "SERVER_ADDR"]);
    set_string(&mut server.host, env, &["SERVER_HOST"]);
    set_parsed(&mut server.port, env, &["SERVER_PORT"])?;
    if let Some((key, value)) = first_set(env, &["SERVER_TLS"]) {
        server.tls = parse_bool(key, &value)?;
    }
    set_string(&mut server.cert_file, env, &["SERVER_CERT_FILE"]);
    set_string(&mut server.key_file, env, &["SERVER_KEY_FILE"]);

    if let Some((_, level)) = first_set(env, &["LOGGER_LEVEL", "LOG_LEVEL"]) {
        config.logger.level = level.to_ascii_lowercase();
    }
    if let Some((_, format)) = first_set(env, &["LOGGER_FORMAT"]) {
        config.logger.format = format.to_ascii_lowercase();
    }
    if let Some((_, directory)) = first_set(env, &["MIGRATIONS_DIR"]) {
        config.migrations.directory = directory;
    }

    Ok(())
}

/// Backfill the relational descriptor from a lone document-store URI.
///
/// Only applies when nothing relational was configured.
pub fn normalize(config: &mut Config) {
    let db = &config.database;
    if db.kind.is_some() || non_empty(&db.url).is_some() || non_empty(&db.host).is_some() {
        return;
    }

    if let Some(uri) = non_empty(&config.mongodb.uri) {
        let uri = uri.to_string();
        debug!("Backfilling relational descriptor from document-store URI");
        config.database.url = Some(uri);
        config.database.kind = Some(BackendKind::MongoDb);
    }
}

/// Single-backend configuration from one environment variable.
pub fn quick(kind: BackendKind, env: &dyn EnvSource) -> Result<Config> {
    let mut config = Config::default();

    match kind {
        BackendKind::Postgres | BackendKind::MySql | BackendKind::Sqlite => {
            let (_, url) = first_set(env, &["DATABASE_URL"])
                .ok_or_else(|| ConfigError::missing("DATABASE_URL"))?;
            config.database.kind = Some(kind);
            config.database.url = Some(url);
        }
        BackendKind::MongoDb => {
            let (_, uri) = first_set(env, &["MONGO_URI", "MONGODB_URI"])
                .ok_or_else(|| ConfigError::missing("MONGO_URI"))?;
            config.mongodb.uri = Some(uri);
            normalize(&mut config);
        }
        BackendKind::Redis => {
            let (_, url) = first_set(env, &["REDIS_URL"])
                .ok_or_else(|| ConfigError::missing("REDIS_URL"))?;
            config.redis.url = Some(url);
        }
    }

    validation::validate(&config)?;
    Ok(config)
}

fn set_string(target: &mut Option<String>, env: &dyn EnvSource, keys: &[&'static str]) {
    if let Some((_, value)) = first_set(env, keys) {
        *target = Some(value);
    }
}

fn set_parsed<T>(
    target: &mut Option<T>,
    env: &dyn EnvSource,
    keys: &[&'static str],
) -> std::result::Result<(), ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    if let Some((key, value)) = first_set(env, keys) {
        let parsed = value
            .parse::<T>()
            .map_err(|e| ConfigError::invalid(key, e.to_string()))?;
        *target = Some(parsed);
    }
    Ok(())
}

fn parse_bool(key: &str, value: &str) -> std::result::Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::invalid(key, format!("`{}` is not a boolean", other))),
    }
}
