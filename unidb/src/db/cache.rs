//! Key-value cache connections (redis)

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use serde_json::{Number, Value};
use tracing::debug;

use crate::config::{BackendKind, RedisConfig};
use crate::db::executor::{Record, Session};
use crate::db::pool::{ConnectionPool, Connector, PoolSettings};
use crate::error::{ConfigError, Error, Result};
use crate::utils::url::{encode_component, sanitize_url};

/// Dials redis connections for a [`ConnectionPool`].
#[derive(Debug, Clone)]
pub struct RedisConnector {
    client: redis::Client,
    url: String,
}

impl RedisConnector {
    pub fn from_config(config: &RedisConfig) -> Result<Self> {
        Self::from_url(connection_url(config)?)
    }

    pub fn from_url(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        let client = redis::Client::open(url.as_str())?;
        Ok(Self { client, url })
    }
}

/// Build the cache URL: an explicit URL wins, otherwise
/// `redis://[:password@]addr/db`.
pub fn connection_url(config: &RedisConfig) -> Result<String> {
    if let Some(url) = crate::config::non_empty(&config.url) {
        return Ok(url.to_string());
    }

    let addr =
        crate::config::non_empty(&config.addr).ok_or_else(|| ConfigError::missing("redis.addr"))?;
    let auth = match crate::config::non_empty(&config.password) {
        Some(password) => format!(":{}@", encode_component(password)),
        None => String::new(),
    };

    Ok(format!("redis://{}{}/{}", auth, addr, config.db.unwrap_or(0)))
}

#[async_trait]
impl Connector for RedisConnector {
    type Connection = RedisSession;

    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    fn describe(&self) -> String {
        sanitize_url(&self.url)
    }

    async fn connect(&self) -> Result<RedisSession> {
        debug!(target = %self.describe(), "Dialing cache");
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(RedisSession { conn })
    }
}

/// A live cache connection.
pub struct RedisSession {
    conn: MultiplexedConnection,
}

impl RedisSession {
    async fn run(&mut self, command: &str, args: &[String]) -> Result<redis::Value> {
        let mut cmd = redis::cmd(command);
        for arg in args {
            cmd.arg(arg);
        }
        let value: redis::Value = cmd.query_async(&mut self.conn).await?;
        Ok(value)
    }
}

#[async_trait]
impl Session for RedisSession {
    /// One command per non-empty line, arguments split on whitespace.
    async fn execute(&mut self, script: &str) -> Result<()> {
        for line in script.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (command, args) = split_command(line)?;
            self.run(&command, &args).await?;
        }
        Ok(())
    }

    async fn query(&mut self, statement: &str, params: &[Value]) -> Result<Vec<Record>> {
        let (command, mut args) = split_command(statement)?;
        args.extend(params.iter().map(param_to_arg));

        let value = self.run(&command, &args).await?;
        let mut record = Record::new();
        record.insert("value".to_string(), redis_to_json(value));
        Ok(vec![record])
    }

    async fn modify(&mut self, statement: &str, params: &[Value]) -> Result<u64> {
        let (command, mut args) = split_command(statement)?;
        args.extend(params.iter().map(param_to_arg));

        match self.run(&command, &args).await? {
            redis::Value::Int(n) => Ok(u64::try_from(n).unwrap_or(0)),
            redis::Value::Nil => Ok(0),
            _ => Ok(1),
        }
    }

    async fn ping(&mut self) -> Result<()> {
        let _: redis::Value = redis::cmd("PING").query_async(&mut self.conn).await?;
        Ok(())
    }
}

fn split_command(line: &str) -> Result<(String, Vec<String>)> {
    let mut parts = line.split_whitespace();
    let command = parts
        .next()
        .ok_or_else(|| Error::Unsupported("empty cache command".to_string()))?;
    Ok((command.to_string(), parts.map(str::to_string).collect()))
}

fn param_to_arg(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Convert a redis reply into JSON.
pub fn redis_to_json(value: redis::Value) -> Value {
    match value {
        redis::Value::Nil => Value::Null,
        redis::Value::Int(n) => Value::from(n),
        redis::Value::BulkString(bytes) => match String::from_utf8(bytes) {
            Ok(s) => Value::String(s),
            Err(e) => Value::Array(e.into_bytes().into_iter().map(Value::from).collect()),
        },
        redis::Value::SimpleString(s) => Value::String(s),
        redis::Value::Okay => Value::String("OK".to_string()),
        redis::Value::Array(items) => Value::Array(items.into_iter().map(redis_to_json).collect()),
        redis::Value::Double(d) => Number::from_f64(d).map(Value::Number).unwrap_or(Value::Null),
        redis::Value::Boolean(b) => Value::Bool(b),
        other => Value::String(format!("{:?}", other)),
    }
}

/// Open a cache pool from its descriptor. Dials once; no retry.
pub async fn open_cache(config: &RedisConfig) -> Result<ConnectionPool<RedisConnector>> {
    let connector = RedisConnector::from_config(config)?;
    ConnectionPool::open(connector, PoolSettings::from_max_size(config.max_pool_size())).await
}
