//! Document store connections (mongodb)
//!
//! Statements name an operation and a collection, `"<verb> <collection>"`:
//!
//! - `query`: `find users` (or just `users`); `params[0]`, when given, is the filter.
//! - `modify`: `insert users` takes one document per param, `update users`
//!   takes `[filter, update]`, and `delete users` takes `[filter]`.
//! - `execute`: the script is a JSON command document for `runCommand`.

use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection, Database};
use serde_json::Value;
use tracing::debug;

use crate::config::{BackendKind, MongoConfig};
use crate::db::executor::{Record, Session};
use crate::db::pool::{ConnectionPool, Connector, PoolSettings};
use crate::error::{ConfigError, ConnectionError, Error, Result};
use crate::utils::url::sanitize_url;

/// Database used when neither the descriptor nor the URI names one.
pub const DEFAULT_DATABASE: &str = "test";

const APP_NAME: &str = "unidb";

/// Dials document store clients for a [`ConnectionPool`].
#[derive(Debug, Clone)]
pub struct MongoConnector {
    uri: String,
    database: Option<String>,
    timeout: Duration,
}

impl MongoConnector {
    pub fn from_config(config: &MongoConfig) -> Result<Self> {
        let uri = crate::config::non_empty(&config.uri)
            .ok_or_else(|| ConfigError::missing("mongodb.uri"))?;
        Ok(Self {
            uri: uri.to_string(),
            database: crate::config::non_empty(&config.database).map(str::to_string),
            timeout: config.timeout(),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// The configured name wins, then the one in the URI path.
pub fn database_name(configured: Option<&str>, from_uri: Option<&str>) -> String {
    configured
        .or(from_uri)
        .filter(|name| !name.trim().is_empty())
        .unwrap_or(DEFAULT_DATABASE)
        .to_string()
}

#[async_trait]
impl Connector for MongoConnector {
    type Connection = MongoSession;

    fn kind(&self) -> BackendKind {
        BackendKind::MongoDb
    }

    fn describe(&self) -> String {
        sanitize_url(&self.uri)
    }

    async fn connect(&self) -> Result<MongoSession> {
        debug!(target = %self.describe(), "Dialing document store");
        let mut options = ClientOptions::parse(&self.uri).await?;
        options.connect_timeout = Some(self.timeout);
        options.server_selection_timeout = Some(self.timeout);
        options.app_name.get_or_insert_with(|| APP_NAME.to_string());

        let name = database_name(self.database.as_deref(), options.default_database.as_deref());
        let client = Client::with_options(options)?;
        let database = client.database(&name);
        let mut session = MongoSession { client, database };

        match tokio::time::timeout(self.timeout, session.ping()).await {
            Ok(ping) => ping?,
            Err(_) => {
                return Err(ConnectionError::Timeout {
                    waited: self.timeout,
                }
                .into())
            }
        }
        Ok(session)
    }

    async fn disconnect(&self, conn: MongoSession) -> Result<()> {
        conn.client.shutdown().await;
        Ok(())
    }
}

/// A live document store client bound to one database.
pub struct MongoSession {
    client: Client,
    database: Database,
}

impl MongoSession {
    pub fn database(&self) -> &Database {
        &self.database
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.database.collection::<Document>(name)
    }
}

#[async_trait]
impl Session for MongoSession {
    async fn execute(&mut self, script: &str) -> Result<()> {
        let command: Value = serde_json::from_str(script)?;
        self.database.run_command(to_document(&command)?, None).await?;
        Ok(())
    }

    async fn query(&mut self, statement: &str, params: &[Value]) -> Result<Vec<Record>> {
        let (verb, collection) = split_statement(statement)?;
        if verb != "find" {
            return Err(Error::Unsupported(format!(
                "document query must be a find, got `{}`",
                verb
            )));
        }

        let filter = params.first().map(to_document).transpose()?;
        let mut cursor = self.collection(collection).find(filter, None).await?;
        let mut records = Vec::new();
        while cursor.advance().await? {
            let doc: Document = cursor.deserialize_current()?;
            records.push(to_record(doc));
        }
        Ok(records)
    }

    async fn modify(&mut self, statement: &str, params: &[Value]) -> Result<u64> {
        let (verb, collection) = split_statement(statement)?;
        let collection = self.collection(collection);

        match (verb, params) {
            ("insert", docs) if !docs.is_empty() => {
                let docs = docs.iter().map(to_document).collect::<Result<Vec<_>>>()?;
                let inserted = collection.insert_many(docs, None).await?;
                Ok(inserted.inserted_ids.len() as u64)
            }
            ("update", [filter, update]) => {
                let updated = collection
                    .update_many(to_document(filter)?, to_document(update)?, None)
                    .await?;
                Ok(updated.modified_count)
            }
            ("delete", [filter]) => {
                let deleted = collection.delete_many(to_document(filter)?, None).await?;
                Ok(deleted.deleted_count)
            }
            (verb, params) => Err(Error::Unsupported(format!(
                "document modify `{}` with {} params",
                verb,
                params.len()
            ))),
        }
    }

    async fn ping(&mut self) -> Result<()> {
        self.database.run_command(doc! { "ping": 1 }, None).await?;
        Ok(())
    }
}

/// Split `"<verb> <collection>"`; a bare collection name is a find.
fn split_statement(statement: &str) -> Result<(&str, &str)> {
    let mut parts = statement.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(collection), None, None) => Ok(("find", collection)),
        (Some(verb), Some(collection), None) => Ok((verb, collection)),
        _ => Err(Error::Unsupported(format!(
            "document statement must be `<verb> <collection>`, got `{}`",
            statement.trim()
        ))),
    }
}

/// A JSON object as a BSON document. Extended JSON (`{"$oid": ..}`) is honoured.
pub fn to_document(value: &Value) -> Result<Document> {
    match Bson::try_from(value.clone()) {
        Ok(Bson::Document(doc)) => Ok(doc),
        Ok(other) => Err(Error::Serialization(format!(
            "expected a document, got {}",
            other
        ))),
        Err(e) => Err(Error::Serialization(e.to_string())),
    }
}

/// A BSON document as a record, in relaxed extended JSON.
pub fn to_record(doc: Document) -> Record {
    match Bson::Document(doc).into_relaxed_extjson() {
        Value::Object(map) => map,
        other => {
            let mut record = Record::new();
            record.insert("value".to_string(), other);
            record
        }
    }
}

/// Open a document store pool from its descriptor. Dials once; no retry.
pub async fn open_document_store(config: &MongoConfig) -> Result<ConnectionPool<MongoConnector>> {
    let connector = MongoConnector::from_config(config)?;
    let settings = PoolSettings::from_max_size(config.max_pool_size())
        .with_acquire_timeout(config.timeout());
    ConnectionPool::open(connector, settings).await
}
