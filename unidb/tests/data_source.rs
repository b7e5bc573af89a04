//! Opening backends from a resolved configuration

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use unidb::config::{DatabaseConfig, MongoConfig};
use unidb::{
    Backend, BackendKind, Config, ConfigError, ConfigResolver, ConnectionPool, Connector,
    DataSource, Error, PoolSettings, Record, Result, Session,
};

fn sqlite_config(dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.database = DatabaseConfig {
        kind: Some(BackendKind::Sqlite),
        url: Some(format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("data.db").display()
        )),
        ..Default::default()
    };
    config.migrations.directory = dir.path().join("migrations").display().to_string();
    config
}

#[tokio::test]
async fn opens_sqlite_and_migrates() {
    let tmp = tempfile::tempdir().unwrap();
    let config = sqlite_config(&tmp);
    fs::create_dir_all(&config.migrations.directory).unwrap();
    fs::write(
        tmp.path().join("migrations").join("1__accounts.sql"),
        "CREATE TABLE accounts (id INTEGER PRIMARY KEY, owner TEXT NOT NULL);",
    )
    .unwrap();

    let source = DataSource::open(Arc::new(config)).await.unwrap();
    assert!(source.cache().is_none());
    assert_eq!(source.migrate().await.unwrap(), 1);
    assert_eq!(source.migrate().await.unwrap(), 0);

    let primary = source.primary().unwrap();
    assert_eq!(primary.kind(), BackendKind::Sqlite);

    let inserted = primary
        .modify(
            "INSERT INTO accounts (id, owner) VALUES (?, ?)",
            &[json!(7), json!("grace")],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let rows = primary
        .query("SELECT owner FROM accounts WHERE id = ?", &[json!(7)])
        .await
        .unwrap();
    assert_eq!(rows[0]["owner"], json!("grace"));

    source.close().await.unwrap();
    source.close().await.unwrap();
}

#[tokio::test]
async fn invalid_config_is_not_retried() {
    let mut config = Config::default();
    config.database.host = Some("db.local".to_string());

    let err = DataSource::open(Arc::new(config)).await.err().unwrap();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test]
async fn unreachable_backend_exhausts_retries() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.database = DatabaseConfig {
        url: Some(format!(
            "sqlite://{}?mode=ro",
            tmp.path().join("missing.db").display()
        )),
        max_retries: Some(1),
        ..Default::default()
    };

    let err = DataSource::open(Arc::new(config)).await.err().unwrap();
    assert!(matches!(err, Error::RetryExhausted { attempts: 1, .. }));
}

#[tokio::test]
async fn untagged_relational_descriptor_is_rejected() {
    let mut config = Config::default();
    config.database = DatabaseConfig {
        host: Some("db.local".to_string()),
        port: Some(5432),
        name: Some("app".to_string()),
        ..Default::default()
    };
    assert!(config.validate().is_ok());

    let err = DataSource::open(Arc::new(config)).await.err().unwrap();
    match err {
        Error::Config(ConfigError::MissingRequired { key }) => assert_eq!(key, "database.type"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn unreachable_document_store_exhausts_retries() {
    let mut config = Config::default();
    config.mongodb = MongoConfig {
        uri: Some("mongodb://127.0.0.1:1/app".to_string()),
        timeout_seconds: Some(1),
        max_retries: Some(1),
        ..Default::default()
    };

    let err = DataSource::open(Arc::new(config)).await.err().unwrap();
    assert!(matches!(err, Error::RetryExhausted { attempts: 1, .. }));
}

#[tokio::test]
async fn resolves_file_then_opens() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("unidb.toml");
    fs::write(
        &path,
        format!(
            "[database]\ntype = \"sqlite\"\nurl = \"sqlite://{}?mode=rwc\"\nmax_pool_size = 3\n",
            tmp.path().join("file.db").display()
        ),
    )
    .unwrap();

    let config = ConfigResolver::new()
        .with_file(&path)
        .resolve(&HashMap::<String, String>::new())
        .unwrap();
    let source = DataSource::open(Arc::new(config)).await.unwrap();

    let pool = source.relational().unwrap();
    assert_eq!(pool.stats().max_open, 3);
    pool.execute("CREATE TABLE t (x INTEGER)").await.unwrap();
}

/// In-memory stand-in for a document store client.
#[derive(Clone, Default)]
struct MemoryStore {
    docs: Arc<Mutex<Vec<Record>>>,
}

struct MemorySession {
    docs: Arc<Mutex<Vec<Record>>>,
}

#[async_trait]
impl Connector for MemoryStore {
    type Connection = MemorySession;

    fn kind(&self) -> BackendKind {
        BackendKind::MongoDb
    }

    fn describe(&self) -> String {
        "memory://documents".to_string()
    }

    async fn connect(&self) -> Result<MemorySession> {
        Ok(MemorySession {
            docs: Arc::clone(&self.docs),
        })
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn execute(&mut self, _script: &str) -> Result<()> {
        Ok(())
    }

    async fn query(&mut self, _statement: &str, _params: &[Value]) -> Result<Vec<Record>> {
        Ok(self.docs.lock().clone())
    }

    async fn modify(&mut self, _statement: &str, params: &[Value]) -> Result<u64> {
        let mut docs = self.docs.lock();
        for param in params {
            if let Value::Object(doc) = param {
                docs.push(doc.clone());
            }
        }
        Ok(params.len() as u64)
    }

    async fn ping(&mut self) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn attached_document_store_becomes_primary() {
    let mut config = Config::default();
    // tagged for the document store, but no `mongodb.uri` to dial
    config.database = DatabaseConfig {
        kind: Some(BackendKind::MongoDb),
        url: Some("mongodb://localhost:27017/app".to_string()),
        ..Default::default()
    };

    let mut source = DataSource::open(Arc::new(config)).await.unwrap();
    assert!(source.relational().is_none());
    assert!(source.primary().is_none());

    let pool = ConnectionPool::open(MemoryStore::default(), PoolSettings::from_max_size(2))
        .await
        .unwrap();
    source.attach_document_store(pool);

    let primary = source.primary().unwrap();
    assert_eq!(primary.kind(), BackendKind::MongoDb);
    primary
        .modify("insert", &[json!({"name": "ada"})])
        .await
        .unwrap();

    let docs = primary.query("find", &[]).await.unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["name"], json!("ada"));

    source.close().await.unwrap();
}
