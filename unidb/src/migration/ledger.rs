//! Persisted history of applied migrations

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Connection, Executor};
use tracing::debug;

use crate::db::connection::{bind_all, SqlConnector};
use crate::db::executor::{Backend, Record};
use crate::db::pool::ConnectionPool;
use crate::error::{ConfigError, Error, Result};
use crate::migration::Migration;

/// Durable record of which versions have been applied.
#[async_trait]
pub trait MigrationLedger: Send + Sync {
    /// Create the backing storage if needed.
    async fn prepare(&self) -> Result<()>;

    /// Applied versions and the checksum each had when it ran.
    async fn applied(&self) -> Result<BTreeMap<u64, String>>;

    /// Run the script and record it; both happen or neither does.
    async fn apply_recorded(&self, migration: &Migration) -> Result<()>;
}

/// Ledger kept in a table of the relational database being migrated.
#[derive(Debug, Clone)]
pub struct SqlLedger {
    pool: ConnectionPool<SqlConnector>,
    table: String,
}

impl SqlLedger {
    pub fn new(pool: ConnectionPool<SqlConnector>, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        if !is_identifier(&table) {
            return Err(ConfigError::invalid(
                "migrations.history_table",
                format!("`{}` is not a plain table name", table),
            )
            .into());
        }
        Ok(Self { pool, table })
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

#[async_trait]
impl MigrationLedger for SqlLedger {
    async fn prepare(&self) -> Result<()> {
        let create_table_sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                version BIGINT PRIMARY KEY,
                description VARCHAR(255) NOT NULL,
                checksum VARCHAR(64) NOT NULL,
                applied_at VARCHAR(64) NOT NULL
            )",
            self.table
        );

        self.pool.execute(&create_table_sql).await
    }

    async fn applied(&self) -> Result<BTreeMap<u64, String>> {
        let sql = format!("SELECT version, checksum FROM {}", self.table);
        let rows = self.pool.query(&sql, &[]).await?;

        rows.iter()
            .map(|row| history_entry(&self.table, row))
            .collect()
    }

    async fn apply_recorded(&self, migration: &Migration) -> Result<()> {
        let connector = self.pool.connector();
        let insert = format!(
            "INSERT INTO {} (version, description, checksum, applied_at) VALUES ({}, {}, {}, {})",
            self.table,
            connector.placeholder(1),
            connector.placeholder(2),
            connector.placeholder(3),
            connector.placeholder(4),
        );
        let params = [
            serde_json::Value::from(migration.version),
            serde_json::Value::from(migration.description.as_str()),
            serde_json::Value::from(migration.checksum.as_str()),
            serde_json::Value::from(Utc::now().to_rfc3339()),
        ];

        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.raw().begin().await?;
        Executor::execute(&mut *tx, migration.script.as_str()).await?;
        bind_all(sqlx::query(&insert), &params)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(version = migration.version, table = %self.table, "Recorded migration");
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// An unreadable row fails the read; skipping it would re-apply its version.
fn history_entry(table: &str, row: &Record) -> Result<(u64, String)> {
    let version = row.get("version").and_then(|v| v.as_u64());
    let checksum = row.get("checksum").and_then(|v| v.as_str());
    match (version, checksum) {
        (Some(version), Some(checksum)) => Ok((version, checksum.to_string())),
        _ => Err(Error::Serialization(format!(
            "unreadable row in {}: {}",
            table,
            serde_json::Value::Object(row.clone())
        ))),
    }
}
