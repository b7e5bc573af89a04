//! Backend capability set
//!
//! Every backend kind exposes the same operations: run a script, query,
//! modify, close. A connection implements [`Session`]; any pool of such
//! connections is a [`Backend`].

use async_trait::async_trait;
use serde_json::Value;

use crate::config::BackendKind;
use crate::db::pool::{ConnectionPool, Connector};
use crate::error::Result;

/// One row: column name to value.
pub type Record = serde_json::Map<String, Value>;

/// Operations on a single live connection.
#[async_trait]
pub trait Session: Send {
    /// Run an opaque script (possibly several statements) for its effect.
    async fn execute(&mut self, script: &str) -> Result<()>;

    /// Run a statement that returns rows.
    async fn query(&mut self, statement: &str, params: &[Value]) -> Result<Vec<Record>>;

    /// Run an insert/update statement, returning the affected row count.
    async fn modify(&mut self, statement: &str, params: &[Value]) -> Result<u64>;

    /// Cheap round trip to check the connection is alive.
    async fn ping(&mut self) -> Result<()>;
}

/// Pool-level capability set, one implementation for every backend kind.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn execute(&self, script: &str) -> Result<()>;

    async fn query(&self, statement: &str, params: &[Value]) -> Result<Vec<Record>>;

    async fn modify(&self, statement: &str, params: &[Value]) -> Result<u64>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
impl<C> Backend for ConnectionPool<C>
where
    C: Connector,
    C::Connection: Session,
{
    fn kind(&self) -> BackendKind {
        self.connector().kind()
    }

    async fn execute(&self, script: &str) -> Result<()> {
        let mut conn = self.acquire().await?;
        record_query(self.kind());
        conn.execute(script).await
    }

    async fn query(&self, statement: &str, params: &[Value]) -> Result<Vec<Record>> {
        let mut conn = self.acquire().await?;
        record_query(self.kind());
        conn.query(statement, params).await
    }

    async fn modify(&self, statement: &str, params: &[Value]) -> Result<u64> {
        let mut conn = self.acquire().await?;
        record_query(self.kind());
        conn.modify(statement, params).await
    }

    async fn close(&self) -> Result<()> {
        ConnectionPool::close(self).await
    }
}

fn record_query(kind: BackendKind) {
    metrics::counter!("unidb_queries_total", "backend" => kind.as_str()).increment(1);
}
