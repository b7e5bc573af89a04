//! unidb: configured, pooled, retry-aware connections to SQL, document and
//! cache backends, plus versioned SQL migrations
//!
//! Resolve a [`Config`] once, hand it to [`DataSource::open`], and use the
//! pools it opens. Every pool is a [`Backend`], so callers can work against
//! whichever store the configuration selects.

pub mod config;
pub mod db;
pub mod error;
pub mod migration;
pub mod utils;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// Re-export main types for easier access
pub use config::{BackendKind, Config, ConfigResolver, EnvSource, ProcessEnv};
pub use db::{
    Backend, ConnectionPool, Connector, MongoConnector, PoolSettings, PoolStats,
    PooledConnection, Record, RedisConnector, Session, SqlConnector,
};
pub use error::{ConfigError, ConnectionError, DiscoveryError, Error, Result};
pub use migration::{Migration, MigrationEngine, MigrationLedger, MigrationState, SqlLedger};
pub use utils::{BackoffPolicy, Retry, RetryError, RetryPolicy};

/// Resolve configuration from `config_path` (plus the process environment)
/// and open every declared backend.
pub async fn init(config_path: &str) -> Result<DataSource> {
    let config = ConfigResolver::new()
        .with_file(config_path)
        .resolve(&ProcessEnv)?;
    DataSource::open(Arc::new(config)).await
}

/// The pools opened for one configuration
pub struct DataSource {
    config: Arc<Config>,
    relational: Option<ConnectionPool<SqlConnector>>,
    cache: Option<ConnectionPool<RedisConnector>>,
    document_store: Option<Arc<dyn Backend>>,
}

impl DataSource {
    /// Open one pool per declared backend, retrying each dial with
    /// exponential backoff.
    pub async fn open(config: Arc<Config>) -> Result<Self> {
        Self::open_inner(config, None).await
    }

    /// Like [`DataSource::open`]; firing `cancel` stops waiting between
    /// dial attempts.
    pub async fn open_with_cancel(config: Arc<Config>, cancel: &CancellationToken) -> Result<Self> {
        Self::open_inner(config, Some(cancel)).await
    }

    async fn open_inner(config: Arc<Config>, cancel: Option<&CancellationToken>) -> Result<Self> {
        config.validate()?;

        let database = &config.database;
        let relational = match database.effective_kind() {
            Some(kind) if kind.is_relational() => {
                let connector = SqlConnector::from_config(database)?;
                let settings = PoolSettings::from_max_size(database.max_pool_size())
                    .with_acquire_timeout(database.acquire_timeout());
                Some(dial_with_retry(connector, settings, database.max_retries(), cancel).await?)
            }
            // host/port/name alone cannot say which driver to use
            None if database.is_declared() => {
                return Err(ConfigError::missing("database.type").into());
            }
            _ => None,
        };

        let cache = if config.redis.is_declared() {
            let connector = RedisConnector::from_config(&config.redis)?;
            let settings = PoolSettings::from_max_size(config.redis.max_pool_size());
            Some(dial_with_retry(connector, settings, config.redis.max_retries(), cancel).await?)
        } else {
            None
        };

        let document_store = if config.mongodb.is_declared() {
            let connector = MongoConnector::from_config(&config.mongodb)?;
            let settings = PoolSettings::from_max_size(config.mongodb.max_pool_size())
                .with_acquire_timeout(config.mongodb.timeout());
            let pool = dial_with_retry(connector, settings, config.mongodb.max_retries(), cancel)
                .await?;
            let backend: Arc<dyn Backend> = Arc::new(pool);
            Some(backend)
        } else {
            None
        };

        Ok(Self {
            config,
            relational,
            cache,
            document_store,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The backend the configuration's kind tag selects.
    pub fn primary(&self) -> Option<&dyn Backend> {
        match self.config.database.effective_kind() {
            Some(BackendKind::MongoDb) => self.document_store(),
            Some(BackendKind::Redis) => self.cache.as_ref().map(|p| p as &dyn Backend),
            _ => self
                .relational
                .as_ref()
                .map(|p| p as &dyn Backend)
                .or_else(|| self.cache.as_ref().map(|p| p as &dyn Backend))
                .or_else(|| self.document_store()),
        }
    }

    pub fn relational(&self) -> Option<&ConnectionPool<SqlConnector>> {
        self.relational.as_ref()
    }

    pub fn cache(&self) -> Option<&ConnectionPool<RedisConnector>> {
        self.cache.as_ref()
    }

    pub fn document_store(&self) -> Option<&dyn Backend> {
        self.document_store.as_deref()
    }

    /// Register a pool for the document store, built from the caller's own
    /// [`Connector`]. Replaces the pool opened from `mongodb.uri`, if any.
    pub fn attach_document_store<C>(&mut self, pool: ConnectionPool<C>)
    where
        C: Connector,
        C::Connection: Session,
    {
        let backend: Arc<dyn Backend> = Arc::new(pool);
        self.document_store = Some(backend);
    }

    /// Apply the configured migration directory to the relational backend.
    pub async fn migrate(&self) -> Result<usize> {
        let pool = self.relational.as_ref().ok_or_else(|| {
            Error::Unsupported("migrations need a relational backend".to_string())
        })?;
        let settings = &self.config.migrations;
        let mut engine = MigrationEngine::from_config(settings);

        if settings.track_history {
            let ledger = SqlLedger::new(pool.clone(), settings.history_table.clone())?;
            engine.run(&settings.directory, &ledger).await
        } else {
            engine.run_untracked(&settings.directory, pool).await
        }
    }

    /// Close every pool. All pools are closed even if one fails; the first
    /// error is returned.
    pub async fn close(&self) -> Result<()> {
        let mut first_error = None;
        let backends = [
            self.relational.as_ref().map(|p| p as &dyn Backend),
            self.cache.as_ref().map(|p| p as &dyn Backend),
            self.document_store(),
        ];

        for backend in backends.into_iter().flatten() {
            if let Err(e) = backend.close().await {
                warn!(backend = %backend.kind(), error = %e, "Failed to close backend");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Open a pool, retrying the first dial. Configuration errors are raised
/// before this point and never retried.
async fn dial_with_retry<C>(
    connector: C,
    settings: PoolSettings,
    max_retries: u32,
    cancel: Option<&CancellationToken>,
) -> Result<ConnectionPool<C>>
where
    C: Connector + Clone,
{
    let kind = connector.kind();
    let target = connector.describe();
    let retry = Retry::new(RetryPolicy::exponential(
        max_retries.max(1),
        BackoffPolicy::default(),
    ));
    let dial = || ConnectionPool::open(connector.clone(), settings);

    let pool = match cancel {
        Some(token) => retry.run_with_cancel(dial, token).await,
        None => retry.run(dial).await,
    }?;

    info!(backend = %kind, target = %target, "Backend ready");
    Ok(pool)
}
