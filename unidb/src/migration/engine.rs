//! Sequential, fail-fast migration runner

use std::path::Path;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::config::MigrationsConfig;
use crate::db::executor::{Backend, Session};
use crate::db::pool::{ConnectionPool, Connector};
use crate::error::{Error, Result};
use crate::migration::discovery;
use crate::migration::ledger::MigrationLedger;
use crate::migration::{Migration, MigrationState};

/// Anything a migration script can be executed against.
#[async_trait]
pub trait MigrationTarget: Send + Sync {
    async fn execute(&self, script: &str) -> Result<()>;
}

#[async_trait]
impl<C> MigrationTarget for ConnectionPool<C>
where
    C: Connector,
    C::Connection: Session,
{
    async fn execute(&self, script: &str) -> Result<()> {
        Backend::execute(self, script).await
    }
}

/// Discovers, orders and applies migrations, tracking where the run is.
#[derive(Debug, Clone)]
pub struct MigrationEngine {
    extension: String,
    state: MigrationState,
}

impl Default for MigrationEngine {
    fn default() -> Self {
        Self::new("sql")
    }
}

impl MigrationEngine {
    pub fn new(extension: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
            state: MigrationState::Idle,
        }
    }

    pub fn from_config(config: &MigrationsConfig) -> Self {
        Self::new(config.extension.clone())
    }

    pub fn state(&self) -> MigrationState {
        self.state
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Scan `dir` and return its migrations in ascending version order.
    pub fn discover(&mut self, dir: impl AsRef<Path>) -> Result<Vec<Migration>> {
        self.state = MigrationState::Discovering;
        match discovery::discover(dir.as_ref(), &self.extension) {
            Ok(migrations) => {
                info!(
                    directory = %dir.as_ref().display(),
                    count = migrations.len(),
                    "Discovered migrations"
                );
                self.state = MigrationState::Ordered;
                Ok(migrations)
            }
            Err(e) => {
                self.state = MigrationState::Aborted;
                Err(e)
            }
        }
    }

    /// Apply every migration in order, stopping at the first failure.
    ///
    /// Returns the number applied. Nothing is rolled back: on error the
    /// target is left as of the last success, which
    /// [`Error::MigrationApply`] reports as `applied`.
    pub async fn apply(
        &mut self,
        target: &dyn MigrationTarget,
        migrations: &[Migration],
    ) -> Result<usize> {
        self.state = MigrationState::Applying;
        let mut applied = 0;

        for migration in migrations {
            info!(version = migration.version, description = %migration.description, "Applying migration");
            if let Err(e) = target.execute(&migration.script).await {
                return Err(self.abort(migration, applied, e));
            }
            applied += 1;
        }

        self.state = MigrationState::Completed;
        info!(applied, "Migrations applied successfully");
        Ok(applied)
    }

    /// Apply only the migrations the ledger has not seen, recording each one
    /// as it succeeds.
    pub async fn apply_tracked(
        &mut self,
        ledger: &dyn MigrationLedger,
        migrations: &[Migration],
    ) -> Result<usize> {
        self.state = MigrationState::Applying;
        if let Err(e) = ledger.prepare().await {
            self.state = MigrationState::Aborted;
            return Err(e);
        }

        let todo = match pending(ledger, migrations).await {
            Ok(todo) => todo,
            Err(e) => {
                self.state = MigrationState::Aborted;
                return Err(e);
            }
        };
        if todo.is_empty() {
            info!("Database schema is already up to date");
        }

        let mut applied = 0;
        for migration in &todo {
            info!(version = migration.version, description = %migration.description, "Applying migration");
            if let Err(e) = ledger.apply_recorded(migration).await {
                return Err(self.abort(migration, applied, e));
            }
            applied += 1;
        }

        self.state = MigrationState::Completed;
        info!(applied, skipped = migrations.len() - todo.len(), "Migrations applied successfully");
        Ok(applied)
    }

    /// Discover `dir` and apply what the ledger has not recorded yet.
    pub async fn run(&mut self, dir: impl AsRef<Path>, ledger: &dyn MigrationLedger) -> Result<usize> {
        let migrations = self.discover(dir)?;
        self.apply_tracked(ledger, &migrations).await
    }

    /// Discover `dir` and apply all of it, with no history kept.
    pub async fn run_untracked(
        &mut self,
        dir: impl AsRef<Path>,
        target: &dyn MigrationTarget,
    ) -> Result<usize> {
        let migrations = self.discover(dir)?;
        self.apply(target, &migrations).await
    }

    fn abort(&mut self, migration: &Migration, applied: usize, source: Error) -> Error {
        self.state = MigrationState::Aborted;
        error!(
            version = migration.version,
            file = %migration.file_name,
            applied,
            error = %source,
            "Migration failed; halting batch"
        );
        Error::MigrationApply {
            version: migration.version,
            applied,
            source: Box::new(source),
        }
    }
}

/// Migrations the ledger has not applied, in the given order.
///
/// An applied version whose checksum no longer matches its file is still
/// skipped, with a warning.
pub async fn pending(
    ledger: &dyn MigrationLedger,
    migrations: &[Migration],
) -> Result<Vec<Migration>> {
    let applied = ledger.applied().await?;

    Ok(migrations
        .iter()
        .filter(|m| match applied.get(&m.version) {
            Some(recorded) => {
                if recorded != &m.checksum {
                    warn!(
                        version = m.version,
                        file = %m.file_name,
                        recorded = %recorded,
                        current = %m.checksum,
                        "Applied migration has changed since it ran"
                    );
                }
                false
            }
            None => true,
        })
        .cloned()
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    /// Records every script it sees; fails on one of them.
    #[derive(Default)]
    struct SpyTarget {
        executed: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl MigrationTarget for SpyTarget {
        async fn execute(&self, script: &str) -> Result<()> {
            self.executed.lock().push(script.to_string());
            if self.fail_on == Some(script) {
                return Err(Error::Unsupported("syntax error".to_string()));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryLedger {
        target: SpyTarget,
        rows: Mutex<BTreeMap<u64, String>>,
    }

    #[async_trait]
    impl MigrationLedger for MemoryLedger {
        async fn prepare(&self) -> Result<()> {
            Ok(())
        }

        async fn applied(&self) -> Result<BTreeMap<u64, String>> {
            Ok(self.rows.lock().clone())
        }

        async fn apply_recorded(&self, migration: &Migration) -> Result<()> {
            self.target.execute(&migration.script).await?;
            self.rows
                .lock()
                .insert(migration.version, migration.checksum.clone());
            Ok(())
        }
    }

    fn batch() -> Vec<Migration> {
        vec![
            Migration::new(1, "one", "first"),
            Migration::new(2, "two", "second"),
            Migration::new(3, "three", "third"),
        ]
    }

    #[tokio::test]
    async fn test_apply_all_in_order() {
        let target = SpyTarget::default();
        let mut engine = MigrationEngine::default();

        let applied = engine.apply(&target, &batch()).await.unwrap();

        assert_eq!(applied, 3);
        assert_eq!(engine.state(), MigrationState::Completed);
        assert_eq!(*target.executed.lock(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_apply_halts_on_first_failure() {
        let target = SpyTarget {
            fail_on: Some("second"),
            ..Default::default()
        };
        let mut engine = MigrationEngine::default();

        let err = engine.apply(&target, &batch()).await.unwrap_err();

        match err {
            Error::MigrationApply {
                version, applied, ..
            } => {
                assert_eq!(version, 2);
                assert_eq!(applied, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(engine.state(), MigrationState::Aborted);
        assert_eq!(*target.executed.lock(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_tracked_apply_skips_recorded_versions() {
        let ledger = MemoryLedger::default();
        let mut engine = MigrationEngine::default();

        assert_eq!(engine.apply_tracked(&ledger, &batch()).await.unwrap(), 3);
        assert_eq!(engine.apply_tracked(&ledger, &batch()).await.unwrap(), 0);
        assert_eq!(ledger.target.executed.lock().len(), 3);

        let mut more = batch();
        more.push(Migration::new(4, "four", "fourth"));
        assert_eq!(engine.apply_tracked(&ledger, &more).await.unwrap(), 1);
        assert_eq!(ledger.target.executed.lock().last().unwrap(), "fourth");
    }

    #[tokio::test]
    async fn test_pending_skips_changed_scripts() {
        let ledger = MemoryLedger::default();
        ledger.rows.lock().insert(1, "stale".to_string());

        let todo = pending(&ledger, &batch()).await.unwrap();
        let versions: Vec<u64> = todo.iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_tracked_failure_keeps_earlier_records() {
        let ledger = MemoryLedger {
            target: SpyTarget {
                fail_on: Some("third"),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut engine = MigrationEngine::default();

        let err = engine.apply_tracked(&ledger, &batch()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::MigrationApply {
                version: 3,
                applied: 2,
                ..
            }
        ));
        assert_eq!(
            ledger.rows.lock().keys().copied().collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn test_discover_state_transitions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("1__init.sql"), "SELECT 1;").unwrap();
        let mut engine = MigrationEngine::default();
        assert_eq!(engine.state(), MigrationState::Idle);

        engine.discover(dir.path()).unwrap();
        assert_eq!(engine.state(), MigrationState::Ordered);

        std::fs::write(dir.path().join("oops.sql"), "SELECT 2;").unwrap();
        assert!(engine.discover(dir.path()).is_err());
        assert_eq!(engine.state(), MigrationState::Aborted);
    }
}
