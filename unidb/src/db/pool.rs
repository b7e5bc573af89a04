//! Pooled connection lifecycle
//!
//! A [`ConnectionPool`] owns the connections produced by a [`Connector`].
//! Slots are counted by a semaphore, so callers beyond `max_open` wait; the
//! wait, and any dial it leads to, ends with [`ConnectionError::Timeout`]
//! when the acquire timeout passes or the caller's cancellation token fires. A checked-out
//! connection is a [`PooledConnection`] guard that goes back to the pool when
//! dropped, whatever path the caller's scope exits by.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BackendKind;
use crate::error::{ConnectionError, Error, Result};

/// Connections are retired once they are this old.
pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(5 * 60);

/// Default wait for a free slot.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Dials new connections for a pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Send + 'static;

    fn kind(&self) -> BackendKind;

    /// Target for log lines; must not contain secrets.
    fn describe(&self) -> String;

    async fn connect(&self) -> Result<Self::Connection>;

    async fn disconnect(&self, conn: Self::Connection) -> Result<()> {
        drop(conn);
        Ok(())
    }
}

/// Sizing and lifetime policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_open: usize,
    pub max_idle: usize,
    pub max_lifetime: Duration,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from_max_size(10)
    }
}

impl PoolSettings {
    /// `max_open = max_size`; half of it (rounded up) may sit idle.
    pub fn from_max_size(max_size: u32) -> Self {
        let max_open = (max_size as usize).max(1);
        Self {
            max_open,
            max_idle: max_open.div_ceil(2),
            max_lifetime: DEFAULT_MAX_LIFETIME,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    fn normalized(mut self) -> Self {
        self.max_open = self.max_open.max(1);
        self.max_idle = self.max_idle.min(self.max_open);
        self
    }
}

/// Snapshot of the pool's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub open: usize,
    pub idle: usize,
    pub in_use: usize,
    pub max_open: usize,
    pub max_idle: usize,
}

struct IdleConnection<T> {
    conn: T,
    created_at: Instant,
}

struct PoolState<T> {
    idle: VecDeque<IdleConnection<T>>,
    open: usize,
    closed: bool,
}

struct Shared<C: Connector> {
    connector: C,
    settings: PoolSettings,
    state: Mutex<PoolState<C::Connection>>,
    slots: Arc<Semaphore>,
}

impl<C: Connector> Shared<C> {
    fn is_expired(&self, created_at: Instant) -> bool {
        created_at.elapsed() >= self.settings.max_lifetime
    }

    fn release(&self, conn: C::Connection, created_at: Instant) {
        let mut state = self.state.lock();
        let keep = !state.closed
            && !self.is_expired(created_at)
            && state.idle.len() < self.settings.max_idle;

        if keep {
            state.idle.push_back(IdleConnection { conn, created_at });
        } else {
            state.open = state.open.saturating_sub(1);
            drop(state);
            drop(conn);
            connection_closed(self.connector.kind());
        }
    }

    fn forget(&self) {
        let mut state = self.state.lock();
        state.open = state.open.saturating_sub(1);
    }
}

/// An `open` slot taken for a dial in flight. Dropping it without
/// [`Reservation::keep`] hands the slot back, so a failed or abandoned dial
/// does not leak the count.
struct Reservation<'a, C: Connector> {
    shared: &'a Shared<C>,
    armed: bool,
}

impl<'a, C: Connector> Reservation<'a, C> {
    fn new(shared: &'a Shared<C>) -> Self {
        Self {
            shared,
            armed: true,
        }
    }

    fn keep(mut self) {
        self.armed = false;
    }
}

impl<C: Connector> Drop for Reservation<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.forget();
        }
    }
}

/// A bounded pool of backend connections. Cloning shares the pool.
pub struct ConnectionPool<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Connector> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("target", &self.shared.connector.describe())
            .field("stats", &self.stats())
            .finish()
    }
}

impl<C: Connector> ConnectionPool<C> {
    /// Open a pool and dial one connection to prove the target is reachable.
    ///
    /// The pool never retries this dial; wrap the call in
    /// [`crate::utils::Retry`] for that.
    pub async fn open(connector: C, settings: PoolSettings) -> Result<Self> {
        let settings = settings.normalized();
        let kind = connector.kind();
        let target = connector.describe();

        let conn = connector
            .connect()
            .await
            .map_err(|e| dial_failed(kind, e))?;
        connection_opened(kind);

        let mut idle = VecDeque::with_capacity(settings.max_idle);
        idle.push_back(IdleConnection {
            conn,
            created_at: Instant::now(),
        });

        info!(
            backend = %kind,
            target = %target,
            max_open = settings.max_open,
            max_idle = settings.max_idle,
            max_lifetime_secs = settings.max_lifetime.as_secs(),
            "Connection pool opened"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                connector,
                settings,
                state: Mutex::new(PoolState {
                    idle,
                    open: 1,
                    closed: false,
                }),
                slots: Arc::new(Semaphore::new(settings.max_open)),
            }),
        })
    }

    pub fn connector(&self) -> &C {
        &self.shared.connector
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.shared.settings
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            open: state.open,
            idle: state.idle.len(),
            in_use: state.open.saturating_sub(state.idle.len()),
            max_open: self.shared.settings.max_open,
            max_idle: self.shared.settings.max_idle,
        }
    }

    /// Wait (up to the acquire timeout) for a connection.
    pub async fn acquire(&self) -> Result<PooledConnection<C>> {
        self.acquire_inner(None).await
    }

    /// Like [`ConnectionPool::acquire`], but `cancel` also ends the wait.
    pub async fn acquire_with(&self, cancel: &CancellationToken) -> Result<PooledConnection<C>> {
        self.acquire_inner(Some(cancel)).await
    }

    /// Take a connection only if a slot is free right now.
    pub async fn try_acquire(&self) -> Result<PooledConnection<C>> {
        let permit = match Arc::clone(&self.shared.slots).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                return Err(ConnectionError::PoolExhausted {
                    max_open: self.shared.settings.max_open,
                }
                .into())
            }
            Err(TryAcquireError::Closed) => return Err(ConnectionError::Closed.into()),
        };
        self.checkout(permit).await
    }

    async fn acquire_inner(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<PooledConnection<C>> {
        let started = tokio::time::Instant::now();
        let timeout = self.shared.settings.acquire_timeout;
        // the deadline and the token cover the dial as well as the slot wait
        let attempt = tokio::time::timeout(timeout, self.wait_and_checkout());

        let outcome = match cancel {
            Some(token) => tokio::select! {
                outcome = attempt => Some(outcome),
                _ = token.cancelled() => None,
            },
            None => Some(attempt.await),
        };

        let cancelled = outcome.is_none();
        match outcome {
            Some(Ok(result)) => result,
            Some(Err(_)) | None => {
                let waited = started.elapsed();
                metrics::counter!(
                    "unidb_acquire_timeouts_total",
                    "backend" => self.shared.connector.kind().as_str()
                )
                .increment(1);
                warn!(
                    backend = %self.shared.connector.kind(),
                    waited_ms = waited.as_millis() as u64,
                    cancelled,
                    "Gave up waiting for a pooled connection"
                );
                Err(ConnectionError::Timeout { waited }.into())
            }
        }
    }

    async fn wait_and_checkout(&self) -> Result<PooledConnection<C>> {
        let permit = Arc::clone(&self.shared.slots)
            .acquire_owned()
            .await
            .map_err(|_| Error::from(ConnectionError::Closed))?;
        self.checkout(permit).await
    }

    async fn checkout(&self, permit: OwnedSemaphorePermit) -> Result<PooledConnection<C>> {
        let shared = &self.shared;
        let kind = shared.connector.kind();

        let (reused, expired) = {
            let mut state = shared.state.lock();
            if state.closed {
                return Err(ConnectionError::Closed.into());
            }

            let mut expired = Vec::new();
            let mut reused = None;
            while let Some(idle) = state.idle.pop_back() {
                if shared.is_expired(idle.created_at) {
                    state.open = state.open.saturating_sub(1);
                    expired.push(idle.conn);
                } else {
                    reused = Some(idle);
                    break;
                }
            }
            if reused.is_none() {
                state.open += 1;
            }
            (reused, expired)
        };
        let reservation = reused.is_none().then(|| Reservation::new(shared));

        for conn in expired {
            debug!(backend = %kind, "Retiring expired connection");
            if let Err(e) = shared.connector.disconnect(conn).await {
                warn!(backend = %kind, error = %e, "Failed to close expired connection");
            }
            connection_closed(kind);
        }

        let (conn, created_at) = match reused {
            Some(idle) => (idle.conn, idle.created_at),
            None => {
                let conn = shared
                    .connector
                    .connect()
                    .await
                    .map_err(|e| dial_failed(kind, e))?;
                if let Some(reservation) = reservation {
                    reservation.keep();
                }
                connection_opened(kind);
                (conn, Instant::now())
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            created_at,
            shared: Arc::clone(shared),
            _permit: permit,
        })
    }

    /// Close the pool. Idle connections are disconnected now, checked-out
    /// ones when they are released. Calling it again does nothing.
    pub async fn close(&self) -> Result<()> {
        let drained: Vec<_> = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.open = state.open.saturating_sub(drained.len());
            drained
        };
        self.shared.slots.close();

        let kind = self.shared.connector.kind();
        let mut first_error = None;
        for idle in drained {
            if let Err(e) = self.shared.connector.disconnect(idle.conn).await {
                warn!(backend = %kind, error = %e, "Failed to close pooled connection");
                first_error.get_or_insert(e);
            }
            connection_closed(kind);
        }

        info!(backend = %kind, target = %self.shared.connector.describe(), "Connection pool closed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// A checked-out connection; returns to its pool on drop.
pub struct PooledConnection<C: Connector> {
    conn: Option<C::Connection>,
    created_at: Instant,
    shared: Arc<Shared<C>>,
    _permit: OwnedSemaphorePermit,
}

impl<C: Connector> PooledConnection<C> {
    /// Drop a connection known to be broken instead of returning it.
    pub fn discard(mut self) {
        if self.conn.take().is_some() {
            self.shared.forget();
            connection_closed(self.shared.connector.kind());
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl<C: Connector> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("backend", &self.shared.connector.kind())
            .field("age", &self.age())
            .finish()
    }
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_ref()
            .unwrap_or_else(|| unreachable!("connection taken before drop"))
    }
}

impl<C: Connector> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_mut()
            .unwrap_or_else(|| unreachable!("connection taken before drop"))
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.release(conn, self.created_at);
        }
    }
}

fn dial_failed(kind: BackendKind, error: Error) -> Error {
    match error {
        Error::Connection(_) => error,
        other => ConnectionError::DialFailed {
            backend: kind.to_string(),
            message: other.to_string(),
        }
        .into(),
    }
}

fn connection_opened(kind: BackendKind) {
    metrics::counter!("unidb_connections_opened_total", "backend" => kind.as_str()).increment(1);
}

fn connection_closed(kind: BackendKind) {
    metrics::counter!("unidb_connections_closed_total", "backend" => kind.as_str()).increment(1);
}
