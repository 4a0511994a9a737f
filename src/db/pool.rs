//! Connection handle pool.
//!
//! One [`ConnectionManager`] serves one [`ConnectionConfig`]. It maps
//! [`ConnectionKey`]s to long-lived native connections, each wrapped in a
//! [`ResourceLock`]:
//!
//! - **Single-flight opens**: every key owns an `OnceCell`, so concurrent
//!   acquires of a fresh key open exactly one connection.
//! - **Bounded**: a semaphore caps open handles at `max_connections`; the
//!   permit travels with the handle and is returned when it closes.
//! - **Idle reaper**: a background task holding only a `Weak` reference
//!   probes idle handles, evicts dead ones and closes forgotten transaction
//!   handles.
//!
//! Handles know their key, never the manager.

use crate::config::ConnectionConfig;
use crate::db::classify::classify_connection_error;
use crate::db::dialect::{Dialect, dialect_for};
use crate::db::lock::ResourceLock;
use crate::error::{DbError, DbResult, NativeError};
use crate::models::ConnectionKey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{OnceCell, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Upper bound for one liveness probe.
const PING_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ConnectionManager {
    config: Arc<ConnectionConfig>,
    dialect: Arc<dyn Dialect>,
    /// Handles by key. An uninitialized cell is an open in progress.
    pool: RwLock<HashMap<ConnectionKey, Arc<OnceCell<ResourceLock>>>>,
    slots: Arc<Semaphore>,
    reaper: parking_lot::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ConnectionManager {
    /// Validate `config` and build a manager for it. No connection is opened
    /// until the first [`acquire`](Self::acquire).
    pub fn new(config: ConnectionConfig) -> DbResult<Arc<Self>> {
        config.validate()?;
        let dialect = dialect_for(config.dialect);
        let max_connections = config.pool.max_connections_or_default() as usize;
        debug!(
            dialect = %config.dialect,
            target = %config.masked(),
            max_connections,
            "Connection manager created"
        );
        Ok(Arc::new(Self {
            config: Arc::new(config),
            dialect,
            pool: RwLock::new(HashMap::new()),
            slots: Arc::new(Semaphore::new(max_connections)),
            reaper: parking_lot::Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn dialect(&self) -> &Arc<dyn Dialect> {
        &self.dialect
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Every key maps to the one shared handle of an in-memory database,
    /// since each native connection would otherwise see its own empty
    /// database.
    fn pool_key(&self, key: ConnectionKey) -> ConnectionKey {
        if self.config.is_in_memory() {
            ConnectionKey::InMemory
        } else {
            key
        }
    }

    async fn cell_for(&self, key: &ConnectionKey) -> Arc<OnceCell<ResourceLock>> {
        {
            let pool = self.pool.read().await;
            if let Some(cell) = pool.get(key) {
                return Arc::clone(cell);
            }
        }
        let mut pool = self.pool.write().await;
        // Double-check after acquiring write lock
        Arc::clone(
            pool.entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new())),
        )
    }

    /// Get the handle for `key`, opening a native connection if there is none.
    ///
    /// A handle found dead is evicted. Long-lived keys then reopen once;
    /// transaction keys fail, since their transaction died with the socket.
    pub async fn acquire(&self, key: ConnectionKey) -> DbResult<ResourceLock> {
        let key = self.pool_key(key);

        for _ in 0..2 {
            if self.is_closed() {
                return Err(DbError::connection("Connection manager is closed"));
            }

            let cell = self.cell_for(&key).await;
            let lock = match cell.get_or_try_init(|| self.open(key.clone())).await {
                Ok(lock) => lock.clone(),
                Err(e) => {
                    self.discard_empty_cell(&key, &cell).await;
                    return Err(e);
                }
            };

            if lock.unwrap().is_open() {
                return Ok(lock);
            }

            warn!(key = %key, handle = %lock.unwrap().id(), "Acquired handle is dead, evicting");
            self.evict(&lock).await;
            if !key.is_long_lived() {
                return Err(DbError::connection(format!(
                    "Connection for transaction {} was lost",
                    key
                )));
            }
        }

        Err(DbError::connection(format!(
            "Could not open a live connection for {}",
            key
        )))
    }

    /// Drop a cell whose open failed so the next acquire starts clean.
    async fn discard_empty_cell(&self, key: &ConnectionKey, cell: &Arc<OnceCell<ResourceLock>>) {
        let mut pool = self.pool.write().await;
        let stale = pool
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, cell) && current.get().is_none());
        if stale {
            pool.remove(key);
        }
    }

    async fn open(&self, key: ConnectionKey) -> DbResult<ResourceLock> {
        if let Some(domain) = &self.config.dialect_options.domain {
            return Err(DbError::invalid_connection(format!(
                "Integrated authentication (domain '{}') is not supported by the {} driver",
                domain,
                self.dialect.kind().display_name()
            )));
        }

        let acquire_timeout = self.config.pool.acquire_timeout_or_default();
        let permit = match tokio::time::timeout(
            acquire_timeout,
            Arc::clone(&self.slots).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(DbError::connection("Connection manager is closed")),
            Err(_) => {
                warn!(
                    key = %key,
                    max_connections = self.config.pool.max_connections_or_default(),
                    "Timed out waiting for a free connection slot"
                );
                return Err(DbError::timeout("acquire connection", acquire_timeout));
            }
        };

        debug!(key = %key, target = %self.config.masked(), "Opening connection");
        let native = match tokio::time::timeout(acquire_timeout, self.dialect.connect(&self.config))
            .await
        {
            Ok(Ok(native)) => native,
            Ok(Err(e)) => {
                let err = classify_connection_error(NativeError::from_sqlx(&e));
                warn!(key = %key, error = %err, kind = %err.kind(), "Connection failed");
                return Err(err);
            }
            Err(_) => {
                return Err(classify_connection_error(
                    NativeError::new("Connection attempt timed out").with_code("ETIMEDOUT"),
                ));
            }
        };

        let lock = ResourceLock::new(key, self.dialect.kind(), native, Some(permit));
        info!(
            key = %lock.key(),
            handle = %lock.unwrap().id(),
            dialect = %self.dialect.kind(),
            "Connection opened"
        );
        Ok(lock)
    }

    /// Close a handle and forget it.
    ///
    /// Idempotent. The long-lived default and in-memory handles are kept
    /// unless `force` is set.
    pub async fn release(&self, lock: &ResourceLock, force: bool) {
        let info = lock.unwrap();
        if info.key().is_long_lived() && !force {
            debug!(key = %info.key(), "Keeping long-lived handle");
            return;
        }
        if !info.begin_release() {
            debug!(key = %info.key(), handle = %info.id(), "Handle already released");
            return;
        }

        self.remove_entry(lock).await;

        let native = {
            let mut guard = lock.lock().await;
            if guard.transactions().is_open() {
                warn!(
                    key = %info.key(),
                    depth = guard.transactions().depth(),
                    "Closing handle with an open transaction; engine rolls it back"
                );
                guard.transactions_mut().abandon();
            }
            guard.take_native()
        };

        if let Some(native) = native {
            match self.dialect.close(native).await {
                Ok(()) => info!(key = %info.key(), handle = %info.id(), "Connection closed"),
                Err(e) => warn!(key = %info.key(), error = %e, "Error closing connection"),
            }
        }
    }

    /// True while the handle reports itself open.
    pub fn validate(&self, lock: &ResourceLock) -> bool {
        let info = lock.unwrap();
        info.is_open() && !info.is_released()
    }

    /// Remove a handle from the pool and close it.
    ///
    /// Evicting a handle that is no longer pooled is not an error; returns
    /// whether this call removed it.
    pub async fn evict(&self, lock: &ResourceLock) -> bool {
        lock.unwrap().mark_dead();
        let removed = self.remove_entry(lock).await;
        if !removed {
            debug!(key = %lock.key(), handle = %lock.unwrap().id(), "Handle already evicted");
        }
        self.release(lock, true).await;
        removed
    }

    /// Remove `lock`'s pool entry if it still refers to this very handle.
    async fn remove_entry(&self, lock: &ResourceLock) -> bool {
        let mut pool = self.pool.write().await;
        let current = pool
            .get(lock.key())
            .and_then(|cell| cell.get())
            .is_some_and(|pooled| pooled.same_handle(lock));
        if current {
            pool.remove(lock.key());
        }
        current
    }

    /// Number of open handles.
    pub async fn len(&self) -> usize {
        let pool = self.pool.read().await;
        pool.values().filter(|cell| cell.get().is_some()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Slots left before `acquire` of a new key waits.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Start the idle reaper on the current runtime.
    ///
    /// Without a runtime the reaper is skipped; handles are then only
    /// checked when acquired.
    pub fn start_reaper(self: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No async runtime, idle reaper disabled");
            return;
        };
        let weak = Arc::downgrade(self);
        let period = self.config.pool.reap_interval_or_default();
        let handle = runtime.spawn(Self::reap_task(weak, period));
        if let Some(previous) = self.reaper.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Exits once the manager is dropped.
    async fn reap_task(weak: Weak<Self>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;

        loop {
            interval.tick().await;
            let Some(manager) = weak.upgrade() else {
                debug!("Connection manager dropped, reaper exiting");
                return;
            };
            if manager.is_closed() {
                return;
            }
            manager.reap_once().await;
            // Drop strong reference before sleeping to allow manager deallocation
            drop(manager);
        }
    }

    /// One reaper pass; returns the number of handles closed.
    ///
    /// Handles in use are skipped. Idle ones are pinged: dead handles are
    /// evicted when `evict_on_disconnect` is set, and transaction handles
    /// idle past `idle_timeout` with no open transaction are closed.
    pub async fn reap_once(&self) -> usize {
        let candidates: Vec<ResourceLock> = {
            let pool = self.pool.read().await;
            pool.values().filter_map(|cell| cell.get().cloned()).collect()
        };

        let idle_timeout = self.config.pool.idle_timeout_or_default();
        let mut dead = Vec::new();
        let mut idle = Vec::new();

        for lock in candidates {
            let Some(mut guard) = lock.try_lock_idle() else {
                continue;
            };
            let alive = guard.info().is_open()
                && match guard.native_mut() {
                    Ok(native) => matches!(
                        tokio::time::timeout(PING_TIMEOUT, self.dialect.ping(native)).await,
                        Ok(Ok(()))
                    ),
                    Err(_) => false,
                };

            if !alive {
                guard.info().mark_dead();
                dead.push(lock.clone());
            } else if !lock.key().is_long_lived()
                && !guard.transactions().is_open()
                && guard.info().last_used().elapsed() > idle_timeout
            {
                idle.push(lock.clone());
            }
        }

        let mut closed = 0;
        if self.config.pool.evict_on_disconnect_or_default() {
            for lock in dead {
                warn!(key = %lock.key(), handle = %lock.unwrap().id(), "Evicting disconnected handle");
                self.evict(&lock).await;
                closed += 1;
            }
        } else if !dead.is_empty() {
            debug!(count = dead.len(), "Dead handles left for the next acquire");
        }
        for lock in idle {
            info!(key = %lock.key(), "Closing idle connection");
            self.release(&lock, true).await;
            closed += 1;
        }
        closed
    }

    /// Stop the reaper and close every handle. Later acquires fail.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(reaper) = self.reaper.lock().take() {
            reaper.abort();
        }

        let handles: Vec<ResourceLock> = {
            let mut pool = self.pool.write().await;
            pool.drain()
                .filter_map(|(_, cell)| cell.get().cloned())
                .collect()
        };
        let count = handles.len();
        for lock in handles {
            self.release(&lock, true).await;
        }
        self.slots.close();
        info!(closed = count, "Connection manager closed");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.get_mut().take() {
            reaper.abort();
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("target", &self.config.masked())
            .field("dialect", &self.dialect.kind())
            .field("available_slots", &self.slots.available_permits())
            .field("closed", &self.is_closed())
            .finish()
    }
}
