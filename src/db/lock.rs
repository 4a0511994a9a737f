//! Exclusive access to one pooled connection handle.
//!
//! A [`ResourceLock`] pairs the handle's lock-free metadata ([`HandleInfo`],
//! readable through [`ResourceLock::unwrap`]) with the handle itself behind
//! an async mutex. Every statement and every transaction transition runs while
//! holding a [`HandleGuard`], so critical sections on one handle never
//! interleave.

use crate::db::dialect::NativeConnection;
use crate::db::transaction::TransactionStack;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionKey, DialectKind};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit};
use tracing::debug;
use uuid::Uuid;

/// Handle metadata readable without taking the lock.
#[derive(Debug)]
pub struct HandleInfo {
    id: Uuid,
    key: ConnectionKey,
    dialect: DialectKind,
    created_at: Instant,
    last_used: parking_lot::Mutex<Instant>,
    open: AtomicBool,
    released: AtomicBool,
    locked: AtomicBool,
}

impl HandleInfo {
    fn new(key: ConnectionKey, dialect: DialectKind) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            key,
            dialect,
            created_at: now,
            last_used: parking_lot::Mutex::new(now),
            open: AtomicBool::new(true),
            released: AtomicBool::new(false),
            locked: AtomicBool::new(false),
        }
    }

    /// Identity of this handle; a key may be served by several handles over time.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn dialect(&self) -> DialectKind {
        self.dialect
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Flag the handle unusable (socket failure, timeout, eviction).
    pub fn mark_dead(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            debug!(key = %self.key, handle = %self.id, "Handle marked dead");
        }
    }

    /// Claim the one-time right to tear the handle down.
    ///
    /// Returns false when another caller already claimed it.
    pub(crate) fn begin_release(&self) -> bool {
        self.open.store(false, Ordering::Release);
        !self.released.swap(true, Ordering::AcqRel)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }
}

/// The pooled resource: native connection, transaction stack and pool slot.
pub struct ConnectionHandle {
    native: Option<NativeConnection>,
    transactions: TransactionStack,
    permit: Option<OwnedSemaphorePermit>,
}

impl ConnectionHandle {
    pub fn native_mut(&mut self) -> DbResult<&mut NativeConnection> {
        self.native
            .as_mut()
            .ok_or_else(|| DbError::connection("Connection handle is closed"))
    }

    pub fn transactions(&self) -> &TransactionStack {
        &self.transactions
    }

    pub fn transactions_mut(&mut self) -> &mut TransactionStack {
        &mut self.transactions
    }

    /// Split borrow used by the transaction state machine.
    pub(crate) fn parts_mut(
        &mut self,
    ) -> DbResult<(&mut NativeConnection, &mut TransactionStack)> {
        let native = self
            .native
            .as_mut()
            .ok_or_else(|| DbError::connection("Connection handle is closed"))?;
        Ok((native, &mut self.transactions))
    }

    /// Take the native connection out and give the pool slot back.
    pub(crate) fn take_native(&mut self) -> Option<NativeConnection> {
        self.permit.take();
        self.native.take()
    }
}

/// Scoped exclusive access to a [`ConnectionHandle`]; unlocks on drop.
pub struct HandleGuard {
    guard: OwnedMutexGuard<ConnectionHandle>,
    info: Arc<HandleInfo>,
    /// Whether dropping the guard counts as use of the handle.
    touch: bool,
}

impl HandleGuard {
    pub fn info(&self) -> &HandleInfo {
        &self.info
    }
}

impl Deref for HandleGuard {
    type Target = ConnectionHandle;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for HandleGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        if self.touch {
            self.info.touch();
        }
        self.info.locked.store(false, Ordering::Release);
    }
}

/// Lockable wrapper around one pooled handle. Cheap to clone.
#[derive(Clone)]
pub struct ResourceLock {
    info: Arc<HandleInfo>,
    handle: Arc<Mutex<ConnectionHandle>>,
}

impl ResourceLock {
    pub(crate) fn new(
        key: ConnectionKey,
        dialect: DialectKind,
        native: NativeConnection,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            info: Arc::new(HandleInfo::new(key, dialect)),
            handle: Arc::new(Mutex::new(ConnectionHandle {
                native: Some(native),
                transactions: TransactionStack::default(),
                permit,
            })),
        }
    }

    /// Wait until no other guard is outstanding, then take the handle.
    pub async fn lock(&self) -> HandleGuard {
        if self.info.is_locked() {
            debug!(key = %self.info.key, "Waiting for connection lock");
        }
        let guard = Arc::clone(&self.handle).lock_owned().await;
        self.info.locked.store(true, Ordering::Release);
        HandleGuard {
            guard,
            info: Arc::clone(&self.info),
            touch: true,
        }
    }

    /// Take the handle only if nobody holds it.
    pub fn try_lock(&self) -> Option<HandleGuard> {
        self.try_lock_inner(true)
    }

    /// Like [`try_lock`](Self::try_lock), but leaves the idle clock alone.
    pub(crate) fn try_lock_idle(&self) -> Option<HandleGuard> {
        self.try_lock_inner(false)
    }

    fn try_lock_inner(&self, touch: bool) -> Option<HandleGuard> {
        let guard = Arc::clone(&self.handle).try_lock_owned().ok()?;
        self.info.locked.store(true, Ordering::Release);
        Some(HandleGuard {
            guard,
            info: Arc::clone(&self.info),
            touch,
        })
    }

    /// Handle metadata, without locking.
    pub fn unwrap(&self) -> &HandleInfo {
        &self.info
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.info.key
    }

    /// True when both locks wrap the same handle.
    pub fn same_handle(&self, other: &ResourceLock) -> bool {
        Arc::ptr_eq(&self.info, &other.info)
    }
}

impl std::fmt::Debug for ResourceLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLock")
            .field("id", &self.info.id)
            .field("key", &self.info.key)
            .field("open", &self.info.is_open())
            .field("locked", &self.info.is_locked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Connection;
    use std::time::Duration;

    async fn memory_lock() -> ResourceLock {
        let conn = sqlx::SqliteConnection::connect("sqlite::memory:").await.unwrap();
        ResourceLock::new(
            ConnectionKey::Default,
            DialectKind::Sqlite,
            NativeConnection::Sqlite(conn),
            None,
        )
    }

    #[tokio::test]
    async fn test_second_guard_waits_for_first() {
        let lock = memory_lock().await;
        let guard = lock.lock().await;
        assert!(lock.unwrap().is_locked());
        assert!(lock.try_lock().is_none());

        let contender = lock.clone();
        let waiter = tokio::spawn(async move {
            let _guard = contender.lock().await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert!(!lock.unwrap().is_locked());
    }

    #[tokio::test]
    async fn test_guard_released_when_task_cancelled() {
        let lock = memory_lock().await;
        let holder = lock.clone();
        let task = tokio::spawn(async move {
            let _guard = holder.lock().await;
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        task.abort();
        let _ = task.await;

        assert!(lock.try_lock().is_some());
    }

    #[tokio::test]
    async fn test_release_claim_is_one_shot() {
        let lock = memory_lock().await;
        assert!(lock.unwrap().is_open());
        assert!(lock.unwrap().begin_release());
        assert!(!lock.unwrap().begin_release());
        assert!(!lock.unwrap().is_open());
    }

    #[tokio::test]
    async fn test_closed_handle_refuses_native_access() {
        let lock = memory_lock().await;
        let mut guard = lock.lock().await;
        assert!(guard.native_mut().is_ok());
        let native = guard.take_native();
        assert!(native.is_some());
        assert!(guard.native_mut().is_err());
    }

    #[tokio::test]
    async fn test_idle_probe_keeps_last_used() {
        let lock = memory_lock().await;
        let before = lock.unwrap().last_used();
        tokio::time::sleep(Duration::from_millis(5)).await;
        drop(lock.try_lock_idle());
        assert_eq!(lock.unwrap().last_used(), before);
        drop(lock.try_lock());
        assert!(lock.unwrap().last_used() > before);
    }

    #[tokio::test]
    async fn test_clones_share_handle() {
        let lock = memory_lock().await;
        let other = memory_lock().await;
        assert!(lock.same_handle(&lock.clone()));
        assert!(!lock.same_handle(&other));
    }
}
