//! Transaction and savepoint state machine.
//!
//! A handle's open scopes live in its [`TransactionStack`]: the bottom entry
//! is the root transaction, every entry above it a savepoint. The stack is
//! part of the [`ConnectionHandle`](crate::db::lock::ConnectionHandle), so
//! every transition runs under the same [`HandleGuard`] as ordinary
//! statements.
//!
//! ```text
//! Idle --begin--> Open(1) --savepoint--> Open(2) ...
//!                   |  ^--commit/rollback (nested)--'
//!                   +--commit--> Committed
//!                   '--rollback--> RolledBack
//! ```
//!
//! The stack is only changed after the engine accepted the statement, with
//! one exception: a failed root `ROLLBACK` still closes the scope, since the
//! connection can no longer be trusted to hold the transaction.

use crate::db::dialect::Dialect;
use crate::db::lock::HandleGuard;
use crate::error::{DbError, DbResult, NativeError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Maximum savepoint name length accepted by all supported engines.
pub const MAX_SAVEPOINT_NAME_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase().replace(['_', '-'], " ");
        match normalized.as_str() {
            "READ UNCOMMITTED" => Ok(Self::ReadUncommitted),
            "READ COMMITTED" => Ok(Self::ReadCommitted),
            "REPEATABLE READ" => Ok(Self::RepeatableRead),
            "SERIALIZABLE" => Ok(Self::Serializable),
            _ => Err(DbError::invalid_input(format!(
                "Unknown isolation level: {}",
                s
            ))),
        }
    }
}

/// SQLite lock acquisition mode of `BEGIN`; other engines ignore it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    #[default]
    Deferred,
    Immediate,
    Exclusive,
}

impl TransactionType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Deferred => "DEFERRED",
            Self::Immediate => "IMMEDIATE",
            Self::Exclusive => "EXCLUSIVE",
        }
    }
}

/// Options for opening a scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOptions {
    /// Scope name; generated when absent.
    pub name: Option<String>,
    /// Only honoured for root transactions.
    pub isolation_level: Option<IsolationLevel>,
    pub transaction_type: Option<TransactionType>,
}

impl TransactionOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    pub fn with_transaction_type(mut self, transaction_type: TransactionType) -> Self {
        self.transaction_type = Some(transaction_type);
        self
    }
}

/// One open transaction or savepoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionScope {
    pub name: String,
    pub isolation_level: Option<IsolationLevel>,
    /// 1 for the root transaction.
    pub depth: usize,
    pub started_at: Instant,
}

impl TransactionScope {
    pub fn is_root(&self) -> bool {
        self.depth == 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Open { depth: usize },
    Committed,
    RolledBack,
}

/// Open scopes of one handle, root first.
#[derive(Debug, Default)]
pub struct TransactionStack {
    scopes: Vec<TransactionScope>,
    outcome: Option<TransactionState>,
}

impl TransactionStack {
    pub fn state(&self) -> TransactionState {
        match self.scopes.len() {
            0 => self.outcome.unwrap_or(TransactionState::Idle),
            depth => TransactionState::Open { depth },
        }
    }

    pub fn is_open(&self) -> bool {
        !self.scopes.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// The active scope.
    pub fn current(&self) -> Option<&TransactionScope> {
        self.scopes.last()
    }

    pub fn root(&self) -> Option<&TransactionScope> {
        self.scopes.first()
    }

    pub fn scopes(&self) -> &[TransactionScope] {
        &self.scopes
    }

    /// Engines fold unquoted savepoint names, so lookups ignore ASCII case.
    fn position(&self, name: &str) -> Option<usize> {
        self.scopes
            .iter()
            .rposition(|s| s.name.eq_ignore_ascii_case(name))
    }

    /// Scope the next `begin` would open.
    fn plan_scope(
        &self,
        name: Option<&str>,
        isolation_level: Option<IsolationLevel>,
    ) -> DbResult<TransactionScope> {
        let depth = self.scopes.len() + 1;
        let name = match name {
            Some(name) => {
                validate_savepoint_name(name)?;
                if self.position(name).is_some() {
                    return Err(DbError::transaction(
                        "A scope with this name is already open",
                        name,
                    ));
                }
                name.to_string()
            }
            None if depth == 1 => format!("tx_{}", Uuid::new_v4().simple()),
            None => {
                // A caller may already have named a scope `sp_<n>`.
                let mut n = depth - 1;
                loop {
                    let candidate = format!("sp_{}", n);
                    if self.position(&candidate).is_none() {
                        break candidate;
                    }
                    n += 1;
                }
            }
        };
        Ok(TransactionScope {
            name,
            isolation_level: if depth == 1 { isolation_level } else { None },
            depth,
            started_at: Instant::now(),
        })
    }

    /// The innermost scope, provided `name` (when given) designates it.
    fn innermost(&self, name: Option<&str>, operation: &str) -> DbResult<&TransactionScope> {
        let Some(current) = self.scopes.last() else {
            return Err(DbError::transaction(
                format!("Cannot {}: no transaction is open", operation),
                name.unwrap_or_default(),
            ));
        };
        match name {
            Some(name) if !name.eq_ignore_ascii_case(&current.name) => {
                let message = if self.position(name).is_some() {
                    format!(
                        "Cannot {} '{}': it is not the innermost scope ('{}' is still open)",
                        operation, name, current.name
                    )
                } else {
                    format!("Cannot {}: no open scope is named '{}'", operation, name)
                };
                Err(DbError::transaction(message, name))
            }
            _ => Ok(current),
        }
    }

    /// Index of the savepoint `rollback_to` rewinds to.
    fn rewind_target(&self, name: &str) -> DbResult<usize> {
        match self.position(name) {
            None => Err(DbError::transaction(
                format!("Cannot roll back to '{}': no open savepoint has that name", name),
                name,
            )),
            Some(0) => Err(DbError::transaction(
                "Cannot roll back to the root transaction; roll it back instead",
                name,
            )),
            Some(index) => Ok(index),
        }
    }

    fn push(&mut self, scope: TransactionScope) {
        if scope.is_root() {
            self.outcome = None;
        }
        self.scopes.push(scope);
    }

    fn pop(&mut self, committed: bool) -> Option<TransactionScope> {
        let scope = self.scopes.pop()?;
        if scope.is_root() {
            self.outcome = Some(if committed {
                TransactionState::Committed
            } else {
                TransactionState::RolledBack
            });
        }
        Some(scope)
    }

    /// Forget every open scope, e.g. after the connection died.
    pub(crate) fn abandon(&mut self) {
        if !self.scopes.is_empty() {
            self.scopes.clear();
            self.outcome = Some(TransactionState::RolledBack);
        }
    }
}

/// Check a savepoint name against the identifier rules all engines accept.
pub fn validate_savepoint_name(name: &str) -> DbResult<()> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(DbError::invalid_input("Savepoint name cannot be empty"));
    };
    if name.len() > MAX_SAVEPOINT_NAME_LEN {
        return Err(DbError::invalid_input(format!(
            "Savepoint name exceeds maximum length of {} characters",
            MAX_SAVEPOINT_NAME_LEN
        )));
    }
    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(DbError::invalid_input(
            "Savepoint name must start with a letter or underscore",
        ));
    }
    if let Some(c) = chars.find(|c| !c.is_ascii_alphanumeric() && *c != '_' && *c != '$') {
        return Err(DbError::invalid_input(format!(
            "Savepoint name contains invalid character: '{}'",
            c
        )));
    }
    Ok(())
}

/// Drives [`TransactionStack`] transitions through a dialect's SQL vocabulary.
#[derive(Debug, Clone)]
pub struct TransactionStateMachine {
    dialect: Arc<dyn Dialect>,
}

impl TransactionStateMachine {
    pub fn new(dialect: Arc<dyn Dialect>) -> Self {
        Self { dialect }
    }

    /// Open a root transaction when idle, a savepoint otherwise.
    pub async fn begin(
        &self,
        guard: &mut HandleGuard,
        options: &TransactionOptions,
    ) -> DbResult<TransactionScope> {
        let (native, stack) = guard.parts_mut()?;
        let scope = stack.plan_scope(options.name.as_deref(), options.isolation_level)?;

        let statements = if scope.is_root() {
            self.dialect
                .begin_statements(options.isolation_level, options.transaction_type)?
        } else {
            if options.isolation_level.is_some() {
                debug!(name = %scope.name, "Isolation level ignored for savepoint");
            }
            vec![self.dialect.savepoint_statement(&scope.name)]
        };
        for sql in &statements {
            self.exec(native, sql).await?;
        }

        if scope.is_root() {
            info!(
                name = %scope.name,
                isolation = ?scope.isolation_level,
                "Transaction started"
            );
        } else {
            debug!(name = %scope.name, depth = scope.depth, "Savepoint created");
        }
        stack.push(scope.clone());
        Ok(scope)
    }

    /// Open a root transaction; fails while the handle already has one open,
    /// which matters on handles shared between callers (in-memory databases).
    pub async fn begin_root(
        &self,
        guard: &mut HandleGuard,
        options: &TransactionOptions,
    ) -> DbResult<TransactionScope> {
        if let Some(root) = guard.transactions().root() {
            return Err(DbError::transaction(
                format!(
                    "Cannot begin a transaction: '{}' is already open on this connection",
                    root.name
                ),
                options.name.as_deref().unwrap_or_default(),
            ));
        }
        self.begin(guard, options).await
    }

    /// Create a savepoint inside the open transaction.
    pub async fn savepoint(
        &self,
        guard: &mut HandleGuard,
        name: Option<&str>,
    ) -> DbResult<TransactionScope> {
        if !guard.transactions().is_open() {
            return Err(DbError::transaction(
                "Cannot create a savepoint: no transaction is open",
                name.unwrap_or_default(),
            ));
        }
        let options = TransactionOptions {
            name: name.map(String::from),
            ..TransactionOptions::default()
        };
        self.begin(guard, &options).await
    }

    /// Commit the innermost scope: `COMMIT` for the root, `RELEASE` otherwise.
    pub async fn commit(
        &self,
        guard: &mut HandleGuard,
        name: Option<&str>,
    ) -> DbResult<TransactionState> {
        let (native, stack) = guard.parts_mut()?;
        let scope = stack.innermost(name, "commit")?;
        let sql = if scope.is_root() {
            self.dialect.commit_statement()
        } else {
            self.dialect.release_savepoint_statement(&scope.name)
        };
        let (scope_name, root) = (scope.name.clone(), scope.is_root());

        self.exec(native, &sql).await?;
        stack.pop(true);
        if root {
            info!(name = %scope_name, "Transaction committed");
        } else {
            debug!(name = %scope_name, "Savepoint released");
        }
        Ok(stack.state())
    }

    /// Roll back the innermost scope.
    ///
    /// A nested scope is rolled back to its savepoint and then released, so
    /// the enclosing scope carries on as if it had never been opened.
    pub async fn rollback(
        &self,
        guard: &mut HandleGuard,
        name: Option<&str>,
    ) -> DbResult<TransactionState> {
        let (native, stack) = guard.parts_mut()?;
        let scope = stack.innermost(name, "roll back")?;
        let (scope_name, root) = (scope.name.clone(), scope.is_root());

        if root {
            let result = self.exec(native, &self.dialect.rollback_statement()).await;
            stack.pop(false);
            match &result {
                Ok(_) => info!(name = %scope_name, "Transaction rolled back"),
                Err(e) => warn!(name = %scope_name, error = %e, "Rollback failed; scope closed"),
            }
            result?;
        } else {
            self.exec(native, &self.dialect.rollback_to_savepoint_statement(&scope_name))
                .await?;
            self.exec(native, &self.dialect.release_savepoint_statement(&scope_name))
                .await?;
            stack.pop(false);
            debug!(name = %scope_name, "Savepoint rolled back");
        }
        Ok(stack.state())
    }

    /// Undo everything after savepoint `name`; the savepoint itself stays open
    /// and every scope above it is discarded.
    pub async fn rollback_to(
        &self,
        guard: &mut HandleGuard,
        name: &str,
    ) -> DbResult<TransactionState> {
        let (native, stack) = guard.parts_mut()?;
        let index = stack.rewind_target(name)?;
        let target = stack.scopes[index].name.clone();

        self.exec(native, &self.dialect.rollback_to_savepoint_statement(&target))
            .await?;
        let discarded = stack.depth() - index - 1;
        stack.scopes.truncate(index + 1);
        debug!(name = %target, discarded, "Rolled back to savepoint");
        Ok(stack.state())
    }

    async fn exec(
        &self,
        native: &mut crate::db::dialect::NativeConnection,
        sql: &str,
    ) -> DbResult<()> {
        debug!(sql = %sql, "Transaction control");
        self.dialect
            .execute(native, sql)
            .await
            .map(|_| ())
            .map_err(|e| DbError::database(NativeError::from_sqlx(&e), Some(sql.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::dialect::{NativeConnection, SqliteDialect};
    use crate::db::lock::ResourceLock;
    use crate::error::ErrorKind;
    use crate::models::{ConnectionKey, DialectKind};
    use sqlx::Connection;

    async fn memory_lock() -> ResourceLock {
        let conn = sqlx::SqliteConnection::connect("sqlite::memory:").await.unwrap();
        ResourceLock::new(
            ConnectionKey::Default,
            DialectKind::Sqlite,
            NativeConnection::Sqlite(conn),
            None,
        )
    }

    fn machine() -> TransactionStateMachine {
        TransactionStateMachine::new(Arc::new(SqliteDialect))
    }

    async fn count(guard: &mut HandleGuard) -> i64 {
        let NativeConnection::Sqlite(conn) = guard.native_mut().unwrap() else {
            unreachable!()
        };
        sqlx::query_scalar("SELECT COUNT(*) FROM t")
            .fetch_one(conn)
            .await
            .unwrap()
    }

    async fn exec(guard: &mut HandleGuard, sql: &str) {
        SqliteDialect
            .execute(guard.native_mut().unwrap(), sql)
            .await
            .unwrap();
    }

    #[test]
    fn test_validate_savepoint_name() {
        assert!(validate_savepoint_name("sp_1").is_ok());
        assert!(validate_savepoint_name("_a$b").is_ok());
        assert!(validate_savepoint_name("").is_err());
        assert!(validate_savepoint_name("1abc").is_err());
        assert!(validate_savepoint_name("a; DROP TABLE t").is_err());
        assert!(validate_savepoint_name(&"a".repeat(65)).is_err());
    }

    #[test]
    fn test_isolation_level_parse() {
        assert_eq!(
            "read_committed".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::ReadCommitted
        );
        assert_eq!(
            "SERIALIZABLE".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::Serializable
        );
        assert!("snapshot".parse::<IsolationLevel>().is_err());
    }

    #[test]
    fn test_stack_generates_names() {
        let mut stack = TransactionStack::default();
        let root = stack.plan_scope(None, Some(IsolationLevel::Serializable)).unwrap();
        assert!(root.name.starts_with("tx_"));
        assert_eq!(root.isolation_level, Some(IsolationLevel::Serializable));
        stack.push(root);

        let nested = stack.plan_scope(None, Some(IsolationLevel::Serializable)).unwrap();
        assert_eq!(nested.name, "sp_1");
        assert_eq!(nested.isolation_level, None);
        assert_eq!(nested.depth, 2);
    }

    #[test]
    fn test_stack_state_transitions() {
        let mut stack = TransactionStack::default();
        assert_eq!(stack.state(), TransactionState::Idle);
        stack.push(stack.plan_scope(Some("outer"), None).unwrap());
        stack.push(stack.plan_scope(Some("inner"), None).unwrap());
        assert_eq!(stack.state(), TransactionState::Open { depth: 2 });

        stack.pop(true);
        assert_eq!(stack.state(), TransactionState::Open { depth: 1 });
        stack.pop(true);
        assert_eq!(stack.state(), TransactionState::Committed);

        stack.push(stack.plan_scope(None, None).unwrap());
        stack.abandon();
        assert_eq!(stack.state(), TransactionState::RolledBack);
    }

    #[test]
    fn test_non_innermost_is_misuse() {
        let mut stack = TransactionStack::default();
        stack.push(stack.plan_scope(Some("outer"), None).unwrap());
        stack.push(stack.plan_scope(Some("inner"), None).unwrap());

        let err = stack.innermost(Some("outer"), "commit").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transaction);
        assert!(err.to_string().contains("not the innermost"));
        assert!(stack.innermost(Some("inner"), "commit").is_ok());
        assert!(stack.innermost(None, "commit").is_ok());
        assert!(stack.innermost(Some("ghost"), "commit").is_err());
    }

    #[test]
    fn test_duplicate_scope_name_rejected() {
        let mut stack = TransactionStack::default();
        stack.push(stack.plan_scope(Some("a"), None).unwrap());
        assert!(stack.plan_scope(Some("a"), None).is_err());
        assert!(stack.plan_scope(Some("A"), None).is_err());
    }

    #[test]
    fn test_generated_name_skips_user_named_scope() {
        let mut stack = TransactionStack::default();
        stack.push(stack.plan_scope(Some("root"), None).unwrap());
        stack.push(stack.plan_scope(Some("SP_2"), None).unwrap());

        let generated = stack.plan_scope(None, None).unwrap();
        assert_eq!(generated.name, "sp_3");
        stack.push(generated);
        assert_eq!(stack.position("sp_2"), Some(1));
        assert_eq!(stack.position("sp_3"), Some(2));
    }

    #[test]
    fn test_scope_lookup_ignores_case() {
        let mut stack = TransactionStack::default();
        stack.push(stack.plan_scope(Some("root"), None).unwrap());
        stack.push(stack.plan_scope(Some("Inner"), None).unwrap());

        assert_eq!(stack.innermost(Some("INNER"), "commit").unwrap().name, "Inner");
        assert_eq!(stack.rewind_target("inner").unwrap(), 1);
    }

    #[test]
    fn test_rewind_target_rules() {
        let mut stack = TransactionStack::default();
        stack.push(stack.plan_scope(Some("root"), None).unwrap());
        stack.push(stack.plan_scope(Some("a"), None).unwrap());
        assert_eq!(stack.rewind_target("a").unwrap(), 1);
        assert!(stack.rewind_target("root").is_err());
        assert!(stack.rewind_target("missing").is_err());
    }

    #[tokio::test]
    async fn test_commit_without_transaction_fails() {
        let lock = memory_lock().await;
        let mut guard = lock.lock().await;
        let err = machine().commit(&mut guard, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transaction);
    }

    #[tokio::test]
    async fn test_rollback_to_restores_savepoint_state() {
        let lock = memory_lock().await;
        let machine = machine();
        let mut guard = lock.lock().await;
        exec(&mut guard, "CREATE TABLE t (v INTEGER)").await;

        machine.begin(&mut guard, &TransactionOptions::default()).await.unwrap();
        machine.savepoint(&mut guard, Some("a")).await.unwrap();
        exec(&mut guard, "INSERT INTO t VALUES (1)").await;
        machine.savepoint(&mut guard, Some("b")).await.unwrap();
        exec(&mut guard, "INSERT INTO t VALUES (2)").await;

        let state = machine.rollback_to(&mut guard, "b").await.unwrap();
        assert_eq!(state, TransactionState::Open { depth: 3 });
        assert_eq!(count(&mut guard).await, 1);

        let state = machine.rollback_to(&mut guard, "a").await.unwrap();
        assert_eq!(state, TransactionState::Open { depth: 2 });
        assert_eq!(count(&mut guard).await, 0);

        // "b" was discarded together with its work.
        assert!(machine.rollback_to(&mut guard, "b").await.is_err());

        machine.rollback(&mut guard, None).await.unwrap();
        let state = machine.commit(&mut guard, None).await.unwrap();
        assert_eq!(state, TransactionState::Committed);
    }

    #[tokio::test]
    async fn test_nested_rollback_keeps_outer_work() {
        let lock = memory_lock().await;
        let machine = machine();
        let mut guard = lock.lock().await;
        exec(&mut guard, "CREATE TABLE t (v INTEGER)").await;

        machine.begin(&mut guard, &TransactionOptions::named("outer")).await.unwrap();
        exec(&mut guard, "INSERT INTO t VALUES (1)").await;
        machine.begin(&mut guard, &TransactionOptions::named("inner")).await.unwrap();
        exec(&mut guard, "INSERT INTO t VALUES (2)").await;

        let err = machine.commit(&mut guard, Some("outer")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transaction);

        machine.rollback(&mut guard, Some("inner")).await.unwrap();
        machine.commit(&mut guard, Some("outer")).await.unwrap();
        assert_eq!(count(&mut guard).await, 1);
        assert_eq!(guard.transactions().state(), TransactionState::Committed);
    }

    #[tokio::test]
    async fn test_begin_root_refuses_open_handle() {
        let lock = memory_lock().await;
        let machine = machine();
        let mut guard = lock.lock().await;

        machine.begin_root(&mut guard, &TransactionOptions::named("first")).await.unwrap();
        let err = machine
            .begin_root(&mut guard, &TransactionOptions::named("second"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transaction);
        assert!(err.to_string().contains("first"));
        assert_eq!(guard.transactions().state(), TransactionState::Open { depth: 1 });

        machine.commit(&mut guard, None).await.unwrap();
        machine.begin_root(&mut guard, &TransactionOptions::named("second")).await.unwrap();
        machine.rollback(&mut guard, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_rollback_to_matches_name_case_insensitively() {
        let lock = memory_lock().await;
        let machine = machine();
        let mut guard = lock.lock().await;
        exec(&mut guard, "CREATE TABLE t (v INTEGER)").await;

        machine.begin(&mut guard, &TransactionOptions::default()).await.unwrap();
        machine.savepoint(&mut guard, Some("Mark")).await.unwrap();
        exec(&mut guard, "INSERT INTO t VALUES (1)").await;

        let state = machine.rollback_to(&mut guard, "mark").await.unwrap();
        assert_eq!(state, TransactionState::Open { depth: 2 });
        assert_eq!(count(&mut guard).await, 0);
        machine.commit(&mut guard, Some("MARK")).await.unwrap();
        machine.rollback(&mut guard, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_root_rollback_discards_everything() {
        let lock = memory_lock().await;
        let machine = machine();
        let mut guard = lock.lock().await;
        exec(&mut guard, "CREATE TABLE t (v INTEGER)").await;

        machine.begin(&mut guard, &TransactionOptions::default()).await.unwrap();
        exec(&mut guard, "INSERT INTO t VALUES (1)").await;
        machine.savepoint(&mut guard, None).await.unwrap();
        exec(&mut guard, "INSERT INTO t VALUES (2)").await;
        machine.rollback(&mut guard, None).await.unwrap();
        let state = machine.rollback(&mut guard, None).await.unwrap();

        assert_eq!(state, TransactionState::RolledBack);
        assert_eq!(count(&mut guard).await, 0);
    }
}
