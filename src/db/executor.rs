//! Query execution engine.
//!
//! [`QueryExecutor::run`] is the single entry point for SQL:
//!
//! 1. Transaction-control statements (`BEGIN`, `COMMIT`, `SAVEPOINT x`, ...)
//!    are recognised by their leading keywords and handed to the
//!    [`TransactionStateMachine`].
//! 2. Everything else is bound (wire types inferred, named parameters
//!    rewritten), streamed through the dialect, and decoded row by row with
//!    the type parsers in effect when the statement started.
//! 3. Driver failures are formatted into constraint errors where the engine
//!    message allows it; results are normalized by query kind.
//!
//! All of it happens while holding the handle's [`ResourceLock`].

use crate::db::classify::{ErrorContext, format_query_error};
use crate::db::dialect::Dialect;
use crate::db::lock::{HandleGuard, ResourceLock};
use crate::db::normalize::{NormalizeContext, normalize};
use crate::db::params::bind_parameters;
use crate::db::stream::drain_events;
use crate::db::transaction::{
    IsolationLevel, TransactionOptions, TransactionScope, TransactionState,
    TransactionStateMachine, TransactionType,
};
use crate::db::type_parser::TypeParserStore;
use crate::error::{DbError, DbResult, NativeError};
use crate::models::{QueryKind, QueryOptions, QueryParams, ResultSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A transaction-control statement recognised by its keywords.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlStatement {
    Begin {
        isolation_level: Option<IsolationLevel>,
        transaction_type: Option<TransactionType>,
    },
    Commit,
    Rollback,
    RollbackTo(String),
    Savepoint(String),
    Release(String),
}

impl ControlStatement {
    /// Classify `sql` by its leading keywords; `None` for ordinary statements.
    pub fn classify(sql: &str) -> Option<Self> {
        let trimmed = sql.trim().trim_end_matches(';').trim_end();
        let words: Vec<&str> = trimmed.split_whitespace().collect();
        let upper: Vec<String> = words.iter().map(|w| w.to_ascii_uppercase()).collect();
        let upper: Vec<&str> = upper.iter().map(String::as_str).collect();

        match upper.as_slice() {
            ["BEGIN", rest @ ..] => Self::parse_begin(rest, true),
            ["START", "TRANSACTION", rest @ ..] => Self::parse_begin(rest, false),
            ["COMMIT"] | ["COMMIT", "TRANSACTION" | "WORK"] | ["END"] | ["END", "TRANSACTION"] => {
                Some(Self::Commit)
            }
            ["ROLLBACK"] | ["ROLLBACK", "TRANSACTION" | "WORK"] => Some(Self::Rollback),
            ["ROLLBACK", .., "TO", _] | ["ROLLBACK", .., "TO", "SAVEPOINT", _] => {
                let to = upper.iter().position(|w| *w == "TO")?;
                let between = &upper[1..to];
                if !(between.is_empty() || matches!(between, ["TRANSACTION"] | ["WORK"])) {
                    return None;
                }
                words.last().map(|name| Self::RollbackTo(name.to_string()))
            }
            ["SAVEPOINT", _] | ["SAVE", "TRANSACTION", _] => {
                words.last().map(|name| Self::Savepoint(name.to_string()))
            }
            ["RELEASE", _] | ["RELEASE", "SAVEPOINT", _] => {
                words.last().map(|name| Self::Release(name.to_string()))
            }
            _ => None,
        }
    }

    fn parse_begin(rest: &[&str], allow_mode: bool) -> Option<Self> {
        let mut transaction_type = None;
        let mut rest = rest;
        if allow_mode {
            if let Some((first, tail)) = rest.split_first() {
                transaction_type = match *first {
                    "DEFERRED" => Some(TransactionType::Deferred),
                    "IMMEDIATE" => Some(TransactionType::Immediate),
                    "EXCLUSIVE" => Some(TransactionType::Exclusive),
                    _ => None,
                };
                if transaction_type.is_some() {
                    rest = tail;
                }
            }
            if let Some(tail) = rest
                .strip_prefix(&["TRANSACTION"])
                .or_else(|| rest.strip_prefix(&["WORK"]))
            {
                rest = tail;
            }
        }

        let isolation_level = match rest {
            [] => None,
            ["ISOLATION", "LEVEL", level @ ..] if !level.is_empty() => {
                Some(level.join(" ").parse().ok()?)
            }
            _ => return None,
        };
        Some(Self::Begin {
            isolation_level,
            transaction_type,
        })
    }
}

/// Executes statements on locked connection handles.
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    dialect: Arc<dyn Dialect>,
    type_parsers: Arc<TypeParserStore>,
    transactions: TransactionStateMachine,
    default_max_rows: Option<u32>,
    default_timeout: Option<Duration>,
}

impl QueryExecutor {
    pub fn new(dialect: Arc<dyn Dialect>, type_parsers: Arc<TypeParserStore>) -> Self {
        Self {
            transactions: TransactionStateMachine::new(Arc::clone(&dialect)),
            dialect,
            type_parsers,
            default_max_rows: None,
            default_timeout: None,
        }
    }

    /// Row cap and statement timeout applied when a call sets none.
    pub fn with_defaults(mut self, max_rows: Option<u32>, timeout: Option<Duration>) -> Self {
        self.default_max_rows = max_rows;
        self.default_timeout = timeout;
        self
    }

    pub fn dialect(&self) -> &Arc<dyn Dialect> {
        &self.dialect
    }

    pub fn type_parsers(&self) -> &Arc<TypeParserStore> {
        &self.type_parsers
    }

    /// Run one statement on `lock` and normalize its result.
    pub async fn run(
        &self,
        lock: &ResourceLock,
        sql: &str,
        params: &QueryParams,
        options: QueryOptions<'_>,
    ) -> DbResult<ResultSet> {
        let start = Instant::now();
        let QueryOptions {
            kind,
            plain,
            max_rows,
            unlimited_rows,
            timeout,
            model,
            mut target,
            cancellation,
        } = options;

        let mut guard = lock.lock().await;

        if matches!(kind, None | Some(QueryKind::TransactionControl)) {
            if let Some(control) = ControlStatement::classify(sql) {
                self.apply_control(&mut guard, control).await?;
                return Ok(ResultSet::control(start.elapsed().as_millis() as u64));
            }
        }

        let kind = kind.unwrap_or_else(|| QueryKind::infer(sql));
        let statement = bind_parameters(sql, params, self.dialect.placeholder_style())?;
        let max_rows = if unlimited_rows {
            None
        } else {
            max_rows.or(self.default_max_rows).map(|n| n as usize)
        };
        let timeout = timeout.or(self.default_timeout);
        let cancellation = cancellation.unwrap_or_default();
        let parsers = self.type_parsers.snapshot();

        debug!(
            sql = %statement.sql,
            params = statement.params.len(),
            kind = ?kind,
            max_rows = ?max_rows,
            handle = %guard.info().id(),
            "Executing query"
        );

        let outcome = {
            let native = guard.native_mut()?;
            let events = self.dialect.stream(native, &statement);
            let drain = drain_events(events, &parsers, max_rows, &cancellation);
            match timeout {
                Some(limit) => tokio::time::timeout(limit, drain).await.map_err(|_| limit),
                None => Ok(drain.await),
            }
        };

        let drained = match outcome {
            Err(limit) => {
                warn!(
                    sql = %sql,
                    timeout_ms = limit.as_millis() as u64,
                    "Statement timed out, retiring connection"
                );
                self.retire(&mut guard);
                return Err(DbError::timeout("query", limit));
            }
            Ok(Err(e)) => {
                let native = NativeError::from_sqlx(&e);
                if native.is_socket_reset() {
                    warn!(error = %native, "Connection lost during query");
                    self.retire(&mut guard);
                }
                let ctx = ErrorContext {
                    sql: Some(sql),
                    model,
                    target: target.as_deref(),
                };
                return Err(format_query_error(native, &ctx));
            }
            Ok(Ok(drained)) if drained.cancelled_by_caller => {
                return Err(DbError::cancelled("query"));
            }
            Ok(Ok(drained)) => drained,
        };
        drop(guard);

        let ctx = NormalizeContext {
            insert_id_field: self.dialect.insert_id_field(),
            model,
            target: target.as_deref_mut(),
            plain,
        };
        let result = normalize(kind, drained, ctx, start.elapsed().as_millis() as u64);
        debug!(
            rows = result.row_count,
            rows_affected = ?result.rows_affected,
            truncated = result.truncated,
            elapsed_ms = result.execution_time_ms,
            "Query completed"
        );
        Ok(result)
    }

    /// Mark the handle dead and drop its native connection; the pool evicts
    /// it on the next acquire.
    fn retire(&self, guard: &mut HandleGuard) {
        guard.info().mark_dead();
        guard.transactions_mut().abandon();
        drop(guard.take_native());
    }

    async fn apply_control(
        &self,
        guard: &mut HandleGuard,
        control: ControlStatement,
    ) -> DbResult<()> {
        debug!(statement = ?control, "Routing transaction control");
        match control {
            ControlStatement::Begin {
                isolation_level,
                transaction_type,
            } => {
                let options = TransactionOptions {
                    name: None,
                    isolation_level,
                    transaction_type,
                };
                self.transactions.begin(guard, &options).await?;
            }
            ControlStatement::Commit => {
                self.transactions.commit(guard, None).await?;
            }
            ControlStatement::Rollback => {
                self.transactions.rollback(guard, None).await?;
            }
            ControlStatement::RollbackTo(name) => {
                self.transactions.rollback_to(guard, &name).await?;
            }
            ControlStatement::Savepoint(name) => {
                self.transactions.savepoint(guard, Some(&name)).await?;
            }
            ControlStatement::Release(name) => {
                self.transactions.commit(guard, Some(&name)).await?;
            }
        }
        Ok(())
    }

    // ---- transaction API ----------------------------------------------------

    pub async fn begin_transaction(
        &self,
        lock: &ResourceLock,
        options: &TransactionOptions,
    ) -> DbResult<TransactionScope> {
        let mut guard = lock.lock().await;
        self.transactions.begin(&mut guard, options).await
    }

    /// Like [`begin_transaction`](Self::begin_transaction), but refuses to
    /// nest into a transaction that is already open on the handle.
    pub async fn begin_root_transaction(
        &self,
        lock: &ResourceLock,
        options: &TransactionOptions,
    ) -> DbResult<TransactionScope> {
        let mut guard = lock.lock().await;
        self.transactions.begin_root(&mut guard, options).await
    }

    pub async fn commit_transaction(
        &self,
        lock: &ResourceLock,
        name: Option<&str>,
    ) -> DbResult<TransactionState> {
        let mut guard = lock.lock().await;
        self.transactions.commit(&mut guard, name).await
    }

    pub async fn rollback_transaction(
        &self,
        lock: &ResourceLock,
        name: Option<&str>,
    ) -> DbResult<TransactionState> {
        let mut guard = lock.lock().await;
        self.transactions.rollback(&mut guard, name).await
    }

    pub async fn savepoint(
        &self,
        lock: &ResourceLock,
        name: Option<&str>,
    ) -> DbResult<TransactionScope> {
        let mut guard = lock.lock().await;
        self.transactions.savepoint(&mut guard, name).await
    }

    pub async fn rollback_to_savepoint(
        &self,
        lock: &ResourceLock,
        name: &str,
    ) -> DbResult<TransactionState> {
        let mut guard = lock.lock().await;
        self.transactions.rollback_to(&mut guard, name).await
    }

    /// Current transaction state of a handle.
    pub async fn transaction_state(&self, lock: &ResourceLock) -> TransactionState {
        lock.lock().await.transactions().state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::dialect::{NativeConnection, SqliteDialect};
    use crate::db::type_parser::TypeDescriptor;
    use crate::error::ErrorKind;
    use crate::models::{ConnectionKey, DialectKind, ModelDescriptor, Parameter, QueryOutput, Row};
    use serde_json::{Value as JsonValue, json};
    use sqlx::Connection;
    use tokio_util::sync::CancellationToken;

    async fn setup() -> (QueryExecutor, ResourceLock) {
        let conn = sqlx::SqliteConnection::connect("sqlite::memory:").await.unwrap();
        let lock = ResourceLock::new(
            ConnectionKey::Default,
            DialectKind::Sqlite,
            NativeConnection::Sqlite(conn),
            None,
        );
        let executor = QueryExecutor::new(
            Arc::new(SqliteDialect),
            Arc::new(TypeParserStore::new(DialectKind::Sqlite)),
        );
        (executor, lock)
    }

    async fn exec(executor: &QueryExecutor, lock: &ResourceLock, sql: &str) -> ResultSet {
        executor
            .run(lock, sql, &QueryParams::None, QueryOptions::default())
            .await
            .unwrap()
    }

    #[test]
    fn test_classify_control_statements() {
        assert_eq!(
            ControlStatement::classify("begin;"),
            Some(ControlStatement::Begin {
                isolation_level: None,
                transaction_type: None
            })
        );
        assert_eq!(
            ControlStatement::classify("BEGIN IMMEDIATE TRANSACTION"),
            Some(ControlStatement::Begin {
                isolation_level: None,
                transaction_type: Some(TransactionType::Immediate)
            })
        );
        assert_eq!(
            ControlStatement::classify("START TRANSACTION ISOLATION LEVEL READ COMMITTED"),
            Some(ControlStatement::Begin {
                isolation_level: Some(IsolationLevel::ReadCommitted),
                transaction_type: None
            })
        );
        assert_eq!(ControlStatement::classify("COMMIT"), Some(ControlStatement::Commit));
        assert_eq!(ControlStatement::classify("rollback work"), Some(ControlStatement::Rollback));
        assert_eq!(
            ControlStatement::classify("ROLLBACK TO SAVEPOINT Sp_A"),
            Some(ControlStatement::RollbackTo("Sp_A".to_string()))
        );
        assert_eq!(
            ControlStatement::classify("ROLLBACK TRANSACTION TO a"),
            Some(ControlStatement::RollbackTo("a".to_string()))
        );
        assert_eq!(
            ControlStatement::classify("SAVE TRANSACTION b"),
            Some(ControlStatement::Savepoint("b".to_string()))
        );
        assert_eq!(
            ControlStatement::classify("RELEASE SAVEPOINT b"),
            Some(ControlStatement::Release("b".to_string()))
        );
    }

    #[test]
    fn test_classify_leaves_ordinary_sql_alone() {
        assert_eq!(ControlStatement::classify("SELECT 1"), None);
        assert_eq!(ControlStatement::classify("BEGIN foo bar"), None);
        assert_eq!(ControlStatement::classify("ROLLBACK junk TO x"), None);
        assert_eq!(ControlStatement::classify("UPDATE savepoint SET x = 1"), None);
    }

    #[tokio::test]
    async fn test_select_with_named_params() {
        let (executor, lock) = setup().await;
        let params = QueryParams::named([("a", Parameter::from(2)), ("b", Parameter::from("x"))]);
        let result = executor
            .run(
                &lock,
                "SELECT :a + 1 AS n, :b AS s, ':a' AS literal",
                &params,
                QueryOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.kind, QueryKind::Select);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0]["n"], json!(3));
        assert_eq!(result.rows[0]["s"], json!("x"));
        assert_eq!(result.rows[0]["literal"], json!(":a"));
    }

    #[tokio::test]
    async fn test_registered_parser_decodes_column() {
        let (executor, lock) = setup().await;
        executor.type_parsers().refresh(
            &TypeDescriptor::new("SHOUT", |v: &JsonValue| match v.as_str() {
                Some(s) => JsonValue::String(s.to_uppercase()),
                None => v.clone(),
            })
            .with_types(DialectKind::Sqlite, ["TEXT"]),
        );
        let result = exec(&executor, &lock, "SELECT 'quiet' AS s, 1 AS n").await;
        assert_eq!(result.rows[0]["s"], json!("QUIET"));
        assert_eq!(result.rows[0]["n"], json!(1));
    }

    #[tokio::test]
    async fn test_max_rows_truncates_stream() {
        let (executor, lock) = setup().await;
        let result = executor
            .run(
                &lock,
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 100) SELECT x FROM c",
                &QueryParams::None,
                QueryOptions::default().with_max_rows(10),
            )
            .await
            .unwrap();
        assert_eq!(result.row_count, 10);
        assert!(result.truncated);

        // The handle stays usable after the early stop.
        let result = exec(&executor, &lock, "SELECT 42 AS answer").await;
        assert_eq!(result.rows[0]["answer"], json!(42));
    }

    #[tokio::test]
    async fn test_insert_attaches_generated_id() {
        let (executor, lock) = setup().await;
        exec(&executor, &lock, "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)").await;

        let mut target = Row::new();
        target.insert("name".to_string(), json!("ada"));
        let result = executor
            .run(
                &lock,
                "INSERT INTO users (name) VALUES (?)",
                &QueryParams::positional(["ada"]),
                QueryOptions::default().with_target(&mut target),
            )
            .await
            .unwrap();

        assert_eq!(result.kind, QueryKind::Insert);
        assert_eq!(result.generated_id, Some(json!(1)));
        assert_eq!(target["id"], json!(1));
    }

    #[tokio::test]
    async fn test_unique_violation_formatted() {
        let (executor, lock) = setup().await;
        exec(&executor, &lock, "CREATE TABLE users (email TEXT UNIQUE)").await;
        exec(&executor, &lock, "INSERT INTO users VALUES ('a@b.com')").await;

        let model = ModelDescriptor::new("User", "users").with_unique_key("uq_email", ["email"]);
        let mut target = Row::new();
        target.insert("email".to_string(), json!("a@b.com"));
        let err = executor
            .run(
                &lock,
                "INSERT INTO users VALUES ('a@b.com')",
                &QueryParams::None,
                QueryOptions::default()
                    .with_model(&model)
                    .with_target(&mut target),
            )
            .await
            .unwrap_err();

        let DbError::UniqueConstraint {
            fields, constraint, ..
        } = err
        else {
            panic!("expected unique constraint error, got {:?}", err);
        };
        assert_eq!(constraint.as_deref(), Some("uq_email"));
        assert_eq!(fields["email"], json!("a@b.com"));
    }

    #[tokio::test]
    async fn test_control_statements_drive_state_machine() {
        let (executor, lock) = setup().await;
        exec(&executor, &lock, "CREATE TABLE t (v INTEGER)").await;

        let result = exec(&executor, &lock, "BEGIN").await;
        assert_eq!(result.output, QueryOutput::Control);
        exec(&executor, &lock, "SAVEPOINT a").await;
        exec(&executor, &lock, "INSERT INTO t VALUES (1)").await;
        exec(&executor, &lock, "ROLLBACK TO SAVEPOINT a").await;
        assert_eq!(
            executor.transaction_state(&lock).await,
            TransactionState::Open { depth: 2 }
        );
        exec(&executor, &lock, "COMMIT").await;
        assert_eq!(
            executor.transaction_state(&lock).await,
            TransactionState::Open { depth: 1 }
        );
        exec(&executor, &lock, "COMMIT").await;
        assert_eq!(
            executor.transaction_state(&lock).await,
            TransactionState::Committed
        );

        let count = exec(&executor, &lock, "SELECT COUNT(*) AS n FROM t").await;
        assert_eq!(count.rows[0]["n"], json!(0));

        let err = executor
            .run(&lock, "COMMIT", &QueryParams::None, QueryOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transaction);
    }

    #[tokio::test]
    async fn test_generic_error_keeps_sql() {
        let (executor, lock) = setup().await;
        let err = executor
            .run(&lock, "SELEC 1", &QueryParams::None, QueryOptions::default())
            .await
            .unwrap_err();
        let DbError::Database { sql, .. } = err else {
            panic!("expected database error");
        };
        assert_eq!(sql.as_deref(), Some("SELEC 1"));
    }

    #[tokio::test]
    async fn test_cancelled_token_aborts_query() {
        let (executor, lock) = setup().await;
        let token = CancellationToken::new();
        token.cancel();
        let err = executor
            .run(
                &lock,
                "SELECT 1",
                &QueryParams::None,
                QueryOptions::default().with_cancellation(token),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(lock.unwrap().is_open());
    }

    #[tokio::test]
    async fn test_timeout_retires_handle() {
        let (executor, lock) = setup().await;
        let err = executor
            .run(
                &lock,
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 50000000) SELECT COUNT(*) FROM c",
                &QueryParams::None,
                QueryOptions::default().with_timeout(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(!lock.unwrap().is_open());
        assert!(lock.lock().await.native_mut().is_err());
    }

    #[tokio::test]
    async fn test_concurrent_runs_serialize_on_handle() {
        let (executor, lock) = setup().await;
        exec(&executor, &lock, "CREATE TABLE t (v INTEGER)").await;

        let mut tasks = Vec::new();
        for i in 0..8 {
            let executor = executor.clone();
            let lock = lock.clone();
            tasks.push(tokio::spawn(async move {
                executor
                    .run(
                        &lock,
                        "INSERT INTO t VALUES (?)",
                        &QueryParams::positional([i]),
                        QueryOptions::default(),
                    )
                    .await
                    .map(|r| r.rows_affected)
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), Some(1));
        }
        let count = exec(&executor, &lock, "SELECT COUNT(*) AS n FROM t").await;
        assert_eq!(count.rows[0]["n"], json!(8));
    }
}
