//! Entry point for the model layer.
//!
//! A [`Database`] owns one [`ConnectionManager`], one [`QueryExecutor`] and
//! the [`TypeParserStore`] they share. Statements outside a transaction run
//! on the pool's `default` handle; [`Database::transaction`] binds a
//! [`Transaction`] to a handle of its own.

use crate::config::ConnectionConfig;
use crate::db::dialect::Dialect;
use crate::db::executor::QueryExecutor;
use crate::db::lock::ResourceLock;
use crate::db::pool::ConnectionManager;
use crate::db::transaction::{TransactionOptions, TransactionScope, TransactionState};
use crate::db::type_parser::{TypeDescriptor, TypeParserStore};
use crate::error::{DbError, DbResult};
use crate::models::{
    ColumnDescription, ConnectionKey, ForeignKeyRef, IndexDescription, QueryKind, QueryOptions,
    QueryOutput, QueryParams, ResultSet, TableRef,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct Database {
    manager: Arc<ConnectionManager>,
    executor: QueryExecutor,
    type_parsers: Arc<TypeParserStore>,
}

impl Database {
    /// Build the pool for `config` and start its idle reaper.
    ///
    /// Connections are opened lazily, so an unreachable server surfaces on
    /// the first statement, not here.
    pub fn new(config: ConnectionConfig) -> DbResult<Self> {
        let max_rows = config.dialect_options.max_rows;
        let statement_timeout = config.pool.statement_timeout();

        let manager = ConnectionManager::new(config)?;
        let dialect = Arc::clone(manager.dialect());
        let type_parsers = Arc::new(TypeParserStore::new(dialect.kind()));
        let executor = QueryExecutor::new(dialect, Arc::clone(&type_parsers))
            .with_defaults(max_rows, statement_timeout);
        manager.start_reaper();

        info!(target = %manager.config().masked(), "Database ready");
        Ok(Self {
            manager,
            executor,
            type_parsers,
        })
    }

    /// Parse a connection URL and build the pool for it.
    pub fn connect_url(url: &str) -> DbResult<Self> {
        Self::new(ConnectionConfig::from_url(url)?)
    }

    pub fn config(&self) -> &ConnectionConfig {
        self.manager.config()
    }

    pub fn dialect(&self) -> &Arc<dyn Dialect> {
        self.executor.dialect()
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    // ---- type parsers -------------------------------------------------------

    pub fn type_parsers(&self) -> &Arc<TypeParserStore> {
        &self.type_parsers
    }

    /// Register `descriptor`'s decoder for this dialect's wire types.
    pub fn refresh_type_parser(&self, descriptor: &TypeDescriptor) -> usize {
        self.type_parsers.refresh(descriptor)
    }

    pub fn clear_type_parser(&self) {
        self.type_parsers.clear();
    }

    // ---- connections --------------------------------------------------------

    pub async fn get_connection(&self, key: ConnectionKey) -> DbResult<ResourceLock> {
        self.manager.acquire(key).await
    }

    pub async fn release_connection(&self, lock: &ResourceLock, force: bool) {
        self.manager.release(lock, force).await;
    }

    pub fn validate(&self, lock: &ResourceLock) -> bool {
        self.manager.validate(lock)
    }

    // ---- statements ---------------------------------------------------------

    /// Run `sql` on a handle the caller already holds.
    ///
    /// A handle that died during the call (statement timeout, socket reset)
    /// is evicted before the error is returned.
    pub async fn run(
        &self,
        lock: &ResourceLock,
        sql: &str,
        params: &QueryParams,
        options: QueryOptions<'_>,
    ) -> DbResult<ResultSet> {
        let result = self.executor.run(lock, sql, params, options).await;
        if result.is_err() && !lock.unwrap().is_open() {
            warn!(key = %lock.key(), "Evicting connection after failed statement");
            self.manager.evict(lock).await;
        }
        result
    }

    /// Run `sql` on the default handle.
    pub async fn query(
        &self,
        sql: &str,
        params: &QueryParams,
        options: QueryOptions<'_>,
    ) -> DbResult<ResultSet> {
        let lock = self.manager.acquire(ConnectionKey::Default).await?;
        self.run(&lock, sql, params, options).await
    }

    /// Open a root transaction on a dedicated handle.
    ///
    /// In-memory databases have a single handle, so their transactions share
    /// it with every other statement and only one can be open at a time; a
    /// second call fails with a `Transaction` error until the first finishes.
    pub async fn transaction(&self, options: TransactionOptions) -> DbResult<Transaction> {
        let id = Uuid::new_v4();
        let lock = self.manager.acquire(ConnectionKey::Transaction(id)).await?;
        let scope = match self.executor.begin_root_transaction(&lock, &options).await {
            Ok(scope) => scope,
            Err(e) => {
                self.manager.release(&lock, false).await;
                return Err(e);
            }
        };
        debug!(id = %id, name = %scope.name, "Transaction bound to connection");
        Ok(Transaction {
            id,
            scope,
            lock,
            db: self.clone(),
            finished: false,
        })
    }

    // ---- introspection ------------------------------------------------------

    pub async fn describe_table(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> DbResult<BTreeMap<String, ColumnDescription>> {
        let sql = self.dialect().describe_table_sql(table, schema);
        match self.introspect(&sql, QueryKind::Describe).await? {
            QueryOutput::Describe(columns) => Ok(columns),
            other => Err(unexpected_output(QueryKind::Describe, &other)),
        }
    }

    pub async fn show_tables(&self) -> DbResult<Vec<TableRef>> {
        let sql = self.dialect().show_tables_sql();
        match self.introspect(&sql, QueryKind::ShowTables).await? {
            QueryOutput::Tables(tables) => Ok(tables),
            other => Err(unexpected_output(QueryKind::ShowTables, &other)),
        }
    }

    pub async fn show_indexes(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> DbResult<Vec<IndexDescription>> {
        let sql = self.dialect().show_indexes_sql(table, schema);
        match self.introspect(&sql, QueryKind::ShowIndexes).await? {
            QueryOutput::Indexes(indexes) => Ok(indexes),
            other => Err(unexpected_output(QueryKind::ShowIndexes, &other)),
        }
    }

    pub async fn foreign_keys(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> DbResult<Vec<ForeignKeyRef>> {
        let sql = self.dialect().foreign_keys_sql(table, schema);
        match self.introspect(&sql, QueryKind::ForeignKeys).await? {
            QueryOutput::ForeignKeys(keys) => Ok(keys),
            other => Err(unexpected_output(QueryKind::ForeignKeys, &other)),
        }
    }

    /// Server version string.
    pub async fn version(&self) -> DbResult<Option<String>> {
        let sql = self.dialect().version_sql();
        match self.introspect(sql, QueryKind::Version).await? {
            QueryOutput::Version(version) => Ok(version),
            other => Err(unexpected_output(QueryKind::Version, &other)),
        }
    }

    /// Catalog queries are never truncated by the configured row cap.
    async fn introspect(&self, sql: &str, kind: QueryKind) -> DbResult<QueryOutput> {
        let options = QueryOptions::kind(kind).without_row_limit();
        let result = self.query(sql, &QueryParams::None, options).await?;
        Ok(result.output)
    }

    /// Close every connection. Later calls fail with a connection error.
    pub async fn close(&self) {
        self.manager.close().await;
    }
}

fn unexpected_output(kind: QueryKind, output: &QueryOutput) -> DbError {
    DbError::internal(format!(
        "{:?} query normalized to an unexpected output: {:?}",
        kind, output
    ))
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("manager", &self.manager)
            .field("type_parsers", &self.type_parsers)
            .finish()
    }
}

/// A root transaction bound to its own connection handle.
///
/// Finish it with [`commit`](Self::commit) or [`rollback`](Self::rollback).
/// Dropping an unfinished transaction rolls it back in the background.
pub struct Transaction {
    id: Uuid,
    scope: TransactionScope,
    lock: ResourceLock,
    db: Database,
    finished: bool,
}

impl Transaction {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.scope.name
    }

    pub fn connection(&self) -> &ResourceLock {
        &self.lock
    }

    pub async fn state(&self) -> TransactionState {
        self.db.executor.transaction_state(&self.lock).await
    }

    pub async fn run(
        &self,
        sql: &str,
        params: &QueryParams,
        options: QueryOptions<'_>,
    ) -> DbResult<ResultSet> {
        self.db.run(&self.lock, sql, params, options).await
    }

    pub async fn savepoint(&self, name: Option<&str>) -> DbResult<TransactionScope> {
        self.db.executor.savepoint(&self.lock, name).await
    }

    /// Undo everything after savepoint `name`, keeping the savepoint open.
    pub async fn rollback_to(&self, name: &str) -> DbResult<TransactionState> {
        self.db.executor.rollback_to_savepoint(&self.lock, name).await
    }

    /// Roll back the innermost savepoint only.
    pub async fn rollback_savepoint(&self, name: Option<&str>) -> DbResult<TransactionState> {
        self.guard_root(name, "roll back")?;
        self.db.executor.rollback_transaction(&self.lock, name).await
    }

    /// Release the innermost savepoint only.
    pub async fn release_savepoint(&self, name: Option<&str>) -> DbResult<TransactionState> {
        self.guard_root(name, "release")?;
        self.db.executor.commit_transaction(&self.lock, name).await
    }

    fn guard_root(&self, name: Option<&str>, operation: &str) -> DbResult<()> {
        if name == Some(self.scope.name.as_str()) {
            return Err(DbError::transaction(
                format!("Cannot {} the transaction itself as a savepoint", operation),
                &self.scope.name,
            ));
        }
        Ok(())
    }

    /// Release open savepoints and commit.
    ///
    /// Fails unless the transaction ends up `Committed`.
    pub async fn commit(mut self) -> DbResult<TransactionState> {
        let result = self
            .unwind(true)
            .await
            .and_then(|state| self.expect_outcome(state, TransactionState::Committed));
        self.finish().await;
        result
    }

    /// Roll back the whole transaction, savepoints included.
    pub async fn rollback(mut self) -> DbResult<TransactionState> {
        let result = self
            .unwind(false)
            .await
            .and_then(|state| self.expect_outcome(state, TransactionState::RolledBack));
        self.finish().await;
        result
    }

    fn expect_outcome(
        &self,
        state: TransactionState,
        expected: TransactionState,
    ) -> DbResult<TransactionState> {
        if state == expected {
            return Ok(state);
        }
        Err(DbError::transaction(
            format!(
                "Transaction finished as {:?} instead of {:?}",
                state, expected
            ),
            &self.scope.name,
        ))
    }

    /// Close scopes down to and including this transaction's own.
    async fn unwind(&self, commit: bool) -> DbResult<TransactionState> {
        unwind_scopes(&self.db, &self.lock, self.scope.depth, commit).await
    }

    async fn finish(&mut self) {
        self.finished = true;
        self.db.manager.release(&self.lock, false).await;
    }
}

async fn unwind_scopes(
    db: &Database,
    lock: &ResourceLock,
    depth: usize,
    commit: bool,
) -> DbResult<TransactionState> {
    loop {
        let state = db.executor.transaction_state(lock).await;
        match state {
            TransactionState::Open { depth: open } if open >= depth => {}
            _ => return Ok(state),
        }
        if commit {
            db.executor.commit_transaction(lock, None).await?;
        } else {
            db.executor.rollback_transaction(lock, None).await?;
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(id = %self.id, name = %self.scope.name, "Transaction dropped unfinished, rolling back");
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.lock.unwrap().mark_dead();
            return;
        };
        let db = self.db.clone();
        let lock = self.lock.clone();
        let depth = self.scope.depth;
        runtime.spawn(async move {
            if let Err(e) = unwind_scopes(&db, &lock, depth, false).await {
                warn!(error = %e, "Background rollback failed, evicting connection");
                db.manager.evict(&lock).await;
                return;
            }
            db.manager.release(&lock, false).await;
        });
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("name", &self.scope.name)
            .field("lock", &self.lock)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::Row;
    use serde_json::json;

    async fn file_db(dir: &tempfile::TempDir) -> Database {
        let path = dir.path().join("facade.db");
        let db = Database::new(ConnectionConfig::sqlite_file(path.to_string_lossy())).unwrap();
        db.query(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL UNIQUE)",
            &QueryParams::None,
            QueryOptions::default(),
        )
        .await
        .unwrap();
        db
    }

    async fn count(db: &Database) -> i64 {
        let result = db
            .query(
                "SELECT COUNT(*) AS n FROM users",
                &QueryParams::None,
                QueryOptions::default(),
            )
            .await
            .unwrap();
        result.rows[0]["n"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn test_transaction_commit_is_visible_outside() {
        let dir = tempfile::tempdir().unwrap();
        let db = file_db(&dir).await;

        let tx = db.transaction(TransactionOptions::default()).await.unwrap();
        tx.run(
            "INSERT INTO users (email) VALUES (?)",
            &QueryParams::positional(["a@b.com"]),
            QueryOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(tx.commit().await.unwrap(), TransactionState::Committed);

        assert_eq!(count(&db).await, 1);
        assert_eq!(db.manager().len().await, 1);
    }

    #[tokio::test]
    async fn test_transaction_rollback_unwinds_savepoints() {
        let dir = tempfile::tempdir().unwrap();
        let db = file_db(&dir).await;

        let tx = db.transaction(TransactionOptions::named("outer")).await.unwrap();
        tx.savepoint(Some("inner")).await.unwrap();
        tx.run(
            "INSERT INTO users (email) VALUES ('x@y.z')",
            &QueryParams::None,
            QueryOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(tx.state().await, TransactionState::Open { depth: 2 });

        assert_eq!(tx.rollback().await.unwrap(), TransactionState::RolledBack);
        assert_eq!(count(&db).await, 0);
    }

    #[tokio::test]
    async fn test_rollback_to_keeps_earlier_work() {
        let dir = tempfile::tempdir().unwrap();
        let db = file_db(&dir).await;

        let tx = db.transaction(TransactionOptions::default()).await.unwrap();
        tx.savepoint(Some("a")).await.unwrap();
        tx.run(
            "INSERT INTO users (email) VALUES ('one@x.y')",
            &QueryParams::None,
            QueryOptions::default(),
        )
        .await
        .unwrap();
        tx.savepoint(Some("b")).await.unwrap();
        tx.run(
            "INSERT INTO users (email) VALUES ('two@x.y')",
            &QueryParams::None,
            QueryOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(
            tx.rollback_to("b").await.unwrap(),
            TransactionState::Open { depth: 3 }
        );
        tx.commit().await.unwrap();
        assert_eq!(count(&db).await, 1);
    }

    #[tokio::test]
    async fn test_savepoint_helpers_refuse_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let db = file_db(&dir).await;
        let tx = db.transaction(TransactionOptions::named("root")).await.unwrap();

        let err = tx.release_savepoint(Some("root")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transaction);
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let db = file_db(&dir).await;

        {
            let tx = db.transaction(TransactionOptions::default()).await.unwrap();
            tx.run(
                "INSERT INTO users (email) VALUES ('gone@x.y')",
                &QueryParams::None,
                QueryOptions::default(),
            )
            .await
            .unwrap();
        }

        for _ in 0..50 {
            if db.manager().len().await == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(db.manager().len().await, 1);
        assert_eq!(count(&db).await, 0);
    }

    #[tokio::test]
    async fn test_insert_attaches_id_to_target() {
        let dir = tempfile::tempdir().unwrap();
        let db = file_db(&dir).await;

        let mut target = Row::new();
        target.insert("email".to_string(), json!("t@x.y"));
        let result = db
            .query(
                "INSERT INTO users (email) VALUES (:email)",
                &QueryParams::named([("email", "t@x.y")]),
                QueryOptions::default().with_target(&mut target),
            )
            .await
            .unwrap();

        assert_eq!(result.generated_id, Some(json!(1)));
        assert_eq!(target["id"], json!(1));
    }

    #[tokio::test]
    async fn test_introspection() {
        let dir = tempfile::tempdir().unwrap();
        let db = file_db(&dir).await;

        let columns = db.describe_table("users", None).await.unwrap();
        assert!(columns["id"].primary_key);
        assert!(!columns["email"].allow_null);

        let tables = db.show_tables().await.unwrap();
        assert_eq!(tables.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(), ["users"]);

        let indexes = db.show_indexes("users", None).await.unwrap();
        assert!(indexes.iter().any(|i| i.unique && i.fields == ["email"]));

        assert!(db.foreign_keys("users", None).await.unwrap().is_empty());
        assert!(db.version().await.unwrap().is_some_and(|v| v.starts_with('3')));
    }

    #[tokio::test]
    async fn test_introspection_ignores_row_cap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capped.db");
        let mut config = ConnectionConfig::sqlite_file(path.to_string_lossy());
        config.dialect_options.max_rows = Some(1);
        let db = Database::new(config).unwrap();
        for sql in [
            "CREATE TABLE wide (a INTEGER, b TEXT, c REAL)",
            "CREATE TABLE other (x INTEGER)",
        ] {
            db.query(sql, &QueryParams::None, QueryOptions::default())
                .await
                .unwrap();
        }

        let columns = db.describe_table("wide", None).await.unwrap();
        assert_eq!(columns.keys().collect::<Vec<_>>(), ["a", "b", "c"]);
        assert_eq!(db.show_tables().await.unwrap().len(), 2);

        // Ordinary queries stay capped.
        let result = db
            .query(
                "SELECT name FROM sqlite_master WHERE type = 'table'",
                &QueryParams::None,
                QueryOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.row_count, 1);
        assert!(result.truncated);
    }

    #[tokio::test]
    async fn test_closed_database_rejects_queries() {
        let dir = tempfile::tempdir().unwrap();
        let db = file_db(&dir).await;
        db.close().await;

        let err = db
            .query("SELECT 1", &QueryParams::None, QueryOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_connection_error());
    }
}
