//! SQLite dialect (file-backed or in-memory).

use super::{
    Dialect, EventStream, ExecSummary, NativeConnection, StreamEvent, mismatched_connection,
    with_statement_logging,
};
use crate::config::{ConnectionConfig, MEMORY_STORAGE};
use crate::db::params::{BoundStatement, PlaceholderStyle, bind_sqlite_param};
use crate::db::transaction::{IsolationLevel, TransactionType};
use crate::db::types::RawRowSource;
use crate::error::{DbError, DbResult};
use crate::models::DialectKind;
use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection, Either, Executor};
use std::str::FromStr;

#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteDialect;

impl SqliteDialect {
    fn connect_options(config: &ConnectionConfig) -> Result<SqliteConnectOptions, sqlx::Error> {
        let mode = config.dialect_options.mode.unwrap_or_default();
        let options = if config.is_in_memory() {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            let storage = config.storage.as_deref().unwrap_or(MEMORY_STORAGE);
            SqliteConnectOptions::new()
                .filename(storage)
                .read_only(mode.is_read_only())
                .create_if_missing(mode.contains(crate::config::OpenMode::CREATE))
        };
        Ok(with_statement_logging(
            options.foreign_keys(true),
            config.dialect_options.debug,
        ))
    }

    /// Trailing schema argument of the table-valued pragma functions.
    fn pragma_args(&self, table: &str, schema: Option<&str>) -> String {
        match schema {
            Some(schema) => format!(
                "{}, {}",
                self.quote_literal(table),
                self.quote_literal(schema)
            ),
            None => self.quote_literal(table),
        }
    }
}

#[async_trait]
impl Dialect for SqliteDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Sqlite
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<NativeConnection, sqlx::Error> {
        let conn = Self::connect_options(config)?.connect().await?;
        Ok(NativeConnection::Sqlite(conn))
    }

    async fn close(&self, conn: NativeConnection) -> Result<(), sqlx::Error> {
        match conn {
            NativeConnection::Sqlite(conn) => conn.close().await,
            other => Err(mismatched_connection(self.kind(), &other)),
        }
    }

    async fn ping(&self, conn: &mut NativeConnection) -> Result<(), sqlx::Error> {
        match conn {
            NativeConnection::Sqlite(conn) => conn.ping().await,
            other => Err(mismatched_connection(self.kind(), other)),
        }
    }

    fn stream<'c>(
        &self,
        conn: &'c mut NativeConnection,
        statement: &'c BoundStatement,
    ) -> EventStream<'c> {
        let conn = match conn {
            NativeConnection::Sqlite(conn) => conn,
            other => {
                let err = mismatched_connection(self.kind(), other);
                return stream::once(async move { Err(err) }).boxed();
            }
        };

        let events = if statement.params.is_empty() {
            conn.fetch_many(statement.sql.as_str())
        } else {
            let mut query = sqlx::query(&statement.sql);
            for param in &statement.params {
                query = bind_sqlite_param(query, param);
            }
            conn.fetch_many(query)
        };

        events
            .map(|item| {
                item.map(|either| match either {
                    Either::Left(done) => StreamEvent::Done(ExecSummary {
                        rows_affected: done.rows_affected(),
                        // The rowid is connection-wide; only trust it when this statement wrote.
                        last_insert_id: (done.rows_affected() > 0)
                            .then(|| done.last_insert_rowid()),
                    }),
                    Either::Right(row) => StreamEvent::Row(row.to_raw_row()),
                })
            })
            .boxed()
    }

    async fn execute(&self, conn: &mut NativeConnection, sql: &str) -> Result<u64, sqlx::Error> {
        match conn {
            NativeConnection::Sqlite(conn) => Ok(conn.execute(sql).await?.rows_affected()),
            other => Err(mismatched_connection(self.kind(), other)),
        }
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Anonymous
    }

    fn begin_statements(
        &self,
        isolation: Option<IsolationLevel>,
        transaction_type: Option<TransactionType>,
    ) -> DbResult<Vec<String>> {
        let mut statements = Vec::with_capacity(2);
        match isolation {
            None => {}
            Some(IsolationLevel::ReadUncommitted) => {
                statements.push("PRAGMA read_uncommitted = ON".to_string())
            }
            Some(IsolationLevel::Serializable) => {
                statements.push("PRAGMA read_uncommitted = OFF".to_string())
            }
            Some(level) => {
                return Err(DbError::invalid_input(format!(
                    "Isolation level {} is not supported by SQLite",
                    level.as_sql()
                )));
            }
        }
        let transaction_type = transaction_type.unwrap_or_default();
        statements.push(format!("BEGIN {} TRANSACTION", transaction_type.as_sql()));
        Ok(statements)
    }

    fn describe_table_sql(&self, table: &str, schema: Option<&str>) -> String {
        format!(
            "SELECT name, type, NULL AS length, \
                    CASE WHEN \"notnull\" = 0 THEN 1 ELSE 0 END AS allow_null, \
                    dflt_value AS default_value, \
                    CASE WHEN pk > 0 THEN 1 ELSE 0 END AS primary_key, \
                    CASE WHEN pk > 0 AND upper(type) = 'INTEGER' THEN 1 ELSE 0 END AS auto_increment, \
                    NULL AS comment \
             FROM pragma_table_info({}) \
             ORDER BY cid",
            self.pragma_args(table, schema)
        )
    }

    fn show_tables_sql(&self) -> String {
        "SELECT name, 'main' AS schema \
         FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' \
         ORDER BY name"
            .to_string()
    }

    fn show_indexes_sql(&self, table: &str, schema: Option<&str>) -> String {
        format!(
            "SELECT il.name AS index_name, \
                    ii.name AS column_name, \
                    il.\"unique\" AS is_unique, \
                    CASE WHEN il.origin = 'pk' THEN 1 ELSE 0 END AS is_primary, \
                    ii.seqno AS seq \
             FROM pragma_index_list({}) AS il, pragma_index_info(il.name) AS ii \
             ORDER BY il.name, ii.seqno",
            self.pragma_args(table, schema)
        )
    }

    fn foreign_keys_sql(&self, table: &str, schema: Option<&str>) -> String {
        format!(
            "SELECT 'fk_' || id AS constraint_name, \
                    {} AS table_name, \
                    \"from\" AS column_name, \
                    \"table\" AS referenced_table, \
                    \"to\" AS referenced_column \
             FROM pragma_foreign_key_list({}) \
             ORDER BY id, seq",
            self.quote_literal(table),
            self.pragma_args(table, schema)
        )
    }

    fn version_sql(&self) -> &'static str {
        "SELECT sqlite_version() AS version"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OpenMode;

    #[test]
    fn test_begin_statements_per_type() {
        assert_eq!(
            SqliteDialect.begin_statements(None, None).unwrap(),
            vec!["BEGIN DEFERRED TRANSACTION".to_string()]
        );
        assert_eq!(
            SqliteDialect
                .begin_statements(
                    Some(IsolationLevel::ReadUncommitted),
                    Some(TransactionType::Immediate)
                )
                .unwrap(),
            vec![
                "PRAGMA read_uncommitted = ON".to_string(),
                "BEGIN IMMEDIATE TRANSACTION".to_string()
            ]
        );
    }

    #[test]
    fn test_unsupported_isolation_rejected() {
        let err = SqliteDialect
            .begin_statements(Some(IsolationLevel::RepeatableRead), None)
            .unwrap_err();
        assert!(err.to_string().contains("REPEATABLE READ"));
    }

    #[tokio::test]
    async fn test_read_only_mode_refuses_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.db");
        let mut config = ConnectionConfig::sqlite_file(path.to_string_lossy());
        config.dialect_options.mode = Some(OpenMode::READ_ONLY);

        assert!(SqliteDialect.connect(&config).await.is_err());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_create_mode_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("created.db");
        let config = ConnectionConfig::sqlite_file(path.to_string_lossy());

        let conn = SqliteDialect.connect(&config).await.unwrap();
        assert!(path.exists());
        SqliteDialect.close(conn).await.unwrap();
    }
}
