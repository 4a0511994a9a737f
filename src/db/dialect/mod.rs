//! Engine capability layer.
//!
//! Each supported engine implements [`Dialect`] once: how to open, close and
//! probe a native connection, how to stream one statement, and the SQL
//! vocabulary the core issues itself (transaction control and introspection).
//! The implementation is picked from [`ConnectionConfig::dialect`].

mod mysql;
mod postgres;
mod sqlite;

pub use mysql::MySqlDialect;
pub use postgres::PostgresDialect;
pub use sqlite::SqliteDialect;

use crate::config::ConnectionConfig;
use crate::db::params::{BoundStatement, PlaceholderStyle};
use crate::db::transaction::{IsolationLevel, TransactionType};
use crate::db::types::RawRow;
use crate::error::DbResult;
use crate::models::DialectKind;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use sqlx::{ConnectOptions, MySqlConnection, PgConnection, SqliteConnection};
use std::sync::Arc;

/// A native engine connection.
#[derive(Debug)]
pub enum NativeConnection {
    Postgres(PgConnection),
    MySql(MySqlConnection),
    Sqlite(SqliteConnection),
}

impl NativeConnection {
    pub fn dialect(&self) -> DialectKind {
        match self {
            Self::Postgres(_) => DialectKind::Postgres,
            Self::MySql(_) => DialectKind::MySql,
            Self::Sqlite(_) => DialectKind::Sqlite,
        }
    }
}

/// Completion metadata of one statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecSummary {
    pub rows_affected: u64,
    /// Driver-reported generated id (MySQL `LAST_INSERT_ID`, SQLite rowid)
    pub last_insert_id: Option<i64>,
}

/// What a statement stream yields.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Row(RawRow),
    Done(ExecSummary),
}

pub type EventStream<'c> = BoxStream<'c, Result<StreamEvent, sqlx::Error>>;

#[async_trait]
pub trait Dialect: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> DialectKind;

    async fn connect(&self, config: &ConnectionConfig) -> Result<NativeConnection, sqlx::Error>;

    async fn close(&self, conn: NativeConnection) -> Result<(), sqlx::Error>;

    async fn ping(&self, conn: &mut NativeConnection) -> Result<(), sqlx::Error>;

    /// Rows and completion events of one statement, in engine order.
    fn stream<'c>(
        &self,
        conn: &'c mut NativeConnection,
        statement: &'c BoundStatement,
    ) -> EventStream<'c>;

    /// Run unparameterized SQL; returns rows affected.
    async fn execute(&self, conn: &mut NativeConnection, sql: &str) -> Result<u64, sqlx::Error>;

    fn placeholder_style(&self) -> PlaceholderStyle;

    fn placeholder(&self, index: usize) -> String {
        self.placeholder_style().placeholder(index)
    }

    fn default_port(&self) -> Option<u16> {
        self.kind().default_port()
    }

    /// Column an engine uses to return a generated id.
    fn insert_id_field(&self) -> &'static str {
        "id"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn quote_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    // ---- transaction vocabulary -------------------------------------------

    /// Statements opening a root transaction.
    fn begin_statements(
        &self,
        isolation: Option<IsolationLevel>,
        transaction_type: Option<TransactionType>,
    ) -> DbResult<Vec<String>>;

    fn commit_statement(&self) -> String {
        "COMMIT".to_string()
    }

    fn rollback_statement(&self) -> String {
        "ROLLBACK".to_string()
    }

    fn savepoint_statement(&self, name: &str) -> String {
        format!("SAVEPOINT {}", name)
    }

    fn release_savepoint_statement(&self, name: &str) -> String {
        format!("RELEASE SAVEPOINT {}", name)
    }

    fn rollback_to_savepoint_statement(&self, name: &str) -> String {
        format!("ROLLBACK TO SAVEPOINT {}", name)
    }

    // ---- introspection ------------------------------------------------------
    //
    // Result columns are canonical so normalization is dialect-free:
    // describe: name, type, length, allow_null, default_value, primary_key, auto_increment, comment
    // tables: name, schema
    // indexes: index_name, column_name, is_unique, is_primary, seq
    // foreign keys: constraint_name, table_name, column_name, referenced_table, referenced_column
    // version: version

    fn describe_table_sql(&self, table: &str, schema: Option<&str>) -> String;

    fn show_tables_sql(&self) -> String;

    fn show_indexes_sql(&self, table: &str, schema: Option<&str>) -> String;

    fn foreign_keys_sql(&self, table: &str, schema: Option<&str>) -> String;

    fn version_sql(&self) -> &'static str;
}

/// Pick the dialect implementation for a config.
pub fn dialect_for(kind: DialectKind) -> Arc<dyn Dialect> {
    match kind {
        DialectKind::Postgres => Arc::new(PostgresDialect),
        DialectKind::MySql => Arc::new(MySqlDialect),
        DialectKind::Sqlite => Arc::new(SqliteDialect),
    }
}

/// Driver statement logging: the protocol trace `debug` asks for.
pub(crate) fn with_statement_logging<O: ConnectOptions>(options: O, debug: bool) -> O {
    if debug {
        options.log_statements(log::LevelFilter::Info)
    } else {
        options.disable_statement_logging()
    }
}

pub(crate) fn mismatched_connection(expected: DialectKind, found: &NativeConnection) -> sqlx::Error {
    sqlx::Error::Protocol(format!(
        "{} dialect received a {} connection",
        expected,
        found.dialect()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_for_selects_kind() {
        for kind in [DialectKind::Postgres, DialectKind::MySql, DialectKind::Sqlite] {
            assert_eq!(dialect_for(kind).kind(), kind);
        }
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(dialect_for(DialectKind::Postgres).placeholder(3), "$3");
        assert_eq!(dialect_for(DialectKind::MySql).placeholder(3), "?");
        assert_eq!(dialect_for(DialectKind::Sqlite).placeholder(1), "?");
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(dialect_for(DialectKind::Postgres).default_port(), Some(5432));
        assert_eq!(dialect_for(DialectKind::MySql).default_port(), Some(3306));
        assert_eq!(dialect_for(DialectKind::Sqlite).default_port(), None);
    }

    #[test]
    fn test_savepoint_vocabulary() {
        let dialect = dialect_for(DialectKind::Postgres);
        assert_eq!(dialect.savepoint_statement("sp_1"), "SAVEPOINT sp_1");
        assert_eq!(
            dialect.rollback_to_savepoint_statement("sp_1"),
            "ROLLBACK TO SAVEPOINT sp_1"
        );
        assert_eq!(
            dialect.release_savepoint_statement("sp_1"),
            "RELEASE SAVEPOINT sp_1"
        );
    }

    #[test]
    fn test_quote_literal_escapes() {
        let dialect = dialect_for(DialectKind::Sqlite);
        assert_eq!(dialect.quote_literal("o'brien"), "'o''brien'");
        let mysql = dialect_for(DialectKind::MySql);
        assert_eq!(mysql.quote_literal("a\\'b"), "'a\\\\''b'");
        assert_eq!(mysql.quote_identifier("order"), "`order`");
    }
}
