//! MySQL / MariaDB dialect.

use super::{
    Dialect, EventStream, ExecSummary, NativeConnection, StreamEvent, mismatched_connection,
    with_statement_logging,
};
use crate::config::ConnectionConfig;
use crate::db::params::{BoundStatement, PlaceholderStyle, bind_mysql_param};
use crate::db::transaction::{IsolationLevel, TransactionType};
use crate::db::types::RawRowSource;
use crate::error::DbResult;
use crate::models::DialectKind;
use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use sqlx::mysql::MySqlConnectOptions;
use sqlx::{ConnectOptions, Connection, Either, Executor};

#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlDialect;

impl MySqlDialect {
    fn connect_options(config: &ConnectionConfig) -> MySqlConnectOptions {
        let mut options = MySqlConnectOptions::new().charset("utf8mb4");
        match &config.dialect_options.instance_name {
            Some(instance) => options = options.socket(instance),
            None => {
                if let Some(host) = &config.host {
                    options = options.host(host);
                }
                if let Some(port) = config.effective_port() {
                    options = options.port(port);
                }
            }
        }
        if let Some(username) = &config.username {
            options = options.username(username);
        }
        if let Some(password) = &config.password {
            options = options.password(password);
        }
        if let Some(database) = &config.database {
            options = options.database(database);
        }
        with_statement_logging(options, config.dialect_options.debug)
    }

    fn schema_condition(&self, column: &str, schema: Option<&str>) -> String {
        match schema {
            Some(schema) => format!("{} = {}", column, self.quote_literal(schema)),
            None => format!("{} = DATABASE()", column),
        }
    }
}

#[async_trait]
impl Dialect for MySqlDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::MySql
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<NativeConnection, sqlx::Error> {
        let conn = Self::connect_options(config).connect().await?;
        Ok(NativeConnection::MySql(conn))
    }

    async fn close(&self, conn: NativeConnection) -> Result<(), sqlx::Error> {
        match conn {
            NativeConnection::MySql(conn) => conn.close().await,
            other => Err(mismatched_connection(self.kind(), &other)),
        }
    }

    async fn ping(&self, conn: &mut NativeConnection) -> Result<(), sqlx::Error> {
        match conn {
            NativeConnection::MySql(conn) => conn.ping().await,
            other => Err(mismatched_connection(self.kind(), other)),
        }
    }

    fn stream<'c>(
        &self,
        conn: &'c mut NativeConnection,
        statement: &'c BoundStatement,
    ) -> EventStream<'c> {
        let conn = match conn {
            NativeConnection::MySql(conn) => conn,
            other => {
                let err = mismatched_connection(self.kind(), other);
                return stream::once(async move { Err(err) }).boxed();
            }
        };

        // Without parameters use the text protocol; some statements cannot be prepared.
        let events = if statement.params.is_empty() {
            conn.fetch_many(statement.sql.as_str())
        } else {
            let mut query = sqlx::query(&statement.sql);
            for param in &statement.params {
                query = bind_mysql_param(query, param);
            }
            conn.fetch_many(query)
        };

        events
            .map(|item| {
                item.map(|either| match either {
                    Either::Left(done) => StreamEvent::Done(ExecSummary {
                        rows_affected: done.rows_affected(),
                        last_insert_id: match done.last_insert_id() {
                            0 => None,
                            id => i64::try_from(id).ok(),
                        },
                    }),
                    Either::Right(row) => StreamEvent::Row(row.to_raw_row()),
                })
            })
            .boxed()
    }

    async fn execute(&self, conn: &mut NativeConnection, sql: &str) -> Result<u64, sqlx::Error> {
        match conn {
            NativeConnection::MySql(conn) => Ok(conn.execute(sql).await?.rows_affected()),
            other => Err(mismatched_connection(self.kind(), other)),
        }
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Anonymous
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn quote_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
    }

    fn begin_statements(
        &self,
        isolation: Option<IsolationLevel>,
        _transaction_type: Option<TransactionType>,
    ) -> DbResult<Vec<String>> {
        let mut statements = Vec::with_capacity(2);
        // Applies to the next transaction only.
        if let Some(level) = isolation {
            statements.push(format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql()));
        }
        statements.push("START TRANSACTION".to_string());
        Ok(statements)
    }

    fn describe_table_sql(&self, table: &str, schema: Option<&str>) -> String {
        format!(
            "SELECT COLUMN_NAME AS name, \
                    COLUMN_TYPE AS type, \
                    NULL AS length, \
                    IS_NULLABLE = 'YES' AS allow_null, \
                    COLUMN_DEFAULT AS default_value, \
                    COLUMN_KEY = 'PRI' AS primary_key, \
                    EXTRA LIKE '%auto_increment%' AS auto_increment, \
                    COLUMN_COMMENT AS comment \
             FROM information_schema.COLUMNS \
             WHERE {} AND TABLE_NAME = {} \
             ORDER BY ORDINAL_POSITION",
            self.schema_condition("TABLE_SCHEMA", schema),
            self.quote_literal(table)
        )
    }

    fn show_tables_sql(&self) -> String {
        "SELECT TABLE_NAME AS name, TABLE_SCHEMA AS `schema` \
         FROM information_schema.TABLES \
         WHERE TABLE_TYPE = 'BASE TABLE' AND TABLE_SCHEMA = DATABASE() \
         ORDER BY TABLE_NAME"
            .to_string()
    }

    fn show_indexes_sql(&self, table: &str, schema: Option<&str>) -> String {
        format!(
            "SELECT INDEX_NAME AS index_name, \
                    COLUMN_NAME AS column_name, \
                    NON_UNIQUE = 0 AS is_unique, \
                    INDEX_NAME = 'PRIMARY' AS is_primary, \
                    SEQ_IN_INDEX AS seq \
             FROM information_schema.STATISTICS \
             WHERE {} AND TABLE_NAME = {} \
             ORDER BY INDEX_NAME, SEQ_IN_INDEX",
            self.schema_condition("TABLE_SCHEMA", schema),
            self.quote_literal(table)
        )
    }

    fn foreign_keys_sql(&self, table: &str, schema: Option<&str>) -> String {
        format!(
            "SELECT CONSTRAINT_NAME AS constraint_name, \
                    TABLE_NAME AS table_name, \
                    COLUMN_NAME AS column_name, \
                    REFERENCED_TABLE_NAME AS referenced_table, \
                    REFERENCED_COLUMN_NAME AS referenced_column \
             FROM information_schema.KEY_COLUMN_USAGE \
             WHERE {} AND TABLE_NAME = {} \
               AND REFERENCED_TABLE_NAME IS NOT NULL \
             ORDER BY CONSTRAINT_NAME, ORDINAL_POSITION",
            self.schema_condition("TABLE_SCHEMA", schema),
            self.quote_literal(table)
        )
    }

    fn version_sql(&self) -> &'static str {
        "SELECT VERSION() AS version"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_set_before_start() {
        let statements = MySqlDialect
            .begin_statements(Some(IsolationLevel::ReadCommitted), None)
            .unwrap();
        assert_eq!(
            statements,
            vec![
                "SET TRANSACTION ISOLATION LEVEL READ COMMITTED".to_string(),
                "START TRANSACTION".to_string()
            ]
        );
    }

    #[test]
    fn test_connect_options_suppress_port_for_instance() {
        let mut config = ConnectionConfig::new(DialectKind::MySql)
            .with_host("localhost")
            .with_port(3307);
        let options = MySqlDialect::connect_options(&config);
        assert_eq!(options.get_port(), 3307);

        config.dialect_options.instance_name = Some("/var/run/mysqld/mysqld.sock".to_string());
        let options = MySqlDialect::connect_options(&config);
        assert!(options.get_socket().is_some());
    }

    #[test]
    fn test_schema_defaults_to_current_database() {
        let sql = MySqlDialect.show_indexes_sql("users", None);
        assert!(sql.contains("TABLE_SCHEMA = DATABASE()"));
        let sql = MySqlDialect.show_indexes_sql("users", Some("app"));
        assert!(sql.contains("TABLE_SCHEMA = 'app'"));
    }
}
