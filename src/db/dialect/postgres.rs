//! PostgreSQL dialect.

use super::{
    Dialect, EventStream, ExecSummary, NativeConnection, StreamEvent, mismatched_connection,
    with_statement_logging,
};
use crate::config::ConnectionConfig;
use crate::db::params::{BoundStatement, PlaceholderStyle, bind_postgres_param};
use crate::db::transaction::{IsolationLevel, TransactionType};
use crate::db::types::RawRowSource;
use crate::error::DbResult;
use crate::models::DialectKind;
use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use sqlx::postgres::PgConnectOptions;
use sqlx::{ConnectOptions, Connection, Either, Executor};

#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresDialect;

impl PostgresDialect {
    fn connect_options(config: &ConnectionConfig) -> PgConnectOptions {
        let mut options = PgConnectOptions::new();
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

    fn schema_literal(&self, schema: Option<&str>) -> String {
        self.quote_literal(schema.unwrap_or("public"))
    }
}

#[async_trait]
impl Dialect for PostgresDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Postgres
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<NativeConnection, sqlx::Error> {
        let conn = Self::connect_options(config).connect().await?;
        Ok(NativeConnection::Postgres(conn))
    }

    async fn close(&self, conn: NativeConnection) -> Result<(), sqlx::Error> {
        match conn {
            NativeConnection::Postgres(conn) => conn.close().await,
            other => Err(mismatched_connection(self.kind(), &other)),
        }
    }

    async fn ping(&self, conn: &mut NativeConnection) -> Result<(), sqlx::Error> {
        match conn {
            NativeConnection::Postgres(conn) => conn.ping().await,
            other => Err(mismatched_connection(self.kind(), other)),
        }
    }

    fn stream<'c>(
        &self,
        conn: &'c mut NativeConnection,
        statement: &'c BoundStatement,
    ) -> EventStream<'c> {
        let conn = match conn {
            NativeConnection::Postgres(conn) => conn,
            other => {
                let err = mismatched_connection(self.kind(), other);
                return stream::once(async move { Err(err) }).boxed();
            }
        };

        // Without parameters use the simple protocol, which also accepts
        // multi-statement scripts.
        let events = if statement.params.is_empty() {
            conn.fetch_many(statement.sql.as_str())
        } else {
            let mut query = sqlx::query(&statement.sql);
            for param in &statement.params {
                query = bind_postgres_param(query, param);
            }
            conn.fetch_many(query)
        };

        events
            .map(|item| {
                item.map(|either| match either {
                    Either::Left(done) => StreamEvent::Done(ExecSummary {
                        rows_affected: done.rows_affected(),
                        last_insert_id: None,
                    }),
                    Either::Right(row) => StreamEvent::Row(row.to_raw_row()),
                })
            })
            .boxed()
    }

    async fn execute(&self, conn: &mut NativeConnection, sql: &str) -> Result<u64, sqlx::Error> {
        match conn {
            NativeConnection::Postgres(conn) => Ok(conn.execute(sql).await?.rows_affected()),
            other => Err(mismatched_connection(self.kind(), other)),
        }
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Numbered
    }

    fn begin_statements(
        &self,
        isolation: Option<IsolationLevel>,
        _transaction_type: Option<TransactionType>,
    ) -> DbResult<Vec<String>> {
        Ok(vec![match isolation {
            Some(level) => format!("BEGIN TRANSACTION ISOLATION LEVEL {}", level.as_sql()),
            None => "BEGIN".to_string(),
        }])
    }

    fn describe_table_sql(&self, table: &str, schema: Option<&str>) -> String {
        format!(
            "SELECT c.column_name::text AS name, \
                    c.data_type::text AS type, \
                    c.character_maximum_length::int AS length, \
                    (c.is_nullable = 'YES') AS allow_null, \
                    c.column_default::text AS default_value, \
                    EXISTS ( \
                        SELECT 1 FROM information_schema.table_constraints tc \
                        JOIN information_schema.key_column_usage kcu \
                          ON tc.constraint_name = kcu.constraint_name \
                         AND tc.table_schema = kcu.table_schema \
                        WHERE tc.constraint_type = 'PRIMARY KEY' \
                          AND tc.table_schema = c.table_schema \
                          AND tc.table_name = c.table_name \
                          AND kcu.column_name = c.column_name \
                    ) AS primary_key, \
                    (c.is_identity = 'YES' OR COALESCE(c.column_default, '') LIKE 'nextval(%') AS auto_increment, \
                    col_description(format('%I.%I', c.table_schema, c.table_name)::regclass, c.ordinal_position::int)::text AS comment \
             FROM information_schema.columns c \
             WHERE c.table_schema = {} AND c.table_name = {} \
             ORDER BY c.ordinal_position",
            self.schema_literal(schema),
            self.quote_literal(table)
        )
    }

    fn show_tables_sql(&self) -> String {
        "SELECT table_name::text AS name, table_schema::text AS schema \
         FROM information_schema.tables \
         WHERE table_type = 'BASE TABLE' \
           AND table_schema NOT IN ('pg_catalog', 'information_schema') \
         ORDER BY table_schema, table_name"
            .to_string()
    }

    fn show_indexes_sql(&self, table: &str, schema: Option<&str>) -> String {
        format!(
            "SELECT i.relname::text AS index_name, \
                    a.attname::text AS column_name, \
                    ix.indisunique AS is_unique, \
                    ix.indisprimary AS is_primary, \
                    array_position(ix.indkey::int2[], a.attnum)::int AS seq \
             FROM pg_index ix \
             JOIN pg_class i ON i.oid = ix.indexrelid \
             JOIN pg_class t ON t.oid = ix.indrelid \
             JOIN pg_namespace n ON n.oid = t.relnamespace \
             JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey) \
             WHERE n.nspname = {} AND t.relname = {} \
             ORDER BY i.relname, seq",
            self.schema_literal(schema),
            self.quote_literal(table)
        )
    }

    fn foreign_keys_sql(&self, table: &str, schema: Option<&str>) -> String {
        format!(
            "SELECT tc.constraint_name::text AS constraint_name, \
                    tc.table_name::text AS table_name, \
                    kcu.column_name::text AS column_name, \
                    ccu.table_name::text AS referenced_table, \
                    ccu.column_name::text AS referenced_column \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
               ON tc.constraint_name = kcu.constraint_name \
              AND tc.table_schema = kcu.table_schema \
             JOIN information_schema.constraint_column_usage ccu \
               ON ccu.constraint_name = tc.constraint_name \
              AND ccu.table_schema = tc.table_schema \
             WHERE tc.constraint_type = 'FOREIGN KEY' \
               AND tc.table_schema = {} AND tc.table_name = {} \
             ORDER BY tc.constraint_name, kcu.ordinal_position",
            self.schema_literal(schema),
            self.quote_literal(table)
        )
    }

    fn version_sql(&self) -> &'static str {
        "SELECT current_setting('server_version') AS version"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_name_used_as_socket() {
        let mut config = ConnectionConfig::new(DialectKind::Postgres).with_host("ignored");
        config.dialect_options.instance_name = Some("/var/run/postgresql".to_string());
        let options = PostgresDialect::connect_options(&config);
        assert_eq!(
            options.get_socket().map(|p| p.to_string_lossy().into_owned()),
            Some("/var/run/postgresql".to_string())
        );
    }

    #[test]
    fn test_connect_options_from_config() {
        let config = ConnectionConfig::new(DialectKind::Postgres)
            .with_host("db.internal")
            .with_database("orders")
            .with_credentials("app", "secret");
        let options = PostgresDialect::connect_options(&config);
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 5432);
        assert_eq!(options.get_database(), Some("orders"));
        assert_eq!(options.get_username(), "app");
    }

    #[test]
    fn test_begin_with_isolation() {
        let statements = PostgresDialect
            .begin_statements(Some(IsolationLevel::Serializable), None)
            .unwrap();
        assert_eq!(
            statements,
            vec!["BEGIN TRANSACTION ISOLATION LEVEL SERIALIZABLE".to_string()]
        );
        assert_eq!(
            PostgresDialect.begin_statements(None, None).unwrap(),
            vec!["BEGIN".to_string()]
        );
    }

    #[test]
    fn test_introspection_quotes_table() {
        let sql = PostgresDialect.describe_table_sql("o'rders", None);
        assert!(sql.contains("c.table_name = 'o''rders'"));
        assert!(sql.contains("c.table_schema = 'public'"));
    }
}
