//! ormbridge
//!
//! Connection pooling, transaction control and query execution for ORM
//! layers, over PostgreSQL, MySQL and SQLite.
//!
//! ```no_run
//! use ormbridge::{ConnectionConfig, Database, QueryOptions, QueryParams};
//!
//! # async fn demo() -> ormbridge::DbResult<()> {
//! let db = Database::new(ConnectionConfig::sqlite_memory())?;
//! let result = db
//!     .query("SELECT 1 AS one", &QueryParams::None, QueryOptions::default())
//!     .await?;
//! assert_eq!(result.row_count, 1);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod database;
pub mod db;
pub mod error;
pub mod models;
pub mod telemetry;

pub use config::{ConnectionConfig, DialectOptions, OpenMode, PoolOptions};
pub use database::{Database, Transaction};
pub use db::{
    ConnectionManager, IsolationLevel, QueryExecutor, ResourceLock, TransactionOptions,
    TransactionState, TransactionType, TypeDescriptor, TypeParserStore,
};
pub use error::{DbError, DbResult, ErrorKind, NativeError, ValidationErrorItem};
pub use models::{
    ConnectionKey, DialectKind, ModelDescriptor, QueryKind, QueryOptions, QueryOutput, QueryParam,
    QueryParams, ResultSet, Row,
};
