//! Error types for the execution core.
//!
//! This module defines all error types using `thiserror`. Connection-phase
//! failures are sorted into the connection family when a handle is acquired;
//! query-phase failures are sorted into the constraint family from the engine
//! message (see [`crate::db::classify`]). Anything unrecognised stays a generic
//! [`DbError::Database`] carrying the driver error untouched.

use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Driver error captured as-is, independent of the driver crate's own types.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeError {
    /// Engine or OS error code (SQLSTATE, MySQL error number, SQLite extended
    /// code, or an errno-style name such as `ECONNREFUSED`).
    pub code: Option<String>,
    pub message: String,
    /// Secondary engine message, e.g. PostgreSQL's `DETAIL` line.
    pub detail: Option<String>,
    pub constraint: Option<String>,
    pub table: Option<String>,
}

impl NativeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Capture a `sqlx` error without losing its code or detail.
    pub fn from_sqlx(err: &sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(io) => {
                let mut native = Self::new(io.to_string());
                native.code = io_error_code(io.kind()).map(String::from);
                native
            }
            sqlx::Error::Configuration(e) => Self::new(e.to_string()).with_code("EINVAL"),
            sqlx::Error::Tls(e) => Self::new(format!("TLS error: {}", e)),
            sqlx::Error::PoolTimedOut => Self::new(err.to_string()).with_code("ETIMEDOUT"),
            sqlx::Error::Database(db_err) => {
                let mut native = Self::new(db_err.message());
                native.code = database_code(&**db_err);
                native.constraint = db_err.constraint().map(String::from);
                native.table = db_err.table().map(String::from);
                if let Some(pg) = db_err.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
                    native.detail = pg.detail().map(String::from);
                }
                native
            }
            other => Self::new(other.to_string()),
        }
    }

    /// True for failures meaning the peer dropped the socket under us.
    pub fn is_socket_reset(&self) -> bool {
        matches!(
            self.code.as_deref(),
            Some("ECONNRESET" | "ECONNABORTED" | "EPIPE" | "ESOCKET")
        ) || {
            let lower = self.message.to_lowercase();
            lower.contains("connection reset")
                || lower.contains("broken pipe")
                || lower.contains("connection closed")
        }
    }
}

/// MySQL reports its error number; `code()` there is only the SQLSTATE.
fn database_code(db_err: &dyn sqlx::error::DatabaseError) -> Option<String> {
    if let Some(mysql) = db_err.try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>() {
        return Some(mysql.number().to_string());
    }
    db_err.code().map(|c| c.into_owned())
}

impl std::fmt::Display for NativeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} (code: {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for NativeError {}

/// Map an I/O error kind onto the errno-style names the classification
/// tables are keyed by.
fn io_error_code(kind: std::io::ErrorKind) -> Option<&'static str> {
    use std::io::ErrorKind;
    let code = match kind {
        ErrorKind::ConnectionRefused => "ECONNREFUSED",
        ErrorKind::ConnectionReset | ErrorKind::UnexpectedEof => "ECONNRESET",
        ErrorKind::ConnectionAborted => "ECONNABORTED",
        ErrorKind::BrokenPipe => "EPIPE",
        ErrorKind::TimedOut => "ETIMEDOUT",
        ErrorKind::HostUnreachable => "EHOSTUNREACH",
        ErrorKind::NetworkUnreachable => "ENETUNREACH",
        ErrorKind::NetworkDown => "ENETDOWN",
        ErrorKind::AddrNotAvailable => "EADDRNOTAVAIL",
        ErrorKind::PermissionDenied => "EACCES",
        ErrorKind::InvalidInput => "EINVAL",
        ErrorKind::NotFound => "ENOENT",
        _ => return None,
    };
    Some(code)
}

/// One offending field of a constraint violation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationErrorItem {
    pub message: String,
    /// e.g. "unique violation"
    pub kind: String,
    pub field: String,
    pub value: JsonValue,
}

impl ValidationErrorItem {
    pub fn unique_violation(field: impl Into<String>, value: JsonValue) -> Self {
        let field = field.into();
        Self {
            message: format!("{} must be unique", field),
            kind: "unique violation".to_string(),
            field,
            value,
        }
    }
}

/// Semantic error kind, stable across dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    HostNotReachable,
    HostNotFound,
    ConnectionRefused,
    AccessDenied,
    InvalidConnection,
    UniqueConstraint,
    ForeignKeyConstraint,
    UnknownConstraint,
    Database,
    Transaction,
    Timeout,
    Cancelled,
    InvalidInput,
    Internal,
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connection => "ConnectionError",
            Self::HostNotReachable => "HostNotReachableError",
            Self::HostNotFound => "HostNotFoundError",
            Self::ConnectionRefused => "ConnectionRefusedError",
            Self::AccessDenied => "AccessDeniedError",
            Self::InvalidConnection => "InvalidConnectionError",
            Self::UniqueConstraint => "UniqueConstraintError",
            Self::ForeignKeyConstraint => "ForeignKeyConstraintError",
            Self::UnknownConstraint => "UnknownConstraintError",
            Self::Database => "DatabaseError",
            Self::Transaction => "TransactionError",
            Self::Timeout => "TimeoutError",
            Self::Cancelled => "CancelledError",
            Self::InvalidInput => "InvalidInputError",
            Self::Internal => "InternalError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection {
        message: String,
        #[source]
        native: Option<NativeError>,
    },

    #[error("Host not reachable: {message}")]
    HostNotReachable {
        message: String,
        #[source]
        native: Option<NativeError>,
    },

    #[error("Host not found: {message}")]
    HostNotFound {
        message: String,
        #[source]
        native: Option<NativeError>,
    },

    #[error("Connection refused: {message}")]
    ConnectionRefused {
        message: String,
        #[source]
        native: Option<NativeError>,
    },

    #[error("Access denied: {message}")]
    AccessDenied {
        message: String,
        #[source]
        native: Option<NativeError>,
    },

    #[error("Invalid connection: {message}")]
    InvalidConnection {
        message: String,
        #[source]
        native: Option<NativeError>,
    },

    #[error("{message}")]
    UniqueConstraint {
        message: String,
        constraint: Option<String>,
        /// Offending field → value, in field order.
        fields: serde_json::Map<String, JsonValue>,
        errors: Vec<ValidationErrorItem>,
        sql: Option<String>,
        #[source]
        native: NativeError,
    },

    #[error("Foreign key constraint violated: {message}")]
    ForeignKeyConstraint {
        message: String,
        constraint: Option<String>,
        table: Option<String>,
        fields: Vec<String>,
        sql: Option<String>,
        #[source]
        native: NativeError,
    },

    #[error("Unknown constraint: {message}")]
    UnknownConstraint {
        message: String,
        constraint: Option<String>,
        table: Option<String>,
        sql: Option<String>,
        #[source]
        native: NativeError,
    },

    #[error("Database error: {message}")]
    Database {
        message: String,
        sql: Option<String>,
        #[source]
        native: NativeError,
    },

    #[error("Transaction error: {message} (scope: {name})")]
    Transaction { message: String, name: String },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a generic connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            native: None,
        }
    }

    /// Create an invalid-connection error (malformed parameters).
    pub fn invalid_connection(message: impl Into<String>) -> Self {
        Self::InvalidConnection {
            message: message.into(),
            native: None,
        }
    }

    /// Wrap a driver error as the generic catch-all.
    pub fn database(native: NativeError, sql: Option<String>) -> Self {
        Self::Database {
            message: native.message.clone(),
            sql,
            native,
        }
    }

    /// Create a transaction state error.
    pub fn transaction(message: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            name: name.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } => ErrorKind::Connection,
            Self::HostNotReachable { .. } => ErrorKind::HostNotReachable,
            Self::HostNotFound { .. } => ErrorKind::HostNotFound,
            Self::ConnectionRefused { .. } => ErrorKind::ConnectionRefused,
            Self::AccessDenied { .. } => ErrorKind::AccessDenied,
            Self::InvalidConnection { .. } => ErrorKind::InvalidConnection,
            Self::UniqueConstraint { .. } => ErrorKind::UniqueConstraint,
            Self::ForeignKeyConstraint { .. } => ErrorKind::ForeignKeyConstraint,
            Self::UnknownConstraint { .. } => ErrorKind::UnknownConstraint,
            Self::Database { .. } => ErrorKind::Database,
            Self::Transaction { .. } => ErrorKind::Transaction,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Every connection-phase error, base kind included.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Connection
                | ErrorKind::HostNotReachable
                | ErrorKind::HostNotFound
                | ErrorKind::ConnectionRefused
                | ErrorKind::AccessDenied
                | ErrorKind::InvalidConnection
        )
    }

    pub fn is_constraint_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::UniqueConstraint
                | ErrorKind::ForeignKeyConstraint
                | ErrorKind::UnknownConstraint
        )
    }

    /// Hint for callers that own a retry policy; this layer never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Connection
                | ErrorKind::HostNotReachable
                | ErrorKind::ConnectionRefused
                | ErrorKind::Timeout
        )
    }

    /// The driver error behind this one, if any.
    pub fn native(&self) -> Option<&NativeError> {
        match self {
            Self::Connection { native, .. }
            | Self::HostNotReachable { native, .. }
            | Self::HostNotFound { native, .. }
            | Self::ConnectionRefused { native, .. }
            | Self::AccessDenied { native, .. }
            | Self::InvalidConnection { native, .. } => native.as_ref(),
            Self::UniqueConstraint { native, .. }
            | Self::ForeignKeyConstraint { native, .. }
            | Self::UnknownConstraint { native, .. }
            | Self::Database { native, .. } => Some(native),
            _ => None,
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
