//! Connection-related data models.
//!
//! This module defines the dialect selector and the keys the connection pool
//! is indexed by.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Supported database dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectKind {
    Postgres,
    /// Includes MariaDB
    MySql,
    Sqlite,
}

impl DialectKind {
    /// Parse the dialect from a URL scheme.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Some(Self::Postgres),
            "mysql" | "mariadb" => Some(Self::MySql),
            "sqlite" => Some(Self::Sqlite),
            _ => None,
        }
    }

    /// Get the display name for this dialect.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Postgres => "PostgreSQL",
            Self::MySql => "MySQL",
            Self::Sqlite => "SQLite",
        }
    }

    /// Get the default port for this dialect.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::Postgres => Some(5432),
            Self::MySql => Some(3306),
            Self::Sqlite => None,
        }
    }

    pub fn is_file_backed(&self) -> bool {
        matches!(self, Self::Sqlite)
    }
}

impl std::fmt::Display for DialectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Key a pooled connection handle is stored under.
///
/// At most one live handle exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKey {
    /// Shared handle for statements outside a transaction.
    Default,
    /// The single handle of an in-memory database; every key folds into it.
    InMemory,
    /// Handle owned by one transaction.
    Transaction(Uuid),
}

impl ConnectionKey {
    pub fn transaction() -> Self {
        Self::Transaction(Uuid::new_v4())
    }

    /// Long-lived handles survive a non-forced release.
    pub fn is_long_lived(&self) -> bool {
        matches!(self, Self::Default | Self::InMemory)
    }
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::InMemory => write!(f, ":memory:"),
            Self::Transaction(id) => write!(f, "{}", id),
        }
    }
}
