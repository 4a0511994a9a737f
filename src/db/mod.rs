//! Database abstraction layer.
//!
//! This module provides the execution core:
//! - Connection handle pool and per-handle locks
//! - Per-dialect driver capabilities
//! - Statement execution, streaming and result normalization
//! - Transaction and savepoint state machine
//! - Wire-type decoder registry
//! - Driver error classification

pub mod classify;
pub mod dialect;
pub mod executor;
pub mod lock;
pub mod normalize;
pub mod params;
pub mod pool;
pub mod stream;
pub mod transaction;
pub mod type_parser;
pub mod types;

pub use classify::{ErrorContext, classify_connection_error, format_query_error};
pub use dialect::{Dialect, NativeConnection, dialect_for};
pub use executor::{ControlStatement, QueryExecutor};
pub use lock::{HandleGuard, HandleInfo, ResourceLock};
pub use pool::ConnectionManager;
pub use transaction::{
    IsolationLevel, TransactionOptions, TransactionScope, TransactionState,
    TransactionStateMachine, TransactionType,
};
pub use type_parser::{TypeDescriptor, TypeParser, TypeParserStore};
