//! Query-related data models.
//!
//! This module defines parameter values, the per-call query descriptor and
//! options, and the normalized result set.

use crate::models::schema::{
    ColumnDescription, ForeignKeyRef, IndexDescription, ModelDescriptor, TableRef,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Precision used for untyped non-integral numbers.
pub const DEFAULT_DECIMAL_PRECISION: u32 = 30;

/// Scale used for untyped non-integral numbers.
pub const DEFAULT_DECIMAL_SCALE: u32 = 15;

/// A decoded row: column name → value, in column order.
pub type Row = serde_json::Map<String, JsonValue>;

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    Float(f64),
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
    /// Structured value bound as the engine's JSON type
    Json(JsonValue),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
        }
    }

    /// Wire type for a parameter the caller left untyped.
    ///
    /// Integral numbers become integers (32-bit when they fit), other numbers
    /// become a fixed-precision decimal, bytes stay binary and everything
    /// else travels as variable-length text.
    pub fn infer_wire_type(&self) -> WireType {
        match self {
            Self::Int(v) => integer_wire_type(*v),
            Self::Float(v) if is_integral(*v) => integer_wire_type(*v as i64),
            Self::Float(_) => WireType::Decimal {
                precision: DEFAULT_DECIMAL_PRECISION,
                scale: DEFAULT_DECIMAL_SCALE,
            },
            Self::Bool(_) => WireType::Bool,
            Self::Bytes(_) => WireType::Binary,
            Self::Json(_) => WireType::Json,
            Self::Null | Self::String(_) => WireType::Text,
        }
    }
}

fn is_integral(v: f64) -> bool {
    v.is_finite() && v.fract() == 0.0 && v >= i64::MIN as f64 && v < i64::MAX as f64
}

fn integer_wire_type(v: i64) -> WireType {
    if i32::try_from(v).is_ok() {
        WireType::Int
    } else {
        WireType::BigInt
    }
}

impl From<JsonValue> for QueryParam {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(s) => Self::String(s),
            other => Self::Json(other),
        }
    }
}

impl From<i64> for QueryParam {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for QueryParam {
    fn from(value: i32) -> Self {
        Self::Int(value as i64)
    }
}

impl From<f64> for QueryParam {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for QueryParam {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for QueryParam {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<u8>> for QueryParam {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Engine-level type a parameter is bound as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireType {
    Int,
    BigInt,
    Decimal { precision: u32, scale: u32 },
    Float,
    Bool,
    Text,
    Binary,
    Json,
}

/// A value with an optional caller-declared wire type.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub value: QueryParam,
    pub wire_type: Option<WireType>,
}

impl Parameter {
    pub fn typed(value: impl Into<QueryParam>, wire_type: WireType) -> Self {
        Self {
            value: value.into(),
            wire_type: Some(wire_type),
        }
    }

    /// Declared wire type, or the one inferred from the value.
    pub fn effective_wire_type(&self) -> WireType {
        self.wire_type
            .unwrap_or_else(|| self.value.infer_wire_type())
    }
}

impl From<QueryParam> for Parameter {
    fn from(value: QueryParam) -> Self {
        Self {
            value,
            wire_type: None,
        }
    }
}

macro_rules! untyped_parameter_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Parameter {
                fn from(value: $ty) -> Self {
                    Self::from(QueryParam::from(value))
                }
            }
        )*
    };
}

untyped_parameter_from!(i64, i32, f64, bool, &str, String, Vec<u8>, JsonValue);

impl<T: Into<QueryParam>> From<Option<T>> for Parameter {
    fn from(value: Option<T>) -> Self {
        Self::from(QueryParam::from(value))
    }
}

/// Parameter bag: positional, or named (`:name` / `$name` in the SQL text).
#[derive(Debug, Clone, Default, PartialEq)]
pub enum QueryParams {
    #[default]
    None,
    Positional(Vec<Parameter>),
    Named(Vec<(String, Parameter)>),
}

impl QueryParams {
    pub fn positional<I, P>(values: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Parameter>,
    {
        Self::Positional(values.into_iter().map(Into::into).collect())
    }

    pub fn named<I, K, P>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, P)>,
        K: Into<String>,
        P: Into<Parameter>,
    {
        Self::Named(
            values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::None => true,
            Self::Positional(v) => v.is_empty(),
            Self::Named(v) => v.is_empty(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Positional(v) => v.len(),
            Self::Named(v) => v.len(),
        }
    }
}

/// Shape of a query, fixed once per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Select,
    Insert,
    Update,
    Delete,
    BulkUpdate,
    BulkDelete,
    Upsert,
    Describe,
    ShowTables,
    ShowIndexes,
    ForeignKeys,
    Version,
    Call,
    Raw,
    TransactionControl,
}

impl QueryKind {
    /// Infer the kind from the leading keyword when the caller gave none.
    pub fn infer(sql: &str) -> Self {
        let upper = sql.trim_start().to_ascii_uppercase();
        let first = upper
            .split(|c: char| c.is_whitespace() || c == '(')
            .next()
            .unwrap_or("");
        match first {
            "SELECT" | "WITH" | "VALUES" => Self::Select,
            "INSERT" | "REPLACE" => Self::Insert,
            "UPDATE" => Self::Update,
            "DELETE" => Self::Delete,
            "CALL" | "EXEC" | "EXECUTE" => Self::Call,
            "DESCRIBE" | "DESC" => Self::Describe,
            "SHOW" if upper.starts_with("SHOW TABLES") => Self::ShowTables,
            "SHOW" if upper.starts_with("SHOW INDEX") || upper.starts_with("SHOW KEYS") => {
                Self::ShowIndexes
            }
            _ => Self::Raw,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Self::Insert
                | Self::Update
                | Self::Delete
                | Self::BulkUpdate
                | Self::BulkDelete
                | Self::Upsert
        )
    }
}

/// SQL text plus its parameters and kind.
#[derive(Debug, Clone)]
pub struct QueryDescriptor {
    pub sql: String,
    pub params: QueryParams,
    pub kind: QueryKind,
}

impl QueryDescriptor {
    pub fn new(sql: impl Into<String>, params: QueryParams, kind: Option<QueryKind>) -> Self {
        let sql = sql.into();
        let kind = kind.unwrap_or_else(|| QueryKind::infer(&sql));
        Self { sql, params, kind }
    }
}

/// Per-call execution options.
#[derive(Debug, Default)]
pub struct QueryOptions<'a> {
    pub kind: Option<QueryKind>,
    /// Return the first row only.
    pub plain: bool,
    /// Overrides the configured row cap.
    pub max_rows: Option<u32>,
    /// Ignore every row cap, configured or per call.
    pub unlimited_rows: bool,
    /// Overrides the configured statement timeout.
    pub timeout: Option<Duration>,
    pub model: Option<&'a ModelDescriptor>,
    /// Caller row receiving the generated id of an insert.
    pub target: Option<&'a mut Row>,
    pub cancellation: Option<CancellationToken>,
}

impl<'a> QueryOptions<'a> {
    pub fn kind(kind: QueryKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn with_plain(mut self) -> Self {
        self.plain = true;
        self
    }

    pub fn with_max_rows(mut self, max_rows: u32) -> Self {
        self.max_rows = Some(max_rows);
        self
    }

    pub fn without_row_limit(mut self) -> Self {
        self.unlimited_rows = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_model(mut self, model: &'a ModelDescriptor) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_target(mut self, target: &'a mut Row) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Outcome of an upsert, reduced from the engine's action indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertAction {
    Insert,
    Update,
}

impl UpsertAction {
    pub fn code(&self) -> u8 {
        match self {
            Self::Insert => 1,
            Self::Update => 2,
        }
    }
}

/// Kind-specific payload of a result set.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum QueryOutput {
    /// Rows are the result; see [`ResultSet::rows`].
    Rows,
    Plain(Option<Row>),
    Describe(BTreeMap<String, ColumnDescription>),
    Tables(Vec<TableRef>),
    Indexes(Vec<IndexDescription>),
    ForeignKeys(Vec<ForeignKeyRef>),
    Version(Option<String>),
    Upsert(UpsertAction),
    Affected(u64),
    /// A transaction-control statement was applied.
    Control,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultSet {
    pub kind: QueryKind,
    pub rows: Vec<Row>,
    pub row_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_id: Option<JsonValue>,
    /// The row cap stopped the stream early.
    pub truncated: bool,
    pub output: QueryOutput,
    pub execution_time_ms: u64,
}

impl ResultSet {
    /// Result of a transaction-control statement.
    pub fn control(execution_time_ms: u64) -> Self {
        Self {
            kind: QueryKind::TransactionControl,
            rows: Vec::new(),
            row_count: 0,
            rows_affected: None,
            generated_id: None,
            truncated: false,
            output: QueryOutput::Control,
            execution_time_ms,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.rows_affected.is_none()
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }
}
