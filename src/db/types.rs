//! Raw row extraction and wire-type classification.
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies a column's wire type into a logical category
//! 2. Dialect-specific decoders pull the value out of the driver row
//!
//! The result is a [`RawRow`]: driver values as JSON, each tagged with the
//! column's wire-type id so the type-parser registry can post-process it.

use crate::models::DialectKind;
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueFormat, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row, Type, TypeInfo, ValueRef};
use std::sync::Arc;

/// Name and wire-type id of one result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    /// Upper-cased engine type name, the key type parsers are registered under
    pub type_id: String,
}

/// One undecoded result row.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub columns: Arc<[ColumnInfo]>,
    pub values: Vec<JsonValue>,
}

impl RawRow {
    pub fn new(columns: Vec<ColumnInfo>, values: Vec<JsonValue>) -> Self {
        Self {
            columns: columns.into(),
            values,
        }
    }
}

/// Extraction of a [`RawRow`] from a driver row.
pub trait RawRowSource {
    fn to_raw_row(&self) -> RawRow;
}

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Unknown,
}

/// Classify a wire type name into a logical category.
pub fn categorize_type(type_name: &str, dialect: DialectKind) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Decimal/Numeric - check first as it overlaps with "numeric" in float checks
    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC is actually a float
        if dialect == DialectKind::Sqlite && lower == "numeric" {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    if lower == "interval" {
        return TypeCategory::Unknown;
    }

    if lower.contains("int") || lower.contains("serial") || lower == "year" {
        return TypeCategory::Integer;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    if lower.contains("float")
        || lower.contains("double")
        || lower == "real"
        || lower == "float4"
        || lower == "float8"
    {
        return TypeCategory::Float;
    }

    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    if lower == "uuid" {
        return TypeCategory::Uuid;
    }

    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    match lower.as_str() {
        "date" => return TypeCategory::Date,
        "time" => return TypeCategory::Time,
        "timestamptz" => return TypeCategory::TimestampTz,
        "timestamp" if dialect == DialectKind::MySql => return TypeCategory::TimestampTz,
        "timestamp" | "datetime" => return TypeCategory::Timestamp,
        _ => {}
    }

    if lower.contains("char") || lower.contains("text") || lower == "name" {
        return TypeCategory::Text;
    }

    TypeCategory::Unknown
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Wrapper type for raw DECIMAL/NUMERIC values as strings.
/// This preserves the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <rust_decimal::Decimal as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        match value.format() {
            PgValueFormat::Binary => Ok(RawDecimal(render_pg_numeric(value.as_bytes()?)?)),
            PgValueFormat::Text => Ok(RawDecimal(value.as_str()?.to_string())),
        }
    }
}

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Render a binary PostgreSQL NUMERIC as decimal text without losing digits.
///
/// Layout: `ndigits`, `weight`, `sign`, `dscale` (2 bytes each, big endian)
/// followed by `ndigits` base-10000 groups, most significant first. The
/// first group is worth `10000^weight`.
pub(crate) fn render_pg_numeric(bytes: &[u8]) -> Result<String, String> {
    let word = |at: usize| -> Result<u16, String> {
        bytes
            .get(at..at + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| "Invalid NUMERIC binary format: truncated".to_string())
    };

    let ndigits = word(0)? as usize;
    let weight = i64::from(word(2)? as i16);
    let sign = word(4)?;
    let dscale = word(6)? as usize;

    let negative = match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        NUMERIC_POS => false,
        NUMERIC_NEG => true,
        other => return Err(format!("Invalid NUMERIC sign: {:#06x}", other)),
    };

    let digits = (0..ndigits)
        .map(|k| word(8 + 2 * k))
        .collect::<Result<Vec<u16>, String>>()?;
    let group = |exp: i64| -> u16 {
        usize::try_from(weight - exp)
            .ok()
            .and_then(|k| digits.get(k).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&group(weight).to_string());
        for exp in (0..weight).rev() {
            out.push_str(&format!("{:04}", group(exp)));
        }
    }

    if dscale > 0 {
        let groups = dscale.div_ceil(4) as i64;
        let fraction: String = (1..=groups)
            .map(|n| format!("{:04}", group(-n)))
            .collect();
        out.push('.');
        out.push_str(&fraction[..dscale]);
    }
    Ok(out)
}

// =============================================================================
// Binary Encoding
// =============================================================================

/// Encode binary column data as base64 text.
pub fn encode_binary_value(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    JsonValue::String(STANDARD.encode(bytes))
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

// =============================================================================
// Row Sources
// =============================================================================

impl RawRowSource for MySqlRow {
    fn to_raw_row(&self) -> RawRow {
        let mut columns = Vec::with_capacity(self.len());
        let mut values = Vec::with_capacity(self.len());
        for (idx, col) in self.columns().iter().enumerate() {
            let type_name = col.type_info().name();
            let category = categorize_type(type_name, DialectKind::MySql);
            values.push(mysql::decode_column(self, idx, type_name, category));
            columns.push(ColumnInfo {
                name: col.name().to_string(),
                type_id: type_name.to_ascii_uppercase(),
            });
        }
        RawRow::new(columns, values)
    }
}

impl RawRowSource for PgRow {
    fn to_raw_row(&self) -> RawRow {
        let mut columns = Vec::with_capacity(self.len());
        let mut values = Vec::with_capacity(self.len());
        for (idx, col) in self.columns().iter().enumerate() {
            let type_name = col.type_info().name();
            let category = categorize_type(type_name, DialectKind::Postgres);
            values.push(postgres::decode_column(self, idx, type_name, category));
            columns.push(ColumnInfo {
                name: col.name().to_string(),
                type_id: type_name.to_ascii_uppercase(),
            });
        }
        RawRow::new(columns, values)
    }
}

impl RawRowSource for SqliteRow {
    fn to_raw_row(&self) -> RawRow {
        let mut columns = Vec::with_capacity(self.len());
        let mut values = Vec::with_capacity(self.len());
        for (idx, col) in self.columns().iter().enumerate() {
            let declared = col.type_info();
            let (value, runtime_type) = sqlite::decode_column(self, idx, declared.name());
            // Expression columns have no declared type; fall back to the storage class.
            let type_id = if declared.is_null() {
                runtime_type
            } else {
                declared.name().to_ascii_uppercase()
            };
            values.push(value);
            columns.push(ColumnInfo {
                name: col.name().to_string(),
                type_id,
            });
        }
        RawRow::new(columns, values)
    }
}

// =============================================================================
// Database-Specific Decoders
// =============================================================================

mod mysql {
    use super::*;

    pub fn decode_column(
        row: &MySqlRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> JsonValue {
        match category {
            TypeCategory::Decimal => decode_decimal(row, idx),
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => decode_boolean(row, idx),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Binary => decode_binary_col(row, idx),
            TypeCategory::Json => decode_json(row, idx),
            TypeCategory::Date => decode_with(row, idx, |d: chrono::NaiveDate| d.to_string()),
            TypeCategory::Time => decode_with(row, idx, |t: chrono::NaiveTime| t.to_string()),
            TypeCategory::Timestamp => {
                decode_with(row, idx, |t: chrono::NaiveDateTime| t.to_string())
            }
            TypeCategory::TimestampTz => decode_with(row, idx, |t: chrono::DateTime<chrono::Utc>| {
                t.to_rfc3339()
            }),
            _ => decode_text(row, idx, type_name),
        }
    }

    fn decode_with<T, F>(row: &MySqlRow, idx: usize, render: F) -> JsonValue
    where
        T: for<'r> Decode<'r, sqlx::MySql> + Type<sqlx::MySql>,
        F: Fn(T) -> String,
    {
        match row.try_get::<Option<T>, _>(idx) {
            Ok(Some(v)) => JsonValue::String(render(v)),
            Ok(None) => JsonValue::Null,
            Err(_) => decode_text(row, idx, ""),
        }
    }

    fn decode_decimal(row: &MySqlRow, idx: usize) -> JsonValue {
        match row.try_get::<Option<RawDecimal>, _>(idx) {
            Ok(Some(v)) => JsonValue::String(v.0),
            Ok(None) => JsonValue::Null,
            Err(e) => {
                tracing::error!("Failed to decode DECIMAL: {:?}", e);
                JsonValue::Null
            }
        }
    }

    fn decode_integer(row: &MySqlRow, idx: usize) -> JsonValue {
        if let Ok(None) = row.try_get::<Option<i64>, _>(idx) {
            return JsonValue::Null;
        }
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<u64>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<u32>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i16>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<u16>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i8>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<u8>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        JsonValue::Null
    }

    fn decode_boolean(row: &MySqlRow, idx: usize) -> JsonValue {
        row.try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::Bool)
            .unwrap_or(JsonValue::Null)
    }

    fn decode_float(row: &MySqlRow, idx: usize) -> JsonValue {
        if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
            return float_value(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<f32>, _>(idx) {
            return float_value(v as f64);
        }
        JsonValue::Null
    }

    fn decode_binary_col(row: &MySqlRow, idx: usize) -> JsonValue {
        row.try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(|v| encode_binary_value(&v))
            .unwrap_or(JsonValue::Null)
    }

    fn decode_json(row: &MySqlRow, idx: usize) -> JsonValue {
        row.try_get::<Option<serde_json::Value>, _>(idx)
            .ok()
            .flatten()
            .unwrap_or(JsonValue::Null)
    }

    fn decode_text(row: &MySqlRow, idx: usize, type_name: &str) -> JsonValue {
        match row.try_get::<Option<String>, _>(idx) {
            Ok(Some(v)) => JsonValue::String(v),
            Ok(None) => JsonValue::Null,
            Err(_) => {
                // Columns reported with a text-incompatible type still carry bytes.
                match row.try_get_unchecked::<Option<Vec<u8>>, _>(idx) {
                    Ok(Some(bytes)) => JsonValue::String(String::from_utf8_lossy(&bytes).into_owned()),
                    _ => {
                        tracing::debug!(column = idx, type_name, "Unsupported MySQL column type");
                        JsonValue::Null
                    }
                }
            }
        }
    }
}

mod postgres {
    use super::*;

    pub fn decode_column(
        row: &PgRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> JsonValue {
        match category {
            TypeCategory::Decimal => decode_decimal(row, idx),
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => decode_boolean(row, idx),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Binary => decode_binary_col(row, idx),
            TypeCategory::Json => decode_json(row, idx),
            TypeCategory::Uuid => decode_with(row, idx, |u: uuid::Uuid| u.to_string()),
            TypeCategory::Date => decode_with(row, idx, |d: chrono::NaiveDate| d.to_string()),
            TypeCategory::Time => decode_with(row, idx, |t: chrono::NaiveTime| t.to_string()),
            TypeCategory::Timestamp => {
                decode_with(row, idx, |t: chrono::NaiveDateTime| t.to_string())
            }
            TypeCategory::TimestampTz => decode_with(row, idx, |t: chrono::DateTime<chrono::Utc>| {
                t.to_rfc3339()
            }),
            _ => decode_text(row, idx, type_name),
        }
    }

    fn decode_with<T, F>(row: &PgRow, idx: usize, render: F) -> JsonValue
    where
        T: for<'r> Decode<'r, sqlx::Postgres> + Type<sqlx::Postgres>,
        F: Fn(T) -> String,
    {
        match row.try_get::<Option<T>, _>(idx) {
            Ok(Some(v)) => JsonValue::String(render(v)),
            Ok(None) => JsonValue::Null,
            Err(e) => {
                tracing::error!("Failed to decode column {}: {:?}", idx, e);
                JsonValue::Null
            }
        }
    }

    fn decode_decimal(row: &PgRow, idx: usize) -> JsonValue {
        match row.try_get::<Option<RawDecimal>, _>(idx) {
            Ok(Some(v)) => JsonValue::String(v.0),
            Ok(None) => JsonValue::Null,
            Err(e) => {
                tracing::error!("Failed to decode NUMERIC: {:?}", e);
                JsonValue::Null
            }
        }
    }

    fn decode_integer(row: &PgRow, idx: usize) -> JsonValue {
        if let Ok(None) = row.try_get::<Option<i64>, _>(idx) {
            return JsonValue::Null;
        }
        if let Ok(Some(v)) = row.try_get::<Option<i16>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        JsonValue::Null
    }

    fn decode_boolean(row: &PgRow, idx: usize) -> JsonValue {
        row.try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::Bool)
            .unwrap_or(JsonValue::Null)
    }

    fn decode_float(row: &PgRow, idx: usize) -> JsonValue {
        if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
            return float_value(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<f32>, _>(idx) {
            return float_value(v as f64);
        }
        JsonValue::Null
    }

    fn decode_binary_col(row: &PgRow, idx: usize) -> JsonValue {
        row.try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(|v| encode_binary_value(&v))
            .unwrap_or(JsonValue::Null)
    }

    fn decode_json(row: &PgRow, idx: usize) -> JsonValue {
        row.try_get::<Option<serde_json::Value>, _>(idx)
            .ok()
            .flatten()
            .unwrap_or(JsonValue::Null)
    }

    fn decode_text(row: &PgRow, idx: usize, type_name: &str) -> JsonValue {
        match row.try_get::<Option<String>, _>(idx) {
            Ok(Some(v)) => JsonValue::String(v),
            Ok(None) => JsonValue::Null,
            Err(_) => {
                tracing::debug!(column = idx, type_name, "Unsupported PostgreSQL column type");
                JsonValue::Null
            }
        }
    }
}

mod sqlite {
    use super::*;

    /// Decode by storage class; returns the value and the storage class name.
    pub fn decode_column(row: &SqliteRow, idx: usize, declared: &str) -> (JsonValue, String) {
        let runtime = match row.try_get_raw(idx) {
            Ok(raw) if raw.is_null() => return (JsonValue::Null, "NULL".to_string()),
            Ok(raw) => raw.type_info().name().to_ascii_uppercase(),
            Err(_) => return (JsonValue::Null, "NULL".to_string()),
        };

        let value = match runtime.as_str() {
            "INTEGER" => match row.try_get::<i64, _>(idx) {
                Ok(v) if categorize_type(declared, DialectKind::Sqlite) == TypeCategory::Boolean => {
                    JsonValue::Bool(v != 0)
                }
                Ok(v) => JsonValue::Number(v.into()),
                Err(_) => JsonValue::Null,
            },
            "REAL" => row
                .try_get::<f64, _>(idx)
                .map(float_value)
                .unwrap_or(JsonValue::Null),
            "BLOB" => row
                .try_get::<Vec<u8>, _>(idx)
                .map(|v| encode_binary_value(&v))
                .unwrap_or(JsonValue::Null),
            _ => row
                .try_get::<String, _>(idx)
                .map(JsonValue::String)
                .unwrap_or(JsonValue::Null),
        };
        (value, runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric(weight: i16, sign: u16, dscale: u16, digits: &[u16]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(digits.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&weight.to_be_bytes());
        bytes.extend_from_slice(&sign.to_be_bytes());
        bytes.extend_from_slice(&dscale.to_be_bytes());
        for d in digits {
            bytes.extend_from_slice(&d.to_be_bytes());
        }
        bytes
    }

    #[test]
    fn test_render_numeric_simple() {
        let bytes = numeric(1, NUMERIC_POS, 3, &[1, 2345, 6780]);
        assert_eq!(render_pg_numeric(&bytes).unwrap(), "12345.678");
        assert_eq!(render_pg_numeric(&numeric(0, NUMERIC_POS, 0, &[])).unwrap(), "0");
        assert_eq!(render_pg_numeric(&numeric(1, NUMERIC_POS, 0, &[1])).unwrap(), "10000");
    }

    #[test]
    fn test_render_numeric_beyond_rust_decimal_precision() {
        let bytes = numeric(
            7,
            NUMERIC_POS,
            1,
            &[12, 3456, 7890, 1234, 5678, 9012, 3456, 7890, 5000],
        );
        assert_eq!(
            render_pg_numeric(&bytes).unwrap(),
            "123456789012345678901234567890.5"
        );
    }

    #[test]
    fn test_render_numeric_special_values() {
        assert_eq!(render_pg_numeric(&numeric(0, NUMERIC_NAN, 0, &[])).unwrap(), "NaN");
        assert_eq!(
            render_pg_numeric(&numeric(0, NUMERIC_PINF, 0, &[])).unwrap(),
            "Infinity"
        );
        assert_eq!(
            render_pg_numeric(&numeric(0, NUMERIC_NINF, 0, &[])).unwrap(),
            "-Infinity"
        );
    }

    #[test]
    fn test_render_numeric_small_fractions() {
        assert_eq!(
            render_pg_numeric(&numeric(-1, NUMERIC_NEG, 2, &[500])).unwrap(),
            "-0.05"
        );
        assert_eq!(
            render_pg_numeric(&numeric(-2, NUMERIC_POS, 5, &[1000])).unwrap(),
            "0.00001"
        );
        // Trailing zeros requested by the column scale are kept.
        assert_eq!(
            render_pg_numeric(&numeric(0, NUMERIC_POS, 2, &[7])).unwrap(),
            "7.00"
        );
    }

    #[test]
    fn test_render_numeric_rejects_malformed_input() {
        assert!(render_pg_numeric(&[0, 1]).is_err());
        let mut truncated = numeric(0, NUMERIC_POS, 0, &[1, 2]);
        truncated.truncate(10);
        assert!(render_pg_numeric(&truncated).is_err());
        assert!(render_pg_numeric(&numeric(0, 0x1234, 0, &[])).is_err());
    }

    #[test]
    fn test_categorize_type_integer() {
        assert_eq!(
            categorize_type("INT", DialectKind::MySql),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("INT8", DialectKind::Postgres),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("TINYINT UNSIGNED", DialectKind::MySql),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("SERIAL", DialectKind::Postgres),
            TypeCategory::Integer
        );
    }

    #[test]
    fn test_categorize_type_decimal() {
        assert_eq!(
            categorize_type("DECIMAL", DialectKind::MySql),
            TypeCategory::Decimal
        );
        assert_eq!(
            categorize_type("NUMERIC", DialectKind::Postgres),
            TypeCategory::Decimal
        );
        // SQLite NUMERIC is a float
        assert_eq!(
            categorize_type("numeric", DialectKind::Sqlite),
            TypeCategory::Float
        );
    }

    #[test]
    fn test_categorize_temporal_types() {
        assert_eq!(
            categorize_type("TIMESTAMPTZ", DialectKind::Postgres),
            TypeCategory::TimestampTz
        );
        assert_eq!(
            categorize_type("TIMESTAMP", DialectKind::Postgres),
            TypeCategory::Timestamp
        );
        assert_eq!(
            categorize_type("TIMESTAMP", DialectKind::MySql),
            TypeCategory::TimestampTz
        );
        assert_eq!(
            categorize_type("DATETIME", DialectKind::MySql),
            TypeCategory::Timestamp
        );
        assert_eq!(
            categorize_type("INTERVAL", DialectKind::Postgres),
            TypeCategory::Unknown
        );
    }

    #[test]
    fn test_categorize_type_json() {
        assert_eq!(
            categorize_type("json", DialectKind::Postgres),
            TypeCategory::Json
        );
        assert_eq!(
            categorize_type("jsonb", DialectKind::Postgres),
            TypeCategory::Json
        );
        assert_eq!(
            categorize_type("VARCHAR", DialectKind::MySql),
            TypeCategory::Text
        );
    }

    #[test]
    fn test_encode_binary_value() {
        assert_eq!(
            encode_binary_value(b"hello world"),
            JsonValue::String("aGVsbG8gd29ybGQ=".to_string())
        );
        assert_eq!(
            encode_binary_value(&[0xFF, 0xFE, 0x00, 0x01]),
            JsonValue::String("//4AAQ==".to_string())
        );
        assert_eq!(encode_binary_value(&[]), JsonValue::String(String::new()));
    }

    #[tokio::test]
    async fn test_sqlite_row_types_follow_storage_class() {
        use sqlx::Connection;
        let mut conn = sqlx::SqliteConnection::connect("sqlite::memory:").await.unwrap();
        sqlx::query("CREATE TABLE t (id INTEGER, flag BOOLEAN, name TEXT, data BLOB)")
            .execute(&mut conn)
            .await
            .unwrap();
        sqlx::query("INSERT INTO t VALUES (7, 1, 'x', X'00FF')")
            .execute(&mut conn)
            .await
            .unwrap();

        let row = sqlx::query("SELECT id, flag, name, data, 1.5 AS ratio, NULL AS \"nothing\" FROM t")
            .fetch_one(&mut conn)
            .await
            .unwrap();
        let raw = row.to_raw_row();

        assert_eq!(raw.values[0], JsonValue::from(7));
        assert_eq!(raw.values[1], JsonValue::Bool(true));
        assert_eq!(raw.values[2], JsonValue::from("x"));
        assert_eq!(raw.values[3], JsonValue::from("AP8="));
        assert_eq!(raw.values[4], JsonValue::from(1.5));
        assert_eq!(raw.values[5], JsonValue::Null);
        assert_eq!(raw.columns[0].type_id, "INTEGER");
        assert_eq!(raw.columns[4].type_id, "REAL");
        assert_eq!(raw.columns[4].name, "ratio");
    }
}
