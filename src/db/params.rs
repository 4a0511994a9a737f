//! Parameter binding for database queries.
//!
//! Untyped parameters receive a wire type from their runtime value, named
//! parameters are rewritten into the engine's placeholder syntax, and the
//! resulting [`BoundParam`]s are bound onto `sqlx` queries per dialect.

use crate::error::{DbError, DbResult};
use crate::models::{Parameter, QueryParam, QueryParams, WireType};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{MySql, Postgres, Sqlite};
use std::collections::HashMap;
use std::str::FromStr;

/// Placeholder style of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `$1, $2, ...`; one bind per distinct name
    Numbered,
    /// `?`; one bind per occurrence
    Anonymous,
}

impl PlaceholderStyle {
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Self::Numbered => format!("${}", index),
            Self::Anonymous => "?".to_string(),
        }
    }
}

/// A parameter with its resolved wire type.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundParam {
    pub value: QueryParam,
    pub wire_type: WireType,
}

impl From<&Parameter> for BoundParam {
    fn from(param: &Parameter) -> Self {
        Self {
            value: param.value.clone(),
            wire_type: param.effective_wire_type(),
        }
    }
}

/// SQL text in native placeholder syntax plus its binds, in bind order.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundStatement {
    pub sql: String,
    pub params: Vec<BoundParam>,
}

/// Resolve wire types and rewrite named parameters.
pub fn bind_parameters(
    sql: &str,
    params: &QueryParams,
    style: PlaceholderStyle,
) -> DbResult<BoundStatement> {
    match params {
        QueryParams::None => Ok(BoundStatement {
            sql: sql.to_string(),
            params: Vec::new(),
        }),
        QueryParams::Positional(values) => Ok(BoundStatement {
            sql: sql.to_string(),
            params: values.iter().map(BoundParam::from).collect(),
        }),
        QueryParams::Named(values) => rewrite_named(sql, values, style),
    }
}

/// Replace `:name` / `$name` markers with native placeholders.
///
/// Quoted strings, quoted identifiers, comments, dollar-quoted bodies and
/// `::` casts are left untouched.
pub fn rewrite_named(
    sql: &str,
    values: &[(String, Parameter)],
    style: PlaceholderStyle,
) -> DbResult<BoundStatement> {
    let lookup: HashMap<&str, &Parameter> = values.iter().map(|(k, v)| (k.as_str(), v)).collect();
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut params = Vec::new();
    let mut numbered: HashMap<String, usize> = HashMap::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' | '`' => {
                let end = skip_quoted(&chars, i, c);
                out.extend(&chars[i..end]);
                i = end;
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                let end = chars[i..]
                    .iter()
                    .position(|&ch| ch == '\n')
                    .map_or(chars.len(), |p| i + p);
                out.extend(&chars[i..end]);
                i = end;
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                let end = find_block_comment_end(&chars, i + 2);
                out.extend(&chars[i..end]);
                i = end;
            }
            ':' if chars.get(i + 1) == Some(&':') => {
                out.push_str("::");
                i += 2;
            }
            '$' if dollar_tag(&chars, i).is_some() => {
                let end = skip_dollar_quoted(&chars, i);
                out.extend(&chars[i..end]);
                i = end;
            }
            ':' | '$' if chars.get(i + 1).is_some_and(|ch| is_ident_start(*ch)) => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && is_ident_char(chars[end]) {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                let param = lookup.get(name.as_str()).ok_or_else(|| {
                    DbError::invalid_input(format!("Named parameter '{}{}' has no value", c, name))
                })?;

                match style {
                    PlaceholderStyle::Numbered => {
                        let index = match numbered.get(&name) {
                            Some(index) => *index,
                            None => {
                                params.push(BoundParam::from(*param));
                                numbered.insert(name, params.len());
                                params.len()
                            }
                        };
                        out.push_str(&style.placeholder(index));
                    }
                    PlaceholderStyle::Anonymous => {
                        params.push(BoundParam::from(*param));
                        out.push_str(&style.placeholder(params.len()));
                    }
                }
                i = end;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    Ok(BoundStatement { sql: out, params })
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Index just past the closing quote; doubled quotes are escapes.
fn skip_quoted(chars: &[char], start: usize, quote: char) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == '\\' && quote == '\'' {
            i += 2;
            continue;
        }
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

/// The `$tag$` opening a PostgreSQL dollar-quoted string at `start`, if any.
fn dollar_tag(chars: &[char], start: usize) -> Option<&[char]> {
    let mut end = start + 1;
    if chars.get(end).is_some_and(|c| is_ident_start(*c)) {
        while end < chars.len() && is_ident_char(chars[end]) {
            end += 1;
        }
    }
    (chars.get(end) == Some(&'$')).then(|| &chars[start..=end])
}

/// Index just past the tag closing the dollar-quoted string at `start`.
fn skip_dollar_quoted(chars: &[char], start: usize) -> usize {
    let Some(tag) = dollar_tag(chars, start) else {
        return start + 1;
    };
    let body = start + tag.len();
    chars[body..]
        .windows(tag.len())
        .position(|window| window == tag)
        .map_or(chars.len(), |p| body + p + tag.len())
}

fn find_block_comment_end(chars: &[char], from: usize) -> usize {
    let mut i = from;
    while i + 1 < chars.len() {
        if chars[i] == '*' && chars[i + 1] == '/' {
            return i + 2;
        }
        i += 1;
    }
    chars.len()
}

// =============================================================================
// Value coercion
// =============================================================================

fn as_i64(value: &QueryParam) -> Option<i64> {
    match value {
        QueryParam::Int(v) => Some(*v),
        QueryParam::Float(v) if v.fract() == 0.0 => Some(*v as i64),
        QueryParam::Bool(v) => Some(i64::from(*v)),
        QueryParam::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_f64(value: &QueryParam) -> Option<f64> {
    match value {
        QueryParam::Int(v) => Some(*v as f64),
        QueryParam::Float(v) => Some(*v),
        QueryParam::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_decimal(value: &QueryParam, scale: u32) -> Option<Decimal> {
    let decimal = match value {
        QueryParam::Int(v) => Some(Decimal::from(*v)),
        QueryParam::Float(v) => Decimal::from_f64(*v),
        QueryParam::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }?;
    Some(decimal.round_dp(scale))
}

fn as_bool(value: &QueryParam) -> Option<bool> {
    match value {
        QueryParam::Bool(v) => Some(*v),
        QueryParam::Int(v) => Some(*v != 0),
        QueryParam::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "t" | "1" => Some(true),
            "false" | "f" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn as_text(value: &QueryParam) -> String {
    match value {
        QueryParam::Null => String::new(),
        QueryParam::Bool(v) => v.to_string(),
        QueryParam::Int(v) => v.to_string(),
        QueryParam::Float(v) => v.to_string(),
        QueryParam::String(s) => s.clone(),
        QueryParam::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        QueryParam::Json(v) => v.to_string(),
    }
}

fn as_json(value: &QueryParam) -> serde_json::Value {
    match value {
        QueryParam::Json(v) => v.clone(),
        QueryParam::String(s) => {
            serde_json::from_str(s).unwrap_or_else(|_| serde_json::Value::String(s.clone()))
        }
        QueryParam::Null => serde_json::Value::Null,
        QueryParam::Bool(v) => serde_json::Value::Bool(*v),
        QueryParam::Int(v) => serde_json::Value::from(*v),
        QueryParam::Float(v) => serde_json::Value::from(*v),
        QueryParam::Bytes(b) => serde_json::Value::String(String::from_utf8_lossy(b).into_owned()),
    }
}

fn as_bytes(value: &QueryParam) -> Vec<u8> {
    match value {
        QueryParam::Bytes(b) => b.clone(),
        other => as_text(other).into_bytes(),
    }
}

// =============================================================================
// Dialect binders
// =============================================================================

/// Bind a parameter to a PostgreSQL query.
pub(crate) fn bind_postgres_param<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    param: &'q BoundParam,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    let value = &param.value;
    match param.wire_type {
        WireType::Int => match value {
            QueryParam::Null => query.bind(None::<i32>),
            v => match as_i64(v).map(i32::try_from) {
                Some(Ok(n)) => query.bind(n),
                Some(Err(_)) => query.bind(as_i64(v)),
                None => query.bind(as_text(v)),
            },
        },
        WireType::BigInt => match value {
            QueryParam::Null => query.bind(None::<i64>),
            v => match as_i64(v) {
                Some(n) => query.bind(n),
                None => query.bind(as_text(v)),
            },
        },
        WireType::Decimal { scale, .. } => match value {
            QueryParam::Null => query.bind(None::<Decimal>),
            v => match as_decimal(v, scale) {
                Some(d) => query.bind(d),
                None => query.bind(as_text(v)),
            },
        },
        WireType::Float => match value {
            QueryParam::Null => query.bind(None::<f64>),
            v => query.bind(as_f64(v)),
        },
        WireType::Bool => match value {
            QueryParam::Null => query.bind(None::<bool>),
            v => query.bind(as_bool(v)),
        },
        WireType::Binary => match value {
            QueryParam::Null => query.bind(None::<Vec<u8>>),
            v => query.bind(as_bytes(v)),
        },
        WireType::Json => match value {
            QueryParam::Null => query.bind(None::<Json<serde_json::Value>>),
            v => query.bind(Json(as_json(v))),
        },
        WireType::Text => match value {
            QueryParam::Null => query.bind(None::<String>),
            QueryParam::String(s) => query.bind(s.as_str()),
            v => query.bind(as_text(v)),
        },
    }
}

/// Bind a parameter to a MySQL query.
pub(crate) fn bind_mysql_param<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    param: &'q BoundParam,
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    let value = &param.value;
    match param.wire_type {
        WireType::Int | WireType::BigInt => match value {
            QueryParam::Null => query.bind(None::<i64>),
            v => match as_i64(v) {
                Some(n) => query.bind(n),
                None => query.bind(as_text(v)),
            },
        },
        WireType::Decimal { scale, .. } => match value {
            QueryParam::Null => query.bind(None::<Decimal>),
            v => match as_decimal(v, scale) {
                Some(d) => query.bind(d),
                None => query.bind(as_text(v)),
            },
        },
        WireType::Float => match value {
            QueryParam::Null => query.bind(None::<f64>),
            v => query.bind(as_f64(v)),
        },
        WireType::Bool => match value {
            QueryParam::Null => query.bind(None::<bool>),
            v => query.bind(as_bool(v)),
        },
        WireType::Binary => match value {
            QueryParam::Null => query.bind(None::<Vec<u8>>),
            v => query.bind(as_bytes(v)),
        },
        WireType::Json => match value {
            QueryParam::Null => query.bind(None::<Json<serde_json::Value>>),
            v => query.bind(Json(as_json(v))),
        },
        WireType::Text => match value {
            QueryParam::Null => query.bind(None::<String>),
            QueryParam::String(s) => query.bind(s.as_str()),
            v => query.bind(as_text(v)),
        },
    }
}

/// Bind a parameter to a SQLite query.
pub(crate) fn bind_sqlite_param<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    param: &'q BoundParam,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    let value = &param.value;
    match param.wire_type {
        WireType::Int | WireType::BigInt | WireType::Bool => match value {
            QueryParam::Null => query.bind(None::<i64>),
            v => match as_i64(v) {
                Some(n) => query.bind(n),
                None => query.bind(as_text(v)),
            },
        },
        // SQLite has no exact decimal storage; REAL is its closest class.
        WireType::Decimal { .. } | WireType::Float => match value {
            QueryParam::Null => query.bind(None::<f64>),
            v => match as_f64(v) {
                Some(n) => query.bind(n),
                None => query.bind(as_text(v)),
            },
        },
        WireType::Binary => match value {
            QueryParam::Null => query.bind(None::<Vec<u8>>),
            v => query.bind(as_bytes(v)),
        },
        // SQLite doesn't have native JSON type, store as string
        WireType::Json => match value {
            QueryParam::Null => query.bind(None::<String>),
            v => query.bind(as_json(v).to_string()),
        },
        WireType::Text => match value {
            QueryParam::Null => query.bind(None::<String>),
            QueryParam::String(s) => query.bind(s.as_str()),
            v => query.bind(as_text(v)),
        },
    }
}
