//! Error classification.
//!
//! Connection-phase failures are sorted by native code first and message
//! second. Query-phase failures are matched against engine message patterns
//! in a fixed priority order: unique, foreign key, unknown constraint, and
//! finally the generic [`DbError::Database`].

use crate::error::{DbError, ErrorKind, NativeError, ValidationErrorItem};
use crate::models::{ModelDescriptor, Row, UniqueKey};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value as JsonValue;

/// Native code → connection error kind.
const CONNECTION_CODES: &[(ErrorKind, &[&str])] = &[
    (
        ErrorKind::HostNotReachable,
        &[
            "ESOCKET",
            "EHOSTUNREACH",
            "ENETUNREACH",
            "ENETDOWN",
            "ETIMEDOUT",
            "ECONNRESET",
            "ECONNABORTED",
            "EPIPE",
        ],
    ),
    (
        ErrorKind::HostNotFound,
        &["ENOTFOUND", "EAI_AGAIN", "EINSTLOOKUP"],
    ),
    (
        ErrorKind::ConnectionRefused,
        // 57P03 cannot_connect_now, 08001/08004 rejected, 1040 too many connections
        &["ECONNREFUSED", "57P03", "08001", "08004", "1040"],
    ),
    (
        ErrorKind::AccessDenied,
        // SQLite: 3 SQLITE_PERM, 23 SQLITE_AUTH
        &[
            "ELOGIN", "EACCES", "28000", "28P01", "1044", "1045", "1698", "3", "23",
        ],
    ),
    (
        ErrorKind::InvalidConnection,
        // 3D000 invalid_catalog_name, 1049 unknown database
        &["EINVAL", "ECONFIG", "3D000", "1049"],
    ),
];

/// Message fragments used when no code is available.
const CONNECTION_MESSAGES: &[(ErrorKind, &[&str])] = &[
    (
        ErrorKind::HostNotFound,
        &[
            "failed to lookup address",
            "name or service not known",
            "nodename nor servname",
            "no such host",
            "temporary failure in name resolution",
        ],
    ),
    (ErrorKind::ConnectionRefused, &["connection refused"]),
    (
        ErrorKind::AccessDenied,
        &[
            "access denied",
            "password authentication failed",
            "authentication failed",
            "permission denied",
        ],
    ),
    (
        ErrorKind::HostNotReachable,
        &[
            "timed out",
            "unreachable",
            "connection reset",
            "broken pipe",
        ],
    ),
    (
        ErrorKind::InvalidConnection,
        &["unknown database", "does not exist", "invalid port", "invalid connection"],
    ),
];

/// Kind of a connection-phase failure.
pub fn connection_error_kind(native: &NativeError) -> ErrorKind {
    if let Some(code) = native.code.as_deref() {
        if let Some((kind, _)) = CONNECTION_CODES
            .iter()
            .find(|(_, codes)| codes.contains(&code))
        {
            return *kind;
        }
    }
    let message = native.message.to_lowercase();
    CONNECTION_MESSAGES
        .iter()
        .find(|(_, needles)| needles.iter().any(|n| message.contains(n)))
        .map(|(kind, _)| *kind)
        .unwrap_or(ErrorKind::Connection)
}

/// Wrap a connection-phase failure in the matching connection error.
pub fn classify_connection_error(native: NativeError) -> DbError {
    let kind = connection_error_kind(&native);
    let message = native.message.clone();
    let native = Some(native);
    match kind {
        ErrorKind::HostNotReachable => DbError::HostNotReachable { message, native },
        ErrorKind::HostNotFound => DbError::HostNotFound { message, native },
        ErrorKind::ConnectionRefused => DbError::ConnectionRefused { message, native },
        ErrorKind::AccessDenied => DbError::AccessDenied { message, native },
        ErrorKind::InvalidConnection => DbError::InvalidConnection { message, native },
        _ => DbError::Connection { message, native },
    }
}

/// What the query layer knows about the failed statement.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorContext<'a> {
    pub sql: Option<&'a str>,
    pub model: Option<&'a ModelDescriptor>,
    /// Row the caller tried to write; supplies values engines do not report.
    pub target: Option<&'a Row>,
}

// ---- unique ---------------------------------------------------------------

static MSSQL_UNIQUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"Violation of (?:UNIQUE|PRIMARY) KEY constraint '([^']+)'\. Cannot insert duplicate key in object '([^']+)'\.(?: The duplicate key value is \((.*)\)\.)?",
    )
    .unwrap()
});
static PG_UNIQUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"duplicate key value violates unique constraint "([^"]+)""#).unwrap());
static PG_KEY_DETAIL: Lazy<Regex> = Lazy::new(|| Regex::new(r"Key \((.*)\)=\((.*)\)").unwrap());
static MYSQL_UNIQUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Duplicate entry '(.*)' for key '([^']+)'").unwrap());
static SQLITE_UNIQUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"UNIQUE constraint failed: (.+)$").unwrap());

// ---- foreign key ----------------------------------------------------------

static MSSQL_FOREIGN_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"The (?:INSERT|UPDATE|DELETE) statement conflicted with the (?:FOREIGN KEY|REFERENCE) constraint "([^"]+)"\. The conflict occurred in database "[^"]+", table "([^"]+)"(?:, column '([^']+)')?"#,
    )
    .unwrap()
});
static PG_FOREIGN_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?:insert or update|update or delete) on table "([^"]+)" violates foreign key constraint "([^"]+)""#,
    )
    .unwrap()
});
static MYSQL_FOREIGN_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"Cannot (?:add or update a child|delete or update a parent) row: a foreign key constraint fails \((?:`[^`]+`\.)?`([^`]+)`, CONSTRAINT `([^`]+)` FOREIGN KEY \((.+?)\) REFERENCES",
    )
    .unwrap()
});
static SQLITE_FOREIGN_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"FOREIGN KEY constraint failed").unwrap());

// ---- unknown constraint ---------------------------------------------------

static MSSQL_UNKNOWN_CONSTRAINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"'([^']+)' is not a constraint|Could not drop constraint\. See previous errors\.")
        .unwrap()
});
static PG_UNKNOWN_CONSTRAINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"constraint "([^"]+)" of relation "([^"]+)" does not exist"#).unwrap()
});
static MYSQL_UNKNOWN_CONSTRAINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Can't DROP (?:FOREIGN KEY |CONSTRAINT |INDEX |CHECK )?[`']([^`']+)[`']; check that")
        .unwrap()
});

#[derive(Debug, Default, PartialEq)]
struct UniqueMatch {
    constraint: Option<String>,
    table: Option<String>,
    columns: Vec<String>,
    values: Vec<String>,
}

fn group(caps: &Captures<'_>, i: usize) -> Option<String> {
    caps.get(i).map(|m| m.as_str().to_string())
}

fn split_list(list: &str) -> Vec<String> {
    list.split(", ")
        .map(|s| s.trim_matches(|c| c == '"' || c == '`').to_string())
        .collect()
}

/// Drop a `table.` prefix.
fn unqualified(name: &str) -> &str {
    name.rsplit_once('.').map_or(name, |(_, tail)| tail)
}

fn match_unique(native: &NativeError) -> Option<UniqueMatch> {
    let message = native.message.as_str();

    if let Some(caps) = MSSQL_UNIQUE.captures(message) {
        return Some(UniqueMatch {
            constraint: group(&caps, 1),
            table: group(&caps, 2),
            columns: Vec::new(),
            values: caps.get(3).map(|m| split_list(m.as_str())).unwrap_or_default(),
        });
    }

    if let Some(caps) = PG_UNIQUE.captures(message) {
        let (columns, values) = native
            .detail
            .as_deref()
            .and_then(|detail| PG_KEY_DETAIL.captures(detail))
            .map(|d| (split_list(&d[1]), split_list(&d[2])))
            .unwrap_or_default();
        return Some(UniqueMatch {
            constraint: group(&caps, 1).or_else(|| native.constraint.clone()),
            table: native.table.clone(),
            columns,
            values,
        });
    }

    if let Some(caps) = MYSQL_UNIQUE.captures(message) {
        return Some(UniqueMatch {
            // MySQL 8 reports `table.key`
            constraint: Some(unqualified(&caps[2]).to_string()),
            table: caps[2].rsplit_once('.').map(|(t, _)| t.to_string()),
            columns: Vec::new(),
            values: vec![caps[1].to_string()],
        });
    }

    if let Some(caps) = SQLITE_UNIQUE.captures(message) {
        let qualified = split_list(caps[1].trim());
        return Some(UniqueMatch {
            constraint: None,
            table: qualified
                .first()
                .and_then(|c| c.rsplit_once('.'))
                .map(|(t, _)| t.to_string()),
            columns: qualified.iter().map(|c| unqualified(c).to_string()).collect(),
            values: Vec::new(),
        });
    }

    None
}

fn unique_error(native: NativeError, found: UniqueMatch, ctx: &ErrorContext<'_>) -> DbError {
    let model_key: Option<&UniqueKey> = ctx.model.and_then(|model| match &found.constraint {
        Some(constraint) => model.unique_key(constraint),
        None => model
            .unique_keys
            .values()
            .find(|key| !found.columns.is_empty() && key.fields == found.columns),
    });

    let field_names: Vec<String> = match model_key {
        Some(key) => key.fields.clone(),
        None if !found.columns.is_empty() => found.columns.clone(),
        None => Vec::new(),
    };

    // MySQL joins composite key values with '-'.
    let values = match found.values.as_slice() {
        [joined] if field_names.len() > 1 => {
            let parts: Vec<String> = joined.split('-').map(String::from).collect();
            if parts.len() == field_names.len() {
                parts
            } else {
                found.values.clone()
            }
        }
        _ => found.values.clone(),
    };
    let value_for = |index: usize, field: &str| -> JsonValue {
        match values.get(index) {
            Some(value) => JsonValue::String(value.clone()),
            None => ctx
                .target
                .and_then(|row| row.get(field))
                .cloned()
                .unwrap_or(JsonValue::Null),
        }
    };

    let mut fields = serde_json::Map::new();
    if field_names.is_empty() {
        if let Some(constraint) = &found.constraint {
            fields.insert(
                constraint.clone(),
                JsonValue::String(values.join(", ")),
            );
        }
    } else {
        for (index, field) in field_names.iter().enumerate() {
            fields.insert(field.clone(), value_for(index, field));
        }
    }

    let key_message = model_key.and_then(|key| key.message.clone());
    let errors = fields
        .iter()
        .map(|(field, value)| {
            let mut item = ValidationErrorItem::unique_violation(field.clone(), value.clone());
            if let Some(message) = &key_message {
                item.message = message.clone();
            }
            item
        })
        .collect();

    DbError::UniqueConstraint {
        message: key_message.unwrap_or_else(|| "Validation error".to_string()),
        constraint: found
            .constraint
            .or_else(|| model_key.map(|key| key.name.clone())),
        fields,
        errors,
        sql: ctx.sql.map(String::from),
        native,
    }
}

fn foreign_key_error(native: NativeError, ctx: &ErrorContext<'_>) -> Option<DbError> {
    let message = native.message.as_str();

    let (constraint, table, fields) = if let Some(caps) = MSSQL_FOREIGN_KEY.captures(message) {
        (
            group(&caps, 1),
            group(&caps, 2),
            caps.get(3).map(|m| vec![m.as_str().to_string()]).unwrap_or_default(),
        )
    } else if let Some(caps) = PG_FOREIGN_KEY.captures(message) {
        let fields = native
            .detail
            .as_deref()
            .and_then(|detail| PG_KEY_DETAIL.captures(detail))
            .map(|d| split_list(&d[1]))
            .unwrap_or_default();
        (group(&caps, 2), group(&caps, 1), fields)
    } else if let Some(caps) = MYSQL_FOREIGN_KEY.captures(message) {
        (group(&caps, 2), group(&caps, 1), split_list(&caps[3]))
    } else if SQLITE_FOREIGN_KEY.is_match(message) {
        (None, ctx.model.map(|m| m.table.clone()), Vec::new())
    } else {
        return None;
    };

    Some(DbError::ForeignKeyConstraint {
        message: native.message.clone(),
        constraint: constraint.or_else(|| native.constraint.clone()),
        table: table.or_else(|| native.table.clone()),
        fields,
        sql: ctx.sql.map(String::from),
        native,
    })
}

fn unknown_constraint_error(native: NativeError, ctx: &ErrorContext<'_>) -> Option<DbError> {
    let message = native.message.as_str();

    let (constraint, table) = if let Some(caps) = MSSQL_UNKNOWN_CONSTRAINT.captures(message) {
        (group(&caps, 1), ctx.model.map(|m| m.table.clone()))
    } else if let Some(caps) = PG_UNKNOWN_CONSTRAINT.captures(message) {
        (group(&caps, 1), group(&caps, 2))
    } else if let Some(caps) = MYSQL_UNKNOWN_CONSTRAINT.captures(message) {
        (group(&caps, 1), ctx.model.map(|m| m.table.clone()))
    } else {
        return None;
    };

    Some(DbError::UnknownConstraint {
        message: native.message.clone(),
        constraint,
        table,
        sql: ctx.sql.map(String::from),
        native,
    })
}

/// Turn a query-phase driver error into the most specific error kind.
pub fn format_query_error(native: NativeError, ctx: &ErrorContext<'_>) -> DbError {
    if let Some(found) = match_unique(&native) {
        return unique_error(native, found, ctx);
    }
    let native = match foreign_key_error(native.clone(), ctx) {
        Some(err) => return err,
        None => native,
    };
    if let Some(err) = unknown_constraint_error(native.clone(), ctx) {
        return err;
    }
    DbError::database(native, ctx.sql.map(String::from))
}
