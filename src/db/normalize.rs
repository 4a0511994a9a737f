//! Result normalization by query kind.
//!
//! Introspection statements are issued with canonical column aliases (see
//! [`Dialect`](crate::db::dialect::Dialect)), so everything here is
//! dialect-free.

use crate::db::stream::Drained;
use crate::models::{
    ColumnDescription, ForeignKeyRef, IndexDescription, ModelDescriptor, QueryKind, QueryOutput,
    ResultSet, Row, TableRef, UpsertAction,
};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Caller-side inputs to normalization.
#[derive(Debug, Default)]
pub struct NormalizeContext<'a, 't> {
    /// Column an engine returns the generated id under.
    pub insert_id_field: &'a str,
    pub model: Option<&'a ModelDescriptor>,
    pub target: Option<&'t mut Row>,
    pub plain: bool,
}

pub fn normalize(
    kind: QueryKind,
    drained: Drained,
    ctx: NormalizeContext<'_, '_>,
    execution_time_ms: u64,
) -> ResultSet {
    let Drained {
        rows,
        summary,
        truncated,
        ..
    } = drained;

    let mut generated_id = None;
    let output = match kind {
        QueryKind::Describe => QueryOutput::Describe(describe_columns(&rows)),
        QueryKind::ShowTables => QueryOutput::Tables(tables(&rows)),
        QueryKind::ShowIndexes => QueryOutput::Indexes(indexes(&rows)),
        QueryKind::ForeignKeys => QueryOutput::ForeignKeys(foreign_keys(&rows)),
        QueryKind::Version => QueryOutput::Version(
            rows.first()
                .and_then(|row| row.get("version"))
                .and_then(as_string),
        ),
        QueryKind::Insert => {
            generated_id = insert_id(&rows, summary.last_insert_id, &ctx);
            attach_insert(&rows, generated_id.as_ref(), ctx);
            QueryOutput::Rows
        }
        QueryKind::Upsert => {
            generated_id = insert_id(&rows, summary.last_insert_id, &ctx);
            let action = upsert_action(rows.first(), summary.rows_affected);
            if action == UpsertAction::Insert {
                attach_insert(&rows, generated_id.as_ref(), ctx);
            }
            QueryOutput::Upsert(action)
        }
        QueryKind::Update | QueryKind::Delete | QueryKind::BulkUpdate | QueryKind::BulkDelete => {
            QueryOutput::Affected(summary.rows_affected)
        }
        _ if ctx.plain => QueryOutput::Plain(rows.first().cloned()),
        _ => QueryOutput::Rows,
    };

    let rows_affected = match kind {
        QueryKind::Select
        | QueryKind::Describe
        | QueryKind::ShowTables
        | QueryKind::ShowIndexes
        | QueryKind::ForeignKeys
        | QueryKind::Version => None,
        _ => Some(summary.rows_affected),
    };

    ResultSet {
        kind,
        row_count: rows.len(),
        rows,
        rows_affected,
        generated_id,
        truncated,
        output,
        execution_time_ms,
    }
}

fn as_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Engine booleans arrive as bools, 0/1, "YES"/"NO" or "t"/"f".
fn truthy(value: Option<&JsonValue>) -> bool {
    match value {
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        Some(JsonValue::String(s)) => matches!(
            s.to_ascii_lowercase().as_str(),
            "1" | "t" | "true" | "y" | "yes"
        ),
        _ => false,
    }
}

/// Strip engine decoration from a column default:
/// `((0))` → `0`, `'abc'::character varying` → `abc`, `NULL` → null.
fn clean_default(value: Option<&JsonValue>) -> Option<JsonValue> {
    let raw = match value? {
        JsonValue::Null => return None,
        JsonValue::String(s) => s.trim().to_string(),
        other => return Some(other.clone()),
    };

    let mut text = raw.as_str();
    while text.len() >= 2 && text.starts_with('(') && text.ends_with(')') {
        text = &text[1..text.len() - 1];
    }
    if text.starts_with('\'') {
        if let Some(end) = text.rfind('\'').filter(|end| *end > 0) {
            return Some(JsonValue::String(text[1..end].replace("''", "'")));
        }
    }
    if text.eq_ignore_ascii_case("null") {
        return None;
    }
    Some(JsonValue::String(text.to_string()))
}

fn describe_columns(rows: &[Row]) -> BTreeMap<String, ColumnDescription> {
    rows.iter()
        .filter_map(|row| {
            let name = row.get("name").and_then(as_string)?;
            let mut type_name = row
                .get("type")
                .and_then(as_string)
                .unwrap_or_default()
                .to_uppercase();
            if let Some(length) = row.get("length").and_then(JsonValue::as_i64) {
                if !type_name.contains('(') {
                    type_name = format!("{}({})", type_name, length);
                }
            }
            let description = ColumnDescription {
                type_name,
                allow_null: truthy(row.get("allow_null")),
                default_value: clean_default(row.get("default_value")),
                primary_key: truthy(row.get("primary_key")),
                auto_increment: truthy(row.get("auto_increment")),
                comment: row
                    .get("comment")
                    .and_then(as_string)
                    .filter(|c| !c.is_empty()),
            };
            Some((name, description))
        })
        .collect()
}

fn tables(rows: &[Row]) -> Vec<TableRef> {
    rows.iter()
        .filter_map(|row| {
            let name = row.get("name").and_then(as_string)?;
            Some(TableRef {
                name,
                schema: row.get("schema").and_then(as_string),
            })
        })
        .collect()
}

/// One entry per index in first-seen order, fields ordered by position.
fn indexes(rows: &[Row]) -> Vec<IndexDescription> {
    let mut grouped: Vec<(IndexDescription, Vec<(i64, String)>)> = Vec::new();
    for row in rows {
        let Some(name) = row.get("index_name").and_then(as_string) else {
            continue;
        };
        let position = match grouped.iter().position(|(index, _)| index.name == name) {
            Some(position) => position,
            None => {
                grouped.push((
                    IndexDescription {
                        name,
                        primary: truthy(row.get("is_primary")),
                        unique: truthy(row.get("is_unique")),
                        fields: Vec::new(),
                    },
                    Vec::new(),
                ));
                grouped.len() - 1
            }
        };
        if let Some(column) = row.get("column_name").and_then(as_string) {
            let seq = row.get("seq").and_then(JsonValue::as_i64).unwrap_or(i64::MAX);
            grouped[position].1.push((seq, column));
        }
    }

    grouped
        .into_iter()
        .map(|(mut index, mut columns)| {
            columns.sort_by_key(|(seq, _)| *seq);
            index.fields = columns.into_iter().map(|(_, column)| column).collect();
            index
        })
        .collect()
}

fn foreign_keys(rows: &[Row]) -> Vec<ForeignKeyRef> {
    rows.iter()
        .filter_map(|row| {
            Some(ForeignKeyRef {
                constraint_name: row.get("constraint_name").and_then(as_string)?,
                table: row.get("table_name").and_then(as_string),
                column_name: row.get("column_name").and_then(as_string)?,
                referenced_table: row.get("referenced_table").and_then(as_string)?,
                referenced_column: row.get("referenced_column").and_then(as_string)?,
            })
        })
        .collect()
}

/// Generated id, by precedence: the engine-returned id column, driver
/// metadata, the model's auto-increment attribute, then its field alias.
fn insert_id(
    rows: &[Row],
    last_insert_id: Option<i64>,
    ctx: &NormalizeContext<'_, '_>,
) -> Option<JsonValue> {
    let first = rows.first();
    let returned = |column: &str| {
        first
            .and_then(|row| row.get(column))
            .filter(|value| !value.is_null())
            .cloned()
    };

    returned(ctx.insert_id_field)
        .or_else(|| last_insert_id.map(JsonValue::from))
        .or_else(|| {
            let model = ctx.model?;
            model
                .auto_increment_attribute
                .as_deref()
                .and_then(&returned)
                .or_else(|| model.auto_increment_field.as_deref().and_then(&returned))
        })
}

/// Copy a single returned row and the generated id onto the caller's row.
fn attach_insert(rows: &[Row], generated_id: Option<&JsonValue>, ctx: NormalizeContext<'_, '_>) {
    let Some(target) = ctx.target else {
        return;
    };
    let attribute = ctx
        .model
        .and_then(|m| m.auto_increment_attribute.as_deref())
        .unwrap_or("id");
    let field = ctx.model.and_then(|m| m.auto_increment_field.as_deref());

    if let [returned] = rows {
        for (column, value) in returned {
            let key = if Some(column.as_str()) == field {
                attribute
            } else {
                column.as_str()
            };
            target.insert(key.to_string(), value.clone());
        }
    }
    if let Some(id) = generated_id {
        target.insert(attribute.to_string(), id.clone());
    }
}

/// Engines report the upsert outcome as an action column (`$action`), a
/// flag (`inserted`/`created`), or through the affected count (MySQL: 1 on
/// insert, 2 on update, 0 on a no-op update).
fn upsert_action(first: Option<&Row>, rows_affected: u64) -> UpsertAction {
    if let Some(row) = first {
        if let Some(action) = row.get("$action").and_then(as_string) {
            return if action.eq_ignore_ascii_case("INSERT") {
                UpsertAction::Insert
            } else {
                UpsertAction::Update
            };
        }
        for flag in ["inserted", "created"] {
            if let Some(value) = row.get(flag) {
                return if truthy(Some(value)) {
                    UpsertAction::Insert
                } else {
                    UpsertAction::Update
                };
            }
        }
    }
    if rows_affected == 1 {
        UpsertAction::Insert
    } else {
        UpsertAction::Update
    }
}
