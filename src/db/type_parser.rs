//! Per-dialect registry of wire-type decoders.
//!
//! Rows are decoded column by column: the column's wire-type id (the engine's
//! upper-cased type name, e.g. `INT4`, `DECIMAL`, `TEXT`) selects a parser; a
//! column without one keeps its raw driver value.

use crate::models::DialectKind;
use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Decode function applied to a raw column value.
pub type TypeParser = Arc<dyn Fn(&JsonValue) -> JsonValue + Send + Sync>;

/// A scalar type of the model layer and the wire types it decodes per dialect.
#[derive(Clone)]
pub struct TypeDescriptor {
    pub key: String,
    types: HashMap<DialectKind, Vec<String>>,
    parse: TypeParser,
}

impl TypeDescriptor {
    pub fn new<F>(key: impl Into<String>, parse: F) -> Self
    where
        F: Fn(&JsonValue) -> JsonValue + Send + Sync + 'static,
    {
        Self::with_parser(key, Arc::new(parse))
    }

    pub fn with_parser(key: impl Into<String>, parse: TypeParser) -> Self {
        Self {
            key: key.into(),
            types: HashMap::new(),
            parse,
        }
    }

    /// Declare the wire-type ids this type decodes for `dialect`.
    pub fn with_types<I, S>(mut self, dialect: DialectKind, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.types
            .entry(dialect)
            .or_default()
            .extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn types_for(&self, dialect: DialectKind) -> &[String] {
        self.types.get(&dialect).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn parser(&self) -> &TypeParser {
        &self.parse
    }
}

impl std::fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("key", &self.key)
            .field("types", &self.types)
            .finish()
    }
}

/// Registry of decoders for one dialect.
///
/// Writers replace the whole map, so a statement decodes every row against
/// the snapshot it took when it started.
pub struct TypeParserStore {
    dialect: DialectKind,
    parsers: RwLock<Arc<HashMap<String, TypeParser>>>,
}

impl TypeParserStore {
    pub fn new(dialect: DialectKind) -> Self {
        Self {
            dialect,
            parsers: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub fn dialect(&self) -> DialectKind {
        self.dialect
    }

    /// Install the descriptor's parser for every wire-type id it declares for
    /// this dialect. Later registrations for the same id win.
    ///
    /// Returns the number of ids installed.
    pub fn refresh(&self, descriptor: &TypeDescriptor) -> usize {
        let ids = descriptor.types_for(self.dialect);
        if ids.is_empty() {
            debug!(key = %descriptor.key, dialect = %self.dialect, "Type declares no wire types for dialect");
            return 0;
        }

        let mut guard = self.parsers.write();
        let mut next = HashMap::clone(&guard);
        for id in ids {
            next.insert(normalize_id(id), Arc::clone(descriptor.parser()));
        }
        *guard = Arc::new(next);

        debug!(key = %descriptor.key, count = ids.len(), "Type parsers refreshed");
        ids.len()
    }

    pub fn clear(&self) {
        *self.parsers.write() = Arc::new(HashMap::new());
    }

    pub fn get(&self, id: &str) -> Option<TypeParser> {
        self.parsers.read().get(&normalize_id(id)).cloned()
    }

    pub fn len(&self) -> usize {
        self.parsers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.parsers.read().is_empty()
    }

    pub fn snapshot(&self) -> TypeParserSnapshot {
        TypeParserSnapshot {
            parsers: Arc::clone(&self.parsers.read()),
        }
    }
}

impl std::fmt::Debug for TypeParserStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeParserStore")
            .field("dialect", &self.dialect)
            .field("parsers", &self.len())
            .finish()
    }
}

/// Point-in-time view of a [`TypeParserStore`].
#[derive(Clone, Default)]
pub struct TypeParserSnapshot {
    parsers: Arc<HashMap<String, TypeParser>>,
}

impl TypeParserSnapshot {
    /// Apply the parser registered for `type_id`, or pass the raw value through.
    pub fn decode(&self, type_id: &str, raw: JsonValue) -> JsonValue {
        if self.parsers.is_empty() {
            return raw;
        }
        match self.parsers.get(&normalize_id(type_id)) {
            Some(parse) => parse(&raw),
            None => raw,
        }
    }
}

fn normalize_id(id: &str) -> String {
    id.trim().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn upper() -> TypeDescriptor {
        TypeDescriptor::new("UPPER", |v: &JsonValue| match v.as_str() {
            Some(s) => JsonValue::String(s.to_uppercase()),
            None => v.clone(),
        })
    }

    #[test]
    fn test_refresh_then_get_returns_same_parser() {
        let store = TypeParserStore::new(DialectKind::Postgres);
        let parse: TypeParser = Arc::new(|v: &JsonValue| v.clone());
        let descriptor = TypeDescriptor::with_parser("X", Arc::clone(&parse))
            .with_types(DialectKind::Postgres, ["X"]);

        assert_eq!(store.refresh(&descriptor), 1);
        let found = store.get("X").expect("parser registered");
        assert!(Arc::ptr_eq(&found, &parse));

        store.clear();
        assert!(store.get("X").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_only_current_dialect_installed() {
        let store = TypeParserStore::new(DialectKind::Sqlite);
        let descriptor = upper()
            .with_types(DialectKind::Postgres, ["TEXT", "VARCHAR"])
            .with_types(DialectKind::Sqlite, ["TEXT"]);

        assert_eq!(store.refresh(&descriptor), 1);
        assert!(store.get("text").is_some());
        assert!(store.get("VARCHAR").is_none());
    }

    #[test]
    fn test_last_registration_wins() {
        let store = TypeParserStore::new(DialectKind::MySql);
        store.refresh(&upper().with_types(DialectKind::MySql, ["VARCHAR"]));
        store.refresh(
            &TypeDescriptor::new("LEN", |v: &JsonValue| {
                json!(v.as_str().map(str::len).unwrap_or(0))
            })
            .with_types(DialectKind::MySql, ["VARCHAR"]),
        );

        let snapshot = store.snapshot();
        assert_eq!(snapshot.decode("VARCHAR", json!("abc")), json!(3));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_snapshot_passes_unknown_types_through() {
        let store = TypeParserStore::new(DialectKind::Sqlite);
        store.refresh(&upper().with_types(DialectKind::Sqlite, ["TEXT"]));
        let snapshot = store.snapshot();

        assert_eq!(snapshot.decode("TEXT", json!("abc")), json!("ABC"));
        assert_eq!(snapshot.decode("INTEGER", json!(5)), json!(5));
    }

    #[test]
    fn test_snapshot_isolated_from_later_writes() {
        let store = TypeParserStore::new(DialectKind::Sqlite);
        store.refresh(&upper().with_types(DialectKind::Sqlite, ["TEXT"]));
        let snapshot = store.snapshot();
        store.clear();

        assert_eq!(snapshot.decode("TEXT", json!("abc")), json!("ABC"));
        assert!(store.get("TEXT").is_none());
    }
}
