//! Schema-related data models.
//!
//! Normalized introspection results, plus the slice of model metadata the
//! executor needs from the model layer (auto-increment attribute, unique keys).

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// One column of a described table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescription {
    /// Database-specific type, with length when the engine reports one (e.g. "VARCHAR(255)")
    #[serde(rename = "type")]
    pub type_name: String,
    pub allow_null: bool,
    #[serde(rename = "default")]
    pub default_value: Option<JsonValue>,
    pub primary_key: bool,
    pub auto_increment: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
}

impl TableRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: None,
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescription {
    pub name: String,
    pub primary: bool,
    pub unique: bool,
    /// Ordered by position in the index
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    pub constraint_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    pub column_name: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

/// A named unique key of a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueKey {
    pub name: String,
    pub fields: Vec<String>,
    /// Replaces the default violation message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Model metadata consumed while normalizing inserts and formatting errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub table: String,
    /// Attribute holding the generated identifier
    #[serde(default)]
    pub auto_increment_attribute: Option<String>,
    /// Column name of that attribute when it differs
    #[serde(default)]
    pub auto_increment_field: Option<String>,
    /// Unique keys by constraint name
    #[serde(default)]
    pub unique_keys: HashMap<String, UniqueKey>,
}

impl ModelDescriptor {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            ..Self::default()
        }
    }

    pub fn with_auto_increment(
        mut self,
        attribute: impl Into<String>,
        field: Option<&str>,
    ) -> Self {
        self.auto_increment_attribute = Some(attribute.into());
        self.auto_increment_field = field.map(String::from);
        self
    }

    pub fn with_unique_key<I, S>(mut self, name: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        self.unique_keys.insert(
            name.clone(),
            UniqueKey {
                name,
                fields: fields.into_iter().map(Into::into).collect(),
                message: None,
            },
        );
        self
    }

    pub fn unique_key(&self, constraint: &str) -> Option<&UniqueKey> {
        self.unique_keys.get(constraint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_descriptor_builder() {
        let model = ModelDescriptor::new("User", "users")
            .with_auto_increment("id", Some("user_id"))
            .with_unique_key("uq_email", ["email"]);

        assert_eq!(model.auto_increment_attribute.as_deref(), Some("id"));
        assert_eq!(model.auto_increment_field.as_deref(), Some("user_id"));
        assert_eq!(
            model.unique_key("uq_email").map(|k| k.fields.clone()),
            Some(vec!["email".to_string()])
        );
        assert!(model.unique_key("missing").is_none());
    }

    #[test]
    fn test_column_description_serializes_short_keys() {
        let column = ColumnDescription {
            type_name: "INTEGER".to_string(),
            allow_null: false,
            default_value: None,
            primary_key: true,
            auto_increment: true,
            comment: None,
        };
        let json = serde_json::to_value(&column).unwrap();
        assert_eq!(json["type"], "INTEGER");
        assert_eq!(json["default"], JsonValue::Null);
        assert!(json.get("comment").is_none());
    }
}
