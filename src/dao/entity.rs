//! Entity capability descriptor and record conversion.

use crate::db::validate_identifier;
use crate::error::{DbError, DbResult};
use crate::models::{QueryParam, Record};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::fmt::Debug;

/// A row type stored in one table.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Clone, PartialEq, Deserialize)]
/// struct User {
///     id: i64,
///     name: String,
///     email: Option<String>,
/// }
///
/// #[derive(Debug, Default, Serialize)]
/// struct UserFields {
///     #[serde(skip_serializing_if = "Option::is_none")]
///     name: Option<String>,
///     #[serde(skip_serializing_if = "Option::is_none")]
///     email: Option<Option<String>>,
/// }
///
/// impl Entity for User {
///     const TABLE: &'static str = "users";
///     type Id = i64;
///     type Fields = UserFields;
/// }
/// ```
pub trait Entity: DeserializeOwned + Clone + Send + Sync + 'static {
    /// Backing table. `schema.table` is accepted.
    const TABLE: &'static str;
    /// Primary-key column, unless overridden on the `Dao`.
    const PRIMARY_KEY: &'static str = "id";

    type Id: Into<QueryParam> + Clone + Debug + Send + Sync + 'static;

    /// Settable fields. Serialized to a JSON object; only the keys present
    /// are written.
    type Fields: Serialize + Send + Sync + 'static;
}

/// Table and primary-key column one `Dao` works against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    pub table: String,
    pub primary_key: String,
}

impl TableDescriptor {
    pub fn new(table: impl Into<String>, primary_key: impl Into<String>) -> DbResult<Self> {
        let descriptor = Self {
            table: table.into(),
            primary_key: primary_key.into(),
        };
        validate_identifier(&descriptor.table)?;
        validate_identifier(&descriptor.primary_key)?;
        Ok(descriptor)
    }

    pub fn for_entity<E: Entity>() -> DbResult<Self> {
        Self::new(E::TABLE, E::PRIMARY_KEY)
    }

    pub fn with_primary_key(self, primary_key: impl Into<String>) -> DbResult<Self> {
        Self::new(self.table, primary_key)
    }
}

/// Build an entity from a detached record.
pub fn entity_from_record<E: Entity>(record: Record) -> DbResult<E> {
    serde_json::from_value(JsonValue::Object(record))
        .map_err(|e| DbError::mapping(std::any::type_name::<E>(), e.to_string()))
}

/// Serialize a field set into the columns it names.
pub fn fields_to_record<F: Serialize>(fields: &F) -> DbResult<Record> {
    match serde_json::to_value(fields)? {
        JsonValue::Object(map) => Ok(map),
        JsonValue::Null => Ok(Record::new()),
        other => Err(DbError::invalid_input(format!(
            "Entity fields must serialize to an object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    struct Widget {
        sku: String,
        label: Option<String>,
    }

    #[derive(Serialize, Default)]
    struct WidgetFields {
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    }

    impl Entity for Widget {
        const TABLE: &'static str = "inventory.widgets";
        const PRIMARY_KEY: &'static str = "sku";
        type Id = String;
        type Fields = WidgetFields;
    }

    #[test]
    fn test_descriptor_from_entity() {
        let d = TableDescriptor::for_entity::<Widget>().unwrap();
        assert_eq!(d.table, "inventory.widgets");
        assert_eq!(d.primary_key, "sku");
        let d = d.with_primary_key("widget_id").unwrap();
        assert_eq!(d.primary_key, "widget_id");
        assert!(TableDescriptor::new("widgets", "bad key").is_err());
    }

    #[test]
    fn test_entity_from_record() {
        let record = json!({"sku": "w-1", "label": null, "extra": 1})
            .as_object()
            .cloned()
            .unwrap();
        let w: Widget = entity_from_record(record).unwrap();
        assert_eq!(w.sku, "w-1");
        assert!(w.label.is_none());

        let bad = json!({"label": "x"}).as_object().cloned().unwrap();
        assert!(matches!(
            entity_from_record::<Widget>(bad),
            Err(DbError::Mapping { .. })
        ));
    }

    #[test]
    fn test_fields_to_record_skips_unset() {
        assert!(fields_to_record(&WidgetFields::default()).unwrap().is_empty());
        let set = WidgetFields {
            label: Some("blue".into()),
        };
        assert_eq!(fields_to_record(&set).unwrap()["label"], json!("blue"));
        assert!(fields_to_record(&()).unwrap().is_empty());
        assert!(matches!(
            fields_to_record(&42),
            Err(DbError::InvalidInput { .. })
        ));
    }
}
