//! Standard rows of jsonb-backed tables.
//!
//! A row is an `order_id` assigned by the database plus a jsonb `data`
//! document carrying the record's fields and its `created_at` /
//! `updated_at` timestamps as `timestamptz` text. [`JsonDataEntity`] wraps a
//! row and tells whether a partial update actually changes it, so callers
//! can skip writes that would not change anything.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DataError;

/// The jsonb document of a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonData<T> {
    /// Record fields, stored flat next to the timestamps.
    #[serde(flatten)]
    pub fields: T,
    /// Creation time as `timestamptz` text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// Last update time as `timestamptz` text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl<T> JsonData<T> {
    /// Document without timestamps.
    pub fn new(fields: T) -> Self {
        Self {
            fields,
            created_at: None,
            updated_at: None,
        }
    }
}

/// One row of a jsonb table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonDataRow<T> {
    /// Assigned by the database. Absent before insert, always present on
    /// rows read back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<i64>,
    /// The jsonb document.
    pub data: JsonData<T>,
}

/// A row plus the names of fields partial updates may not touch.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonDataEntity<T> {
    row: JsonDataRow<T>,
    key_fields: &'static [&'static str],
}

impl<T> JsonDataEntity<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Wraps `row`.
    #[must_use]
    pub fn new(row: JsonDataRow<T>) -> Self {
        Self { row, key_fields: &[] }
    }

    /// Marks fields as keys; [`check_data`](Self::check_data) rejects patches
    /// naming them.
    #[must_use]
    pub fn with_key_fields(mut self, fields: &'static [&'static str]) -> Self {
        self.key_fields = fields;
        self
    }

    /// The wrapped row.
    #[must_use]
    pub fn row(&self) -> &JsonDataRow<T> {
        &self.row
    }

    /// Unwraps the row.
    #[must_use]
    pub fn into_row(self) -> JsonDataRow<T> {
        self.row
    }

    /// The row as a JSON document, `{"order_id": .., "data": {..}}`.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::Serde`] if `T` fails to serialize.
    pub fn to_json(&self) -> Result<Value, DataError> {
        Ok(serde_json::to_value(&self.row)?)
    }

    /// Snapshot of one data field. A JSON `null` reads as absent.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::NotAnObject`] or [`DataError::Serde`] if the data
    /// does not serialize to an object.
    pub fn get_field(&self, name: &str) -> Result<Option<Value>, DataError> {
        let mut data = self.data_object()?;
        Ok(data.remove(name).filter(|v| !v.is_null()))
    }

    /// Merges `patch` over the current data, top-level keys replacing
    /// existing ones, and returns the resulting row if it differs from the
    /// current one. `None` means the patch changes nothing.
    ///
    /// The comparison is structural on the typed result, so key order and
    /// fields `T` drops on the way in do not count as changes.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::KeyField`] if the patch names a key field and
    /// [`DataError::Serde`] if the merged document does not fit `T`.
    pub fn check_data(&self, patch: Map<String, Value>) -> Result<Option<JsonDataRow<T>>, DataError> {
        if let Some(key) = patch.keys().find(|k| self.key_fields.contains(&k.as_str())) {
            return Err(DataError::KeyField(key.clone()));
        }
        let current = self.data_object()?;
        let mut merged = current.clone();
        merged.extend(patch);

        let data: JsonData<T> = serde_json::from_value(Value::Object(merged))?;
        if serde_json::to_value(&data)? == Value::Object(current) {
            return Ok(None);
        }
        Ok(Some(JsonDataRow {
            order_id: self.row.order_id,
            data,
        }))
    }

    fn data_object(&self) -> Result<Map<String, Value>, DataError> {
        match serde_json::to_value(&self.row.data)? {
            Value::Object(map) => Ok(map),
            _ => Err(DataError::NotAnObject),
        }
    }
}
