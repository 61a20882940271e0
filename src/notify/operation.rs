//! Row-change payloads carried on the notification channel.
//!
//! A database trigger publishes one JSON object per changed row:
//!
//! ```json
//! {"op": "update", "table": "message", "new": {...}, "old": {...}}
//! ```
//!
//! `op` selects the variant. `manual_update` is accepted as a synonym for
//! `set`, for application-issued refreshes that do not come from a trigger.

use serde::{Deserialize, Serialize};

/// One row change. `R` is the row type, raw JSON by default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RowOperation<R = serde_json::Value> {
    /// A row was inserted.
    Insert {
        /// Source table.
        table: String,
        /// Inserted row.
        new: R,
    },

    /// A row was updated.
    Update {
        /// Source table.
        table: String,
        /// Row after the update.
        new: R,
        /// Row before the update.
        old: R,
    },

    /// A row was deleted.
    Delete {
        /// Source table.
        table: String,
        /// Deleted row.
        old: R,
    },

    /// A row should be refreshed in place.
    #[serde(alias = "manual_update")]
    Set {
        /// Source table.
        table: String,
        /// Current row.
        new: R,
    },
}

impl<R> RowOperation<R> {
    /// Table the change happened on.
    #[must_use]
    pub fn table(&self) -> &str {
        match self {
            Self::Insert { table, .. }
            | Self::Update { table, .. }
            | Self::Delete { table, .. }
            | Self::Set { table, .. } => table,
        }
    }

    /// Wire name of the operation.
    #[must_use]
    pub fn op_name(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
            Self::Set { .. } => "set",
        }
    }

    /// Row state after the change, if it still exists.
    #[must_use]
    pub fn new_row(&self) -> Option<&R> {
        match self {
            Self::Insert { new, .. } | Self::Update { new, .. } | Self::Set { new, .. } => Some(new),
            Self::Delete { .. } => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn update_carries_both_rows() {
        let raw = r#"{"op":"update","table":"message","new":{"id":1,"v":2},"old":{"id":1,"v":1}}"#;
        let Ok(op) = serde_json::from_str::<RowOperation>(raw) else {
            panic!("valid update payload");
        };
        assert_eq!(op.table(), "message");
        assert_eq!(op.op_name(), "update");
        assert_eq!(op.new_row(), Some(&json!({"id": 1, "v": 2})));
    }

    #[test]
    fn manual_update_is_set() {
        let raw = r#"{"op":"manual_update","table":"user_data","new":{"user_id":"u1"}}"#;
        let Ok(op) = serde_json::from_str::<RowOperation>(raw) else {
            panic!("manual_update must parse");
        };
        assert!(matches!(op, RowOperation::Set { .. }));
        assert_eq!(op.op_name(), "set");
    }

    #[test]
    fn delete_has_no_new_row() {
        let raw = r#"{"op":"delete","table":"message","old":{"id":9}}"#;
        let Ok(op) = serde_json::from_str::<RowOperation>(raw) else {
            panic!("valid delete payload");
        };
        assert!(op.new_row().is_none());
    }

    #[test]
    fn unknown_op_is_rejected() {
        let raw = r#"{"op":"truncate","table":"message"}"#;
        assert!(serde_json::from_str::<RowOperation>(raw).is_err());
    }

    #[test]
    fn missing_row_is_rejected() {
        let raw = r#"{"op":"insert","table":"message"}"#;
        assert!(serde_json::from_str::<RowOperation>(raw).is_err());
    }

    #[derive(Debug, PartialEq, Deserialize)]
    struct MessageRow {
        id: i64,
        body: String,
    }

    #[test]
    fn typed_rows() {
        let raw = r#"{"op":"insert","table":"message","new":{"id":3,"body":"hi"}}"#;
        let Ok(RowOperation::Insert { new, .. }) = serde_json::from_str::<RowOperation<MessageRow>>(raw) else {
            panic!("typed insert must parse");
        };
        assert_eq!(
            new,
            MessageRow {
                id: 3,
                body: "hi".to_string()
            }
        );
    }
}
