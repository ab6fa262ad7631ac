//! Batch commit payloads.
//!
//! `save_changes` turns a session's staged state into one
//! [`SaveChangesData`]: deferred raw commands first, then deletes, then
//! puts, submitted as a single `POST {base}/bulk_docs`. The server answers
//! with a `"Results"` array whose entries carry a `"Type"` discriminator,
//! parsed through the closed [`BatchResultType`] enum.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One `PUT` entry in a batch body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PutCommandData {
    #[serde(rename = "Type")]
    pub kind: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_vector: Option<String>,
    pub document: Value,
}

impl PutCommandData {
    pub fn new(id: impl Into<String>, change_vector: Option<String>, document: Value) -> Self {
        Self {
            kind: "PUT".to_string(),
            id: id.into(),
            change_vector,
            document,
        }
    }
}

/// One `DELETE` entry in a batch body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeleteCommandData {
    #[serde(rename = "Type")]
    pub kind: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_vector: Option<String>,
}

impl DeleteCommandData {
    pub fn new(id: impl Into<String>, change_vector: Option<String>) -> Self {
        Self {
            kind: "DELETE".to_string(),
            id: id.into(),
            change_vector,
        }
    }
}

/// Accumulates the ordered command list for one commit.
///
/// Deferred commands are included verbatim and counted separately so the
/// session can report how many of the batch entries it did not author.
#[derive(Debug, Clone, Default)]
pub struct SaveChangesData {
    pub commands: Vec<Value>,
    pub deferred_commands_count: usize,
}

impl SaveChangesData {
    /// Starts from the session's deferred commands, which always lead the
    /// batch.
    pub fn with_deferred(deferred: Vec<Value>) -> Self {
        Self {
            deferred_commands_count: deferred.len(),
            commands: deferred,
        }
    }

    pub fn push_delete(&mut self, delete: DeleteCommandData) {
        // serializing a field-only struct cannot fail
        self.commands
            .push(serde_json::to_value(delete).unwrap_or(Value::Null));
    }

    pub fn push_put(&mut self, put: PutCommandData) {
        self.commands
            .push(serde_json::to_value(put).unwrap_or(Value::Null));
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Discriminator of one batch result entry.
///
/// Closed on purpose: an unrecognized `"Type"` maps to `NotImplemented`
/// rather than an error, so one unknown entry cannot fail a whole commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchResultType {
    Put,
    Delete,
    NotImplemented(String),
}

impl BatchResultType {
    /// Reads the discriminator out of one `"Results"` entry.
    pub fn of(result: &Value) -> Self {
        match result.get("Type").and_then(Value::as_str) {
            Some("PUT") => BatchResultType::Put,
            Some("DELETE") => BatchResultType::Delete,
            Some(other) => BatchResultType::NotImplemented(other.to_string()),
            None => BatchResultType::NotImplemented(String::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_command_serialization() {
        let put = PutCommandData::new(
            "users/1",
            Some("A:1-xyz".to_string()),
            json!({"name": "a"}),
        );
        let value = serde_json::to_value(&put).unwrap();
        assert_eq!(
            value,
            json!({
                "Type": "PUT",
                "Id": "users/1",
                "ChangeVector": "A:1-xyz",
                "Document": {"name": "a"}
            })
        );
    }

    #[test]
    fn test_put_command_omits_absent_change_vector() {
        let put = PutCommandData::new("users/1", None, json!({}));
        let value = serde_json::to_value(&put).unwrap();
        assert!(value.get("ChangeVector").is_none());
    }

    #[test]
    fn test_delete_command_serialization() {
        let delete = DeleteCommandData::new("users/2", None);
        let value = serde_json::to_value(&delete).unwrap();
        assert_eq!(value, json!({"Type": "DELETE", "Id": "users/2"}));
    }

    #[test]
    fn test_save_changes_data_ordering() {
        let deferred = vec![json!({"Type": "PATCH", "Id": "users/9"})];
        let mut data = SaveChangesData::with_deferred(deferred);
        data.push_delete(DeleteCommandData::new("users/2", None));
        data.push_put(PutCommandData::new("users/1", None, json!({"name": "a"})));

        assert_eq!(data.deferred_commands_count, 1);
        assert_eq!(data.commands.len(), 3);
        assert_eq!(data.commands[0]["Type"], "PATCH");
        assert_eq!(data.commands[1]["Type"], "DELETE");
        assert_eq!(data.commands[2]["Type"], "PUT");
    }

    #[test]
    fn test_save_changes_data_empty() {
        let data = SaveChangesData::default();
        assert!(data.is_empty());
        assert_eq!(data.deferred_commands_count, 0);
    }

    #[test]
    fn test_batch_result_type_parsing() {
        assert_eq!(
            BatchResultType::of(&json!({"Type": "PUT", "@id": "users/1"})),
            BatchResultType::Put
        );
        assert_eq!(
            BatchResultType::of(&json!({"Type": "DELETE"})),
            BatchResultType::Delete
        );
        assert_eq!(
            BatchResultType::of(&json!({"Type": "COMPARE_EXCHANGE"})),
            BatchResultType::NotImplemented("COMPARE_EXCHANGE".to_string())
        );
        assert_eq!(
            BatchResultType::of(&json!({"@id": "users/1"})),
            BatchResultType::NotImplemented(String::new())
        );
    }
}
