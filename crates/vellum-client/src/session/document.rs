//! Change tracking for one document inside a session.

use serde_json::{Map, Value};

/// A document the session tracks.
///
/// `entity` and `metadata` are the live, caller-visible values.
/// `original_value` and `original_metadata` snapshot the last state the
/// server confirmed; they move only when a commit round-trip completes, so
/// comparing against them tells the session what actually changed.
#[derive(Debug, Clone)]
pub struct DocumentInfo {
    pub id: String,
    pub entity: Value,
    pub change_vector: Option<String>,
    pub metadata: Value,
    pub original_metadata: Value,
    /// `None` until the server has confirmed the document once.
    pub original_value: Option<Value>,
}

impl DocumentInfo {
    /// A document staged by `store` that the server has not seen yet.
    pub fn new_pending(id: impl Into<String>, entity: Value, change_vector: Option<String>) -> Self {
        Self {
            id: id.into(),
            entity,
            change_vector,
            metadata: Value::Object(Map::new()),
            original_metadata: Value::Object(Map::new()),
            original_value: None,
        }
    }

    /// A document as the server returned it. The originals snapshot the
    /// server view; the live metadata starts as a fresh clone of it.
    pub fn from_server(id: impl Into<String>, entity: Value, metadata: Value) -> Self {
        let change_vector = metadata
            .get("@change-vector")
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            id: id.into(),
            original_metadata: metadata.clone(),
            metadata,
            change_vector,
            original_value: Some(entity.clone()),
            entity,
        }
    }

    /// Whether the live entity differs from the last server-confirmed one.
    /// Never-persisted documents always count as changed.
    pub fn has_changes(&self) -> bool {
        match &self.original_value {
            None => true,
            Some(original) => original != &self.entity,
        }
    }

    /// The value sent in a PUT: the entity, with the live metadata embedded
    /// under `@metadata` when there is any.
    pub fn document_for_put(&self) -> Value {
        let mut document = self.entity.clone();
        if let (Value::Object(target), Value::Object(metadata)) = (&mut document, &self.metadata) {
            if !metadata.is_empty() {
                target.insert("@metadata".to_string(), Value::Object(metadata.clone()));
            }
        }
        document
    }
}

/// A deletion staged in the session, by id.
#[derive(Debug, Clone)]
pub struct DeletedEntity {
    pub id: String,
    pub change_vector: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pending_document_always_has_changes() {
        let doc = DocumentInfo::new_pending("users/1", json!({"name": "a"}), None);
        assert!(doc.has_changes());
        assert!(doc.original_value.is_none());
        assert_eq!(doc.metadata, json!({}));
    }

    #[test]
    fn test_server_document_starts_unchanged() {
        let metadata = json!({"@id": "users/1", "@change-vector": "A:1-n1"});
        let doc = DocumentInfo::from_server("users/1", json!({"name": "a"}), metadata);
        assert!(!doc.has_changes());
        assert_eq!(doc.change_vector.as_deref(), Some("A:1-n1"));
        assert_eq!(doc.original_metadata, doc.metadata);
    }

    #[test]
    fn test_mutation_is_detected_against_original() {
        let metadata = json!({"@id": "users/1"});
        let mut doc = DocumentInfo::from_server("users/1", json!({"name": "a"}), metadata);
        doc.entity["name"] = json!("b");
        assert!(doc.has_changes());
        // the original is untouched by the live mutation
        assert_eq!(doc.original_value.as_ref().unwrap()["name"], "a");
    }

    #[test]
    fn test_document_for_put_embeds_metadata() {
        let metadata = json!({"@collection": "Users"});
        let doc = DocumentInfo::from_server("users/1", json!({"name": "a"}), metadata);
        let put = doc.document_for_put();
        assert_eq!(put["name"], "a");
        assert_eq!(put["@metadata"]["@collection"], "Users");
    }

    #[test]
    fn test_document_for_put_skips_empty_metadata() {
        let doc = DocumentInfo::new_pending("users/1", json!({"name": "a"}), None);
        let put = doc.document_for_put();
        assert!(put.get("@metadata").is_none());
    }
}
