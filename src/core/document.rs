use crate::core::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Reserved identity field.
pub const ID_FIELD: &str = "_id";

/// A document: ordered map of field name to typed value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document {
    fields: BTreeMap<String, Value>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field setter.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(field.into(), value.into())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Document identity, when it is a text `_id`.
    pub fn id(&self) -> Option<&str> {
        self.fields.get(ID_FIELD).and_then(Value::as_str)
    }

    /// Identity used for de-duplication; any `_id` kind is accepted.
    pub fn identity_key(&self) -> Option<String> {
        self.fields.get(ID_FIELD).map(Value::canonical_key)
    }

    /// Assigns a fresh v4 identifier when the document has none.
    pub fn ensure_id(&mut self) -> String {
        if let Some(existing) = self.fields.get(ID_FIELD) {
            return existing.key_string();
        }
        let id = Uuid::new_v4().to_string();
        self.fields.insert(ID_FIELD.to_string(), Value::Text(id.clone()));
        id
    }

    /// Keeps only the listed fields (plus `_id`).
    pub fn project(&self, fields: &[String]) -> Document {
        let mut projected = Document::new();
        for (name, value) in &self.fields {
            if name == ID_FIELD || fields.iter().any(|f| f == name) {
                projected.fields.insert(name.clone(), value.clone());
            }
        }
        projected
    }

    /// Serialized size in bytes, used for storage accounting.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map(|bytes| bytes.len()).unwrap_or(0)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Document {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl TryFrom<serde_json::Value> for Document {
    type Error = crate::core::ShardError;

    fn try_from(json: serde_json::Value) -> crate::core::Result<Self> {
        match json {
            serde_json::Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| Value::try_from(v).map(|v| (k, v)))
                .collect(),
            other => Err(crate::core::ShardError::TypeMismatch(format!(
                "document must be a JSON object, got {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_id_keeps_existing_identity() {
        let mut doc = Document::new().with("_id", "fixed").with("name", "Ada");
        assert_eq!(doc.ensure_id(), "fixed");

        let mut fresh = Document::new().with("name", "Bob");
        let id = fresh.ensure_id();
        assert_eq!(fresh.id(), Some(id.as_str()));
        assert_eq!(fresh.ensure_id(), id);
    }

    #[test]
    fn projection_always_keeps_identity() {
        let doc = Document::new()
            .with("_id", "a")
            .with("name", "Ada")
            .with("age", 36);
        let projected = doc.project(&["age".to_string()]);
        assert_eq!(projected.len(), 2);
        assert!(projected.contains("_id"));
        assert!(!projected.contains("name"));
    }

    #[test]
    fn json_objects_convert_to_documents() {
        let doc =
            Document::try_from(serde_json::json!({"_id": "x", "score": 4, "tags": ["a"]})).unwrap();
        assert_eq!(doc.id(), Some("x"));
        assert_eq!(doc.get("score"), Some(&Value::Integer(4)));
        assert!(Document::try_from(serde_json::json!([1])).is_err());
    }
}
