//! The unit of data flowing through a pipeline.
//!
//! A [`Document`] is an insertion-ordered mapping from field name to
//! [`Value`]. Nested fields are addressed with dotted paths (`"profile.tier"`).
//! Stages never share a document between workers: each stage produces new
//! documents from the ones it receives.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Failure to interpret JSON input as documents.
#[derive(Debug, thiserror::Error)]
pub enum DocumentParseError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected a JSON array of documents, found {found}")]
    NotAnArray { found: &'static str },
    #[error("element {index} is not a JSON object (found {found})")]
    NotAnObject { index: usize, found: &'static str },
}

/// Ordered key/value record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(IndexMap<String, Value>);

impl Document {
    #[must_use]
    pub fn new() -> Self {
        Self(IndexMap::new())
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self(IndexMap::with_capacity(capacity))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.0.get_mut(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Insert or replace a top-level field. New keys are appended; replaced
    /// keys keep their position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Remove a top-level field, preserving the order of the remaining keys.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.shift_remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> indexmap::map::Iter<'_, String, Value> {
        self.0.iter()
    }

    /// Resolve a dotted path. Numeric segments index into arrays.
    #[must_use]
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.0.get(first)?;
        for segment in segments {
            current = match current {
                Value::Mapping(doc) => doc.0.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Set the value at a dotted path, creating intermediate mappings.
    /// A non-mapping value found on the way is replaced by a mapping.
    pub fn set_path(&mut self, path: &str, value: impl Into<Value>) {
        let value = value.into();
        match path.split_once('.') {
            None => {
                self.0.insert(path.to_string(), value);
            }
            Some((head, rest)) => {
                let slot = self
                    .0
                    .entry(head.to_string())
                    .or_insert_with(|| Value::Mapping(Document::new()));
                if !matches!(slot, Value::Mapping(_)) {
                    *slot = Value::Mapping(Document::new());
                }
                if let Value::Mapping(child) = slot {
                    child.set_path(rest, value);
                }
            }
        }
    }

    /// Remove the value at a dotted path. Empty parents are kept.
    pub fn remove_path(&mut self, path: &str) -> Option<Value> {
        match path.split_once('.') {
            None => self.remove(path),
            Some((head, rest)) => match self.0.get_mut(head)? {
                Value::Mapping(child) => child.remove_path(rest),
                _ => None,
            },
        }
    }

    /// Parse a JSON object into a document.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid JSON or not an object.
    pub fn from_json_str(json: &str) -> Result<Self, DocumentParseError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        Self::try_from(value).map_err(|found| DocumentParseError::NotAnObject { index: 0, found })
    }

    /// Render as compact JSON.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        Value::Mapping(self.clone()).into()
    }
}

impl TryFrom<serde_json::Value> for Document {
    /// Name of the JSON type found instead of an object.
    type Error = &'static str;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        match Value::from(value) {
            Value::Mapping(doc) => Ok(doc),
            other => Err(other.type_name()),
        }
    }
}

impl From<IndexMap<String, Value>> for Document {
    fn from(map: IndexMap<String, Value>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Document {
    type Item = (String, Value);
    type IntoIter = indexmap::map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Document {
    type Item = (&'a String, &'a Value);
    type IntoIter = indexmap::map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

/// Parse a JSON array of objects into documents.
///
/// # Errors
///
/// Returns an error if the text is not a JSON array of objects.
pub fn documents_from_json_array(json: &str) -> Result<Vec<Document>, DocumentParseError> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    let serde_json::Value::Array(items) = value else {
        return Err(DocumentParseError::NotAnArray {
            found: Value::from(value).type_name(),
        });
    };
    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            Document::try_from(item).map_err(|found| DocumentParseError::NotAnObject { index, found })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        Document::try_from(value).unwrap()
    }

    #[test]
    fn get_path_walks_mappings_and_arrays() {
        let d = doc(json!({"profile": {"tier": "GOLD"}, "tags": ["a", "b"]}));
        assert_eq!(d.get_path("profile.tier"), Some(&Value::from("GOLD")));
        assert_eq!(d.get_path("tags.1"), Some(&Value::from("b")));
        assert_eq!(d.get_path("profile.missing"), None);
        assert_eq!(d.get_path("tags.x"), None);
    }

    #[test]
    fn set_path_creates_intermediates() {
        let mut d = doc(json!({"a": 1}));
        d.set_path("b.c.d", 5);
        d.set_path("a.x", true);
        assert_eq!(d.to_json(), json!({"a": {"x": true}, "b": {"c": {"d": 5}}}));
    }

    #[test]
    fn insert_keeps_position_of_existing_key() {
        let mut d = doc(json!({"a": 1, "b": 2, "c": 3}));
        d.insert("b", 20);
        let keys: Vec<&String> = d.keys().collect();
        assert_eq!(keys, ["a", "b", "c"]);
        d.remove("a");
        let keys: Vec<&String> = d.keys().collect();
        assert_eq!(keys, ["b", "c"]);
    }

    #[test]
    fn remove_path_nested() {
        let mut d = doc(json!({"a": {"b": 1, "c": 2}}));
        assert_eq!(d.remove_path("a.b"), Some(Value::from(1)));
        assert_eq!(d.to_json(), json!({"a": {"c": 2}}));
        assert_eq!(d.remove_path("a.zz"), None);
    }

    #[test]
    fn parse_array_of_documents() {
        let docs = documents_from_json_array(
            r#"[{"orderId": "A-100", "total": 120.0}, {"orderId": "A-101"}]"#,
        )
        .unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].get("total"), Some(&Value::from(120.0)));
    }

    #[test]
    fn parse_rejects_non_objects() {
        let err = documents_from_json_array(r#"[{"a": 1}, 3]"#).unwrap_err();
        assert!(matches!(err, DocumentParseError::NotAnObject { index: 1, found: "number" }));
        let err = documents_from_json_array(r#"{"a": 1}"#).unwrap_err();
        assert!(matches!(err, DocumentParseError::NotAnArray { found: "mapping" }));
    }

    #[test]
    fn display_is_compact_json() {
        let d = doc(json!({"customerId": "C-1", "status": "ACTIVE"}));
        assert_eq!(d.to_string(), r#"{"customerId":"C-1","status":"ACTIVE"}"#);
    }
}
