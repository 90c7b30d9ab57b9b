//! Declarative pipeline stages in their wire form.

use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::error::ConfigurationError;
use crate::value::Value;

/// One pipeline operation: an operator name and its payload.
///
/// On the wire a stage is a document with exactly one key, e.g.
/// `{"$match": {"status": "PAID"}}`. The leading `$` is optional and is
/// stripped on parse, so `match` and `$match` name the same operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Document", into = "Document")]
pub struct Stage {
    operator: String,
    spec: Value,
}

impl Stage {
    #[must_use]
    pub fn new(operator: impl AsRef<str>, spec: impl Into<Value>) -> Self {
        Self {
            operator: normalize_operator(operator.as_ref()).to_string(),
            spec: spec.into(),
        }
    }

    /// Operator name without the `$` prefix.
    #[must_use]
    pub fn operator(&self) -> &str {
        &self.operator
    }

    #[must_use]
    pub fn spec(&self) -> &Value {
        &self.spec
    }

    /// Parse the single-key wire form.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] if the document does not have exactly one key.
    pub fn from_document(doc: Document) -> Result<Self, ConfigurationError> {
        if doc.len() != 1 {
            return Err(ConfigurationError::new(
                "INVALID_STAGE",
                format!(
                    "a stage must have exactly one operator key, found {}",
                    doc.len()
                ),
            ));
        }
        let mut entries = doc.into_iter();
        let (tag, spec) = entries
            .next()
            .ok_or_else(|| ConfigurationError::new("INVALID_STAGE", "empty stage"))?;
        let operator = normalize_operator(&tag);
        if operator.is_empty() {
            return Err(ConfigurationError::new("INVALID_STAGE", "empty operator name"));
        }
        Ok(Self {
            operator: operator.to_string(),
            spec,
        })
    }

    /// Wire form with the canonical `$`-prefixed tag.
    #[must_use]
    pub fn to_document(&self) -> Document {
        let mut doc = Document::with_capacity(1);
        doc.insert(format!("${}", self.operator), self.spec.clone());
        doc
    }
}

impl TryFrom<Document> for Stage {
    type Error = ConfigurationError;

    fn try_from(doc: Document) -> Result<Self, Self::Error> {
        Self::from_document(doc)
    }
}

impl From<Stage> for Document {
    fn from(stage: Stage) -> Self {
        stage.to_document()
    }
}

fn normalize_operator(tag: &str) -> &str {
    tag.strip_prefix('$').unwrap_or(tag)
}

/// Parse a JSON array of stage documents.
///
/// # Errors
///
/// Returns a [`ConfigurationError`] naming the first malformed stage.
pub fn stages_from_json_array(json: &str) -> Result<Vec<Stage>, ConfigurationError> {
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| ConfigurationError::new("INVALID_PIPELINE", format!("invalid JSON: {e}")))?;
    let serde_json::Value::Array(items) = value else {
        return Err(ConfigurationError::new(
            "INVALID_PIPELINE",
            "a pipeline must be a JSON array of stages",
        ));
    };
    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            let doc = Document::try_from(item).map_err(|found| {
                ConfigurationError::new(
                    "INVALID_STAGE",
                    format!("a stage must be an object, found {found}"),
                )
                .at_stage(index)
            })?;
            Stage::from_document(doc).map_err(|e| e.at_stage(index))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_tag_spellings_normalize() {
        let stages = stages_from_json_array(
            r#"[{"$match": {"status": "PAID"}}, {"group": {"_id": "$status"}}]"#,
        )
        .unwrap();
        assert_eq!(stages[0].operator(), "match");
        assert_eq!(stages[1].operator(), "group");
        assert_eq!(
            stages[0].to_document().to_string(),
            r#"{"$match":{"status":"PAID"}}"#
        );
    }

    #[test]
    fn rejects_multi_key_stage() {
        let err = stages_from_json_array(r#"[{"$match": {}}, {"$set": {}, "$project": {}}]"#)
            .unwrap_err();
        assert_eq!(err.code, "INVALID_STAGE");
        assert_eq!(err.stage_index, Some(1));
    }

    #[test]
    fn rejects_non_object_stage() {
        let err = stages_from_json_array(r#"["$match"]"#).unwrap_err();
        assert_eq!(err.stage_index, Some(0));
        assert!(err.message.contains("string"));
    }

    #[test]
    fn deserializes_from_yaml_like_value() {
        let stage: Stage = serde_json::from_str(r#"{"$limit": 5}"#).unwrap();
        assert_eq!(stage.operator(), "limit");
        assert_eq!(stage.spec(), &Value::from(5));
    }
}
