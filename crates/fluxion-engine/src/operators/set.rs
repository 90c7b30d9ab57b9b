//! `set` / `addFields`.

use fluxion_types::document::Document;
use fluxion_types::error::{ConfigurationError, EvaluationErrorKind};
use fluxion_types::value::Value;

use super::{check_field_name, EvalScope, OperatorFailure};
use crate::enrich::{CircuitRegistry, HttpCallOperator};
use crate::expression::Expression;

#[derive(Debug)]
enum FieldValue {
    Expr(Expression),
    HttpCall(Box<HttpCallOperator>),
}

/// Adds or replaces fields. Every value is computed from the input document
/// before any field is written, so fields never observe each other.
#[derive(Debug)]
pub struct SetOperator {
    fields: Vec<(String, FieldValue)>,
}

impl SetOperator {
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] for an empty or non-mapping spec,
    /// invalid field names or invalid expressions.
    pub fn compile(
        operator: &str,
        spec: &Value,
        circuits: &CircuitRegistry,
    ) -> Result<Self, ConfigurationError> {
        let Value::Mapping(spec) = spec else {
            return Err(ConfigurationError::invalid_stage(
                operator,
                format!("expected a mapping of fields, found {}", spec.type_name()),
            ));
        };
        if spec.is_empty() {
            return Err(ConfigurationError::invalid_stage(operator, "no fields to set"));
        }
        let mut fields = Vec::with_capacity(spec.len());
        for (name, value) in spec {
            check_field_name(operator, name)?;
            let field = match http_call_spec(value) {
                Some(call) => {
                    let call = HttpCallOperator::compile(call, circuits)?;
                    if call.target().is_some() {
                        return Err(ConfigurationError::invalid_stage(
                            operator,
                            format!("$httpCall in field '{name}' cannot declare a target"),
                        ));
                    }
                    FieldValue::HttpCall(Box::new(call))
                }
                None => FieldValue::Expr(Expression::compile(value)?),
            };
            fields.push((name.clone(), field));
        }
        Ok(Self { fields })
    }

    #[must_use]
    pub fn has_enrichment(&self) -> bool {
        self.fields
            .iter()
            .any(|(_, value)| matches!(value, FieldValue::HttpCall(_)))
    }

    /// # Errors
    ///
    /// Returns the first document's evaluation or enrichment failure.
    pub async fn apply(
        &self,
        batch: Vec<Document>,
        scope: EvalScope<'_>,
    ) -> Result<Vec<Document>, OperatorFailure> {
        let mut out = Vec::with_capacity(batch.len());
        for (index, doc) in batch.into_iter().enumerate() {
            let mut values = Vec::with_capacity(self.fields.len());
            for (_, field) in &self.fields {
                let value = match field {
                    FieldValue::Expr(expr) => {
                        expr.evaluate(&doc).map_err(|kind| OperatorFailure::at(index, kind))?
                    }
                    FieldValue::HttpCall(call) => call
                        .call(&doc, scope.cancel, scope.policy, scope.counters)
                        .await
                        .map_err(|e| OperatorFailure::at(index, EvaluationErrorKind::Enrichment(e)))?,
                };
                values.push(value);
            }
            let mut doc = doc;
            for ((path, _), value) in self.fields.iter().zip(values) {
                doc.set_path(path, value);
            }
            out.push(doc);
        }
        Ok(out)
    }
}

/// `{"$httpCall": {...}}` as a field value.
fn http_call_spec(value: &Value) -> Option<&Value> {
    let doc = value.as_mapping()?;
    if doc.len() == 1 {
        doc.get("$httpCall")
    } else {
        None
    }
}
