//! Query predicates for the `match` stage.

use fluxion_types::document::Document;
use fluxion_types::error::{ConfigurationError, EvaluationErrorKind};
use fluxion_types::value::Value;
use regex::Regex;

use crate::expression::{Comparison, Expression};

/// A compiled query.
#[derive(Debug, Clone)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Nor(Vec<Predicate>),
    Field {
        path: String,
        conditions: Vec<FieldCondition>,
    },
    Expr(Expression),
}

/// One operator applied to the value at a field path.
#[derive(Debug, Clone)]
pub enum FieldCondition {
    Compare(Comparison, Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Regex(Regex),
    Size(usize),
    Not(Vec<FieldCondition>),
}

impl Predicate {
    /// Compile a query document.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] for unknown operators and malformed operands.
    pub fn compile(query: &Value) -> Result<Self, ConfigurationError> {
        let Value::Mapping(query) = query else {
            return Err(invalid(format!(
                "a query must be a mapping, found {}",
                query.type_name()
            )));
        };
        let mut clauses = Vec::with_capacity(query.len());
        for (key, value) in query {
            let clause = match key.as_str() {
                "$and" => Self::And(compile_clause_list(key, value)?),
                "$or" => Self::Or(compile_clause_list(key, value)?),
                "$nor" => Self::Nor(compile_clause_list(key, value)?),
                "$expr" => Self::Expr(Expression::compile(value)?),
                op if op.starts_with('$') => {
                    return Err(invalid(format!("unknown query operator '{op}'")))
                }
                path => Self::Field {
                    path: path.to_string(),
                    conditions: compile_conditions(value)?,
                },
            };
            clauses.push(clause);
        }
        Ok(if clauses.len() == 1 {
            clauses.remove(0)
        } else {
            Self::And(clauses)
        })
    }

    /// # Errors
    ///
    /// Only `$expr` clauses can fail, with the expression's evaluation error.
    pub fn matches(&self, doc: &Document) -> Result<bool, EvaluationErrorKind> {
        match self {
            Self::And(clauses) => {
                for clause in clauses {
                    if !clause.matches(doc)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Or(clauses) => {
                for clause in clauses {
                    if clause.matches(doc)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Self::Nor(clauses) => {
                for clause in clauses {
                    if clause.matches(doc)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Field { path, conditions } => {
                let value = doc.get_path(path);
                Ok(conditions.iter().all(|c| c.matches(value)))
            }
            Self::Expr(expr) => Ok(expr.evaluate(doc)?.truthy()),
        }
    }
}

impl FieldCondition {
    /// `value` is `None` when the field is missing.
    #[must_use]
    pub fn matches(&self, value: Option<&Value>) -> bool {
        match self {
            Self::Compare(Comparison::Eq, literal) => equals(value, literal),
            Self::Compare(Comparison::Ne, literal) => !equals(value, literal),
            Self::Compare(comparison, literal) => {
                value.is_some_and(|v| in_range(*comparison, v, literal))
            }
            Self::In(literals) => literals.iter().any(|literal| equals(value, literal)),
            Self::Nin(literals) => !literals.iter().any(|literal| equals(value, literal)),
            Self::Exists(expected) => value.is_some() == *expected,
            Self::Regex(re) => match value {
                Some(Value::String(s)) => re.is_match(s),
                Some(Value::Array(items)) => items
                    .iter()
                    .any(|item| item.as_str().is_some_and(|s| re.is_match(s))),
                _ => false,
            },
            Self::Size(expected) => {
                matches!(value, Some(Value::Array(items)) if items.len() == *expected)
            }
            Self::Not(conditions) => !conditions.iter().all(|c| c.matches(value)),
        }
    }
}

/// Equality with query semantics: a missing field equals `null`, and an
/// array field matches when any element equals a non-array literal.
fn equals(value: Option<&Value>, literal: &Value) -> bool {
    match value {
        None => literal.is_null(),
        Some(v) if v == literal => true,
        Some(Value::Array(items)) if !matches!(literal, Value::Array(_)) => {
            items.contains(literal)
        }
        Some(_) => false,
    }
}

/// Range comparison only succeeds between values of the same type.
fn in_range(comparison: Comparison, value: &Value, literal: &Value) -> bool {
    if let Some(ordering) = value.compare_same_type(literal) {
        if comparison.accepts(ordering) {
            return true;
        }
    }
    match value {
        Value::Array(items) => items.iter().any(|item| {
            item.compare_same_type(literal)
                .is_some_and(|ordering| comparison.accepts(ordering))
        }),
        _ => false,
    }
}

// ── Compilation ─────────────────────────────────────────────────────

fn invalid(message: impl Into<String>) -> ConfigurationError {
    ConfigurationError::new("INVALID_QUERY", message)
}

fn compile_clause_list(op: &str, value: &Value) -> Result<Vec<Predicate>, ConfigurationError> {
    match value {
        Value::Array(items) if !items.is_empty() => items.iter().map(Predicate::compile).collect(),
        _ => Err(invalid(format!("{op} takes a non-empty array of queries"))),
    }
}

fn compile_conditions(value: &Value) -> Result<Vec<FieldCondition>, ConfigurationError> {
    let Value::Mapping(spec) = value else {
        return Ok(vec![FieldCondition::Compare(Comparison::Eq, value.clone())]);
    };
    let operator_keys = spec.keys().filter(|key| key.starts_with('$')).count();
    if operator_keys == 0 {
        return Ok(vec![FieldCondition::Compare(Comparison::Eq, value.clone())]);
    }
    if operator_keys != spec.len() {
        return Err(invalid("cannot mix query operators and plain fields"));
    }

    let options = match spec.get("$options") {
        None => "",
        Some(Value::String(s)) => s.as_str(),
        Some(other) => {
            return Err(invalid(format!(
                "$options must be a string, found {}",
                other.type_name()
            )))
        }
    };

    let mut conditions = Vec::with_capacity(spec.len());
    for (op, operand) in spec {
        let condition = match op.as_str() {
            "$options" => {
                if !spec.contains_key("$regex") {
                    return Err(invalid("$options requires $regex"));
                }
                continue;
            }
            "$in" => FieldCondition::In(literal_list(op, operand)?),
            "$nin" => FieldCondition::Nin(literal_list(op, operand)?),
            "$exists" => FieldCondition::Exists(operand.truthy()),
            "$regex" => FieldCondition::Regex(compile_regex(operand, options)?),
            "$size" => {
                let size = operand
                    .as_i64()
                    .and_then(|n| usize::try_from(n).ok())
                    .ok_or_else(|| invalid("$size takes a non-negative integer"))?;
                FieldCondition::Size(size)
            }
            "$not" => match operand {
                Value::Mapping(_) => FieldCondition::Not(compile_conditions(operand)?),
                _ => return Err(invalid("$not takes an operator mapping")),
            },
            other => match Comparison::from_operator(other) {
                Some(comparison) => FieldCondition::Compare(comparison, operand.clone()),
                None => return Err(invalid(format!("unknown query operator '{other}'"))),
            },
        };
        conditions.push(condition);
    }
    Ok(conditions)
}

fn literal_list(op: &str, operand: &Value) -> Result<Vec<Value>, ConfigurationError> {
    operand
        .as_array()
        .map(<[Value]>::to_vec)
        .ok_or_else(|| invalid(format!("{op} takes an array")))
}

fn compile_regex(pattern: &Value, options: &str) -> Result<Regex, ConfigurationError> {
    let Some(pattern) = pattern.as_str() else {
        return Err(invalid("$regex takes a string pattern"));
    };
    if let Some(flag) = options.chars().find(|c| !matches!(c, 'i' | 'm' | 's' | 'x')) {
        return Err(invalid(format!("unsupported regex option '{flag}'")));
    }
    let source = if options.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{options}){pattern}")
    };
    Regex::new(&source).map_err(|e| invalid(format!("invalid regex '{pattern}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        Document::try_from(value).unwrap()
    }

    fn query(spec: serde_json::Value) -> Predicate {
        Predicate::compile(&Value::from(spec)).unwrap()
    }

    #[test]
    fn equality_semantics() {
        let d = doc(json!({"status": "PAID", "tags": ["vip", "eu"], "note": null}));
        assert!(query(json!({"status": "PAID"})).matches(&d).unwrap());
        assert!(!query(json!({"status": "PENDING"})).matches(&d).unwrap());
        assert!(query(json!({"tags": "vip"})).matches(&d).unwrap());
        assert!(query(json!({"missing": null})).matches(&d).unwrap());
        assert!(query(json!({"note": null})).matches(&d).unwrap());
        assert!(query(json!({})).matches(&d).unwrap());
    }

    #[test]
    fn range_operators_need_same_type() {
        let d = doc(json!({"total": 120.0, "code": "120"}));
        assert!(query(json!({"total": {"$gt": 100, "$lte": 120}})).matches(&d).unwrap());
        assert!(!query(json!({"total": {"$gt": "100"}})).matches(&d).unwrap());
        assert!(!query(json!({"code": {"$gt": 1}})).matches(&d).unwrap());
        assert!(!query(json!({"missing": {"$lt": 5}})).matches(&d).unwrap());
    }

    #[test]
    fn membership_existence_and_size() {
        let d = doc(json!({"status": "PAID", "items": [1, 2, 3]}));
        assert!(query(json!({"status": {"$in": ["PAID", "SHIPPED"]}})).matches(&d).unwrap());
        assert!(query(json!({"status": {"$nin": ["VOID"]}})).matches(&d).unwrap());
        assert!(query(json!({"items": {"$exists": true}})).matches(&d).unwrap());
        assert!(query(json!({"gone": {"$exists": false}})).matches(&d).unwrap());
        assert!(query(json!({"items": {"$size": 3}})).matches(&d).unwrap());
        assert!(query(json!({"status": {"$ne": "VOID"}})).matches(&d).unwrap());
    }

    #[test]
    fn regex_with_options() {
        let d = doc(json!({"email": "Ada@Example.com"}));
        assert!(query(json!({"email": {"$regex": "example\\.com$", "$options": "i"}}))
            .matches(&d)
            .unwrap());
        assert!(!query(json!({"email": {"$regex": "example\\.com$"}})).matches(&d).unwrap());
    }

    #[test]
    fn logical_operators() {
        let d = doc(json!({"status": "PAID", "total": 5}));
        assert!(query(json!({"$or": [{"status": "VOID"}, {"total": {"$lt": 10}}]}))
            .matches(&d)
            .unwrap());
        assert!(!query(json!({"$nor": [{"status": "PAID"}]})).matches(&d).unwrap());
        assert!(query(json!({"$and": [{"status": "PAID"}, {"total": 5}]})).matches(&d).unwrap());
        assert!(query(json!({"total": {"$not": {"$gt": 10}}})).matches(&d).unwrap());
    }

    #[test]
    fn expr_uses_truthiness_and_propagates_errors() {
        let d = doc(json!({"spent": 50, "budget": 40, "name": "x"}));
        assert!(query(json!({"$expr": {"$gt": ["$spent", "$budget"]}})).matches(&d).unwrap());
        let err = query(json!({"$expr": {"$add": ["$name", 1]}})).matches(&d).unwrap_err();
        assert!(matches!(err, EvaluationErrorKind::TypeMismatch { .. }));
    }

    #[test]
    fn compile_errors() {
        for spec in [
            json!({"$where": "1"}),
            json!({"a": {"$bogus": 1}}),
            json!({"a": {"$gt": 1, "b": 2}}),
            json!({"$or": []}),
            json!({"a": {"$in": 3}}),
            json!({"a": {"$regex": "("}}),
            json!({"a": {"$size": -1}}),
        ] {
            assert!(Predicate::compile(&Value::from(spec.clone())).is_err(), "{spec}");
        }
        assert!(Predicate::compile(&Value::from(3)).is_err());
    }
}
