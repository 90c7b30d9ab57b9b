//! Aggregation expressions.
//!
//! Expressions are compiled once from their document form and evaluated
//! against a single input document. They back the `set`/`addFields`
//! field values, computed `project` fields, `group` keys and accumulators,
//! and the `$expr` query operator.
//!
//! Compile rules:
//! - `"$path.to.field"` reads a field (missing reads as `null`)
//! - `"$$ROOT"` is the whole input document, `"$$ROOT.a"` is the same as `"$a"`
//! - a mapping with one `$`-prefixed key is an operator call
//! - any other mapping or array is evaluated element-wise
//! - everything else is a literal

use std::cmp::Ordering;

use fluxion_types::document::Document;
use fluxion_types::error::{ConfigurationError, EvaluationErrorKind};
use fluxion_types::value::{Number, Value};

/// Comparison operators shared by expressions and query predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparison {
    pub(crate) fn from_operator(op: &str) -> Option<Self> {
        match op {
            "$eq" => Some(Self::Eq),
            "$ne" => Some(Self::Ne),
            "$gt" => Some(Self::Gt),
            "$gte" => Some(Self::Gte),
            "$lt" => Some(Self::Lt),
            "$lte" => Some(Self::Lte),
            _ => None,
        }
    }

    /// Expression semantics: equality is structural, ordering is the total order.
    fn holds(self, left: &Value, right: &Value) -> bool {
        match self {
            Self::Eq => left == right,
            Self::Ne => left != right,
            _ => self.accepts(left.total_cmp(right)),
        }
    }

    /// Whether an ordering between two values satisfies the comparison.
    pub(crate) fn accepts(self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::Ne => ordering != Ordering::Equal,
            Self::Gt => ordering == Ordering::Greater,
            Self::Gte => ordering != Ordering::Less,
            Self::Lt => ordering == Ordering::Less,
            Self::Lte => ordering != Ordering::Greater,
        }
    }
}

/// A compiled aggregation expression.
#[derive(Debug, Clone)]
pub enum Expression {
    Literal(Value),
    Field(String),
    Root,
    Object(Vec<(String, Expression)>),
    Array(Vec<Expression>),
    Add(Vec<Expression>),
    Subtract(Box<Expression>, Box<Expression>),
    Multiply(Vec<Expression>),
    Divide(Box<Expression>, Box<Expression>),
    Mod(Box<Expression>, Box<Expression>),
    Abs(Box<Expression>),
    Concat(Vec<Expression>),
    ToUpper(Box<Expression>),
    ToLower(Box<Expression>),
    ToString(Box<Expression>),
    Compare(Comparison, Box<Expression>, Box<Expression>),
    Cmp(Box<Expression>, Box<Expression>),
    And(Vec<Expression>),
    Or(Vec<Expression>),
    Not(Box<Expression>),
    Cond {
        condition: Box<Expression>,
        then: Box<Expression>,
        otherwise: Box<Expression>,
    },
    IfNull(Vec<Expression>),
    Size(Box<Expression>),
    In(Box<Expression>, Box<Expression>),
}

impl Expression {
    /// Compile an expression from its document form.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] for unknown operators, wrong operand
    /// counts and malformed variable references.
    pub fn compile(spec: &Value) -> Result<Self, ConfigurationError> {
        match spec {
            Value::String(s) => compile_string(s),
            Value::Array(items) => Ok(Self::Array(compile_all(items)?)),
            Value::Mapping(doc) => compile_mapping(doc),
            other => Ok(Self::Literal(other.clone())),
        }
    }

    /// Evaluate against one document.
    ///
    /// # Errors
    ///
    /// Returns an [`EvaluationErrorKind`] on type mismatches and division by zero.
    pub fn evaluate(&self, doc: &Document) -> Result<Value, EvaluationErrorKind> {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::Field(path) => Ok(doc.get_path(path).cloned().unwrap_or_default()),
            Self::Root => Ok(Value::Mapping(doc.clone())),
            Self::Object(fields) => {
                let mut out = Document::with_capacity(fields.len());
                for (key, expr) in fields {
                    out.insert(key.clone(), expr.evaluate(doc)?);
                }
                Ok(Value::Mapping(out))
            }
            Self::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|expr| expr.evaluate(doc))
                    .collect::<Result<_, _>>()?,
            )),
            Self::Add(operands) => fold_numeric("$add", operands, doc, Number::Int(0), Number::add),
            Self::Multiply(operands) => {
                fold_numeric("$multiply", operands, doc, Number::Int(1), Number::mul)
            }
            Self::Subtract(a, b) => binary_numeric("$subtract", a, b, doc, |x, y| Ok(x.sub(y))),
            Self::Divide(a, b) => binary_numeric("$divide", a, b, doc, |x, y| {
                if y.is_zero() {
                    Err(divide_by_zero("$divide"))
                } else {
                    Ok(x.div(y))
                }
            }),
            Self::Mod(a, b) => binary_numeric("$mod", a, b, doc, |x, y| {
                if y.is_zero() {
                    Err(divide_by_zero("$mod"))
                } else {
                    Ok(x.rem(y))
                }
            }),
            Self::Abs(a) => Ok(numeric_operand("$abs", a.evaluate(doc)?)?
                .map_or(Value::Null, |n| Value::Number(n.abs()))),
            Self::Concat(operands) => {
                let mut out = String::new();
                for expr in operands {
                    match expr.evaluate(doc)? {
                        Value::Null => return Ok(Value::Null),
                        Value::String(s) => out.push_str(&s),
                        other => return Err(type_mismatch("$concat", "string", &other)),
                    }
                }
                Ok(Value::String(out))
            }
            Self::ToUpper(a) => Ok(Value::String(a.evaluate(doc)?.to_plain_string().to_uppercase())),
            Self::ToLower(a) => Ok(Value::String(a.evaluate(doc)?.to_plain_string().to_lowercase())),
            Self::ToString(a) => {
                let value = a.evaluate(doc)?;
                Ok(if value.is_null() {
                    Value::Null
                } else {
                    Value::String(value.to_plain_string())
                })
            }
            Self::Compare(comparison, a, b) => {
                Ok(Value::Bool(comparison.holds(&a.evaluate(doc)?, &b.evaluate(doc)?)))
            }
            Self::Cmp(a, b) => {
                let ordering = a.evaluate(doc)?.total_cmp(&b.evaluate(doc)?);
                Ok(Value::from(ordering as i64))
            }
            Self::And(operands) => {
                for expr in operands {
                    if !expr.evaluate(doc)?.truthy() {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            Self::Or(operands) => {
                for expr in operands {
                    if expr.evaluate(doc)?.truthy() {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            Self::Not(a) => Ok(Value::Bool(!a.evaluate(doc)?.truthy())),
            Self::Cond {
                condition,
                then,
                otherwise,
            } => {
                if condition.evaluate(doc)?.truthy() {
                    then.evaluate(doc)
                } else {
                    otherwise.evaluate(doc)
                }
            }
            Self::IfNull(operands) => {
                let Some((replacement, candidates)) = operands.split_last() else {
                    return Ok(Value::Null);
                };
                for expr in candidates {
                    let value = expr.evaluate(doc)?;
                    if !value.is_null() {
                        return Ok(value);
                    }
                }
                replacement.evaluate(doc)
            }
            Self::Size(a) => match a.evaluate(doc)? {
                Value::Array(items) => Ok(Value::from(i64::try_from(items.len()).unwrap_or(i64::MAX))),
                other => Err(type_mismatch("$size", "array", &other)),
            },
            Self::In(needle, haystack) => {
                let needle = needle.evaluate(doc)?;
                match haystack.evaluate(doc)? {
                    Value::Array(items) => Ok(Value::Bool(items.contains(&needle))),
                    other => Err(type_mismatch("$in", "array", &other)),
                }
            }
        }
    }
}

// ── Compilation ─────────────────────────────────────────────────────

fn compile_all(items: &[Value]) -> Result<Vec<Expression>, ConfigurationError> {
    items.iter().map(Expression::compile).collect()
}

fn compile_string(s: &str) -> Result<Expression, ConfigurationError> {
    if let Some(variable) = s.strip_prefix("$$") {
        return match variable.split_once('.') {
            None if variable == "ROOT" => Ok(Expression::Root),
            Some(("ROOT", path)) if !path.is_empty() => Ok(Expression::Field(path.to_string())),
            _ => Err(ConfigurationError::invalid_expression(format!(
                "unknown variable '$${variable}'"
            ))),
        };
    }
    match s.strip_prefix('$') {
        Some("") => Err(ConfigurationError::invalid_expression(
            "field reference '$' has an empty path",
        )),
        Some(path) => Ok(Expression::Field(path.to_string())),
        None => Ok(Expression::Literal(Value::String(s.to_string()))),
    }
}

fn compile_mapping(doc: &Document) -> Result<Expression, ConfigurationError> {
    let operator_keys = doc.keys().filter(|key| key.starts_with('$')).count();
    if operator_keys == 0 {
        let fields = doc
            .iter()
            .map(|(key, value)| Ok((key.clone(), Expression::compile(value)?)))
            .collect::<Result<_, ConfigurationError>>()?;
        return Ok(Expression::Object(fields));
    }
    let mut entries = doc.iter();
    match (entries.next(), entries.next()) {
        (Some((op, args)), None) => compile_operator(op, args),
        _ => Err(ConfigurationError::invalid_expression(
            "an operator expression must be the only key of its object",
        )),
    }
}

fn compile_operator(op: &str, args: &Value) -> Result<Expression, ConfigurationError> {
    match op {
        "$literal" => return Ok(Expression::Literal(args.clone())),
        "$httpCall" => {
            return Err(ConfigurationError::invalid_expression(
                "$httpCall is only allowed as a top-level field value of set/addFields",
            ))
        }
        "$cond" => {
            if let Value::Mapping(branches) = args {
                return compile_cond_mapping(branches);
            }
        }
        _ => {}
    }

    let operands = match args {
        Value::Array(items) => compile_all(items)?,
        single => vec![Expression::compile(single)?],
    };

    if let Some(comparison) = Comparison::from_operator(op) {
        let [a, b] = exactly(op, operands)?;
        return Ok(Expression::Compare(comparison, Box::new(a), Box::new(b)));
    }

    let expr = match op {
        "$add" => Expression::Add(operands),
        "$multiply" => Expression::Multiply(operands),
        "$concat" => Expression::Concat(operands),
        "$and" => Expression::And(operands),
        "$or" => Expression::Or(operands),
        "$subtract" => binary(op, operands, Expression::Subtract)?,
        "$divide" => binary(op, operands, Expression::Divide)?,
        "$mod" => binary(op, operands, Expression::Mod)?,
        "$cmp" => binary(op, operands, Expression::Cmp)?,
        "$in" => binary(op, operands, Expression::In)?,
        "$abs" => unary(op, operands, Expression::Abs)?,
        "$toUpper" => unary(op, operands, Expression::ToUpper)?,
        "$toLower" => unary(op, operands, Expression::ToLower)?,
        "$toString" => unary(op, operands, Expression::ToString)?,
        "$not" => unary(op, operands, Expression::Not)?,
        "$size" => unary(op, operands, Expression::Size)?,
        "$cond" => {
            let [condition, then, otherwise] = exactly(op, operands)?;
            Expression::Cond {
                condition: Box::new(condition),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            }
        }
        "$ifNull" => {
            if operands.len() < 2 {
                return Err(ConfigurationError::invalid_expression(
                    "$ifNull takes at least 2 arguments",
                ));
            }
            Expression::IfNull(operands)
        }
        _ => {
            return Err(ConfigurationError::invalid_expression(format!(
                "unknown expression operator '{op}'"
            )))
        }
    };
    Ok(expr)
}

fn compile_cond_mapping(branches: &Document) -> Result<Expression, ConfigurationError> {
    let branch = |name: &str| -> Result<Box<Expression>, ConfigurationError> {
        let spec = branches.get(name).ok_or_else(|| {
            ConfigurationError::invalid_expression(format!("$cond is missing '{name}'"))
        })?;
        Ok(Box::new(Expression::compile(spec)?))
    };
    if let Some(unknown) = branches
        .keys()
        .find(|key| !matches!(key.as_str(), "if" | "then" | "else"))
    {
        return Err(ConfigurationError::invalid_expression(format!(
            "$cond has unknown key '{unknown}'"
        )));
    }
    Ok(Expression::Cond {
        condition: branch("if")?,
        then: branch("then")?,
        otherwise: branch("else")?,
    })
}

fn exactly<const N: usize>(
    op: &str,
    operands: Vec<Expression>,
) -> Result<[Expression; N], ConfigurationError> {
    let found = operands.len();
    operands.try_into().map_err(|_| {
        ConfigurationError::invalid_expression(format!(
            "{op} takes {N} argument(s), got {found}"
        ))
    })
}

fn unary(
    op: &str,
    operands: Vec<Expression>,
    build: fn(Box<Expression>) -> Expression,
) -> Result<Expression, ConfigurationError> {
    let [a] = exactly(op, operands)?;
    Ok(build(Box::new(a)))
}

fn binary(
    op: &str,
    operands: Vec<Expression>,
    build: fn(Box<Expression>, Box<Expression>) -> Expression,
) -> Result<Expression, ConfigurationError> {
    let [a, b] = exactly(op, operands)?;
    Ok(build(Box::new(a), Box::new(b)))
}

// ── Evaluation helpers ──────────────────────────────────────────────

pub(crate) fn type_mismatch(operator: &str, expected: &'static str, found: &Value) -> EvaluationErrorKind {
    EvaluationErrorKind::TypeMismatch {
        operator: operator.to_string(),
        expected,
        found: found.type_name(),
    }
}

fn divide_by_zero(operator: &str) -> EvaluationErrorKind {
    EvaluationErrorKind::DivideByZero {
        operator: operator.to_string(),
    }
}

/// `Ok(None)` for null operands, which propagate as a null result.
fn numeric_operand(operator: &str, value: Value) -> Result<Option<Number>, EvaluationErrorKind> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(Some(n)),
        other => Err(type_mismatch(operator, "number", &other)),
    }
}

fn fold_numeric(
    operator: &str,
    operands: &[Expression],
    doc: &Document,
    init: Number,
    combine: fn(Number, Number) -> Number,
) -> Result<Value, EvaluationErrorKind> {
    let mut acc = init;
    let mut saw_null = false;
    for expr in operands {
        match numeric_operand(operator, expr.evaluate(doc)?)? {
            Some(n) => acc = combine(acc, n),
            None => saw_null = true,
        }
    }
    Ok(if saw_null { Value::Null } else { Value::Number(acc) })
}

fn binary_numeric(
    operator: &str,
    a: &Expression,
    b: &Expression,
    doc: &Document,
    apply: impl FnOnce(Number, Number) -> Result<Number, EvaluationErrorKind>,
) -> Result<Value, EvaluationErrorKind> {
    let left = numeric_operand(operator, a.evaluate(doc)?)?;
    let right = numeric_operand(operator, b.evaluate(doc)?)?;
    match (left, right) {
        (Some(x), Some(y)) => apply(x, y).map(Value::Number),
        _ => Ok(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        Document::try_from(value).unwrap()
    }

    fn eval(spec: serde_json::Value, input: &Document) -> Result<Value, EvaluationErrorKind> {
        Expression::compile(&Value::from(spec)).unwrap().evaluate(input)
    }

    #[test]
    fn field_references_and_root() {
        let d = doc(json!({"customer": {"id": "C-1"}, "total": 10}));
        assert_eq!(eval(json!("$customer.id"), &d).unwrap(), Value::from("C-1"));
        assert_eq!(eval(json!("$missing"), &d).unwrap(), Value::Null);
        assert_eq!(eval(json!("$$ROOT.total"), &d).unwrap(), Value::from(10));
        assert_eq!(eval(json!("$$ROOT"), &d).unwrap(), Value::Mapping(d.clone()));
        assert_eq!(eval(json!("plain"), &d).unwrap(), Value::from("plain"));
    }

    #[test]
    fn arithmetic_keeps_integers_until_division() {
        let d = doc(json!({"qty": 3, "price": 2.5, "n": 7}));
        assert_eq!(eval(json!({"$add": ["$qty", 1]}), &d).unwrap().to_string(), "4");
        assert_eq!(
            eval(json!({"$multiply": ["$qty", "$price"]}), &d).unwrap(),
            Value::from(7.5)
        );
        assert_eq!(eval(json!({"$subtract": ["$n", "$qty"]}), &d).unwrap(), Value::from(4));
        assert_eq!(eval(json!({"$divide": ["$n", 2]}), &d).unwrap(), Value::from(3.5));
        assert_eq!(eval(json!({"$mod": ["$n", 4]}), &d).unwrap(), Value::from(3));
        assert_eq!(eval(json!({"$abs": -4}), &d).unwrap(), Value::from(4));
    }

    #[test]
    fn arithmetic_on_null_yields_null() {
        let d = doc(json!({"qty": 3}));
        assert_eq!(eval(json!({"$add": ["$qty", "$missing"]}), &d).unwrap(), Value::Null);
        assert_eq!(eval(json!({"$divide": [null, 0]}), &d).unwrap(), Value::Null);
    }

    #[test]
    fn arithmetic_type_mismatch_and_divide_by_zero() {
        let d = doc(json!({"qty": 3, "name": "x"}));
        let err = eval(json!({"$add": ["$qty", "$name"]}), &d).unwrap_err();
        assert_eq!(
            err,
            EvaluationErrorKind::TypeMismatch {
                operator: "$add".into(),
                expected: "number",
                found: "string"
            }
        );
        let err = eval(json!({"$divide": ["$qty", 0]}), &d).unwrap_err();
        assert!(matches!(err, EvaluationErrorKind::DivideByZero { .. }));
    }

    #[test]
    fn string_operators() {
        let d = doc(json!({"first": "Ada", "last": "Lovelace", "n": 3}));
        assert_eq!(
            eval(json!({"$concat": ["$first", " ", "$last"]}), &d).unwrap(),
            Value::from("Ada Lovelace")
        );
        assert_eq!(eval(json!({"$concat": ["$first", "$nope"]}), &d).unwrap(), Value::Null);
        assert_eq!(eval(json!({"$toUpper": "$first"}), &d).unwrap(), Value::from("ADA"));
        assert_eq!(eval(json!({"$toLower": "$last"}), &d).unwrap(), Value::from("lovelace"));
        assert_eq!(eval(json!({"$toString": "$n"}), &d).unwrap(), Value::from("3"));
    }

    #[test]
    fn conditionals_and_logic() {
        let d = doc(json!({"total": 150, "note": null}));
        let tier = json!({"$cond": {"if": {"$gte": ["$total", 100]}, "then": "HIGH", "else": "LOW"}});
        assert_eq!(eval(tier, &d).unwrap(), Value::from("HIGH"));
        let tier = json!({"$cond": [{"$lt": ["$total", 100]}, "LOW", "HIGH"]});
        assert_eq!(eval(tier, &d).unwrap(), Value::from("HIGH"));
        assert_eq!(
            eval(json!({"$ifNull": ["$note", "$missing", "none"]}), &d).unwrap(),
            Value::from("none")
        );
        assert_eq!(
            eval(json!({"$and": [{"$gt": ["$total", 1]}, {"$not": [false]}]}), &d).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(eval(json!({"$cmp": ["$total", 200]}), &d).unwrap(), Value::from(-1));
    }

    #[test]
    fn array_operators() {
        let d = doc(json!({"tags": ["a", "b"], "tag": "b"}));
        assert_eq!(eval(json!({"$size": "$tags"}), &d).unwrap(), Value::from(2));
        assert_eq!(eval(json!({"$in": ["$tag", "$tags"]}), &d).unwrap(), Value::Bool(true));
        assert!(eval(json!({"$size": "$tag"}), &d).is_err());
    }

    #[test]
    fn literal_suppresses_interpretation() {
        let d = Document::new();
        assert_eq!(eval(json!({"$literal": "$notAField"}), &d).unwrap(), Value::from("$notAField"));
    }

    #[test]
    fn compile_errors() {
        for spec in [
            json!({"$frobnicate": 1}),
            json!({"$subtract": [1]}),
            json!({"$add": [1], "other": 2}),
            json!({"$httpCall": {"url": "http://x"}}),
            json!("$$NOW"),
            json!("$"),
            json!({"$cond": {"if": true, "then": 1}}),
        ] {
            let err = Expression::compile(&Value::from(spec.clone())).unwrap_err();
            assert_eq!(err.code, "INVALID_EXPRESSION", "{spec}");
        }
    }
}
