//! `group`: aggregate the current micro-batch by key.

use std::collections::HashSet;

use fluxion_types::document::Document;
use fluxion_types::error::ConfigurationError;
use fluxion_types::value::{Number, Value};
use indexmap::IndexMap;

use super::{check_field_name, OperatorFailure};
use crate::expression::Expression;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccumulatorKind {
    Sum,
    Avg,
    Min,
    Max,
    Count,
    First,
    Last,
    Push,
    AddToSet,
}

impl AccumulatorKind {
    fn parse(name: &str) -> Option<Self> {
        Some(match name.strip_prefix('$').unwrap_or(name) {
            "sum" => Self::Sum,
            "avg" => Self::Avg,
            "min" => Self::Min,
            "max" => Self::Max,
            "count" => Self::Count,
            "first" => Self::First,
            "last" => Self::Last,
            "push" => Self::Push,
            "addToSet" => Self::AddToSet,
            _ => return None,
        })
    }
}

#[derive(Debug)]
struct Accumulator {
    name: String,
    kind: AccumulatorKind,
    expr: Expression,
}

/// Running state of one accumulator within one group.
#[derive(Debug)]
enum State {
    Sum(Number),
    Avg { total: f64, count: u64 },
    Extreme(Option<Value>),
    Count(i64),
    First(Option<Value>),
    Last(Value),
    Push(Vec<Value>),
    AddToSet(Vec<Value>, HashSet<String>),
}

impl State {
    fn new(kind: AccumulatorKind) -> Self {
        match kind {
            AccumulatorKind::Sum => Self::Sum(Number::Int(0)),
            AccumulatorKind::Avg => Self::Avg { total: 0.0, count: 0 },
            AccumulatorKind::Min | AccumulatorKind::Max => Self::Extreme(None),
            AccumulatorKind::Count => Self::Count(0),
            AccumulatorKind::First => Self::First(None),
            AccumulatorKind::Last => Self::Last(Value::Null),
            AccumulatorKind::Push => Self::Push(Vec::new()),
            AccumulatorKind::AddToSet => Self::AddToSet(Vec::new(), HashSet::new()),
        }
    }

    fn fold(&mut self, kind: AccumulatorKind, value: Value) {
        match self {
            // Non-numeric values are ignored by sum and avg.
            Self::Sum(acc) => {
                if let Some(n) = value.as_number() {
                    *acc = acc.add(n);
                }
            }
            Self::Avg { total, count } => {
                if let Some(x) = value.as_f64() {
                    *total += x;
                    *count += 1;
                }
            }
            Self::Extreme(current) => {
                if value.is_null() {
                    return;
                }
                let replace = current.as_ref().map_or(true, |c| {
                    let ordering = value.total_cmp(c);
                    if kind == AccumulatorKind::Min {
                        ordering.is_lt()
                    } else {
                        ordering.is_gt()
                    }
                });
                if replace {
                    *current = Some(value);
                }
            }
            Self::Count(n) => *n += 1,
            Self::First(first) => {
                if first.is_none() {
                    *first = Some(value);
                }
            }
            Self::Last(last) => *last = value,
            Self::Push(items) => items.push(value),
            Self::AddToSet(items, seen) => {
                if seen.insert(value.canonical_key()) {
                    items.push(value);
                }
            }
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn finish(self) -> Value {
        match self {
            Self::Sum(n) => Value::Number(n),
            Self::Avg { count: 0, .. } => Value::Null,
            Self::Avg { total, count } => Value::from(total / count as f64),
            Self::Extreme(value) | Self::First(value) => value.unwrap_or_default(),
            Self::Count(n) => Value::from(n),
            Self::Last(value) => value,
            Self::Push(items) | Self::AddToSet(items, _) => Value::Array(items),
        }
    }
}

/// Groups documents by the `_id` expression.
///
/// Output has one document per distinct key in first-seen order, with `_id`
/// first and accumulators in declaration order.
#[derive(Debug)]
pub struct GroupOperator {
    key: Expression,
    accumulators: Vec<Accumulator>,
}

impl GroupOperator {
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] for a missing `_id`, unknown
    /// accumulators or malformed accumulator specs.
    pub fn compile(spec: &Value) -> Result<Self, ConfigurationError> {
        let Value::Mapping(spec) = spec else {
            return Err(ConfigurationError::invalid_stage(
                "group",
                format!("expected a mapping, found {}", spec.type_name()),
            ));
        };
        let key = spec
            .get("_id")
            .ok_or_else(|| ConfigurationError::invalid_stage("group", "missing _id"))?;
        let key = Expression::compile(key)?;

        let mut accumulators = Vec::with_capacity(spec.len().saturating_sub(1));
        for (name, value) in spec {
            if name == "_id" {
                continue;
            }
            check_field_name("group", name)?;
            if name.contains('.') {
                return Err(ConfigurationError::invalid_stage(
                    "group",
                    format!("accumulator name '{name}' cannot contain '.'"),
                ));
            }
            accumulators.push(compile_accumulator(name, value)?);
        }
        Ok(Self { key, accumulators })
    }

    /// # Errors
    ///
    /// Returns the first key or accumulator evaluation failure.
    pub fn apply(&self, batch: Vec<Document>) -> Result<Vec<Document>, OperatorFailure> {
        let mut groups: IndexMap<String, (Value, Vec<State>)> = IndexMap::new();
        for (index, doc) in batch.iter().enumerate() {
            let key = self
                .key
                .evaluate(doc)
                .map_err(|kind| OperatorFailure::at(index, kind))?;
            let (_, states) = groups.entry(key.canonical_key()).or_insert_with(|| {
                let states = self.accumulators.iter().map(|a| State::new(a.kind)).collect();
                (key, states)
            });
            for (accumulator, state) in self.accumulators.iter().zip(states.iter_mut()) {
                let value = accumulator
                    .expr
                    .evaluate(doc)
                    .map_err(|kind| OperatorFailure::at(index, kind))?;
                state.fold(accumulator.kind, value);
            }
        }

        Ok(groups
            .into_values()
            .map(|(key, states)| {
                let mut out = Document::with_capacity(self.accumulators.len() + 1);
                out.insert("_id", key);
                for (accumulator, state) in self.accumulators.iter().zip(states) {
                    out.insert(accumulator.name.clone(), state.finish());
                }
                out
            })
            .collect())
    }
}

fn compile_accumulator(name: &str, spec: &Value) -> Result<Accumulator, ConfigurationError> {
    let invalid = |detail: String| {
        ConfigurationError::invalid_stage("group", format!("accumulator '{name}': {detail}"))
    };
    let Some(doc) = spec.as_mapping().filter(|d| d.len() == 1) else {
        return Err(invalid(
            "expected a single-key mapping such as {\"$sum\": \"$field\"}".to_string(),
        ));
    };
    let Some((op, operand)) = doc.iter().next() else {
        return Err(invalid("empty accumulator".to_string()));
    };
    let kind = AccumulatorKind::parse(op)
        .ok_or_else(|| invalid(format!("unknown accumulator '{op}'")))?;
    let expr = if kind == AccumulatorKind::Count {
        Expression::Literal(Value::Null)
    } else {
        Expression::compile(operand)?
    };
    Ok(Accumulator {
        name: name.to_string(),
        kind,
        expr,
    })
}
