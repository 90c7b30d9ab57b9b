//! Dynamically-typed values carried by [`Document`]s.
//!
//! [`Value`] is a closed tagged union. Operators coerce through the helper
//! methods here instead of inspecting variants ad hoc, so the coercion rules
//! live in one place.

use std::cmp::Ordering;
use std::fmt::{self, Write as _};

use serde::{Deserialize, Serialize};

use crate::document::Document;

// ── Number ──────────────────────────────────────────────────────────

/// Numeric payload of a [`Value`].
///
/// Integers stay integers through addition, subtraction and multiplication
/// until they overflow or meet a float.
#[derive(Debug, Clone, Copy)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Float(f) => f,
        }
    }

    /// Integral view of the number, if it has one.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(i),
            Self::Float(f)
                if f.is_finite() && f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 =>
            {
                Some(f as i64)
            }
            Self::Float(_) => None,
        }
    }

    #[must_use]
    pub fn is_zero(self) -> bool {
        match self {
            Self::Int(i) => i == 0,
            Self::Float(f) => f == 0.0,
        }
    }

    #[must_use]
    pub fn add(self, other: Self) -> Self {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a
                .checked_add(b)
                .map_or_else(|| Self::Float(self.as_f64() + other.as_f64()), Self::Int),
            _ => Self::Float(self.as_f64() + other.as_f64()),
        }
    }

    #[must_use]
    pub fn sub(self, other: Self) -> Self {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a
                .checked_sub(b)
                .map_or_else(|| Self::Float(self.as_f64() - other.as_f64()), Self::Int),
            _ => Self::Float(self.as_f64() - other.as_f64()),
        }
    }

    #[must_use]
    pub fn mul(self, other: Self) -> Self {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a
                .checked_mul(b)
                .map_or_else(|| Self::Float(self.as_f64() * other.as_f64()), Self::Int),
            _ => Self::Float(self.as_f64() * other.as_f64()),
        }
    }

    /// Division always produces a float. Callers check for a zero divisor.
    #[must_use]
    pub fn div(self, other: Self) -> Self {
        Self::Float(self.as_f64() / other.as_f64())
    }

    #[must_use]
    pub fn rem(self, other: Self) -> Self {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) if b != 0 => Self::Int(a.wrapping_rem(b)),
            _ => Self::Float(self.as_f64() % other.as_f64()),
        }
    }

    #[must_use]
    pub fn abs(self) -> Self {
        match self {
            Self::Int(i) => i.checked_abs().map_or(Self::Float(self.as_f64().abs()), Self::Int),
            Self::Float(f) => Self::Float(f.abs()),
        }
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a == b,
            _ => self.as_f64() == other.as_f64(),
        }
    }
}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            _ => self.as_f64().partial_cmp(&other.as_f64()),
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
        }
    }
}

impl From<i64> for Number {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Number {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

// ── Value ───────────────────────────────────────────────────────────

/// A dynamically-typed value: `{Null, Bool, Number, String, Array, Mapping}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Value>),
    Mapping(Document),
}

impl Value {
    /// Short type name used in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Mapping(_) => "mapping",
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_number(&self) -> Option<Number> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        self.as_number().map(Number::as_f64)
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        self.as_number().and_then(Number::as_i64)
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_mapping(&self) -> Option<&Document> {
        match self {
            Self::Mapping(doc) => Some(doc),
            _ => None,
        }
    }

    /// Truthiness used by `$cond`, `$and`, `$or`, `$not` and `$expr`:
    /// null, `false` and numeric zero are false, everything else is true.
    #[must_use]
    pub fn truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Number(n) => !n.is_zero(),
            _ => true,
        }
    }

    /// Plain rendering for string contexts: strings are not quoted, null is empty.
    #[must_use]
    pub fn to_plain_string(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::String(s) => s.clone(),
            Self::Number(n) => n.to_string(),
            Self::Bool(b) => b.to_string(),
            other => other.to_string(),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Number(_) => 1,
            Self::String(_) => 2,
            Self::Mapping(_) => 3,
            Self::Array(_) => 4,
            Self::Bool(_) => 5,
        }
    }

    /// Total order across all values: by type rank
    /// (`null < number < string < mapping < array < bool`), then by content.
    #[must_use]
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Array(a), Self::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.total_cmp(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Self::Mapping(a), Self::Mapping(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    let ord = ka.cmp(kb).then_with(|| va.total_cmp(vb));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.rank().cmp(&other.rank()),
        }
    }

    /// Ordering for range predicates: only values of the same type rank compare.
    #[must_use]
    pub fn compare_same_type(&self, other: &Self) -> Option<Ordering> {
        if self.rank() == other.rank() {
            Some(self.total_cmp(other))
        } else {
            None
        }
    }

    /// Stable textual key used to partition documents into groups.
    /// Numerically equal integers and floats produce the same key.
    #[must_use]
    pub fn canonical_key(&self) -> String {
        let mut out = String::new();
        self.write_canonical(&mut out);
        out
    }

    fn write_canonical(&self, out: &mut String) {
        match self {
            Self::Null => out.push('z'),
            Self::Bool(b) => {
                let _ = write!(out, "b{b}");
            }
            Self::Number(n) => match n.as_i64() {
                Some(i) => {
                    let _ = write!(out, "n{i}");
                }
                None => {
                    let _ = write!(out, "n{}", n.as_f64());
                }
            },
            Self::String(s) => {
                let _ = write!(out, "s{}:{s}", s.len());
            }
            Self::Array(items) => {
                out.push('[');
                for item in items {
                    item.write_canonical(out);
                    out.push(',');
                }
                out.push(']');
            }
            Self::Mapping(doc) => {
                out.push('{');
                for (key, value) in doc.iter() {
                    let _ = write!(out, "{}:{key}=", key.len());
                    value.write_canonical(out);
                    out.push(',');
                }
                out.push('}');
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Mapping(a), Self::Mapping(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json: serde_json::Value = self.clone().into();
        write!(f, "{json}")
    }
}

// ── Conversions ─────────────────────────────────────────────────────

impl From<serde_json::Value> for Value {
    #[allow(clippy::cast_precision_loss)]
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Number(Number::Int(i))
                } else if let Some(u) = n.as_u64() {
                    Self::Number(Number::Float(u as f64))
                } else {
                    Self::Number(Number::Float(n.as_f64().unwrap_or(f64::NAN)))
                }
            }
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Self::from).collect())
            }
            serde_json::Value::Object(map) => Self::Mapping(
                map.into_iter()
                    .map(|(key, value)| (key, Self::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(Number::Int(i)) => Self::Number(i.into()),
            Value::Number(Number::Float(f)) => {
                serde_json::Number::from_f64(f).map_or(Self::Null, Self::Number)
            }
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            Value::Mapping(doc) => Self::Object(
                doc.into_iter()
                    .map(|(key, value)| (key, Self::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Number(Number::Int(value))
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Number(Number::Int(i64::from(value)))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Number(Number::Float(value))
    }
}

impl From<Number> for Value {
    fn from(value: Number) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Self::Array(value)
    }
}

impl From<Document> for Value {
    fn from(value: Document) -> Self {
        Self::Mapping(value)
    }
}
