//! Small structural operators: `unset`, `unwind`, `sort`, `limit`, `skip`, `count`.

use std::cmp::Ordering;

use fluxion_types::document::Document;
use fluxion_types::error::ConfigurationError;
use fluxion_types::value::Value;

use super::{check_field_name, field_path};

// ── unset ───────────────────────────────────────────────────────────

/// Removes one or more field paths from every document.
#[derive(Debug)]
pub struct UnsetOperator {
    paths: Vec<String>,
}

impl UnsetOperator {
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] unless the spec is a field path or a
    /// non-empty list of field paths.
    pub fn compile(spec: &Value) -> Result<Self, ConfigurationError> {
        let paths = match spec {
            Value::Array(items) if !items.is_empty() => items
                .iter()
                .map(|item| field_path("unset", item).map(str::to_string))
                .collect::<Result<Vec<_>, _>>()?,
            Value::Array(_) => {
                return Err(ConfigurationError::invalid_stage("unset", "no fields to unset"))
            }
            other => vec![field_path("unset", other)?.to_string()],
        };
        Ok(Self { paths })
    }

    #[must_use]
    pub fn apply(&self, batch: Vec<Document>) -> Vec<Document> {
        batch
            .into_iter()
            .map(|mut doc| {
                for path in &self.paths {
                    doc.remove_path(path);
                }
                doc
            })
            .collect()
    }
}

// ── unwind ──────────────────────────────────────────────────────────

/// Emits one document per element of an array field.
#[derive(Debug)]
pub struct UnwindOperator {
    path: String,
    preserve_null_and_empty: bool,
}

impl UnwindOperator {
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] for anything but `"$path"` or
    /// `{path, preserveNullAndEmptyArrays}`.
    pub fn compile(spec: &Value) -> Result<Self, ConfigurationError> {
        match spec {
            Value::String(_) => Ok(Self {
                path: reference("unwind", spec)?.to_string(),
                preserve_null_and_empty: false,
            }),
            Value::Mapping(doc) => {
                let mut path = None;
                let mut preserve_null_and_empty = false;
                for (key, value) in doc {
                    match key.as_str() {
                        "path" => path = Some(reference("unwind", value)?.to_string()),
                        "preserveNullAndEmptyArrays" => {
                            preserve_null_and_empty = value.as_bool().ok_or_else(|| {
                                ConfigurationError::invalid_stage(
                                    "unwind",
                                    "preserveNullAndEmptyArrays must be a bool",
                                )
                            })?;
                        }
                        other => {
                            return Err(ConfigurationError::invalid_stage(
                                "unwind",
                                format!("unknown option '{other}'"),
                            ))
                        }
                    }
                }
                let path = path
                    .ok_or_else(|| ConfigurationError::invalid_stage("unwind", "missing path"))?;
                Ok(Self {
                    path,
                    preserve_null_and_empty,
                })
            }
            other => Err(ConfigurationError::invalid_stage(
                "unwind",
                format!("expected a field path, found {}", other.type_name()),
            )),
        }
    }

    #[must_use]
    pub fn apply(&self, batch: Vec<Document>) -> Vec<Document> {
        let mut out = Vec::with_capacity(batch.len());
        for doc in batch {
            match doc.get_path(&self.path) {
                Some(Value::Array(items)) if !items.is_empty() => {
                    let items = items.clone();
                    for item in items {
                        let mut copy = doc.clone();
                        copy.set_path(&self.path, item);
                        out.push(copy);
                    }
                }
                Some(Value::Array(_)) => {
                    if self.preserve_null_and_empty {
                        let mut doc = doc;
                        doc.remove_path(&self.path);
                        out.push(doc);
                    }
                }
                None | Some(Value::Null) => {
                    if self.preserve_null_and_empty {
                        out.push(doc);
                    }
                }
                // Scalars and mappings unwind to themselves.
                Some(_) => out.push(doc),
            }
        }
        out
    }
}

/// `unwind` requires the `$` reference form.
fn reference<'a>(operator: &str, spec: &'a Value) -> Result<&'a str, ConfigurationError> {
    match spec.as_str() {
        Some(raw) if raw.starts_with('$') => field_path(operator, spec),
        _ => Err(ConfigurationError::invalid_stage(
            operator,
            "path must be a field reference such as \"$items\"",
        )),
    }
}

// ── sort ────────────────────────────────────────────────────────────

/// Stable sort of the micro-batch by one or more keys.
#[derive(Debug)]
pub struct SortOperator {
    keys: Vec<(String, bool)>,
}

impl SortOperator {
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] unless every key maps to `1` or `-1`.
    pub fn compile(spec: &Value) -> Result<Self, ConfigurationError> {
        let Some(doc) = spec.as_mapping().filter(|doc| !doc.is_empty()) else {
            return Err(ConfigurationError::invalid_stage(
                "sort",
                "expected a non-empty mapping of field to 1 or -1",
            ));
        };
        let mut keys = Vec::with_capacity(doc.len());
        for (path, direction) in doc {
            check_field_name("sort", path)?;
            let ascending = match direction.as_i64() {
                Some(1) => true,
                Some(-1) => false,
                _ => {
                    return Err(ConfigurationError::invalid_stage(
                        "sort",
                        format!("direction for '{path}' must be 1 or -1"),
                    ))
                }
            };
            keys.push((path.clone(), ascending));
        }
        Ok(Self { keys })
    }

    #[must_use]
    pub fn apply(&self, mut batch: Vec<Document>) -> Vec<Document> {
        batch.sort_by(|a, b| {
            self.keys
                .iter()
                .map(|(path, ascending)| {
                    let null = Value::Null;
                    let left = a.get_path(path).unwrap_or(&null);
                    let right = b.get_path(path).unwrap_or(&null);
                    let ordering = left.total_cmp(right);
                    if *ascending {
                        ordering
                    } else {
                        ordering.reverse()
                    }
                })
                .find(|ordering| ordering.is_ne())
                .unwrap_or(Ordering::Equal)
        });
        batch
    }
}

// ── limit / skip ────────────────────────────────────────────────────

fn count_spec(operator: &str, spec: &Value, min: i64) -> Result<usize, ConfigurationError> {
    spec.as_i64()
        .filter(|n| *n >= min)
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| {
            ConfigurationError::invalid_stage(
                operator,
                format!("expected an integer >= {min}, found {spec}"),
            )
        })
}

/// Keeps the first `n` documents of the micro-batch.
#[derive(Debug)]
pub struct LimitOperator {
    limit: usize,
}

impl LimitOperator {
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] unless the spec is a positive integer.
    pub fn compile(spec: &Value) -> Result<Self, ConfigurationError> {
        Ok(Self {
            limit: count_spec("limit", spec, 1)?,
        })
    }

    #[must_use]
    pub fn apply(&self, mut batch: Vec<Document>) -> Vec<Document> {
        batch.truncate(self.limit);
        batch
    }
}

/// Drops the first `n` documents of the micro-batch.
#[derive(Debug)]
pub struct SkipOperator {
    skip: usize,
}

impl SkipOperator {
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] unless the spec is a non-negative integer.
    pub fn compile(spec: &Value) -> Result<Self, ConfigurationError> {
        Ok(Self {
            skip: count_spec("skip", spec, 0)?,
        })
    }

    #[must_use]
    pub fn apply(&self, batch: Vec<Document>) -> Vec<Document> {
        batch.into_iter().skip(self.skip).collect()
    }
}

// ── count ───────────────────────────────────────────────────────────

/// Replaces the micro-batch with `{field: n}`. An empty batch emits nothing.
#[derive(Debug)]
pub struct CountOperator {
    field: String,
}

impl CountOperator {
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] unless the spec is a plain field name.
    pub fn compile(spec: &Value) -> Result<Self, ConfigurationError> {
        let Some(field) = spec.as_str() else {
            return Err(ConfigurationError::invalid_stage(
                "count",
                format!("expected a field name, found {}", spec.type_name()),
            ));
        };
        check_field_name("count", field)?;
        if field.contains('.') {
            return Err(ConfigurationError::invalid_stage(
                "count",
                format!("field name '{field}' cannot contain '.'"),
            ));
        }
        Ok(Self {
            field: field.to_string(),
        })
    }

    #[must_use]
    pub fn apply(&self, batch: Vec<Document>) -> Vec<Document> {
        if batch.is_empty() {
            return Vec::new();
        }
        let count = i64::try_from(batch.len()).unwrap_or(i64::MAX);
        let mut out = Document::with_capacity(1);
        out.insert(self.field.clone(), count);
        vec![out]
    }
}
