//! `project`: keep or drop fields, or compute new ones.

use fluxion_types::document::Document;
use fluxion_types::error::{ConfigurationError, EvaluationErrorKind};
use fluxion_types::value::Value;

use super::{check_field_name, OperatorFailure};
use crate::expression::Expression;

const ID: &str = "_id";

#[derive(Debug)]
enum Inclusion {
    Keep,
    Computed(Expression),
}

#[derive(Debug)]
enum Mode {
    /// Output has `_id` (unless dropped) plus the listed fields, in projection order.
    Include {
        id: Option<Inclusion>,
        fields: Vec<(String, Inclusion)>,
    },
    /// Output is the input minus the listed paths.
    Exclude { paths: Vec<String> },
}

#[derive(Debug)]
pub struct ProjectOperator {
    mode: Mode,
}

/// How a single projection entry reads.
enum Entry {
    Flag(bool),
    Computed(Expression),
}

fn classify(value: &Value) -> Result<Entry, ConfigurationError> {
    Ok(match value {
        Value::Bool(flag) => Entry::Flag(*flag),
        Value::Number(n) => Entry::Flag(!n.is_zero()),
        other => Entry::Computed(Expression::compile(other)?),
    })
}

impl ProjectOperator {
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] for an empty projection or one that
    /// mixes inclusion and exclusion on fields other than `_id`.
    pub fn compile(spec: &Value) -> Result<Self, ConfigurationError> {
        let Value::Mapping(spec) = spec else {
            return Err(ConfigurationError::invalid_stage(
                "project",
                format!("expected a mapping, found {}", spec.type_name()),
            ));
        };
        if spec.is_empty() {
            return Err(ConfigurationError::invalid_stage("project", "projection is empty"));
        }

        let mut id: Option<Entry> = None;
        let mut included = Vec::new();
        let mut excluded = Vec::new();
        for (name, value) in spec {
            let entry = classify(value)?;
            if name == ID {
                id = Some(entry);
                continue;
            }
            check_field_name("project", name)?;
            match entry {
                Entry::Flag(true) => included.push((name.clone(), Inclusion::Keep)),
                Entry::Computed(expr) => included.push((name.clone(), Inclusion::Computed(expr))),
                Entry::Flag(false) => excluded.push(name.clone()),
            }
        }

        if !included.is_empty() && !excluded.is_empty() {
            return Err(ConfigurationError::invalid_stage(
                "project",
                format!(
                    "cannot mix inclusion ('{}') and exclusion ('{}')",
                    included[0].0, excluded[0]
                ),
            ));
        }

        let mode = match id {
            Some(Entry::Computed(expr)) if excluded.is_empty() => Mode::Include {
                id: Some(Inclusion::Computed(expr)),
                fields: included,
            },
            Some(Entry::Computed(_)) => {
                return Err(ConfigurationError::invalid_stage(
                    "project",
                    "a computed _id requires inclusion mode",
                ))
            }
            Some(Entry::Flag(false)) if included.is_empty() => {
                excluded.push(ID.to_string());
                Mode::Exclude { paths: excluded }
            }
            Some(Entry::Flag(false)) => Mode::Include {
                id: None,
                fields: included,
            },
            _ if !excluded.is_empty() => Mode::Exclude { paths: excluded },
            _ => Mode::Include {
                id: Some(Inclusion::Keep),
                fields: included,
            },
        };
        Ok(Self { mode })
    }

    #[must_use]
    pub fn is_inclusion(&self) -> bool {
        matches!(self.mode, Mode::Include { .. })
    }

    /// # Errors
    ///
    /// Returns the first computed field's evaluation failure.
    pub fn apply(&self, batch: Vec<Document>) -> Result<Vec<Document>, OperatorFailure> {
        batch
            .into_iter()
            .enumerate()
            .map(|(index, doc)| self.project(doc).map_err(|kind| OperatorFailure::at(index, kind)))
            .collect()
    }

    fn project(&self, doc: Document) -> Result<Document, EvaluationErrorKind> {
        match &self.mode {
            Mode::Exclude { paths } => {
                let mut doc = doc;
                for path in paths {
                    doc.remove_path(path);
                }
                Ok(doc)
            }
            Mode::Include { id, fields } => {
                let mut out = Document::with_capacity(fields.len() + 1);
                match id {
                    Some(Inclusion::Keep) => {
                        if let Some(value) = doc.get(ID) {
                            out.insert(ID, value.clone());
                        }
                    }
                    Some(Inclusion::Computed(expr)) => {
                        out.insert(ID, expr.evaluate(&doc)?);
                    }
                    None => {}
                }
                for (path, inclusion) in fields {
                    match inclusion {
                        Inclusion::Keep => {
                            if let Some(value) = doc.get_path(path) {
                                out.set_path(path, value.clone());
                            }
                        }
                        Inclusion::Computed(expr) => out.set_path(path, expr.evaluate(&doc)?),
                    }
                }
                Ok(out)
            }
        }
    }
}
