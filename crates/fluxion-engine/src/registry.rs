//! Custom stage operators.
//!
//! Built-in operators are resolved by the compiler directly. Anything else
//! must be registered by name in an [`OperatorRegistry`] that is passed to
//! [`Pipeline::compile`](crate::evaluator::Pipeline::compile).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use fluxion_types::document::Document;
use fluxion_types::error::{ConfigurationError, EvaluationErrorKind};
use fluxion_types::value::Value;

/// Stage names handled by the compiler itself.
pub const BUILTIN_OPERATORS: &[&str] = &[
    "match", "set", "addFields", "project", "unset", "unwind", "group", "sort", "limit", "skip",
    "count", "httpCall",
];

/// A user-supplied stage operator.
///
/// `validate` runs once at compile time. `apply` runs once per micro-batch
/// and must be deterministic: failures are never retried.
pub trait StageOperator: Send + Sync {
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] if `spec` is not usable.
    fn validate(&self, _spec: &Value) -> Result<(), ConfigurationError> {
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an [`EvaluationErrorKind`] if the batch cannot be processed.
    fn apply(&self, spec: &Value, batch: Vec<Document>) -> Result<Vec<Document>, EvaluationErrorKind>;
}

/// Name → handler map for custom operators. Built once before compilation.
#[derive(Default, Clone)]
pub struct OperatorRegistry {
    handlers: HashMap<String, Arc<dyn StageOperator>>,
}

impl OperatorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name` (without the `$` prefix).
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] if the name is empty, shadows a
    /// built-in operator, or is already registered.
    pub fn register(
        &mut self,
        name: &str,
        handler: Arc<dyn StageOperator>,
    ) -> Result<(), ConfigurationError> {
        let name = name.strip_prefix('$').unwrap_or(name);
        if name.is_empty() {
            return Err(ConfigurationError::new(
                "INVALID_OPERATOR",
                "operator name cannot be empty",
            ));
        }
        if BUILTIN_OPERATORS.contains(&name) {
            return Err(ConfigurationError::new(
                "INVALID_OPERATOR",
                format!("'{name}' is a built-in operator"),
            ));
        }
        if self.handlers.contains_key(name) {
            return Err(ConfigurationError::new(
                "INVALID_OPERATOR",
                format!("operator '{name}' is already registered"),
            ));
        }
        self.handlers.insert(name.to_string(), handler);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn StageOperator>> {
        self.handlers.get(name).cloned()
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for OperatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorRegistry")
            .field("operators", &self.names())
            .finish()
    }
}
