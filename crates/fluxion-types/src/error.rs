//! Structured error model for pipeline compilation and execution.
//!
//! Each error type carries enough classification for the executor's
//! error policy to decide between retrying, dropping and aborting.
//! Construct via the kind-specific factory methods.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Broad classification of a pipeline failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed pipeline, stage or runtime definition.
    Config,
    /// A document could not be processed by an operator.
    Evaluation,
    /// A network enrichment call failed.
    Enrichment,
    /// The destination rejected a write.
    Sink,
    /// The source failed to produce a batch.
    Source,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Config => "config",
            Self::Evaluation => "evaluation",
            Self::Enrichment => "enrichment",
            Self::Sink => "sink",
            Self::Source => "source",
        };
        f.write_str(s)
    }
}

/// Whether retrying the same unit of work can succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Retryable,
    Terminal,
}

// ── Configuration ───────────────────────────────────────────────────

/// Malformed pipeline definition. Always detected before processing starts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub struct ConfigurationError {
    pub code: String,
    pub message: String,
    pub stage_index: Option<usize>,
}

impl ConfigurationError {
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            stage_index: None,
        }
    }

    /// Stage tag that is neither built in nor registered.
    #[must_use]
    pub fn unknown_operator(operator: &str) -> Self {
        Self::new("UNKNOWN_OPERATOR", format!("unknown stage operator '{operator}'"))
    }

    /// Stage payload that does not fit the operator's grammar.
    #[must_use]
    pub fn invalid_stage(operator: &str, message: impl fmt::Display) -> Self {
        Self::new("INVALID_STAGE", format!("{operator}: {message}"))
    }

    /// Expression that fails to compile.
    #[must_use]
    pub fn invalid_expression(message: impl Into<String>) -> Self {
        Self::new("INVALID_EXPRESSION", message)
    }

    /// Runtime or error-policy configuration that violates an invariant.
    #[must_use]
    pub fn invalid_runtime(message: impl Into<String>) -> Self {
        Self::new("INVALID_RUNTIME", message)
    }

    /// Attach the index of the offending stage.
    #[must_use]
    pub fn at_stage(mut self, index: usize) -> Self {
        self.stage_index.get_or_insert(index);
        self
    }
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[config] {}: {}", self.code, self.message)?;
        if let Some(index) = self.stage_index {
            write!(f, " (stage {index})")?;
        }
        Ok(())
    }
}

// ── Enrichment ──────────────────────────────────────────────────────

/// Failure mode of a network enrichment call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentErrorKind {
    /// Connect or read timeout elapsed (retryable).
    Timeout,
    /// Connection could not be established (retryable).
    Connect,
    /// Endpoint answered 5xx (retryable).
    ServerError,
    /// Other transport failure after the request was sent (retryable).
    Transport,
    /// Circuit breaker is open; no request was sent (retryable).
    CircuitOpen,
    /// Endpoint answered 4xx.
    ClientError,
    /// URL template could not be rendered for the document.
    MalformedTemplate,
    /// Request could not be built (invalid URL, method, header).
    InvalidRequest,
}

impl fmt::Display for EnrichmentErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::Connect => "connect",
            Self::ServerError => "server_error",
            Self::Transport => "transport",
            Self::CircuitOpen => "circuit_open",
            Self::ClientError => "client_error",
            Self::MalformedTemplate => "malformed_template",
            Self::InvalidRequest => "invalid_request",
        };
        f.write_str(s)
    }
}

/// Failed network enrichment call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("[enrichment:{kind}] {endpoint}: {message}")]
pub struct EnrichmentError {
    pub kind: EnrichmentErrorKind,
    pub endpoint: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl EnrichmentError {
    fn new(kind: EnrichmentErrorKind, endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            endpoint: endpoint.into(),
            message: message.into(),
            status: None,
        }
    }

    #[must_use]
    pub fn timeout(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EnrichmentErrorKind::Timeout, endpoint, message)
    }

    #[must_use]
    pub fn connect(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EnrichmentErrorKind::Connect, endpoint, message)
    }

    #[must_use]
    pub fn transport(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EnrichmentErrorKind::Transport, endpoint, message)
    }

    #[must_use]
    pub fn circuit_open(endpoint: impl Into<String>) -> Self {
        Self::new(
            EnrichmentErrorKind::CircuitOpen,
            endpoint,
            "circuit breaker is open, call short-circuited",
        )
    }

    #[must_use]
    pub fn malformed_template(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EnrichmentErrorKind::MalformedTemplate, endpoint, message)
    }

    #[must_use]
    pub fn invalid_request(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EnrichmentErrorKind::InvalidRequest, endpoint, message)
    }

    /// Classify an HTTP error status: 5xx is a server error, anything else a client error.
    #[must_use]
    pub fn http_status(endpoint: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        let kind = if status >= 500 {
            EnrichmentErrorKind::ServerError
        } else {
            EnrichmentErrorKind::ClientError
        };
        let mut err = Self::new(kind, endpoint, message);
        err.status = Some(status);
        err
    }

    #[must_use]
    pub fn class(&self) -> FailureClass {
        match self.kind {
            EnrichmentErrorKind::Timeout
            | EnrichmentErrorKind::Connect
            | EnrichmentErrorKind::ServerError
            | EnrichmentErrorKind::Transport
            | EnrichmentErrorKind::CircuitOpen => FailureClass::Retryable,
            EnrichmentErrorKind::ClientError
            | EnrichmentErrorKind::MalformedTemplate
            | EnrichmentErrorKind::InvalidRequest => FailureClass::Terminal,
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class() == FailureClass::Retryable
    }
}

// ── Stage evaluation ────────────────────────────────────────────────

/// Why an operator could not be applied to a document.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvaluationErrorKind {
    #[error("field '{path}' is missing")]
    MissingField { path: String },
    #[error("{operator} expected {expected}, found {found}")]
    TypeMismatch {
        operator: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("division by zero in {operator}")]
    DivideByZero { operator: String },
    #[error(transparent)]
    Enrichment(EnrichmentError),
    #[error("{0}")]
    Custom(String),
}

/// A document failed an operator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub struct StageEvaluationError {
    pub stage_index: usize,
    pub operator: String,
    pub document_index: Option<usize>,
    pub kind: EvaluationErrorKind,
}

impl StageEvaluationError {
    #[must_use]
    pub fn new(stage_index: usize, operator: impl Into<String>, kind: EvaluationErrorKind) -> Self {
        Self {
            stage_index,
            operator: operator.into(),
            document_index: None,
            kind,
        }
    }

    #[must_use]
    pub fn with_document(mut self, index: usize) -> Self {
        self.document_index = Some(index);
        self
    }

    /// Only enrichment failures are worth retrying; operator failures are deterministic.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(&self.kind, EvaluationErrorKind::Enrichment(e) if e.is_retryable())
    }

    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self.kind {
            EvaluationErrorKind::Enrichment(_) => ErrorCategory::Enrichment,
            _ => ErrorCategory::Evaluation,
        }
    }
}

impl fmt::Display for StageEvaluationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[evaluation] stage {} ({})", self.stage_index, self.operator)?;
        if let Some(index) = self.document_index {
            write!(f, " document {index}")?;
        }
        write!(f, ": {}", self.kind)
    }
}

// ── Source / Sink ───────────────────────────────────────────────────

/// Destination rejected or failed a write.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[sink] {message}")]
pub struct SinkError {
    pub message: String,
    pub retryable: bool,
}

impl SinkError {
    /// Temporary failure (connection reset, throttling); retrying may succeed.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// The destination refused the batch; retrying will not help.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Source failed to produce a batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[source] {message}")]
pub struct SourceError {
    pub message: String,
    pub retryable: bool,
}

impl SourceError {
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}
