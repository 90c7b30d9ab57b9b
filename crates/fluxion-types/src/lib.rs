//! Shared data model for the Fluxion pipeline engine.
//!
//! | Module     | Responsibility |
//! |------------|----------------|
//! | `value`    | Dynamically-typed values and numeric coercion |
//! | `document` | Ordered records with dotted-path access |
//! | `stage`    | Single-key stage wire form |
//! | `config`   | Runtime configuration and error policy |
//! | `error`    | Structured, classified error types |
//! | `metric`   | Metrics snapshots |

pub mod config;
pub mod document;
pub mod error;
pub mod metric;
pub mod stage;
pub mod value;

pub use config::{BackoffStrategy, StreamingErrorPolicy, StreamingRuntimeConfig};
pub use document::{documents_from_json_array, Document, DocumentParseError};
pub use error::{
    ConfigurationError, EnrichmentError, EnrichmentErrorKind, ErrorCategory,
    EvaluationErrorKind, FailureClass, SinkError, SourceError, StageEvaluationError,
};
pub use metric::{MetricsSnapshot, StageMetricsSnapshot};
pub use stage::{stages_from_json_array, Stage};
pub use value::{Number, Value};
