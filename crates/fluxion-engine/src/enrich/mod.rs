//! Network enrichment (`httpCall`) and its circuit breakers.

pub mod circuit;
pub mod http_call;
pub mod template;

pub use circuit::{CircuitBreaker, CircuitRegistry, CircuitSettings, CircuitState};
pub use http_call::HttpCallOperator;
