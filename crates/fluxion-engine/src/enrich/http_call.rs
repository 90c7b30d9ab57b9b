//! Network enrichment through an HTTP call per document.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fluxion_types::config::StreamingErrorPolicy;
use fluxion_types::document::Document;
use fluxion_types::error::{ConfigurationError, EnrichmentError};
use fluxion_types::value::Value;
use indexmap::IndexMap;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Method;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::circuit::{CircuitBreaker, CircuitRegistry, CircuitSettings, Permit};
use super::template::UrlTemplate;
use crate::expression::Expression;
use crate::streaming::metrics::StageCounters;
use crate::streaming::policy::retry_with_policy;

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_TARGET: &str = "response";

const ERROR_BODY_PREVIEW: usize = 256;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HttpCallSpec {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: IndexMap<String, Value>,
    #[serde(default)]
    headers: IndexMap<String, Value>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default, alias = "connectTimeoutMs")]
    connect_timeout_ms: Option<u64>,
    #[serde(default, alias = "readTimeoutMs")]
    read_timeout_ms: Option<u64>,
    #[serde(default, alias = "circuitBreaker")]
    circuit_breaker: CircuitSettings,
    #[serde(default)]
    target: Option<String>,
}

/// A compiled `httpCall`.
///
/// Calls to the same method and URL template share one circuit breaker
/// through the [`CircuitRegistry`] the operator was compiled against.
#[derive(Debug)]
pub struct HttpCallOperator {
    endpoint: String,
    method: Method,
    template: UrlTemplate,
    params: HashMap<String, Expression>,
    headers: Vec<(HeaderName, Expression)>,
    body: Option<Expression>,
    read_timeout: Duration,
    target: Option<String>,
    client: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
}

struct PreparedRequest {
    url: String,
    headers: Vec<(HeaderName, HeaderValue)>,
    body: Option<serde_json::Value>,
}

impl HttpCallOperator {
    /// Compile an `httpCall` configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] for unknown keys, an unbalanced URL
    /// template, an invalid method or header name, or params that match no
    /// placeholder.
    pub fn compile(spec: &Value, circuits: &CircuitRegistry) -> Result<Self, ConfigurationError> {
        let spec: HttpCallSpec = serde_json::from_value(serde_json::Value::from(spec.clone()))
            .map_err(|e| ConfigurationError::invalid_stage("httpCall", e))?;

        let template = UrlTemplate::parse(&spec.url)?;
        let method_name = spec.method.as_deref().unwrap_or("GET").to_ascii_uppercase();
        let method = Method::from_bytes(method_name.as_bytes()).map_err(|_| {
            ConfigurationError::invalid_stage("httpCall", format!("invalid method '{method_name}'"))
        })?;
        let endpoint = format!("{method} {}", template.as_str());

        let mut params = HashMap::with_capacity(spec.params.len());
        for (name, value) in &spec.params {
            if !template.placeholders().any(|p| p == name.as_str()) {
                return Err(ConfigurationError::invalid_stage(
                    "httpCall",
                    format!("param '{name}' has no matching placeholder in '{}'", spec.url),
                ));
            }
            params.insert(name.clone(), Expression::compile(value)?);
        }

        let headers = spec
            .headers
            .iter()
            .map(|(name, value)| {
                let header = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                    ConfigurationError::invalid_stage("httpCall", format!("invalid header name '{name}'"))
                })?;
                Ok((header, Expression::compile(value)?))
            })
            .collect::<Result<Vec<_>, ConfigurationError>>()?;

        let body = spec.body.as_ref().map(Expression::compile).transpose()?;

        if spec.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigurationError::invalid_stage(
                "httpCall",
                "circuitBreaker.failureThreshold must be at least 1",
            ));
        }

        let connect_timeout =
            Duration::from_millis(spec.connect_timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS));
        let read_timeout =
            Duration::from_millis(spec.read_timeout_ms.unwrap_or(DEFAULT_READ_TIMEOUT_MS));
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ConfigurationError::invalid_stage("httpCall", format!("http client: {e}")))?;

        let breaker = circuits.breaker(&endpoint, spec.circuit_breaker);

        Ok(Self {
            endpoint,
            method,
            template,
            params,
            headers,
            body,
            read_timeout,
            target: spec.target,
            client,
            breaker,
        })
    }

    /// `METHOD url-template`, the circuit breaker key.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Explicit `target` field, if configured.
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Call the endpoint for one document, retrying retryable failures per
    /// `policy`. Every failed attempt is counted on `counters`; backoff sleeps
    /// end early when `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns the last [`EnrichmentError`] once retries are exhausted or a
    /// terminal failure occurs.
    pub async fn call(
        &self,
        doc: &Document,
        cancel: &CancellationToken,
        policy: &StreamingErrorPolicy,
        counters: &StageCounters,
    ) -> Result<Value, EnrichmentError> {
        let request = match self.prepare(doc) {
            Ok(request) => request,
            Err(err) => {
                counters.record_error();
                return Err(err);
            }
        };
        let request = &request;
        retry_with_policy(
            policy,
            cancel,
            &self.endpoint,
            move |attempt| async move {
                let result = self.attempt(request).await;
                if let Err(err) = &result {
                    counters.record_error();
                    tracing::debug!(endpoint = %self.endpoint, attempt, error = %err, "Enrichment call failed");
                }
                result
            },
        )
        .await
    }

    fn prepare(&self, doc: &Document) -> Result<PreparedRequest, EnrichmentError> {
        let mut values = HashMap::new();
        for name in self.template.placeholders() {
            let value = match self.params.get(name) {
                Some(expr) => expr.evaluate(doc).map_err(|e| {
                    EnrichmentError::malformed_template(&self.endpoint, format!("param '{name}': {e}"))
                })?,
                None => doc.get_path(name).cloned().unwrap_or_default(),
            };
            if !value.is_null() {
                values.insert(name, value.to_plain_string());
            }
        }
        let url = self.template.render(|name| values.get(name).cloned()).map_err(|name| {
            EnrichmentError::malformed_template(
                &self.endpoint,
                format!("placeholder '{name}' has no value"),
            )
        })?;

        let mut headers = Vec::with_capacity(self.headers.len());
        for (name, expr) in &self.headers {
            let rendered = expr
                .evaluate(doc)
                .map_err(|e| EnrichmentError::invalid_request(&self.endpoint, e.to_string()))?
                .to_plain_string();
            let value = HeaderValue::from_str(&rendered).map_err(|_| {
                EnrichmentError::invalid_request(
                    &self.endpoint,
                    format!("header '{name}' has an invalid value"),
                )
            })?;
            headers.push((name.clone(), value));
        }

        let body: Option<serde_json::Value> = match &self.body {
            Some(expr) => Some(
                expr.evaluate(doc)
                    .map_err(|e| EnrichmentError::invalid_request(&self.endpoint, e.to_string()))?
                    .into(),
            ),
            None => None,
        };

        Ok(PreparedRequest { url, headers, body })
    }

    async fn attempt(&self, request: &PreparedRequest) -> Result<Value, EnrichmentError> {
        let Some(permit) = self.breaker.try_acquire() else {
            return Err(EnrichmentError::circuit_open(&self.endpoint));
        };
        let guard = PermitGuard {
            breaker: &self.breaker,
            permit: Some(permit),
        };
        let result = self.send(request).await;
        guard.settle(result.as_ref().map_or_else(|e| !e.is_retryable(), |_| true));
        result
    }

    async fn send(&self, request: &PreparedRequest) -> Result<Value, EnrichmentError> {
        let mut builder = self
            .client
            .request(self.method.clone(), &request.url)
            .timeout(self.read_timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.clone(), value.clone());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| self.classify(&e))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| self.classify(&e))?;
        if !status.is_success() {
            let preview: String = text.chars().take(ERROR_BODY_PREVIEW).collect();
            return Err(EnrichmentError::http_status(
                &self.endpoint,
                status.as_u16(),
                format!("HTTP {status}: {preview}"),
            ));
        }
        Ok(decode_body(text))
    }

    fn classify(&self, err: &reqwest::Error) -> EnrichmentError {
        if err.is_timeout() {
            EnrichmentError::timeout(&self.endpoint, err.to_string())
        } else if err.is_connect() {
            EnrichmentError::connect(&self.endpoint, err.to_string())
        } else if err.is_builder() {
            EnrichmentError::invalid_request(&self.endpoint, err.to_string())
        } else {
            EnrichmentError::transport(&self.endpoint, err.to_string())
        }
    }
}

/// JSON bodies are decoded; anything else is kept as a string.
fn decode_body(text: String) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(json) => Value::from(json),
        Err(_) => Value::String(text),
    }
}

/// Reports the call outcome to the breaker exactly once, even when the
/// call future is dropped mid-flight.
struct PermitGuard<'a> {
    breaker: &'a CircuitBreaker,
    permit: Option<Permit>,
}

impl PermitGuard<'_> {
    fn settle(mut self, endpoint_alive: bool) {
        if let Some(permit) = self.permit.take() {
            if endpoint_alive {
                self.breaker.on_success(permit);
            } else {
                self.breaker.on_failure(permit);
            }
        }
    }
}

impl Drop for PermitGuard<'_> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.breaker.abandon(permit);
        }
    }
}
