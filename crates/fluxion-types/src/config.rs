//! Runtime configuration and error policy for streaming runs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

pub const DEFAULT_MICRO_BATCH_SIZE: usize = 64;
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_SOURCE_QUEUE_CAPACITY: usize = 16;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 500;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

/// Concurrency and buffering knobs for one streaming run.
///
/// Keys are snake_case; camelCase spellings are accepted as aliases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamingRuntimeConfig {
    #[serde(alias = "microBatchSize")]
    pub micro_batch_size: usize,
    #[serde(alias = "queueCapacity")]
    pub queue_capacity: usize,
    #[serde(alias = "sourceQueueCapacity")]
    pub source_queue_capacity: usize,
    #[serde(alias = "workerThreadPoolSize")]
    pub worker_thread_pool_size: usize,
    #[serde(alias = "directHandoff")]
    pub direct_handoff: bool,
    #[serde(alias = "pollTimeoutMs")]
    pub poll_timeout_ms: u64,
    #[serde(alias = "shutdownGraceMs")]
    pub shutdown_grace_ms: u64,
}

impl Default for StreamingRuntimeConfig {
    fn default() -> Self {
        Self {
            micro_batch_size: DEFAULT_MICRO_BATCH_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            source_queue_capacity: DEFAULT_SOURCE_QUEUE_CAPACITY,
            worker_thread_pool_size: 1,
            direct_handoff: false,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

impl StreamingRuntimeConfig {
    #[must_use]
    pub fn builder() -> StreamingRuntimeConfigBuilder {
        StreamingRuntimeConfigBuilder::default()
    }

    /// Check the configuration invariants.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] describing every violated invariant.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let mut problems = Vec::new();
        if self.micro_batch_size == 0 {
            problems.push("micro_batch_size must be at least 1");
        }
        if self.worker_thread_pool_size == 0 {
            problems.push("worker_thread_pool_size must be at least 1");
        }
        if !self.direct_handoff && self.queue_capacity == 0 {
            problems.push("queue_capacity must be positive unless direct_handoff is enabled");
        }
        if self.poll_timeout_ms == 0 {
            problems.push("poll_timeout_ms must be positive");
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigurationError::invalid_runtime(problems.join("; ")))
        }
    }

    #[must_use]
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Builder for [`StreamingRuntimeConfig`]; `build` validates.
#[derive(Debug, Clone, Default)]
pub struct StreamingRuntimeConfigBuilder {
    config: StreamingRuntimeConfig,
}

impl StreamingRuntimeConfigBuilder {
    #[must_use]
    pub fn micro_batch_size(mut self, size: usize) -> Self {
        self.config.micro_batch_size = size;
        self
    }

    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn source_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.source_queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn worker_thread_pool_size(mut self, workers: usize) -> Self {
        self.config.worker_thread_pool_size = workers;
        self
    }

    #[must_use]
    pub fn direct_handoff(mut self, enabled: bool) -> Self {
        self.config.direct_handoff = enabled;
        self
    }

    #[must_use]
    pub fn poll_timeout_ms(mut self, ms: u64) -> Self {
        self.config.poll_timeout_ms = ms;
        self
    }

    #[must_use]
    pub fn shutdown_grace_ms(mut self, ms: u64) -> Self {
        self.config.shutdown_grace_ms = ms;
        self
    }

    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] if the configuration is invalid.
    pub fn build(self) -> Result<StreamingRuntimeConfig, ConfigurationError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// ── Error policy ────────────────────────────────────────────────────

/// Delay schedule between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffStrategy {
    None,
    Fixed {
        #[serde(alias = "delayMs")]
        delay_ms: u64,
    },
    Exponential {
        #[serde(alias = "baseMs")]
        base_ms: u64,
        #[serde(alias = "maxMs")]
        max_ms: u64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            base_ms: 100,
            max_ms: 60_000,
        }
    }
}

/// Retry and abort behaviour for retryable failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamingErrorPolicy {
    #[serde(alias = "maxRetries")]
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
    #[serde(alias = "failFast")]
    pub fail_fast: bool,
}

impl Default for StreamingErrorPolicy {
    fn default() -> Self {
        Self::fail_fast()
    }
}

impl StreamingErrorPolicy {
    /// First error aborts the run; nothing is retried.
    #[must_use]
    pub fn fail_fast() -> Self {
        Self {
            max_retries: 0,
            backoff: BackoffStrategy::None,
            fail_fast: true,
        }
    }

    /// Retry retryable failures; drop the batch once retries are exhausted.
    #[must_use]
    pub fn retrying(max_retries: u32, backoff: BackoffStrategy) -> Self {
        Self {
            max_retries,
            backoff,
            fail_fast: false,
        }
    }

    /// Abort instead of dropping once retries are exhausted.
    #[must_use]
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] if an exponential backoff has a zero
    /// base or a cap below the base.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if let BackoffStrategy::Exponential { base_ms, max_ms } = self.backoff {
            if base_ms == 0 {
                return Err(ConfigurationError::invalid_runtime(
                    "exponential backoff base_ms must be positive",
                ));
            }
            if max_ms < base_ms {
                return Err(ConfigurationError::invalid_runtime(
                    "exponential backoff max_ms must not be below base_ms",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        StreamingRuntimeConfig::default().validate().unwrap();
        StreamingErrorPolicy::default().validate().unwrap();
        assert!(StreamingErrorPolicy::default().fail_fast);
    }

    #[test]
    fn builder_rejects_zero_queue_without_handoff() {
        let err = StreamingRuntimeConfig::builder()
            .queue_capacity(0)
            .build()
            .unwrap_err();
        assert_eq!(err.code, "INVALID_RUNTIME");
        assert!(err.message.contains("queue_capacity"));

        let config = StreamingRuntimeConfig::builder()
            .queue_capacity(0)
            .direct_handoff(true)
            .build()
            .unwrap();
        assert!(config.direct_handoff);
    }

    #[test]
    fn builder_reports_all_problems() {
        let err = StreamingRuntimeConfig::builder()
            .micro_batch_size(0)
            .worker_thread_pool_size(0)
            .build()
            .unwrap_err();
        assert!(err.message.contains("micro_batch_size"));
        assert!(err.message.contains("worker_thread_pool_size"));
    }

    #[test]
    fn deserializes_camel_case_aliases() {
        let config: StreamingRuntimeConfig = serde_json::from_str(
            r#"{"microBatchSize": 8, "workerThreadPoolSize": 4, "direct_handoff": true}"#,
        )
        .unwrap();
        assert_eq!(config.micro_batch_size, 8);
        assert_eq!(config.worker_thread_pool_size, 4);
        assert!(config.direct_handoff);
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn deserializes_tagged_backoff() {
        let policy: StreamingErrorPolicy = serde_json::from_str(
            r#"{"maxRetries": 2, "backoff": {"strategy": "fixed", "delay_ms": 10}}"#,
        )
        .unwrap();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.backoff, BackoffStrategy::Fixed { delay_ms: 10 });
        // Unspecified fields fall back to the fail-fast default.
        assert!(policy.fail_fast);
    }

    #[test]
    fn rejects_inverted_exponential_bounds() {
        let policy = StreamingErrorPolicy::retrying(
            3,
            BackoffStrategy::Exponential {
                base_ms: 500,
                max_ms: 100,
            },
        );
        assert!(policy.validate().is_err());
    }
}
