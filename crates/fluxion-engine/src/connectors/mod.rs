//! Built-in source and sink connectors used by pipeline files.
//!
//! Each connector publishes a [`ConnectorDescriptor`] listing its options,
//! so pipeline configs can be checked before anything is opened.

pub mod jsonl;
pub mod stdout;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Result};
use fluxion_types::document::Document;
use fluxion_types::value::Value;
use serde::Serialize;

use crate::streaming::{StreamingSink, StreamingSource};

// ── Descriptors ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorKind {
    Source,
    Sink,
}

impl fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => f.write_str("source"),
            Self::Sink => f.write_str("sink"),
        }
    }
}

/// Value type of a connector option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionType {
    String,
    Integer,
    Boolean,
    Path,
}

impl OptionType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String | Self::Path => value.as_str().is_some(),
            Self::Integer => value.as_i64().is_some_and(|n| n >= 0),
            Self::Boolean => value.as_bool().is_some(),
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "non-negative integer",
            Self::Boolean => "boolean",
            Self::Path => "path",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectorOption {
    pub name: &'static str,
    pub kind: OptionType,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<&'static str>,
    /// Value must not be logged or echoed.
    pub secret: bool,
    pub description: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectorDescriptor {
    pub name: &'static str,
    pub kind: ConnectorKind,
    pub description: &'static str,
    pub options: &'static [ConnectorOption],
}

impl ConnectorDescriptor {
    /// Check `config` against the declared options. Returns every problem found.
    #[must_use]
    pub fn validate(&self, config: &Document) -> Vec<String> {
        let context = format!("{} '{}'", self.kind, self.name);
        let mut errors = Vec::new();
        for option in self.options {
            match config.get(option.name) {
                None if option.required => {
                    errors.push(format!("{context}: missing required option '{}'", option.name));
                }
                Some(value) if !option.kind.accepts(value) => errors.push(format!(
                    "{context}: option '{}' must be a {}",
                    option.name,
                    option.kind.name()
                )),
                _ => {}
            }
        }
        for key in config.keys() {
            if !self.options.iter().any(|o| o.name == key.as_str()) {
                errors.push(format!("{context}: unknown option '{key}'"));
            }
        }
        errors
    }
}

// ── Option accessors ────────────────────────────────────────────────

pub(crate) fn string_option<'a>(config: &'a Document, name: &str) -> Option<&'a str> {
    config.get(name).and_then(Value::as_str)
}

pub(crate) fn required_string<'a>(config: &'a Document, name: &str) -> Result<&'a str> {
    match string_option(config, name) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => bail!("option '{name}' is required"),
    }
}

pub(crate) fn bool_option(config: &Document, name: &str, default: bool) -> bool {
    config.get(name).and_then(Value::as_bool).unwrap_or(default)
}

pub(crate) fn usize_option(config: &Document, name: &str, default: usize) -> usize {
    config
        .get(name)
        .and_then(Value::as_i64)
        .and_then(|n| usize::try_from(n).ok())
        .unwrap_or(default)
}

// ── Factories & registry ────────────────────────────────────────────

pub trait SourceFactory: Send + Sync {
    fn descriptor(&self) -> &ConnectorDescriptor;

    /// # Errors
    ///
    /// Returns an error if the source cannot be opened with `config`.
    fn create(&self, config: &Document) -> Result<Arc<dyn StreamingSource>>;
}

pub trait SinkFactory: Send + Sync {
    fn descriptor(&self) -> &ConnectorDescriptor;

    /// # Errors
    ///
    /// Returns an error if the sink cannot be opened with `config`.
    fn create(&self, config: &Document) -> Result<Arc<dyn StreamingSink>>;
}

/// Connectors available to pipeline files, keyed by kind and name.
#[derive(Default, Clone)]
pub struct ConnectorRegistry {
    sources: BTreeMap<String, Arc<dyn SourceFactory>>,
    sinks: BTreeMap<String, Arc<dyn SinkFactory>>,
}

impl ConnectorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `jsonl` (source and sink) and `stdout` (sink).
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_source(Arc::new(jsonl::JsonLinesSourceFactory));
        registry.register_sink(Arc::new(jsonl::JsonLinesSinkFactory));
        registry.register_sink(Arc::new(stdout::StdoutSinkFactory));
        registry
    }

    /// Register a source, replacing any source of the same name.
    pub fn register_source(&mut self, factory: Arc<dyn SourceFactory>) {
        self.sources
            .insert(factory.descriptor().name.to_string(), factory);
    }

    /// Register a sink, replacing any sink of the same name.
    pub fn register_sink(&mut self, factory: Arc<dyn SinkFactory>) {
        self.sinks.insert(factory.descriptor().name.to_string(), factory);
    }

    #[must_use]
    pub fn source(&self, name: &str) -> Option<&Arc<dyn SourceFactory>> {
        self.sources.get(name)
    }

    #[must_use]
    pub fn sink(&self, name: &str) -> Option<&Arc<dyn SinkFactory>> {
        self.sinks.get(name)
    }

    /// Every descriptor, sources first, each group sorted by name.
    #[must_use]
    pub fn descriptors(&self) -> Vec<&ConnectorDescriptor> {
        self.sources
            .values()
            .map(|f| f.descriptor())
            .chain(self.sinks.values().map(|f| f.descriptor()))
            .collect()
    }

    /// # Errors
    ///
    /// Returns an error if no source is registered under `name` or it fails to open.
    pub fn create_source(&self, name: &str, config: &Document) -> Result<Arc<dyn StreamingSource>> {
        let Some(factory) = self.source(name) else {
            bail!("Unknown source connector '{name}'");
        };
        factory.create(config)
    }

    /// # Errors
    ///
    /// Returns an error if no sink is registered under `name` or it fails to open.
    pub fn create_sink(&self, name: &str, config: &Document) -> Result<Arc<dyn StreamingSink>> {
        let Some(factory) = self.sink(name) else {
            bail!("Unknown sink connector '{name}'");
        };
        factory.create(config)
    }
}

impl fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .field("sinks", &self.sinks.keys().collect::<Vec<_>>())
            .finish()
    }
}
