//! Sink capability and in-memory sinks.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use fluxion_types::document::Document;
use fluxion_types::error::SinkError;

/// Receives evaluated batches.
///
/// Unless `is_concurrent` returns `true`, the executor serializes every
/// `accept` call through a single writer task.
#[async_trait]
pub trait StreamingSink: Send + Sync {
    /// Accept one batch. May buffer internally.
    async fn accept(&self, batch: &[Document]) -> Result<(), SinkError>;

    /// Flush and release resources. Called once at the end of every run,
    /// including cancelled and aborted runs.
    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }

    fn is_concurrent(&self) -> bool {
        false
    }
}

/// Collects every accepted document in memory.
#[derive(Debug, Clone, Default)]
pub struct CollectSink {
    documents: Arc<Mutex<Vec<Document>>>,
}

impl CollectSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything accepted so far.
    #[must_use]
    pub fn documents(&self) -> Vec<Document> {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StreamingSink for CollectSink {
    async fn accept(&self, batch: &[Document]) -> Result<(), SinkError> {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(batch);
        Ok(())
    }

    fn is_concurrent(&self) -> bool {
        true
    }
}

type Callback = dyn Fn(&[Document]) -> Result<(), SinkError> + Send + Sync;

/// Hands every batch to a closure.
pub struct CallbackSink {
    callback: Box<Callback>,
    concurrent: bool,
}

impl CallbackSink {
    /// The callback is invoked from a single writer task.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&[Document]) -> Result<(), SinkError> + Send + Sync + 'static,
    {
        Self {
            callback: Box::new(callback),
            concurrent: false,
        }
    }

    /// Allow workers to invoke the callback concurrently.
    #[must_use]
    pub fn concurrent(mut self) -> Self {
        self.concurrent = true;
        self
    }
}

impl fmt::Debug for CallbackSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackSink")
            .field("concurrent", &self.concurrent)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StreamingSink for CallbackSink {
    async fn accept(&self, batch: &[Document]) -> Result<(), SinkError> {
        (self.callback)(batch)
    }

    fn is_concurrent(&self) -> bool {
        self.concurrent
    }
}
