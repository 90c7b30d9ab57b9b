//! Source capability and in-memory sources.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use fluxion_types::document::Document;
use fluxion_types::error::SourceError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Outcome of one [`StreamingSource::poll`].
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Batch(Vec<Document>),
    /// Nothing arrived within the poll timeout; the stream is still open.
    Timeout,
    EndOfStream,
}

/// Produces document batches for a streaming run.
///
/// `poll` must return within roughly `timeout`. `cancel` is idempotent and
/// makes in-flight and later polls return promptly.
#[async_trait]
pub trait StreamingSource: Send + Sync {
    async fn poll(&self, timeout: Duration) -> Result<SourceEvent, SourceError>;

    fn cancel(&self);
}

// ── IterSource ──────────────────────────────────────────────────────

type DocumentIter = Box<dyn Iterator<Item = Document> + Send>;

/// Bounded source over an in-memory iterator.
pub struct IterSource {
    documents: Mutex<DocumentIter>,
    batch_size: usize,
    cancelled: AtomicBool,
}

impl IterSource {
    /// `batch_size` of zero is treated as one.
    pub fn new<I>(documents: I, batch_size: usize) -> Self
    where
        I: IntoIterator<Item = Document>,
        I::IntoIter: Send + 'static,
    {
        Self {
            documents: Mutex::new(Box::new(documents.into_iter())),
            batch_size: batch_size.max(1),
            cancelled: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl StreamingSource for IterSource {
    async fn poll(&self, _timeout: Duration) -> Result<SourceEvent, SourceError> {
        if self.cancelled.load(Ordering::Acquire) {
            return Ok(SourceEvent::EndOfStream);
        }
        let batch: Vec<Document> = self
            .documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_ref()
            .take(self.batch_size)
            .collect();
        if batch.is_empty() {
            Ok(SourceEvent::EndOfStream)
        } else {
            Ok(SourceEvent::Batch(batch))
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

// ── ChannelSource ───────────────────────────────────────────────────

/// Unbounded stream fed through a tokio channel.
///
/// The stream ends when every sender is dropped or the source is cancelled.
pub struct ChannelSource {
    receiver: tokio::sync::Mutex<mpsc::Receiver<Vec<Document>>>,
    cancel: CancellationToken,
}

impl ChannelSource {
    /// Create the source and the sender that feeds it.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<Vec<Document>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                receiver: tokio::sync::Mutex::new(rx),
                cancel: CancellationToken::new(),
            },
            tx,
        )
    }
}

#[async_trait]
impl StreamingSource for ChannelSource {
    async fn poll(&self, timeout: Duration) -> Result<SourceEvent, SourceError> {
        let mut receiver = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Ok(SourceEvent::EndOfStream),
            guard = self.receiver.lock() => guard,
        };
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Ok(SourceEvent::EndOfStream),
            received = tokio::time::timeout(timeout, receiver.recv()) => Ok(match received {
                Ok(Some(batch)) => SourceEvent::Batch(batch),
                Ok(None) => SourceEvent::EndOfStream,
                Err(_) => SourceEvent::Timeout,
            }),
        }
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}
