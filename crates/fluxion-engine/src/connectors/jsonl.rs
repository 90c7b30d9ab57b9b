//! JSON-lines file source and sink.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fluxion_types::document::Document;
use fluxion_types::error::{SinkError, SourceError};
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio::sync::Mutex;

use super::{
    bool_option, required_string, usize_option, ConnectorDescriptor, ConnectorKind,
    ConnectorOption, OptionType, SinkFactory, SourceFactory,
};
use crate::streaming::{SourceEvent, StreamingSink, StreamingSource};

const DEFAULT_BATCH_SIZE: usize = 256;

// ── Source ──────────────────────────────────────────────────────────

const SOURCE_OPTIONS: &[ConnectorOption] = &[
    ConnectorOption {
        name: "path",
        kind: OptionType::Path,
        required: true,
        default_value: None,
        secret: false,
        description: "File to read, one JSON object per line",
    },
    ConnectorOption {
        name: "batch_size",
        kind: OptionType::Integer,
        required: false,
        default_value: Some("256"),
        secret: false,
        description: "Documents returned per poll",
    },
];

static SOURCE_DESCRIPTOR: ConnectorDescriptor = ConnectorDescriptor {
    name: "jsonl",
    kind: ConnectorKind::Source,
    description: "Reads documents from a JSON-lines file",
    options: SOURCE_OPTIONS,
};

struct LineReader {
    lines: Lines<Box<dyn AsyncBufRead + Send + Unpin>>,
    line_no: usize,
    /// Documents parsed before a failed read; returned first by the next poll.
    pending: Vec<Document>,
}

/// Bounded source over a JSON-lines file. Blank lines are skipped; a line
/// that is not a JSON object fails the run.
pub struct JsonLinesSource {
    path: PathBuf,
    reader: Mutex<LineReader>,
    batch_size: usize,
    cancelled: AtomicBool,
}

impl JsonLinesSource {
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: impl Into<PathBuf>, batch_size: usize) -> Result<Self> {
        let path = path.into();
        let file = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open source file: {}", path.display()))?;
        Ok(Self::from_reader(
            path,
            Box::new(BufReader::new(File::from_std(file))),
            batch_size,
        ))
    }

    fn from_reader(
        path: PathBuf,
        reader: Box<dyn AsyncBufRead + Send + Unpin>,
        batch_size: usize,
    ) -> Self {
        Self {
            reader: Mutex::new(LineReader {
                lines: reader.lines(),
                line_no: 0,
                pending: Vec::new(),
            }),
            path,
            batch_size: batch_size.max(1),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Invalid UTF-8 is malformed input, not a passing I/O failure.
    fn read_error(&self, line_no: usize, e: &io::Error) -> SourceError {
        let message = format!("{}:{line_no}: read failed: {e}", self.path.display());
        if e.kind() == io::ErrorKind::InvalidData {
            SourceError::fatal(message)
        } else {
            SourceError::transient(message)
        }
    }
}

#[async_trait]
impl StreamingSource for JsonLinesSource {
    async fn poll(&self, _timeout: Duration) -> Result<SourceEvent, SourceError> {
        if self.cancelled.load(Ordering::Acquire) {
            return Ok(SourceEvent::EndOfStream);
        }
        let mut reader = self.reader.lock().await;
        let mut batch = std::mem::take(&mut reader.pending);
        batch.reserve(self.batch_size.saturating_sub(batch.len()));
        while batch.len() < self.batch_size {
            let line = match reader.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    let err = self.read_error(reader.line_no + 1, &e);
                    reader.pending = batch;
                    return Err(err);
                }
            };
            reader.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            match Document::from_json_str(&line) {
                Ok(doc) => batch.push(doc),
                Err(e) => {
                    let err =
                        SourceError::fatal(format!("{}:{}: {e}", self.path.display(), reader.line_no));
                    reader.pending = batch;
                    return Err(err);
                }
            }
        }
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

pub struct JsonLinesSourceFactory;

impl SourceFactory for JsonLinesSourceFactory {
    fn descriptor(&self) -> &ConnectorDescriptor {
        &SOURCE_DESCRIPTOR
    }

    fn create(&self, config: &Document) -> Result<Arc<dyn StreamingSource>> {
        let path = required_string(config, "path")?;
        let batch_size = usize_option(config, "batch_size", DEFAULT_BATCH_SIZE);
        Ok(Arc::new(JsonLinesSource::open(path, batch_size)?))
    }
}

// ── Sink ────────────────────────────────────────────────────────────

const SINK_OPTIONS: &[ConnectorOption] = &[
    ConnectorOption {
        name: "path",
        kind: OptionType::Path,
        required: true,
        default_value: None,
        secret: false,
        description: "File to write, one JSON object per line",
    },
    ConnectorOption {
        name: "append",
        kind: OptionType::Boolean,
        required: false,
        default_value: Some("false"),
        secret: false,
        description: "Append instead of truncating an existing file",
    },
];

static SINK_DESCRIPTOR: ConnectorDescriptor = ConnectorDescriptor {
    name: "jsonl",
    kind: ConnectorKind::Sink,
    description: "Writes documents to a JSON-lines file",
    options: SINK_OPTIONS,
};

/// Buffered JSON-lines writer. Flushed on `close`.
///
/// A batch is retryable only while none of its bytes reached the writer;
/// once part of it is written, a failure is terminal.
pub struct JsonLinesSink {
    path: PathBuf,
    writer: Mutex<BufWriter<Box<dyn AsyncWrite + Send + Unpin>>>,
}

impl JsonLinesSink {
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or opened for append.
    pub fn create(path: impl Into<PathBuf>, append: bool) -> Result<Self> {
        let path = path.into();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&path)
            .with_context(|| format!("Failed to open sink file: {}", path.display()))?;
        Ok(Self::from_writer(path, BufWriter::new(Box::new(File::from_std(file)))))
    }

    fn from_writer(path: PathBuf, writer: BufWriter<Box<dyn AsyncWrite + Send + Unpin>>) -> Self {
        Self {
            path,
            writer: Mutex::new(writer),
        }
    }

    fn io_error(&self, e: &io::Error) -> SinkError {
        SinkError::transient(format!("{}: {e}", self.path.display()))
    }

    fn write_error(&self, written: usize, total: usize, e: &io::Error) -> SinkError {
        if written == 0 {
            self.io_error(e)
        } else {
            SinkError::rejected(format!(
                "{}: write failed after {written} of {total} bytes: {e}",
                self.path.display()
            ))
        }
    }
}

#[async_trait]
impl StreamingSink for JsonLinesSink {
    async fn accept(&self, batch: &[Document]) -> Result<(), SinkError> {
        let mut buf = Vec::new();
        for doc in batch {
            serde_json::to_writer(&mut buf, &doc.to_json())
                .map_err(|e| SinkError::rejected(format!("{}: {e}", self.path.display())))?;
            buf.push(b'\n');
        }
        let mut writer = self.writer.lock().await;
        let mut written = 0;
        while written < buf.len() {
            let n = writer
                .write(&buf[written..])
                .await
                .and_then(|n| {
                    if n == 0 {
                        Err(io::Error::from(io::ErrorKind::WriteZero))
                    } else {
                        Ok(n)
                    }
                })
                .map_err(|e| self.write_error(written, buf.len(), &e))?;
            written += n;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.writer
            .lock()
            .await
            .flush()
            .await
            .map_err(|e| self.io_error(&e))
    }
}

pub struct JsonLinesSinkFactory;

impl SinkFactory for JsonLinesSinkFactory {
    fn descriptor(&self) -> &ConnectorDescriptor {
        &SINK_DESCRIPTOR
    }

    fn create(&self, config: &Document) -> Result<Arc<dyn StreamingSink>> {
        let path = required_string(config, "path")?;
        let append = bool_option(config, "append", false);
        Ok(Arc::new(JsonLinesSink::create(path, append)?))
    }
}
