//! Standard-output sink.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use fluxion_types::document::Document;
use fluxion_types::error::SinkError;
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::sync::Mutex;

use super::{bool_option, ConnectorDescriptor, ConnectorKind, ConnectorOption, OptionType, SinkFactory};
use crate::streaming::StreamingSink;

const OPTIONS: &[ConnectorOption] = &[ConnectorOption {
    name: "pretty",
    kind: OptionType::Boolean,
    required: false,
    default_value: Some("false"),
    secret: false,
    description: "Pretty-print each document instead of one per line",
}];

static DESCRIPTOR: ConnectorDescriptor = ConnectorDescriptor {
    name: "stdout",
    kind: ConnectorKind::Sink,
    description: "Prints documents as JSON to standard output",
    options: OPTIONS,
};

pub struct StdoutSink {
    out: Mutex<Stdout>,
    pretty: bool,
}

impl StdoutSink {
    #[must_use]
    pub fn new(pretty: bool) -> Self {
        Self {
            out: Mutex::new(tokio::io::stdout()),
            pretty,
        }
    }

    fn render(&self, batch: &[Document]) -> Result<Vec<u8>, serde_json::Error> {
        let mut buf = Vec::new();
        for doc in batch {
            if self.pretty {
                serde_json::to_writer_pretty(&mut buf, &doc.to_json())?;
            } else {
                serde_json::to_writer(&mut buf, &doc.to_json())?;
            }
            buf.push(b'\n');
        }
        Ok(buf)
    }
}

#[async_trait]
impl StreamingSink for StdoutSink {
    async fn accept(&self, batch: &[Document]) -> Result<(), SinkError> {
        let buf = self
            .render(batch)
            .map_err(|e| SinkError::rejected(format!("stdout: {e}")))?;
        self.out
            .lock()
            .await
            .write_all(&buf)
            .await
            .map_err(|e| SinkError::transient(format!("stdout: {e}")))
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.out
            .lock()
            .await
            .flush()
            .await
            .map_err(|e| SinkError::transient(format!("stdout: {e}")))
    }
}

pub struct StdoutSinkFactory;

impl SinkFactory for StdoutSinkFactory {
    fn descriptor(&self) -> &ConnectorDescriptor {
        &DESCRIPTOR
    }

    fn create(&self, config: &Document) -> Result<Arc<dyn StreamingSink>> {
        Ok(Arc::new(StdoutSink::new(bool_option(config, "pretty", false))))
    }
}
