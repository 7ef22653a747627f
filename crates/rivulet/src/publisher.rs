//! Publishers selectable from configuration
//!
//! - `console`: writes every event to stdout (pretty or one JSON line)
//! - `log`: emits every event as a `tracing` record on the `rivulet::changes` target

use async_trait::async_trait;
use rivulet_cdc::{ChangeEvent, Publisher, Result};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::info;

use crate::config::{OutputFormat, PublisherConfig, PublisherKind};

/// Build the publisher named by `config`
pub fn build_publisher(config: &PublisherConfig) -> Arc<dyn Publisher> {
    match config.kind {
        PublisherKind::Console => Arc::new(ConsolePublisher::new(config.format)),
        PublisherKind::Log => Arc::new(LogPublisher::new(config.format)),
    }
}

/// Format an event for output
pub fn format_event(event: &ChangeEvent, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => event.to_json(),
        OutputFormat::Pretty => {
            let mut output = format!(
                "[{}] {}: {} @ {}\n",
                event.captured_at.format("%Y-%m-%d %H:%M:%S%.3f"),
                event.op.as_str().to_uppercase(),
                event.table,
                event.position
            );
            output.push_str(&serde_json::to_string_pretty(&event.columns)?);

            if let Some(before) = &event.before {
                output.push_str("\n---before---\n");
                output.push_str(&serde_json::to_string_pretty(before)?);
            }
            Ok(output)
        }
    }
}

/// Writes events to stdout, or to any async writer in tests.
pub struct ConsolePublisher {
    format: OutputFormat,
    out: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl ConsolePublisher {
    pub fn new(format: OutputFormat) -> Self {
        Self::with_writer(format, Box::new(tokio::io::stdout()))
    }

    pub fn with_writer(format: OutputFormat, out: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        Self {
            format,
            out: Mutex::new(out),
        }
    }
}

#[async_trait]
impl Publisher for ConsolePublisher {
    async fn send(&self, event: &ChangeEvent) -> Result<()> {
        let mut output = format_event(event, self.format)?;
        output.push('\n');

        let mut out = self.out.lock().await;
        out.write_all(output.as_bytes()).await?;
        out.flush().await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "console"
    }
}

/// Emits events as `tracing` records.
pub struct LogPublisher {
    format: OutputFormat,
}

impl LogPublisher {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }
}

#[async_trait]
impl Publisher for LogPublisher {
    async fn send(&self, event: &ChangeEvent) -> Result<()> {
        let payload = match self.format {
            OutputFormat::Json => event.to_json()?,
            OutputFormat::Pretty => serde_json::to_string(&event.columns)?,
        };
        info!(
            target: "rivulet::changes",
            table = %event.table,
            op = event.op.as_str(),
            cursor = %event.position,
            "{}",
            payload
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}
