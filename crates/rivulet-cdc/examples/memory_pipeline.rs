//! In-memory pipeline example
//!
//! Runs the engine against a synthetic change source that produces a few
//! rows every second, with cursors kept in memory.
//!
//! Run with:
//! ```
//! cargo run -p rivulet-cdc --example memory_pipeline
//! ```

use async_trait::async_trait;
use rivulet_cdc::common::MemoryCheckpointStore;
use rivulet_cdc::{
    ChangeBatch, ChangeEvent, ChangeOp, ChangeSource, CheckpointStore, Cursor, Orchestrator,
    Publisher, Result, SourceConnector, TableId, TableMonitorConfig, TableSession,
};
use serde_json::{json, Map};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Emits one change per elapsed 300ms since start
struct TickingSource {
    started: Instant,
}

#[async_trait]
impl ChangeSource for TickingSource {
    async fn columns(&mut self, _table: &TableId) -> Result<Vec<String>> {
        Ok(vec!["id".into(), "tick".into()])
    }

    async fn fetch(
        &mut self,
        table: &TableId,
        _columns: &[String],
        since: &Cursor,
        limit: Option<usize>,
    ) -> Result<ChangeBatch> {
        let produced = (self.started.elapsed().as_millis() / 300) as u64;
        let last_seen = u64::from_be_bytes(since.as_bytes().try_into().unwrap_or([0; 8]));

        let events = (last_seen + 1..=produced)
            .take(limit.unwrap_or(usize::MAX))
            .map(|n| {
                let mut columns = Map::new();
                columns.insert("id".into(), json!(n % 3));
                columns.insert("tick".into(), json!(n));
                let op = if n % 3 == 0 {
                    ChangeOp::Insert
                } else {
                    ChangeOp::Update
                };
                ChangeEvent::new(table.clone(), op, columns, Cursor::new(n.to_be_bytes().to_vec()))
            })
            .collect();

        Ok(ChangeBatch::from_events(events, since.clone()))
    }

    fn min_cursor(&self) -> Cursor {
        Cursor::min(8)
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct TickingConnector {
    checkpoints: Arc<MemoryCheckpointStore>,
}

#[async_trait]
impl SourceConnector for TickingConnector {
    async fn open(&self, _table: &TableId) -> Result<TableSession> {
        Ok(TableSession::new(
            Box::new(TickingSource {
                started: Instant::now(),
            }),
            self.checkpoints.clone(),
        ))
    }
}

struct StdoutPublisher;

#[async_trait]
impl Publisher for StdoutPublisher {
    async fn send(&self, event: &ChangeEvent) -> Result<()> {
        println!("{}", event.to_json()?);
        Ok(())
    }

    fn name(&self) -> &str {
        "stdout"
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let orchestrator = Orchestrator::new(Arc::new(TickingConnector {
        checkpoints: checkpoints.clone(),
    }));

    let tables = ["orders", "customers"]
        .into_iter()
        .map(|name| {
            TableMonitorConfig::new(TableId::new("dbo", name))
                .poll_interval(Duration::from_millis(500))
                .max_poll_interval(Duration::from_secs(4))
        })
        .collect();

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
        }
        stopper.cancel();
    });

    let report = orchestrator
        .run(tables, Arc::new(StdoutPublisher), cancel)
        .await?;

    println!(
        "\nDelivered {} changes from {} tables",
        report.events_delivered,
        report.tables_started.len()
    );
    for table in &report.tables_started {
        if let Some(cursor) = checkpoints.load(table).await? {
            println!("  {} -> {}", table, cursor);
        }
    }
    Ok(())
}
