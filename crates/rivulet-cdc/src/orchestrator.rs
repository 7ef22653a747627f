//! # Orchestrator
//!
//! Runs one [`TableMonitor`] per configured table and funnels their output
//! into a single ordered delivery path.
//!
//! ```text
//!  ┌──────────┐  ┌──────────┐  ┌──────────┐
//!  │ monitor  │  │ monitor  │  │ monitor  │   one task per table (JoinSet)
//!  │ dbo.a    │  │ dbo.b    │  │ dbo.c    │
//!  └────┬─────┘  └────┬─────┘  └────┬─────┘
//!       └─────────────┼─────────────┘
//!                     ▼
//!            ┌─────────────────┐
//!            │ delivery channel│   FIFO, unbounded by default
//!            └────────┬────────┘
//!                     ▼
//!            ┌─────────────────┐
//!            │  reader task    │ ──► Publisher::send
//!            └─────────────────┘
//! ```
//!
//! ## Lifecycle
//!
//! 1. Open a session per table; a table whose session cannot be opened is
//!    skipped, the others continue
//! 2. Start a monitor per opened session, each on a child cancellation token
//! 3. On cancellation: stop opening sessions, cancel every monitor, join them,
//!    close the channel and let the reader drain every queued event (or stop
//!    at `drain_timeout` when one is set)
//!
//! A run with no tables, or in which no table could be started, fails.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::common::{CdcError, EventEmitter, Publisher, Result, SourceConnector, TableId};
use crate::delivery;
use crate::monitor::{MonitorHandle, MonitorStatus, MonitorSummary, TableMonitor, TableMonitorConfig};

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Delivery channel capacity (`None` = unbounded)
    pub channel_capacity: Option<usize>,
    /// Bound on the final drain (`None` = wait for every queued event).
    ///
    /// Queued events are already checkpointed, so a drain cut short loses
    /// them for good.
    pub drain_timeout: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            channel_capacity: None,
            drain_timeout: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = Some(capacity);
        self
    }

    pub fn drain_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.drain_timeout = timeout;
        self
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Tables whose monitor ran until shutdown
    pub tables_started: Vec<TableId>,
    /// Tables whose session could not be opened
    pub tables_skipped: Vec<TableId>,
    /// Tables whose monitor failed to initialize
    pub tables_failed: Vec<TableId>,
    /// Final state of every monitor that ran until shutdown
    pub monitors: Vec<MonitorSummary>,
    /// Events the publisher accepted
    pub events_delivered: u64,
    /// Events the publisher rejected
    pub publish_failures: u64,
    /// Events still queued when the drain timed out
    pub undelivered: u64,
}

impl RunReport {
    pub fn drained(&self) -> bool {
        self.undelivered == 0
    }
}

/// Coordinates table monitors and the delivery reader.
pub struct Orchestrator {
    connector: Arc<dyn SourceConnector>,
    config: OrchestratorConfig,
    handles: RwLock<Vec<MonitorHandle>>,
}

impl Orchestrator {
    pub fn new(connector: Arc<dyn SourceConnector>) -> Self {
        Self::with_config(connector, OrchestratorConfig::default())
    }

    pub fn with_config(connector: Arc<dyn SourceConnector>, config: OrchestratorConfig) -> Self {
        Self {
            connector,
            config,
            handles: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Status of every running monitor.
    ///
    /// Each monitor answers at its next wait, so this may take up to one
    /// in-flight poll per table.
    pub async fn status(&self) -> Vec<MonitorStatus> {
        let handles = self.handles.read().await.clone();
        let mut statuses = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Some(status) = handle.status().await {
                statuses.push(status);
            }
        }
        statuses
    }

    /// Monitor `tables` until `cancel` fires, delivering every change to `publisher`.
    pub async fn run(
        &self,
        tables: Vec<TableMonitorConfig>,
        publisher: Arc<dyn Publisher>,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        if tables.is_empty() {
            return Err(CdcError::config("no tables configured"));
        }

        let (sender, receiver) = delivery::channel(self.config.channel_capacity);
        let stats = sender.stats();
        let mut reader = tokio::spawn(receiver.run(publisher));
        let emitter: Arc<dyn EventEmitter> = Arc::new(sender);

        let mut report = RunReport::default();
        let mut monitors = JoinSet::new();
        let total = tables.len();

        info!(tables = total, "Starting table monitors");

        for table_config in tables {
            if cancel.is_cancelled() {
                break;
            }

            let table = table_config.table.clone();
            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.connector.open(&table) => Some(result),
            };

            let mut session = match opened {
                None => break,
                Some(Ok(session)) => session,
                Some(Err(e)) => {
                    warn!(
                        table = %table,
                        error = %e,
                        category = ?e.category(),
                        "Could not open session; skipping table"
                    );
                    report.tables_skipped.push(table);
                    continue;
                }
            };

            if cancel.is_cancelled() {
                if let Err(e) = session.source.close().await {
                    warn!(table = %table, error = %e, "Failed to close session");
                }
                break;
            }

            let (monitor, handle) = TableMonitor::new(
                table_config,
                session,
                emitter.clone(),
                cancel.child_token(),
            );
            self.handles.write().await.push(handle);
            monitors.spawn(async move { (table, monitor.run().await) });
        }

        let spawned = monitors.len();
        let mut fatal = None;

        if spawned == 0 && !cancel.is_cancelled() {
            fatal = Some(CdcError::connection(format!(
                "none of the {} configured tables could be opened",
                total
            )));
        } else {
            info!(
                started = spawned,
                skipped = report.tables_skipped.len(),
                "Table monitors running"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    joined = monitors.join_next() => match joined {
                        Some(joined) => record_monitor(&mut report, joined),
                        None => break,
                    },
                }
            }

            // Monitors hold child tokens and stop on their own once cancelled
            while let Some(joined) = monitors.join_next().await {
                record_monitor(&mut report, joined);
            }

            if report.tables_started.is_empty() && !cancel.is_cancelled() {
                fatal = Some(CdcError::connection(format!(
                    "none of the {} configured tables could be started",
                    total
                )));
            }
        }

        self.handles.write().await.clear();
        drop(emitter);

        let drained = match self.config.drain_timeout {
            Some(timeout) => tokio::time::timeout(timeout, &mut reader).await.ok(),
            None => Some((&mut reader).await),
        };

        match drained {
            Some(Ok(delivered)) => {
                report.events_delivered = delivered.delivered;
                report.publish_failures = delivered.failed;
            }
            Some(Err(e)) => {
                error!(error = %e, "Delivery reader task failed");
                let snapshot = stats.snapshot();
                report.events_delivered = snapshot.delivered;
                report.publish_failures = snapshot.failed;
                report.undelivered = snapshot.pending();
            }
            None => {
                reader.abort();
                let snapshot = stats.snapshot();
                report.events_delivered = snapshot.delivered;
                report.publish_failures = snapshot.failed;
                report.undelivered = snapshot.pending();
                error!(
                    undelivered = report.undelivered,
                    "Drain timed out; undelivered changes were already checkpointed and are lost"
                );
            }
        }

        if let Some(e) = fatal {
            error!(error = %e, "Orchestrator could not start");
            return Err(e);
        }

        info!(
            started = report.tables_started.len(),
            skipped = report.tables_skipped.len(),
            failed = report.tables_failed.len(),
            delivered = report.events_delivered,
            publish_failures = report.publish_failures,
            "Orchestrator stopped"
        );
        Ok(report)
    }
}

fn record_monitor(
    report: &mut RunReport,
    joined: std::result::Result<(TableId, Result<MonitorSummary>), tokio::task::JoinError>,
) {
    match joined {
        Ok((table, Ok(summary))) => {
            report.tables_started.push(table);
            report.monitors.push(summary);
        }
        Ok((table, Err(_))) => {
            // already logged by the monitor
            report.tables_failed.push(table);
        }
        Err(e) => {
            error!(error = %e, "Table monitor task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{
        ChangeBatch, ChangeEvent, ChangeSource, Cursor, MemoryCheckpointStore, TableSession,
    };
    use async_trait::async_trait;

    struct IdleSource;

    #[async_trait]
    impl ChangeSource for IdleSource {
        async fn columns(&mut self, _table: &TableId) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn fetch(
            &mut self,
            _table: &TableId,
            _columns: &[String],
            since: &Cursor,
            _limit: Option<usize>,
        ) -> Result<ChangeBatch> {
            Ok(ChangeBatch::empty(since.clone()))
        }

        fn min_cursor(&self) -> Cursor {
            Cursor::min(2)
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct OnlyConnector(&'static str);

    #[async_trait]
    impl SourceConnector for OnlyConnector {
        async fn open(&self, table: &TableId) -> Result<TableSession> {
            if table.name != self.0 {
                return Err(CdcError::connection("login failed"));
            }
            Ok(TableSession::new(
                Box::new(IdleSource),
                Arc::new(MemoryCheckpointStore::new()),
            ))
        }
    }

    struct NullPublisher;

    #[async_trait]
    impl Publisher for NullPublisher {
        async fn send(&self, _event: &ChangeEvent) -> Result<()> {
            Ok(())
        }
    }

    fn tables(names: &[&str]) -> Vec<TableMonitorConfig> {
        names
            .iter()
            .map(|n| TableMonitorConfig::new(TableId::new("dbo", *n)))
            .collect()
    }

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.channel_capacity, None);
        assert_eq!(config.drain_timeout, None);
    }

    #[tokio::test]
    async fn test_no_tables_is_fatal() {
        let orchestrator = Orchestrator::new(Arc::new(OnlyConnector("a")));
        let err = orchestrator
            .run(Vec::new(), Arc::new(NullPublisher), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CdcError::Config(_)));
    }

    #[tokio::test]
    async fn test_all_sessions_failing_is_fatal() {
        let orchestrator = Orchestrator::new(Arc::new(OnlyConnector("zzz")));
        let err = orchestrator
            .run(
                tables(&["a", "b"]),
                Arc::new(NullPublisher),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CdcError::Connection(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_unopenable_table_and_reports_status() {
        let orchestrator = Arc::new(Orchestrator::new(Arc::new(OnlyConnector("b"))));
        let cancel = CancellationToken::new();

        let run = {
            let orchestrator = orchestrator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                orchestrator
                    .run(tables(&["a", "b"]), Arc::new(NullPublisher), cancel)
                    .await
            })
        };

        let mut statuses = orchestrator.status().await;
        while statuses.is_empty() {
            tokio::task::yield_now().await;
            statuses = orchestrator.status().await;
        }
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].table, TableId::new("dbo", "b"));

        cancel.cancel();
        let report = run.await.unwrap().unwrap();
        assert_eq!(report.tables_skipped, vec![TableId::new("dbo", "a")]);
        assert_eq!(report.tables_started, vec![TableId::new("dbo", "b")]);
        assert!(report.drained());
        assert!(orchestrator.status().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_is_not_fatal() {
        let orchestrator = Orchestrator::new(Arc::new(OnlyConnector("a")));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = orchestrator
            .run(tables(&["a"]), Arc::new(NullPublisher), cancel)
            .await
            .unwrap();
        assert!(report.tables_started.is_empty());
        assert_eq!(report.events_delivered, 0);
    }
}
