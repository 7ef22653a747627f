//! # Table Monitor
//!
//! One monitor per table. It owns that table's session, cursor and backoff,
//! and runs a small state machine:
//!
//! ```text
//!  ┌──────────────┐  cursor loaded  ┌─────────┐  batch done  ┌─────────┐
//!  │ Initializing │ ──────────────► │ Polling │ ───────────► │ Waiting │
//!  └──────┬───────┘                 └─────────┘ ◄─────────── └────┬────┘
//!         │ cancelled                    ▲        interval        │ cancelled
//!         ▼                              │        elapsed         ▼
//!     ┌─────────┐                        │                  ┌─────────┐
//!     │ Stopped │ ◄──────────────────────┴───────────────── │ Stopped │
//!     └─────────┘          cancelled at top of iteration     └─────────┘
//! ```
//!
//! ## Per-poll contract
//!
//! 1. Resolve the column set and fetch changes after the in-memory cursor
//! 2. Emit each event in order
//! 3. Save the new cursor, then adopt it and reset the backoff
//!
//! An empty poll doubles the interval. Any failure leaves the cursor and the
//! interval where they were, so the same changes are read again next time
//! (at-least-once). Cancellation is honored at the wait, at the top of each
//! iteration and between emissions; an interrupted batch is not checkpointed.
//!
//! Status is read by message through a [`MonitorHandle`] while the monitor
//! waits, so no state is shared between tasks.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::common::{
    BackoffController, CdcError, ChangeBatch, Cursor, ErrorCategory, EventEmitter, Result,
    TableId, TableSession,
};

/// Default minimum poll interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default maximum poll interval
pub const DEFAULT_MAX_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Per-table monitoring settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMonitorConfig {
    /// Table to monitor
    pub table: TableId,
    /// Backoff floor, used after every poll that found changes
    pub poll_interval: Duration,
    /// Backoff ceiling
    pub max_poll_interval: Duration,
    /// Maximum rows per fetch (`None` = unlimited)
    pub max_batch_size: Option<usize>,
}

impl TableMonitorConfig {
    pub fn new(table: TableId) -> Self {
        Self {
            table,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_poll_interval: DEFAULT_MAX_POLL_INTERVAL,
            max_batch_size: None,
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn max_poll_interval(mut self, interval: Duration) -> Self {
        self.max_poll_interval = interval;
        self
    }

    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = Some(size);
        self
    }
}

/// Lifecycle state of a table monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Initializing,
    Polling,
    Waiting,
    Stopped,
}

/// Point-in-time view of a monitor, produced by the monitor itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorStatus {
    pub table: TableId,
    pub state: MonitorState,
    /// In-memory cursor (`None` before initialization completes)
    pub cursor: Option<Cursor>,
    /// Interval of the current or next wait
    pub interval_ms: u64,
    pub polls: u64,
    pub events_emitted: u64,
    pub errors: u64,
    pub checkpoint_failures: u64,
    pub last_error: Option<String>,
    pub last_error_category: Option<ErrorCategory>,
}

/// Final figures of a monitor that ran to cancellation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSummary {
    pub table: TableId,
    pub cursor: Cursor,
    pub polls: u64,
    pub events_emitted: u64,
    pub errors: u64,
}

/// Query port into a running monitor.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    table: TableId,
    requests: mpsc::Sender<oneshot::Sender<MonitorStatus>>,
}

impl MonitorHandle {
    pub fn table(&self) -> &TableId {
        &self.table
    }

    /// Ask the monitor for its status.
    ///
    /// Answered at the monitor's next wait; `None` once it has stopped.
    pub async fn status(&self) -> Option<MonitorStatus> {
        let (tx, rx) = oneshot::channel();
        self.requests.send(tx).await.ok()?;
        rx.await.ok()
    }
}

enum PollOutcome {
    Changes(usize),
    Empty,
    Interrupted,
}

#[derive(Debug, Default)]
struct Counters {
    polls: u64,
    events_emitted: u64,
    errors: u64,
    checkpoint_failures: u64,
    last_error: Option<String>,
    last_error_category: Option<ErrorCategory>,
}

/// Polls one table until cancelled.
pub struct TableMonitor {
    core: MonitorCore,
    status_rx: mpsc::Receiver<oneshot::Sender<MonitorStatus>>,
}

struct MonitorCore {
    config: TableMonitorConfig,
    session: TableSession,
    emitter: Arc<dyn EventEmitter>,
    cancel: CancellationToken,
    state: MonitorState,
    cursor: Option<Cursor>,
    backoff: BackoffController,
    counters: Counters,
}

impl TableMonitor {
    /// Create a monitor and the handle used to query it.
    pub fn new(
        config: TableMonitorConfig,
        session: TableSession,
        emitter: Arc<dyn EventEmitter>,
        cancel: CancellationToken,
    ) -> (Self, MonitorHandle) {
        let (status_tx, status_rx) = mpsc::channel(8);
        let handle = MonitorHandle {
            table: config.table.clone(),
            requests: status_tx,
        };
        let backoff = BackoffController::new(config.poll_interval, config.max_poll_interval);

        let monitor = Self {
            core: MonitorCore {
                config,
                session,
                emitter,
                cancel,
                state: MonitorState::Initializing,
                cursor: None,
                backoff,
                counters: Counters::default(),
            },
            status_rx,
        };
        (monitor, handle)
    }

    pub fn table(&self) -> &TableId {
        &self.core.config.table
    }

    /// Run until cancelled.
    ///
    /// Returns an error only when initialization fails. The session is
    /// closed before returning on every path.
    pub async fn run(self) -> Result<MonitorSummary> {
        let TableMonitor {
            mut core,
            mut status_rx,
        } = self;

        let result = core.run(&mut status_rx).await;
        core.state = MonitorState::Stopped;

        if let Err(e) = core.session.source.close().await {
            warn!(table = %core.config.table, error = %e, "Failed to close session");
        }

        match result {
            Ok(()) => {
                let summary = core.summary();
                info!(
                    table = %summary.table,
                    cursor = %summary.cursor,
                    events = summary.events_emitted,
                    "Table monitor stopped"
                );
                Ok(summary)
            }
            Err(e) => Err(e),
        }
    }
}

impl MonitorCore {
    async fn run(
        &mut self,
        status_rx: &mut mpsc::Receiver<oneshot::Sender<MonitorStatus>>,
    ) -> Result<()> {
        let cancel = self.cancel.clone();
        let initialized = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.initialize() => Some(result),
        };

        match initialized {
            None => return Ok(()),
            Some(Err(e)) => {
                error!(
                    table = %self.config.table,
                    error = %e,
                    code = e.error_code(),
                    category = ?e.category(),
                    "Table monitor failed to initialize"
                );
                return Err(e);
            }
            Some(Ok(())) => {}
        }

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.state = MonitorState::Polling;
            self.counters.polls += 1;

            match self.poll_once().await {
                Ok(PollOutcome::Changes(count)) => {
                    debug!(
                        table = %self.config.table,
                        events = count,
                        cursor = %self.cursor_display(),
                        "Processed changes"
                    );
                }
                Ok(PollOutcome::Empty) => {
                    trace!(
                        table = %self.config.table,
                        next_poll_ms = self.backoff.current().as_millis() as u64,
                        "No changes"
                    );
                }
                Ok(PollOutcome::Interrupted) => {
                    debug!(table = %self.config.table, "Batch interrupted by shutdown");
                    break;
                }
                Err(e) => self.record_error(e),
            }

            self.state = MonitorState::Waiting;
            if !self.wait(self.backoff.current(), status_rx).await {
                break;
            }
        }

        Ok(())
    }

    async fn initialize(&mut self) -> Result<()> {
        let table = &self.config.table;
        let checkpoints = &self.session.checkpoints;

        checkpoints.ensure_schema().await?;
        let cursor = match checkpoints.load(table).await? {
            Some(saved) => self.session.source.normalize_cursor(saved),
            None => self.session.source.min_cursor(),
        };

        info!(
            table = %table,
            cursor = %cursor,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_poll_interval_ms = self.config.max_poll_interval.as_millis() as u64,
            "Table monitor started"
        );
        self.cursor = Some(cursor);
        Ok(())
    }

    async fn poll_once(&mut self) -> Result<PollOutcome> {
        let table = self.config.table.clone();
        let since = self
            .cursor
            .clone()
            .ok_or_else(|| CdcError::invalid_state("monitor polled before initialization"))?;

        let columns = self.session.source.columns(&table).await?;
        let batch = self
            .session
            .source
            .fetch(&table, &columns, &since, self.config.max_batch_size)
            .await?;
        check_batch(&table, &since, &batch)?;

        if batch.is_empty() {
            self.backoff.increase();
            return Ok(PollOutcome::Empty);
        }

        let ChangeBatch { events, cursor } = batch;
        let count = events.len();
        for event in events {
            let emitted = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                result = self.emitter.emit(event) => Some(result),
            };
            match emitted {
                None => return Ok(PollOutcome::Interrupted),
                Some(result) => result?,
            }
            self.counters.events_emitted += 1;
        }

        self.session
            .checkpoints
            .save(&table, &cursor)
            .await
            .map_err(|e| {
                if e.is_checkpoint_failure() {
                    e
                } else {
                    CdcError::checkpoint(table.to_string(), e.to_string())
                }
            })?;

        self.cursor = Some(cursor);
        self.backoff.reset();
        Ok(PollOutcome::Changes(count))
    }

    fn record_error(&mut self, e: CdcError) {
        self.counters.errors += 1;
        self.counters.last_error = Some(e.to_string());
        self.counters.last_error_category = Some(e.category());

        if e.is_checkpoint_failure() {
            self.counters.checkpoint_failures += 1;
            error!(
                table = %self.config.table,
                cursor = %self.cursor_display(),
                error = %e,
                "Checkpoint save failed; cursor unchanged, batch will be delivered again"
            );
        } else {
            error!(
                table = %self.config.table,
                error = %e,
                code = e.error_code(),
                category = ?e.category(),
                retriable = e.is_retriable(),
                "Poll failed"
            );
        }
    }

    /// Sleep for `interval`, answering status queries meanwhile.
    ///
    /// Returns `false` if cancelled.
    async fn wait(
        &self,
        interval: Duration,
        status_rx: &mut mpsc::Receiver<oneshot::Sender<MonitorStatus>>,
    ) -> bool {
        let cancel = self.cancel.clone();
        let sleep = tokio::time::sleep(interval);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                Some(reply) = status_rx.recv() => {
                    let _ = reply.send(self.status());
                }
            }
        }
    }

    fn status(&self) -> MonitorStatus {
        MonitorStatus {
            table: self.config.table.clone(),
            state: self.state,
            cursor: self.cursor.clone(),
            interval_ms: self.backoff.current().as_millis() as u64,
            polls: self.counters.polls,
            events_emitted: self.counters.events_emitted,
            errors: self.counters.errors,
            checkpoint_failures: self.counters.checkpoint_failures,
            last_error: self.counters.last_error.clone(),
            last_error_category: self.counters.last_error_category,
        }
    }

    fn summary(&self) -> MonitorSummary {
        MonitorSummary {
            table: self.config.table.clone(),
            cursor: self
                .cursor
                .clone()
                .unwrap_or_else(|| self.session.source.min_cursor()),
            polls: self.counters.polls,
            events_emitted: self.counters.events_emitted,
            errors: self.counters.errors,
        }
    }

    fn cursor_display(&self) -> String {
        self.cursor
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string())
    }
}

/// Reject batches that would move the cursor backwards or out of order.
fn check_batch(table: &TableId, since: &Cursor, batch: &ChangeBatch) -> Result<()> {
    if batch.cursor < *since {
        return Err(CdcError::invalid_state(format!(
            "cursor for {} regressed from {} to {}",
            table, since, batch.cursor
        )));
    }

    let mut previous = since;
    for event in &batch.events {
        if event.position <= *previous {
            return Err(CdcError::invalid_state(format!(
                "change at {} for {} is not after {}",
                event.position, table, previous
            )));
        }
        previous = &event.position;
    }

    if let Some(last) = batch.events.last() {
        if batch.cursor != last.position {
            return Err(CdcError::invalid_state(format!(
                "batch cursor {} for {} does not match last change {}",
                batch.cursor, table, last.position
            )));
        }
    }

    Ok(())
}
