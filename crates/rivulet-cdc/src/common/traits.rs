//! Contracts between the monitoring engine and its collaborators
//!
//! Database-agnostic. A concrete source (see the `sqlserver` module) provides
//! a [`SourceConnector`] that opens one [`TableSession`] per table; sinks
//! implement [`Publisher`].

use async_trait::async_trait;
use std::fmt;

use crate::common::{ChangeBatch, ChangeEvent, Cursor, Result, SharedCheckpointStore, TableId};

/// A table's change-tracking facility, read through one dedicated session.
///
/// `Sync` so a monitor can borrow its session across awaits on any worker.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Current tracked column names, in source order.
    async fn columns(&mut self, table: &TableId) -> Result<Vec<String>>;

    /// Changes strictly after `since`, in source order.
    ///
    /// `limit` caps the number of rows read; the returned cursor then
    /// points at the last row actually returned.
    async fn fetch(
        &mut self,
        table: &TableId,
        columns: &[String],
        since: &Cursor,
        limit: Option<usize>,
    ) -> Result<ChangeBatch>;

    /// Cursor preceding every change this source can report
    fn min_cursor(&self) -> Cursor;

    /// Bring a persisted cursor into this source's native form
    fn normalize_cursor(&self, cursor: Cursor) -> Cursor {
        cursor
    }

    /// Release the session. Called exactly once by its owner.
    async fn close(&mut self) -> Result<()>;
}

/// Everything one table monitor owns: its source session and a checkpoint handle.
pub struct TableSession {
    pub source: Box<dyn ChangeSource>,
    pub checkpoints: SharedCheckpointStore,
}

impl TableSession {
    pub fn new(source: Box<dyn ChangeSource>, checkpoints: SharedCheckpointStore) -> Self {
        Self {
            source,
            checkpoints,
        }
    }
}

impl fmt::Debug for TableSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableSession").finish_non_exhaustive()
    }
}

/// Opens dedicated per-table sessions.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Open a session for one table. Failure skips only that table.
    async fn open(&self, table: &TableId) -> Result<TableSession>;
}

/// Where a table monitor hands its events.
#[async_trait]
pub trait EventEmitter: Send + Sync {
    async fn emit(&self, event: ChangeEvent) -> Result<()>;
}

/// Downstream sink for change events.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Deliver one event. Failures are logged by the caller and not retried.
    async fn send(&self, event: &ChangeEvent) -> Result<()>;

    /// Sink name for logs
    fn name(&self) -> &str {
        "publisher"
    }
}
