//! SQL Server change source, offset store and connector
//!
//! Each table session owns one connection. The change source and the
//! session's checkpoint store share it; the monitor uses them one at a time.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::client::{ChangeRow, SqlServerClient, CURSOR_WIDTH, LSN_WIDTH};
use super::config::SqlServerConfig;
use super::error::SqlServerError;
use crate::common::{
    CdcError, ChangeBatch, ChangeEvent, ChangeOp, ChangeSource, CheckpointStore, Cursor, Result,
    SharedCheckpointStore, SourceConnector, TableId, TableSession,
};

type SharedClient = Arc<Mutex<Option<SqlServerClient>>>;

/// Map an `__$operation` code to an operation kind.
///
/// Code 3 (update before-image) never reaches this point on its own; it is
/// merged into the following code 4 row.
pub fn op_from_code(code: i32) -> ChangeOp {
    match code {
        1 => ChangeOp::Delete,
        2 => ChangeOp::Insert,
        4 => ChangeOp::Update,
        other => ChangeOp::Unknown(other),
    }
}

/// Turn ordered change rows into events, merging update pairs (3 then 4).
pub fn rows_to_events(table: &TableId, rows: Vec<ChangeRow>) -> Vec<ChangeEvent> {
    let mut events = Vec::with_capacity(rows.len());
    let mut iter = rows.into_iter().peekable();

    while let Some(current) = iter.next() {
        if current.operation == 3 {
            let paired = iter
                .peek()
                .is_some_and(|next| next.operation == 4 && next.position == current.position);

            if paired {
                if let Some(after) = iter.next() {
                    events.push(
                        ChangeEvent::new(table.clone(), ChangeOp::Update, after.data, after.position)
                            .with_before(current.data),
                    );
                    continue;
                }
            }

            warn!(table = %table, position = %current.position, "Update before-image without after-image");
            events.push(
                ChangeEvent::new(
                    table.clone(),
                    ChangeOp::Update,
                    current.data.clone(),
                    current.position,
                )
                .with_before(current.data),
            );
            continue;
        }

        let op = op_from_code(current.operation);
        if let ChangeOp::Unknown(code) = op {
            warn!(table = %table, code, position = %current.position, "Unknown CDC operation code");
        }
        events.push(ChangeEvent::new(table.clone(), op, current.data, current.position));
    }

    events
}

/// Widen a legacy start-LSN-only cursor to `__$start_lsn ‖ __$seqval`.
///
/// The sequence half is all `0xFF`, so resuming skips the whole transaction
/// the old cursor pointed at (it was fully processed).
pub fn widen_legacy_cursor(cursor: Cursor) -> Cursor {
    if cursor.len() != LSN_WIDTH {
        return cursor;
    }
    let mut bytes = cursor.as_bytes().to_vec();
    bytes.extend_from_slice(&[0xFF; LSN_WIDTH]);
    Cursor::new(bytes)
}

/// Change source over `cdc.<schema>_<table>_CT`.
pub struct SqlServerChangeSource {
    client: SharedClient,
}

#[async_trait]
impl ChangeSource for SqlServerChangeSource {
    async fn columns(&mut self, table: &TableId) -> Result<Vec<String>> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or(SqlServerError::SessionClosed)?;
        client.table_columns(table).await
    }

    async fn fetch(
        &mut self,
        table: &TableId,
        columns: &[String],
        since: &Cursor,
        limit: Option<usize>,
    ) -> Result<ChangeBatch> {
        let rows = {
            let mut guard = self.client.lock().await;
            let client = guard.as_mut().ok_or(SqlServerError::SessionClosed)?;
            client.fetch_changes(table, columns, since, limit).await?
        };

        let events = rows_to_events(table, rows);
        Ok(ChangeBatch::from_events(events, since.clone()))
    }

    fn min_cursor(&self) -> Cursor {
        Cursor::min(CURSOR_WIDTH)
    }

    fn normalize_cursor(&self, cursor: Cursor) -> Cursor {
        widen_legacy_cursor(cursor)
    }

    async fn close(&mut self) -> Result<()> {
        let client = self.client.lock().await.take();
        match client {
            Some(client) => client.close().await,
            None => Ok(()),
        }
    }
}

/// Checkpoint store backed by the `cdc_offsets` table of the source database.
pub struct SqlServerCheckpointStore {
    client: SharedClient,
}

impl SqlServerCheckpointStore {
    fn checkpoint_error(table: &TableId, e: impl std::fmt::Display) -> CdcError {
        CdcError::checkpoint(table.to_string(), e.to_string())
    }
}

#[async_trait]
impl CheckpointStore for SqlServerCheckpointStore {
    async fn ensure_schema(&self) -> Result<()> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or(SqlServerError::SessionClosed)?;
        client
            .ensure_offsets_table()
            .await
            .map_err(|e| CdcError::checkpoint(super::client::OFFSETS_TABLE, e.to_string()))
    }

    async fn load(&self, table: &TableId) -> Result<Option<Cursor>> {
        let mut guard = self.client.lock().await;
        let client = guard
            .as_mut()
            .ok_or_else(|| Self::checkpoint_error(table, SqlServerError::SessionClosed))?;

        let bytes = client
            .load_offset(&table.to_string())
            .await
            .map_err(|e| Self::checkpoint_error(table, e))?;
        Ok(bytes.map(Cursor::new))
    }

    async fn save(&self, table: &TableId, cursor: &Cursor) -> Result<()> {
        let mut guard = self.client.lock().await;
        let client = guard
            .as_mut()
            .ok_or_else(|| Self::checkpoint_error(table, SqlServerError::SessionClosed))?;

        client
            .save_offset(&table.to_string(), cursor.as_bytes())
            .await
            .map_err(|e| Self::checkpoint_error(table, e))
    }
}

/// Opens one SQL Server session per table.
///
/// By default cursors are stored in the source database; an external store
/// (e.g. a [`FileCheckpointStore`](crate::common::FileCheckpointStore)) can
/// be supplied instead.
pub struct SqlServerConnector {
    config: SqlServerConfig,
    checkpoints: Option<SharedCheckpointStore>,
}

impl SqlServerConnector {
    pub fn new(config: SqlServerConfig) -> Self {
        Self {
            config,
            checkpoints: None,
        }
    }

    /// Keep cursors in `store` instead of the source database
    pub fn with_checkpoint_store(mut self, store: SharedCheckpointStore) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn config(&self) -> &SqlServerConfig {
        &self.config
    }
}

#[async_trait]
impl SourceConnector for SqlServerConnector {
    async fn open(&self, table: &TableId) -> Result<TableSession> {
        let mut client = SqlServerClient::connect(&self.config).await?;

        if let Err(e) = client.verify_capture_enabled(table).await {
            if let Err(close_err) = client.close().await {
                warn!(table = %table, error = %close_err, "Failed to close session");
            }
            return Err(e);
        }

        let client: SharedClient = Arc::new(Mutex::new(Some(client)));
        let checkpoints: SharedCheckpointStore = match &self.checkpoints {
            Some(store) => store.clone(),
            None => Arc::new(SqlServerCheckpointStore {
                client: client.clone(),
            }),
        };

        info!(table = %table, "Opened SQL Server session");
        Ok(TableSession::new(
            Box::new(SqlServerChangeSource { client }),
            checkpoints,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map, Value};

    fn row(position: u8, seq: u8, operation: i32, name: &str) -> ChangeRow {
        let mut bytes = vec![0u8; CURSOR_WIDTH];
        bytes[LSN_WIDTH - 1] = position;
        bytes[CURSOR_WIDTH - 1] = seq;
        let mut data = Map::new();
        data.insert("id".to_string(), json!(1));
        data.insert("name".to_string(), Value::String(name.to_string()));
        ChangeRow {
            position: Cursor::new(bytes),
            operation,
            data,
        }
    }

    fn table() -> TableId {
        TableId::new("dbo", "users")
    }

    #[test]
    fn test_op_codes() {
        assert_eq!(op_from_code(1), ChangeOp::Delete);
        assert_eq!(op_from_code(2), ChangeOp::Insert);
        assert_eq!(op_from_code(4), ChangeOp::Update);
        assert_eq!(op_from_code(5), ChangeOp::Unknown(5));
        assert_eq!(op_from_code(0), ChangeOp::Unknown(0));
    }

    #[test]
    fn test_update_pairs_are_merged() {
        let rows = vec![
            row(1, 1, 2, "ann"),
            row(2, 1, 3, "ann"),
            row(2, 1, 4, "anne"),
            row(3, 1, 1, "anne"),
        ];

        let events = rows_to_events(&table(), rows);
        let ops: Vec<ChangeOp> = events.iter().map(|e| e.op).collect();
        assert_eq!(
            ops,
            vec![ChangeOp::Insert, ChangeOp::Update, ChangeOp::Delete]
        );

        let update = &events[1];
        assert_eq!(update.get("name"), Some(&json!("anne")));
        assert_eq!(update.before.as_ref().unwrap()["name"], json!("ann"));

        // positions stay strictly increasing after the merge
        assert!(events.windows(2).all(|w| w[0].position < w[1].position));
    }

    #[test]
    fn test_unknown_code_is_kept_distinct() {
        let events = rows_to_events(&table(), vec![row(1, 1, 9, "x")]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].op, ChangeOp::Unknown(9));
    }

    #[test]
    fn test_orphan_before_image() {
        let events = rows_to_events(&table(), vec![row(1, 1, 3, "old")]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].op, ChangeOp::Update);
        assert!(events[0].before.is_some());
    }

    #[test]
    fn test_widen_legacy_cursor() {
        let legacy = Cursor::from_hex("0000002a000001f00003").unwrap();
        let widened = widen_legacy_cursor(legacy.clone());
        assert_eq!(widened.len(), CURSOR_WIDTH);
        assert_eq!(widened.to_hex(), "0000002a000001f00003ffffffffffffffffffff");

        // every change of the next transaction sorts after it
        let mut next = legacy.as_bytes().to_vec();
        next[LSN_WIDTH - 1] += 1;
        next.extend_from_slice(&[0u8; LSN_WIDTH]);
        assert!(Cursor::new(next) > widened);

        let full = Cursor::min(CURSOR_WIDTH);
        assert_eq!(widen_legacy_cursor(full.clone()), full);
    }
}
