//! # Checkpointing
//!
//! Durable per-table cursors so a restarted process resumes where it left off.
//!
//! ## Guarantees
//!
//! - **Idempotent setup**: `ensure_schema` may run any number of times,
//!   concurrently, from every table monitor
//! - **Atomic upsert**: one record per table, replaced whole on `save`
//! - **Loud failures**: a failed `save` is returned to the caller, never
//!   swallowed, so the monitor keeps its old cursor
//!
//! ## Backends
//!
//! | Backend | Storage |
//! |---------|---------|
//! | [`MemoryCheckpointStore`] | in-process map (tests, embedding) |
//! | [`FileCheckpointStore`] | one JSON file per table, temp file + fsync + rename |
//! | `SqlServerCheckpointStore` | `cdc_offsets` table in the source database (feature `sqlserver`) |
//!
//! ## Usage
//!
//! ```ignore
//! use rivulet_cdc::common::{CheckpointStore, FileCheckpointStore, TableId};
//!
//! let store = FileCheckpointStore::new("/var/lib/rivulet/checkpoints");
//! store.ensure_schema().await?;
//!
//! let table = TableId::parse("dbo.users")?;
//! let cursor = store.load(&table).await?;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::common::{CdcError, Cursor, Result, TableId};

/// Persisted position of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Table key (`schema.table`)
    pub table: String,
    /// Last cursor whose events were all handed to delivery
    pub cursor: Cursor,
    /// When the record was last written
    pub updated_at: DateTime<Utc>,
}

impl CheckpointRecord {
    pub fn new(table: &TableId, cursor: Cursor) -> Self {
        Self {
            table: table.to_string(),
            cursor,
            updated_at: Utc::now(),
        }
    }
}

/// Durable storage for per-table cursors.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Create backing storage if it does not exist yet. Idempotent.
    async fn ensure_schema(&self) -> Result<()>;

    /// Last saved cursor for a table, if any.
    async fn load(&self, table: &TableId) -> Result<Option<Cursor>>;

    /// Atomically upsert the cursor for a table.
    async fn save(&self, table: &TableId, cursor: &Cursor) -> Result<()>;
}

/// Shared checkpoint store handle.
pub type SharedCheckpointStore = Arc<dyn CheckpointStore>;

/// In-memory checkpoint store (for testing or when persistence isn't needed).
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    records: RwLock<HashMap<String, CheckpointRecord>>,
    schema_inits: AtomicU64,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `ensure_schema` calls observed
    pub fn schema_inits(&self) -> u64 {
        self.schema_inits.load(Ordering::Relaxed)
    }

    /// Full record for a table
    pub async fn record(&self, table: &TableId) -> Option<CheckpointRecord> {
        self.records.read().await.get(&table.to_string()).cloned()
    }

    /// Seed a cursor, as if a previous run had saved it
    pub async fn seed(&self, table: &TableId, cursor: Cursor) {
        self.records
            .write()
            .await
            .insert(table.to_string(), CheckpointRecord::new(table, cursor));
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn ensure_schema(&self) -> Result<()> {
        self.schema_inits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn load(&self, table: &TableId) -> Result<Option<Cursor>> {
        Ok(self.record(table).await.map(|r| r.cursor))
    }

    async fn save(&self, table: &TableId, cursor: &Cursor) -> Result<()> {
        self.seed(table, cursor.clone()).await;
        Ok(())
    }
}

/// Checkpoint store keeping one JSON file per table.
///
/// Writes go to a temp file that is fsynced and then renamed over the
/// previous record, so a crash leaves either the old or the new cursor.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    base_dir: PathBuf,
    fsync: bool,
}

impl FileCheckpointStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            fsync: true,
        }
    }

    /// Skip fsync after writes (faster, not crash-safe)
    pub fn without_fsync(mut self) -> Self {
        self.fsync = false;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn file_path(&self, table: &TableId) -> Result<PathBuf> {
        let key = table.to_string();
        if table.schema.is_empty()
            || table.name.is_empty()
            || key.contains('/')
            || key.contains('\\')
            || key.contains("..")
        {
            return Err(CdcError::config(format!("Invalid checkpoint key '{}'", key)));
        }
        Ok(self.base_dir.join(format!("{}.json", key)))
    }

    async fn write_record(&self, path: &Path, record: &CheckpointRecord) -> std::io::Result<()> {
        let temp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(record)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        file.write_all(&json).await?;
        if self.fsync {
            file.sync_all().await?;
        }
        drop(file);

        fs::rename(&temp_path, path).await
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn ensure_schema(&self) -> Result<()> {
        fs::create_dir_all(&self.base_dir).await.map_err(|e| {
            CdcError::checkpoint(
                self.base_dir.display().to_string(),
                format!("cannot create checkpoint directory: {}", e),
            )
        })?;
        debug!("Checkpoint directory ready: {}", self.base_dir.display());
        Ok(())
    }

    async fn load(&self, table: &TableId) -> Result<Option<Cursor>> {
        let path = self.file_path(table)?;

        let contents = match fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CdcError::checkpoint(table.to_string(), e.to_string())),
        };

        let record: CheckpointRecord = serde_json::from_slice(&contents).map_err(|e| {
            CdcError::checkpoint(table.to_string(), format!("corrupt checkpoint file: {}", e))
        })?;

        info!(table = %table, cursor = %record.cursor, "Loaded checkpoint");
        Ok(Some(record.cursor))
    }

    async fn save(&self, table: &TableId, cursor: &Cursor) -> Result<()> {
        let path = self.file_path(table)?;
        let record = CheckpointRecord::new(table, cursor.clone());

        self.write_record(&path, &record)
            .await
            .map_err(|e| CdcError::checkpoint(table.to_string(), e.to_string()))?;

        debug!(table = %table, cursor = %cursor, "Saved checkpoint");
        Ok(())
    }
}
