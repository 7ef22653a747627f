//! Test harness for engine integration tests
//!
//! In-process stand-ins for every collaborator of the orchestrator:
//! - [`ScriptedConnector`] hands out sessions over scripted tables
//! - [`RecordingCheckpointStore`] keeps save history and can fail on demand
//! - [`RecordingPublisher`] records deliveries, optionally slowly or failing

#![allow(dead_code)]

use async_trait::async_trait;
use rivulet_cdc::common::MemoryCheckpointStore;
use rivulet_cdc::{
    CdcError, ChangeBatch, ChangeEvent, ChangeOp, ChangeSource, CheckpointStore, Cursor,
    Publisher, Result, SourceConnector, TableId, TableSession,
};
use serde_json::{json, Map};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

static INIT: Once = Once::new();

/// Initialize test logging (idempotent)
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("rivulet_cdc=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Cursor for a scripted position (2 bytes, big-endian)
pub fn pos(n: u16) -> Cursor {
    Cursor::new(n.to_be_bytes().to_vec())
}

pub fn table(name: &str) -> TableId {
    TableId::new("dbo", name)
}

/// Poll until `check` holds, failing the test after `limit` of (virtual) time.
pub async fn wait_until<F, Fut>(limit: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {:?}",
            limit
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Change rows of one table, appendable while the engine runs.
#[derive(Clone, Default)]
pub struct ScriptedTable {
    rows: Arc<Mutex<Vec<u16>>>,
    failing_fetches: Arc<AtomicUsize>,
    always_fail: Arc<Mutex<bool>>,
}

impl ScriptedTable {
    pub fn with_rows(rows: impl IntoIterator<Item = u16>) -> Self {
        let table = Self::default();
        table.push(rows);
        table
    }

    pub fn push(&self, rows: impl IntoIterator<Item = u16>) {
        self.rows.lock().unwrap().extend(rows);
    }

    /// Fail the next `n` fetches
    pub fn fail_next_fetches(&self, n: usize) {
        self.failing_fetches.store(n, Ordering::SeqCst);
    }

    /// Fail every fetch from now on
    pub fn break_source(&self) {
        *self.always_fail.lock().unwrap() = true;
    }
}

/// Change source over a [`ScriptedTable`].
pub struct ScriptedSource {
    table: ScriptedTable,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl ChangeSource for ScriptedSource {
    async fn columns(&mut self, _table: &TableId) -> Result<Vec<String>> {
        Ok(vec!["id".to_string(), "table".to_string()])
    }

    async fn fetch(
        &mut self,
        table: &TableId,
        _columns: &[String],
        since: &Cursor,
        limit: Option<usize>,
    ) -> Result<ChangeBatch> {
        if *self.table.always_fail.lock().unwrap() {
            return Err(CdcError::source("change table unavailable"));
        }
        let pending = self.table.failing_fetches.load(Ordering::SeqCst);
        if pending > 0 {
            self.table.failing_fetches.store(pending - 1, Ordering::SeqCst);
            return Err(CdcError::source("deadlock victim"));
        }

        let events: Vec<ChangeEvent> = self
            .table
            .rows
            .lock()
            .unwrap()
            .iter()
            .map(|n| (*n, pos(*n)))
            .filter(|(_, p)| p > since)
            .take(limit.unwrap_or(usize::MAX))
            .map(|(n, p)| {
                let mut columns = Map::new();
                columns.insert("id".to_string(), json!(n));
                columns.insert("table".to_string(), json!(table.name));
                ChangeEvent::new(table.clone(), ChangeOp::Insert, columns, p)
            })
            .collect();

        Ok(ChangeBatch::from_events(events, since.clone()))
    }

    fn min_cursor(&self) -> Cursor {
        Cursor::min(2)
    }

    async fn close(&mut self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Checkpoint store recording every successful save.
#[derive(Default)]
pub struct RecordingCheckpointStore {
    inner: MemoryCheckpointStore,
    saves: Mutex<Vec<(TableId, Cursor)>>,
    failing_saves: Mutex<HashMap<TableId, usize>>,
}

impl RecordingCheckpointStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `n` saves for `table`
    pub fn fail_next_saves(&self, table: &TableId, n: usize) {
        self.failing_saves.lock().unwrap().insert(table.clone(), n);
    }

    pub fn saves_for(&self, table: &TableId) -> Vec<Cursor> {
        self.saves
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn schema_inits(&self) -> u64 {
        self.inner.schema_inits()
    }

    /// Store a cursor without recording it as a save
    pub async fn seed(&self, table: &TableId, cursor: Cursor) {
        self.inner.seed(table, cursor).await;
    }

    pub async fn cursor(&self, table: &TableId) -> Option<Cursor> {
        self.inner.load(table).await.ok().flatten()
    }
}

#[async_trait]
impl CheckpointStore for RecordingCheckpointStore {
    async fn ensure_schema(&self) -> Result<()> {
        self.inner.ensure_schema().await
    }

    async fn load(&self, table: &TableId) -> Result<Option<Cursor>> {
        self.inner.load(table).await
    }

    async fn save(&self, table: &TableId, cursor: &Cursor) -> Result<()> {
        {
            let mut failing = self.failing_saves.lock().unwrap();
            if let Some(n) = failing.get_mut(table) {
                if *n > 0 {
                    *n -= 1;
                    return Err(CdcError::checkpoint(table.to_string(), "write conflict"));
                }
            }
        }
        self.saves
            .lock()
            .unwrap()
            .push((table.clone(), cursor.clone()));
        self.inner.save(table, cursor).await
    }
}

/// Connector over scripted tables sharing one checkpoint store.
pub struct ScriptedConnector {
    tables: HashMap<TableId, ScriptedTable>,
    unreachable: HashSet<TableId>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub opens: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    pub fn new(checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self {
            tables: HashMap::new(),
            unreachable: HashSet::new(),
            checkpoints,
            opens: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_table(mut self, table: TableId, script: ScriptedTable) -> Self {
        self.tables.insert(table, script);
        self
    }

    /// Sessions for `table` fail to open
    pub fn with_unreachable(mut self, table: TableId) -> Self {
        self.unreachable.insert(table);
        self
    }

    pub fn opened(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceConnector for ScriptedConnector {
    async fn open(&self, table: &TableId) -> Result<TableSession> {
        if self.unreachable.contains(table) {
            return Err(CdcError::connection(format!(
                "login failed for {}",
                table
            )));
        }
        let script = self
            .tables
            .get(table)
            .cloned()
            .ok_or_else(|| CdcError::config(format!("unknown table {}", table)))?;

        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(TableSession::new(
            Box::new(ScriptedSource {
                table: script,
                closes: self.closes.clone(),
            }),
            self.checkpoints.clone(),
        ))
    }
}

/// Publisher recording every delivered event.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<ChangeEvent>>,
    attempts: AtomicUsize,
    delay: Option<Duration>,
    reject: HashSet<(TableId, Cursor)>,
}

impl RecordingPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sleep this long inside every send
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Default::default()
        })
    }

    /// Reject the given events
    pub fn rejecting(reject: impl IntoIterator<Item = (TableId, Cursor)>) -> Arc<Self> {
        Arc::new(Self {
            reject: reject.into_iter().collect(),
            ..Default::default()
        })
    }

    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Positions delivered for one table, in delivery order
    pub fn positions(&self, table: &TableId) -> Vec<Cursor> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| &e.table == table)
            .map(|e| e.position.clone())
            .collect()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn send(&self, event: &ChangeEvent) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self
            .reject
            .contains(&(event.table.clone(), event.position.clone()))
        {
            return Err(CdcError::publish("rejected by sink"));
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}
