//! # Common CDC Types and Traits
//!
//! Source-agnostic building blocks of the monitoring engine:
//!
//! - [`Cursor`] - Opaque, ordered position in a table's change stream
//! - [`ChangeEvent`] / [`ChangeBatch`] - Row-level changes and fetch results
//! - [`BackoffController`] - Adaptive poll interval
//! - [`CheckpointStore`] - Durable per-table cursors
//! - [`ChangeSource`] / [`SourceConnector`] - What a database adapter provides
//! - [`Publisher`] - Downstream sink contract
//! - [`Validator`] - Identifier checks before SQL is built
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Common Module                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  SourceConnector ←─── opens one TableSession per table      │
//! │  ChangeSource    ←─── columns / fetch / close               │
//! │  CheckpointStore ←─── Memory, File, SQL Server backends     │
//! │  Cursor          ←─── byte-ordered resume position          │
//! │  Backoff         ←─── floor..ceiling doubling interval      │
//! │  Publisher       ←─── console, log, custom sinks            │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod backoff;
mod checkpoint;
mod cursor;
mod error;
mod event;
mod traits;
mod validation;

pub use backoff::BackoffController;
pub use checkpoint::{
    CheckpointRecord, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore,
    SharedCheckpointStore,
};
pub use cursor::Cursor;
pub use error::{CdcError, ErrorCategory, Result};
pub use event::{ChangeBatch, ChangeEvent, ChangeOp, TableId, DEFAULT_SCHEMA};
pub use traits::{ChangeSource, EventEmitter, Publisher, SourceConnector, TableSession};
pub use validation::Validator;
