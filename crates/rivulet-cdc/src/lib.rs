//! # rivulet-cdc - Poll-based Change Data Capture
//!
//! Incrementally captures row-level changes from a database's change-tracking
//! tables and forwards them, in order, to a downstream sink. Progress is
//! checkpointed per table so a restart resumes without losing changes
//! (delivery is at-least-once).
//!
//! ## Features
//!
//! - `sqlserver` - SQL Server change tables via `cdc.<schema>_<table>_CT`
//! - `full` - All sources
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                       Orchestrator                         │
//! │  opens one TableSession per table via SourceConnector      │
//! └──────┬──────────────────┬──────────────────┬───────────────┘
//!        ▼                  ▼                  ▼
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ TableMonitor │   │ TableMonitor │   │ TableMonitor │
//! │ cursor       │   │ cursor       │   │ cursor       │
//! │ backoff      │   │ backoff      │   │ backoff      │
//! └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!        │ ChangeEvent      │                  │
//!        ▼                  ▼                  ▼
//! ┌────────────────────────────────────────────────────────────┐
//! │              delivery channel (FIFO fan-in)                │
//! └──────────────────────────┬─────────────────────────────────┘
//!                            ▼
//!                    Publisher::send
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # #[cfg(feature = "sqlserver")]
//! # async fn example() -> anyhow::Result<()> {
//! use rivulet_cdc::sqlserver::{SqlServerConfig, SqlServerConnector};
//! use rivulet_cdc::{Orchestrator, TableId, TableMonitorConfig};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let config = SqlServerConfig::from_ado_string(
//!     "Server=tcp:localhost,1433;Database=app;User Id=sa;Password=secret",
//! )?;
//! let connector = Arc::new(SqlServerConnector::new(config));
//! # let publisher: Arc<dyn rivulet_cdc::Publisher> = todo!();
//!
//! let tables = vec![TableMonitorConfig::new(TableId::parse("dbo.users")?)];
//! let report = Orchestrator::new(connector)
//!     .run(tables, publisher, CancellationToken::new())
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Public API Organization
//!
//! ### Tier 1: Core Types (crate root)
//! Events, cursors, the engine and the contracts adapters implement.
//!
//! ### Tier 2: Engine internals (`monitor`, `delivery`, `orchestrator`)
//! Monitor handles and status, delivery channel, run reports.
//!
//! ### Tier 3: Building blocks (`common` module)
//! Backoff controller, checkpoint backends, identifier validation.

pub mod common;
pub mod delivery;
pub mod monitor;
pub mod orchestrator;

// =============================================================================
// TIER 1: Core Types
// =============================================================================

pub use common::{
    CdcError, ChangeBatch, ChangeEvent, ChangeOp, ChangeSource, CheckpointStore, Cursor,
    ErrorCategory, EventEmitter, Publisher, Result, SourceConnector, TableId, TableSession,
};
pub use monitor::{MonitorHandle, MonitorState, MonitorStatus, TableMonitor, TableMonitorConfig};
pub use orchestrator::{Orchestrator, OrchestratorConfig, RunReport};

// SQL Server change tables - feature-gated
#[cfg(feature = "sqlserver")]
pub mod sqlserver;
