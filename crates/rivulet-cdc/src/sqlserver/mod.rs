//! # SQL Server Change Source
//!
//! Reads the change tables SQL Server's CDC capture job maintains, one
//! session per monitored table.
//!
//! ```text
//! ┌──────────┐    ┌──────────────┐    ┌─────────────────────┐
//! │ DML Ops  │───▶│ Transaction  │───▶│ CDC Capture Job     │
//! │ (I/U/D)  │    │ Log          │    │ (SQL Agent)         │
//! └──────────┘    └──────────────┘    └──────────┬──────────┘
//!                                                │
//!                                                ▼
//!                                     ┌─────────────────────┐
//!                                     │ cdc.<schema>_<table>│
//!                                     │ _CT change tables   │
//!                                     └──────────┬──────────┘
//!                                                │ poll
//!                                                ▼
//!                                     ┌─────────────────────┐
//!                                     │ SqlServerChangeSource│
//!                                     └─────────────────────┘
//! ```
//!
//! ## Cursor
//!
//! A cursor is `__$start_lsn ‖ __$seqval` (20 bytes). Byte order equals
//! change order, including within one transaction, so a fetch limit never
//! skips the tail of a large transaction:
//!
//! ```text
//! WHERE __$start_lsn > @lsn
//!    OR (__$start_lsn = @lsn AND __$seqval > @seqval)
//! ORDER BY __$start_lsn, __$seqval
//! ```
//!
//! Cursors saved as a bare 10-byte start LSN are widened with an all-`0xFF`
//! sequence value on load.
//!
//! ## Operation codes
//!
//! | `__$operation` | Meaning | Event |
//! |----------------|---------|-------|
//! | 1 | delete | `Delete` |
//! | 2 | insert | `Insert` |
//! | 3 | update, before image | merged into the following 4 as `before` |
//! | 4 | update, after image | `Update` |
//! | other | - | `Unknown(code)` |
//!
//! ## Offsets
//!
//! Unless another store is supplied, cursors live in `dbo.cdc_offsets`:
//!
//! | Column | Type |
//! |--------|------|
//! | `table_name` | `NVARCHAR(255)` primary key (`schema.table`) |
//! | `last_lsn` | `VARBINARY(20)` |
//! | `updated_at` | `DATETIME2` |
//!
//! ## SQL Server Requirements
//!
//! 1. **Enable CDC on database**: `EXEC sys.sp_cdc_enable_db;`
//! 2. **Enable CDC on tables**:
//!    ```sql
//!    EXEC sys.sp_cdc_enable_table
//!        @source_schema = N'dbo',
//!        @source_name = N'users',
//!        @role_name = NULL;
//!    ```
//! 3. **SQL Server Agent must be running**

mod client;
mod config;
mod error;
mod source;

pub use client::{capture_table_name, ChangeRow, SqlServerClient, CURSOR_WIDTH, LSN_WIDTH, OFFSETS_TABLE};
pub use config::{SqlServerConfig, SqlServerConfigBuilder};
pub use error::SqlServerError;
pub use source::{
    op_from_code, rows_to_events, widen_legacy_cursor, SqlServerChangeSource,
    SqlServerCheckpointStore, SqlServerConnector,
};
