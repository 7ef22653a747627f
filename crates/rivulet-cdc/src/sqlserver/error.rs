//! SQL Server adapter error types

use crate::common::CdcError;
use thiserror::Error;

/// SQL Server-specific errors
#[derive(Error, Debug)]
pub enum SqlServerError {
    /// Connection string could not be parsed
    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),

    /// TCP connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Connect or login did not finish in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// TDS protocol error (login, TLS, server error during handshake)
    #[error("TDS protocol error: {0}")]
    Tds(String),

    /// Change tracking not enabled on table
    #[error("CDC not enabled on table '{schema}.{table}'. Run: EXEC sys.sp_cdc_enable_table @source_schema=N'{schema}', @source_name=N'{table}', @role_name=NULL")]
    TableNotEnabled { schema: String, table: String },

    /// Table has no visible columns
    #[error("No columns found for '{schema}.{table}'")]
    NoColumns { schema: String, table: String },

    /// Change table query failed
    #[error("CDC table query failed: {0}")]
    QueryFailed(String),

    /// Malformed LSN or sequence value
    #[error("Invalid LSN format: {0}")]
    InvalidLsn(String),

    /// Session used after close
    #[error("Session already closed")]
    SessionClosed,
}

impl From<SqlServerError> for CdcError {
    fn from(err: SqlServerError) -> Self {
        match err {
            SqlServerError::InvalidConnectionString(msg) => CdcError::config(msg),
            SqlServerError::Connection(msg) | SqlServerError::Tds(msg) => {
                CdcError::connection(msg)
            }
            SqlServerError::Timeout(msg) => CdcError::timeout(msg),
            SqlServerError::TableNotEnabled { .. } => CdcError::config(err.to_string()),
            SqlServerError::NoColumns { .. } => CdcError::schema(err.to_string()),
            SqlServerError::QueryFailed(msg) => CdcError::source(msg),
            SqlServerError::InvalidLsn(_) | SqlServerError::SessionClosed => {
                CdcError::invalid_state(err.to_string())
            }
        }
    }
}
