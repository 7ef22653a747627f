//! SQL Server TDS client for change-table reads and offset storage
//!
//! Uses Tiberius for TDS communication with SQL Server.

use serde_json::{Map, Value};
use tiberius::{Client, Row};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, trace};

use super::config::SqlServerConfig;
use super::error::SqlServerError;
use crate::common::{Cursor, Result, TableId, Validator};

/// Width of `__$start_lsn` and of `__$seqval`
pub const LSN_WIDTH: usize = 10;

/// Width of a cursor: `__$start_lsn ‖ __$seqval`
pub const CURSOR_WIDTH: usize = LSN_WIDTH * 2;

/// Table holding one persisted cursor per monitored table
pub const OFFSETS_TABLE: &str = "cdc_offsets";

/// Data columns of a change table, skipping the `__$` metadata columns
const CAPTURED_COLUMNS_QUERY: &str = "SELECT c.name FROM sys.columns c \
     JOIN sys.tables t ON c.object_id = t.object_id \
     JOIN sys.schemas s ON t.schema_id = s.schema_id \
     WHERE s.name = 'cdc' AND t.name = @P1 AND LEFT(c.name, 3) <> '__$' \
     ORDER BY c.column_id";

/// SQL Server error number for "object already exists"
const OBJECT_EXISTS: u32 = 2714;

/// One row of a change table.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRow {
    /// `__$start_lsn ‖ __$seqval`
    pub position: Cursor,
    /// `__$operation` (1 delete, 2 insert, 3 update before, 4 update after)
    pub operation: i32,
    /// Column values in requested order
    pub data: Map<String, Value>,
}

/// SQL Server client for change capture
pub struct SqlServerClient {
    client: Client<Compat<TcpStream>>,
}

impl SqlServerClient {
    /// Connect and log in, bounded by the configured connect timeout
    pub async fn connect(config: &SqlServerConfig) -> Result<Self> {
        let tiberius_config = config.tiberius_config()?;
        let addr = tiberius_config.get_addr();
        debug!("Connecting to SQL Server {}", addr);

        let connect = async {
            let tcp = TcpStream::connect(&addr)
                .await
                .map_err(|e| SqlServerError::Connection(format!("{}: {}", addr, e)))?;
            tcp.set_nodelay(true)
                .map_err(|e| SqlServerError::Connection(e.to_string()))?;

            Client::connect(tiberius_config, tcp.compat_write())
                .await
                .map_err(|e| SqlServerError::Tds(e.to_string()))
        };

        let client = tokio::time::timeout(config.connect_timeout, connect)
            .await
            .map_err(|_| {
                SqlServerError::Timeout(format!(
                    "connecting to {} after {:?}",
                    addr, config.connect_timeout
                ))
            })??;

        info!("Connected to SQL Server {}", addr);
        Ok(Self { client })
    }

    /// Fail unless the table has a change table (`cdc.<schema>_<table>_CT`)
    pub async fn verify_capture_enabled(&mut self, table: &TableId) -> Result<()> {
        Validator::validate_table(table)?;
        let change_table = capture_table_name(table);

        let rows = self
            .client
            .query(
                "SELECT 1 FROM sys.tables t \
                 JOIN sys.schemas s ON t.schema_id = s.schema_id \
                 WHERE s.name = 'cdc' AND t.name = @P1",
                &[&change_table.as_str()],
            )
            .await
            .map_err(|e| SqlServerError::QueryFailed(e.to_string()))?
            .into_first_result()
            .await
            .map_err(|e| SqlServerError::QueryFailed(e.to_string()))?;

        if rows.is_empty() {
            return Err(SqlServerError::TableNotEnabled {
                schema: table.schema.clone(),
                table: table.name.clone(),
            }
            .into());
        }
        Ok(())
    }

    /// Columns tracked by a table's capture instance, by column order.
    ///
    /// Read from the change table itself: a column added to the source table
    /// after CDC was enabled is not captured and must not be selected.
    pub async fn table_columns(&mut self, table: &TableId) -> Result<Vec<String>> {
        Validator::validate_table(table)?;
        let change_table = capture_table_name(table);

        let rows = self
            .client
            .query(CAPTURED_COLUMNS_QUERY, &[&change_table.as_str()])
            .await
            .map_err(|e| SqlServerError::QueryFailed(e.to_string()))?
            .into_first_result()
            .await
            .map_err(|e| SqlServerError::QueryFailed(e.to_string()))?;

        let columns: Vec<String> = rows
            .iter()
            .filter_map(|row| row.get::<&str, _>(0).map(|s| s.to_string()))
            .collect();

        if columns.is_empty() {
            return Err(SqlServerError::NoColumns {
                schema: table.schema.clone(),
                table: table.name.clone(),
            }
            .into());
        }
        Ok(columns)
    }

    /// Change rows strictly after `since`, ordered by position then operation.
    ///
    /// With a limit, rows tied with the last one on position are included
    /// as well, so an update's before and after images are never split.
    pub async fn fetch_changes(
        &mut self,
        table: &TableId,
        columns: &[String],
        since: &Cursor,
        limit: Option<usize>,
    ) -> Result<Vec<ChangeRow>> {
        let query = build_changes_query(table, columns, limit)?;
        let (lsn, seqval) = split_cursor(since)?;

        let stream = match limit {
            Some(limit) => {
                let top = i64::try_from(limit).unwrap_or(i64::MAX);
                self.client.query(&query, &[&lsn, &seqval, &top]).await
            }
            None => self.client.query(&query, &[&lsn, &seqval]).await,
        }
        .map_err(|e| SqlServerError::QueryFailed(e.to_string()))?;

        let rows = stream
            .into_first_result()
            .await
            .map_err(|e| SqlServerError::QueryFailed(e.to_string()))?;

        let mut changes = Vec::with_capacity(rows.len());
        for row in rows {
            let start_lsn = binary_column(&row, 0, "__$start_lsn")?;
            let seqval = binary_column(&row, 1, "__$seqval")?;
            let operation: i32 = row.get(2).unwrap_or(0);

            let mut position = Vec::with_capacity(CURSOR_WIDTH);
            position.extend_from_slice(start_lsn);
            position.extend_from_slice(seqval);

            changes.push(ChangeRow {
                position: Cursor::new(position),
                operation,
                data: parse_row_data(&row, columns, 3),
            });
        }

        // TOP .. WITH TIES only orders by position; order the pair halves here
        changes.sort_by(|a, b| {
            a.position
                .cmp(&b.position)
                .then(a.operation.cmp(&b.operation))
        });

        trace!("Got {} change rows from {}", changes.len(), table);
        Ok(changes)
    }

    /// Create the offsets table unless it already exists
    pub async fn ensure_offsets_table(&mut self) -> Result<()> {
        let ddl = format!(
            "IF NOT EXISTS (SELECT 1 FROM sys.tables t \
                JOIN sys.schemas s ON t.schema_id = s.schema_id \
                WHERE s.name = 'dbo' AND t.name = '{table}') \
             BEGIN \
                CREATE TABLE [dbo].[{table}] ( \
                    table_name NVARCHAR(255) NOT NULL PRIMARY KEY, \
                    last_lsn VARBINARY(20) NOT NULL, \
                    updated_at DATETIME2 NOT NULL DEFAULT SYSUTCDATETIME() \
                ) \
             END",
            table = OFFSETS_TABLE
        );

        match self.client.execute(ddl, &[]).await {
            Ok(_) => Ok(()),
            // another session created it between the check and the CREATE
            Err(tiberius::error::Error::Server(ref e)) if e.code() == OBJECT_EXISTS => Ok(()),
            Err(e) => Err(SqlServerError::QueryFailed(e.to_string()).into()),
        }
    }

    /// Persisted cursor bytes for a table key
    pub async fn load_offset(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        let query = format!(
            "SELECT last_lsn FROM [dbo].[{}] WHERE table_name = @P1",
            OFFSETS_TABLE
        );
        let rows = self
            .client
            .query(query, &[&key])
            .await
            .map_err(|e| SqlServerError::QueryFailed(e.to_string()))?
            .into_first_result()
            .await
            .map_err(|e| SqlServerError::QueryFailed(e.to_string()))?;

        Ok(rows
            .first()
            .and_then(|row| row.get::<&[u8], _>(0))
            .map(|b| b.to_vec()))
    }

    /// Upsert the cursor bytes for a table key
    pub async fn save_offset(&mut self, key: &str, cursor: &[u8]) -> Result<()> {
        let query = format!(
            "MERGE [dbo].[{table}] WITH (HOLDLOCK) AS target \
             USING (SELECT @P1 AS table_name, @P2 AS last_lsn) AS source \
             ON target.table_name = source.table_name \
             WHEN MATCHED THEN \
                UPDATE SET last_lsn = source.last_lsn, updated_at = SYSUTCDATETIME() \
             WHEN NOT MATCHED THEN \
                INSERT (table_name, last_lsn, updated_at) \
                VALUES (source.table_name, source.last_lsn, SYSUTCDATETIME());",
            table = OFFSETS_TABLE
        );

        self.client
            .execute(query, &[&key, &cursor])
            .await
            .map_err(|e| SqlServerError::QueryFailed(e.to_string()))?;
        Ok(())
    }

    /// Execute a statement (used by tests and tooling)
    pub async fn execute(&mut self, sql: &str) -> Result<u64> {
        let result = self
            .client
            .execute(sql, &[])
            .await
            .map_err(|e| SqlServerError::QueryFailed(e.to_string()))?;
        Ok(result.total())
    }

    /// Log out and close the connection
    pub async fn close(self) -> Result<()> {
        self.client
            .close()
            .await
            .map_err(|e| SqlServerError::Tds(e.to_string()))?;
        Ok(())
    }
}

/// Name of the change table inside the `cdc` schema
pub fn capture_table_name(table: &TableId) -> String {
    format!("{}_{}_CT", table.schema, table.name)
}

fn quote_identifier(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

fn build_changes_query(table: &TableId, columns: &[String], limit: Option<usize>) -> Result<String> {
    Validator::validate_table(table)?;

    let mut select = vec![
        "__$start_lsn".to_string(),
        "__$seqval".to_string(),
        "__$operation".to_string(),
    ];
    select.extend(columns.iter().map(|c| quote_identifier(c)));

    let top = if limit.is_some() {
        "TOP (@P3) WITH TIES "
    } else {
        ""
    };

    Ok(format!(
        "SELECT {top}{columns} FROM [cdc].{change_table} \
         WHERE __$start_lsn > @P1 OR (__$start_lsn = @P1 AND __$seqval > @P2) \
         ORDER BY __$start_lsn, __$seqval",
        top = top,
        columns = select.join(", "),
        change_table = quote_identifier(&capture_table_name(table)),
    ))
}

/// Split a cursor into `(__$start_lsn, __$seqval)`
pub fn split_cursor(cursor: &Cursor) -> Result<(&[u8], &[u8])> {
    let bytes = cursor.as_bytes();
    if bytes.len() != CURSOR_WIDTH {
        return Err(SqlServerError::InvalidLsn(format!(
            "Expected {} bytes, got {}",
            CURSOR_WIDTH,
            bytes.len()
        ))
        .into());
    }
    Ok(bytes.split_at(LSN_WIDTH))
}

fn binary_column<'a>(row: &'a Row, index: usize, name: &str) -> Result<&'a [u8]> {
    let bytes: &[u8] = row
        .get(index)
        .ok_or_else(|| SqlServerError::InvalidLsn(format!("Missing {} column", name)))?;

    if bytes.len() != LSN_WIDTH {
        return Err(SqlServerError::InvalidLsn(format!(
            "Expected {} bytes in {}, got {}",
            LSN_WIDTH,
            name,
            bytes.len()
        ))
        .into());
    }
    Ok(bytes)
}

/// Parse row data into a JSON map
fn parse_row_data(row: &Row, columns: &[String], start_index: usize) -> Map<String, Value> {
    let mut data = Map::new();

    for (i, col_name) in columns.iter().enumerate() {
        let col_idx = start_index + i;
        if col_idx >= row.len() {
            break;
        }

        // Try different types in order of likelihood
        let value = if let Some(v) = row.try_get::<&str, _>(col_idx).ok().flatten() {
            Value::String(v.to_string())
        } else if let Some(v) = row.try_get::<i64, _>(col_idx).ok().flatten() {
            Value::Number(v.into())
        } else if let Some(v) = row.try_get::<i32, _>(col_idx).ok().flatten() {
            Value::Number(v.into())
        } else if let Some(v) = row.try_get::<i16, _>(col_idx).ok().flatten() {
            Value::Number(v.into())
        } else if let Some(v) = row.try_get::<u8, _>(col_idx).ok().flatten() {
            Value::Number(v.into())
        } else if let Some(v) = row.try_get::<f64, _>(col_idx).ok().flatten() {
            float_value(v)
        } else if let Some(v) = row.try_get::<f32, _>(col_idx).ok().flatten() {
            float_value(f64::from(v))
        } else if let Some(v) = row
            .try_get::<tiberius::numeric::Numeric, _>(col_idx)
            .ok()
            .flatten()
        {
            // decimal/money keep their exact text form
            Value::String(v.to_string())
        } else if let Some(v) = row.try_get::<bool, _>(col_idx).ok().flatten() {
            Value::Bool(v)
        } else if let Some(v) = row.try_get::<&[u8], _>(col_idx).ok().flatten() {
            Value::String(base64_encode(v))
        } else if let Some(v) = row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(col_idx)
            .ok()
            .flatten()
        {
            Value::String(v.to_rfc3339())
        } else if let Some(v) = row
            .try_get::<chrono::NaiveDateTime, _>(col_idx)
            .ok()
            .flatten()
        {
            Value::String(v.format("%Y-%m-%d %H:%M:%S%.f").to_string())
        } else if let Some(v) = row.try_get::<chrono::NaiveDate, _>(col_idx).ok().flatten() {
            Value::String(v.format("%Y-%m-%d").to_string())
        } else if let Some(v) = row.try_get::<chrono::NaiveTime, _>(col_idx).ok().flatten() {
            Value::String(v.format("%H:%M:%S%.f").to_string())
        } else if let Some(v) = row.try_get::<tiberius::Uuid, _>(col_idx).ok().flatten() {
            Value::String(v.to_string())
        } else {
            // Null or unsupported type
            Value::Null
        };

        data.insert(col_name.clone(), value);
    }

    data
}

fn float_value(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Base64 encode binary data
fn base64_encode(data: &[u8]) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine};
    STANDARD.encode(data)
}
