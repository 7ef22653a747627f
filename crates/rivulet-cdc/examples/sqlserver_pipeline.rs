//! SQL Server CDC Example
//!
//! Streams changes of CDC-enabled tables to stdout until Ctrl+C.
//!
//! Prerequisites:
//! 1. `EXEC sys.sp_cdc_enable_db;` on the database
//! 2. `EXEC sys.sp_cdc_enable_table @source_schema = N'dbo', @source_name = N'users', @role_name = NULL;`
//! 3. SQL Server Agent running
//!
//! Run with:
//! ```
//! SQLSERVER_URL="Server=tcp:localhost,1433;Database=testdb;User Id=sa;Password=...;TrustServerCertificate=true" \
//!     cargo run -p rivulet-cdc --example sqlserver_pipeline --features sqlserver -- dbo.users dbo.orders
//! ```

use async_trait::async_trait;
use rivulet_cdc::sqlserver::{SqlServerConfig, SqlServerConnector};
use rivulet_cdc::{ChangeEvent, Orchestrator, Publisher, Result, TableId, TableMonitorConfig};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

struct PrettyPublisher;

#[async_trait]
impl Publisher for PrettyPublisher {
    async fn send(&self, event: &ChangeEvent) -> Result<()> {
        println!("{}", event.to_json_pretty()?);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let conn_str = std::env::var("SQLSERVER_URL").unwrap_or_else(|_| {
        "Server=tcp:localhost,1433;Database=testdb;User Id=sa;Password=yourStrong(!)Password;TrustServerCertificate=true"
            .to_string()
    });
    let config = SqlServerConfig::from_ado_string(conn_str)?;
    println!("Connecting to {}", config.redacted_connection_string());

    let tables: Vec<TableMonitorConfig> = std::env::args()
        .skip(1)
        .map(|arg| arg.parse::<TableId>().map(TableMonitorConfig::new))
        .collect::<Result<_>>()?;
    let tables = if tables.is_empty() {
        vec![TableMonitorConfig::new(TableId::new("dbo", "users"))]
    } else {
        tables
    };

    let orchestrator = Orchestrator::new(Arc::new(SqlServerConnector::new(config)));

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nShutting down...");
        }
        stopper.cancel();
    });

    let report = orchestrator
        .run(tables, Arc::new(PrettyPublisher), cancel)
        .await?;

    println!(
        "Delivered {} changes ({} undelivered, {} tables skipped)",
        report.events_delivered,
        report.undelivered,
        report.tables_skipped.len()
    );
    Ok(())
}
