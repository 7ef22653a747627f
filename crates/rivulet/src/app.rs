//! Wiring from configuration to a running engine

use anyhow::Context;
use rivulet_cdc::common::FileCheckpointStore;
use rivulet_cdc::sqlserver::{SqlServerConfig, SqlServerConnector};
use rivulet_cdc::{Cursor, Orchestrator, RunReport, SourceConnector, TableId};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{CheckpointConfig, RivuletConfig, SourceConfig};
use crate::publisher::build_publisher;

/// Build the connector for the configured source and checkpoint store
pub fn build_connector(config: &RivuletConfig) -> anyhow::Result<Arc<dyn SourceConnector>> {
    match &config.source {
        SourceConfig::Sqlserver { connection_string } => {
            let sql = SqlServerConfig::from_ado_string(connection_string.as_str())
                .context("Invalid source.connection_string")?;
            let mut connector = SqlServerConnector::new(sql);

            if let CheckpointConfig::File { dir } = &config.checkpoint {
                info!(dir = %dir.display(), "Using file checkpoints");
                connector = connector.with_checkpoint_store(Arc::new(FileCheckpointStore::new(dir)));
            }
            Ok(Arc::new(connector))
        }
    }
}

/// Run the configured pipeline until `cancel` fires
pub async fn run(config: &RivuletConfig, cancel: CancellationToken) -> anyhow::Result<RunReport> {
    let connector = build_connector(config)?;
    run_with_connector(connector, config, cancel).await
}

/// Run the configured tables and publisher over `connector`
pub async fn run_with_connector(
    connector: Arc<dyn SourceConnector>,
    config: &RivuletConfig,
    cancel: CancellationToken,
) -> anyhow::Result<RunReport> {
    let tables = config
        .monitor_configs()
        .context("Invalid table configuration")?;
    let publisher = build_publisher(&config.publisher);

    info!(
        source = config.source.kind(),
        publisher = publisher.name(),
        tables = tables.len(),
        "Starting rivulet"
    );

    let orchestrator =
        Orchestrator::with_config(connector, config.delivery.to_orchestrator_config());
    let report = orchestrator
        .run(tables, publisher, cancel)
        .await
        .context("Change capture could not start")?;

    if !report.drained() {
        warn!(
            undelivered = report.undelivered,
            "Stopped before every queued change was published"
        );
    }
    Ok(report)
}

/// What `rivulet tables` reports for one table
#[derive(Debug, Clone, Serialize)]
pub struct TableInfo {
    pub table: TableId,
    pub columns: Vec<String>,
    pub cursor: Option<Cursor>,
    pub error: Option<String>,
}

/// Open every configured table once and report its columns and stored cursor
pub async fn inspect_tables(
    connector: Arc<dyn SourceConnector>,
    config: &RivuletConfig,
) -> anyhow::Result<Vec<TableInfo>> {
    let mut infos = Vec::with_capacity(config.tables.len());

    for table_config in &config.tables {
        let table = table_config.table_id()?;
        let mut info = TableInfo {
            table: table.clone(),
            columns: Vec::new(),
            cursor: None,
            error: None,
        };

        match connector.open(&table).await {
            Ok(mut session) => {
                let inspected = async {
                    session.checkpoints.ensure_schema().await?;
                    let cursor = session.checkpoints.load(&table).await?;
                    let columns = session.source.columns(&table).await?;
                    Ok::<_, rivulet_cdc::CdcError>((columns, cursor))
                }
                .await;

                match inspected {
                    Ok((columns, cursor)) => {
                        info.columns = columns;
                        info.cursor = cursor.map(|c| session.source.normalize_cursor(c));
                    }
                    Err(e) => info.error = Some(e.to_string()),
                }
                if let Err(e) = session.source.close().await {
                    warn!(table = %table, error = %e, "Failed to close session");
                }
            }
            Err(e) => info.error = Some(e.to_string()),
        }

        infos.push(info);
    }

    Ok(infos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rivulet_cdc::common::MemoryCheckpointStore;
    use rivulet_cdc::{
        CdcError, ChangeBatch, ChangeEvent, ChangeOp, ChangeSource, CheckpointStore, Result,
        TableSession,
    };
    use serde_json::{json, Map};
    use std::time::Duration;

    struct FixedSource {
        rows: u8,
    }

    #[async_trait]
    impl ChangeSource for FixedSource {
        async fn columns(&mut self, _table: &TableId) -> Result<Vec<String>> {
            Ok(vec!["id".to_string()])
        }

        async fn fetch(
            &mut self,
            table: &TableId,
            _columns: &[String],
            since: &Cursor,
            _limit: Option<usize>,
        ) -> Result<ChangeBatch> {
            let events = (1..=self.rows)
                .map(|n| Cursor::new(vec![n]))
                .filter(|c| c > since)
                .map(|c| {
                    let mut columns = Map::new();
                    columns.insert("id".into(), json!(c.as_bytes()[0]));
                    ChangeEvent::new(table.clone(), ChangeOp::Insert, columns, c)
                })
                .collect();
            Ok(ChangeBatch::from_events(events, since.clone()))
        }

        fn min_cursor(&self) -> Cursor {
            Cursor::min(1)
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct FixedConnector {
        store: Arc<MemoryCheckpointStore>,
    }

    #[async_trait]
    impl SourceConnector for FixedConnector {
        async fn open(&self, table: &TableId) -> Result<TableSession> {
            if table.name == "missing" {
                return Err(CdcError::config("table is not enabled for CDC"));
            }
            Ok(TableSession::new(
                Box::new(FixedSource { rows: 3 }),
                self.store.clone(),
            ))
        }
    }

    fn config(tables: &[&str]) -> RivuletConfig {
        let mut yaml = String::from(
            r#"
source:
  type: sqlserver
  connection_string: "Server=tcp:localhost,1433;User Id=sa;Password=x"
publisher:
  type: log
delivery:
  drain_timeout: 5s
tables:
"#,
        );
        for table in tables {
            yaml.push_str(&format!("  - name: {}\n    poll_interval: 100ms\n", table));
        }
        RivuletConfig::from_yaml(&yaml).unwrap()
    }

    #[test]
    fn test_build_connector_for_both_checkpoint_kinds() {
        let mut config = config(&["users"]);
        assert!(build_connector(&config).is_ok());

        let dir = tempfile::tempdir().unwrap();
        config.checkpoint = CheckpointConfig::File {
            dir: dir.path().to_path_buf(),
        };
        assert!(build_connector(&config).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_delivers_and_checkpoints() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let connector = Arc::new(FixedConnector {
            store: store.clone(),
        });
        let config = config(&["users", "orders"]);
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            stopper.cancel();
        });

        let report = run_with_connector(connector, &config, cancel).await.unwrap();
        assert_eq!(report.tables_started.len(), 2);
        assert_eq!(report.events_delivered, 6);
        assert!(report.drained());
        assert_eq!(
            store.load(&TableId::new("dbo", "users")).await.unwrap(),
            Some(Cursor::new(vec![3]))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_fails_when_no_table_opens() {
        let connector = Arc::new(FixedConnector {
            store: Arc::new(MemoryCheckpointStore::new()),
        });
        let err = run_with_connector(connector, &config(&["missing"]), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("could not start"));
    }

    #[tokio::test]
    async fn test_inspect_tables() {
        let store = Arc::new(MemoryCheckpointStore::new());
        store
            .seed(&TableId::new("dbo", "users"), Cursor::new(vec![2]))
            .await;
        let connector = Arc::new(FixedConnector {
            store: store.clone(),
        });

        let infos = inspect_tables(connector, &config(&["users", "missing"]))
            .await
            .unwrap();

        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].columns, vec!["id".to_string()]);
        assert_eq!(infos[0].cursor, Some(Cursor::new(vec![2])));
        assert!(infos[0].error.is_none());
        assert!(infos[1].error.as_deref().unwrap().contains("not enabled"));
        assert_eq!(store.schema_inits(), 1);
    }
}
