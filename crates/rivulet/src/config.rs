//! Configuration for the rivulet host
//!
//! Loaded from YAML (`rivulet.yaml` by default). `${VAR}` and
//! `${VAR:-default}` are expanded from the environment before parsing.
//!
//! ```yaml
//! source:
//!   type: sqlserver
//!   connection_string: "Server=tcp:${DB_HOST:-localhost},1433;Database=app;User Id=sa;Password=${DB_PASSWORD}"
//! checkpoint:
//!   type: file
//!   dir: ./checkpoints
//! publisher:
//!   type: console
//!   format: json
//! delivery:
//!   channel_capacity: 10000
//! tables:
//!   - name: dbo.users
//!     poll_interval: 5s
//!     max_poll_interval: 1m
//!     max_batch_size: 1000
//! ```

use rivulet_cdc::common::Validator;
use rivulet_cdc::monitor::{DEFAULT_MAX_POLL_INTERVAL, DEFAULT_POLL_INTERVAL};
use rivulet_cdc::sqlserver::SqlServerConfig;
use rivulet_cdc::{OrchestratorConfig, TableId, TableMonitorConfig};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// `<n>ms`, `<n>s`, `<n>m`, `<n>h` or `HH:MM:SS`
static INTERVAL_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^(?:(\d+)\s*(ms|s|m|h)|(\d+):([0-5]\d):([0-5]\d))$")
        .expect("interval regex pattern is invalid - this is a bug")
});

/// Root configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RivuletConfig {
    /// Database the changes are read from
    pub source: SourceConfig,

    /// Where table cursors are kept
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Where change events go
    #[serde(default)]
    pub publisher: PublisherConfig,

    /// Fan-in channel and shutdown behaviour
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Monitored tables
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

/// Change source
#[derive(Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    /// SQL Server with CDC enabled on the monitored tables
    Sqlserver {
        /// ADO.NET style connection string
        connection_string: String,
    },
}

impl SourceConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceConfig::Sqlserver { .. } => "sqlserver",
        }
    }

    /// Connection string with the password masked
    pub fn redacted(&self) -> String {
        match self {
            SourceConfig::Sqlserver { connection_string } => {
                match SqlServerConfig::from_ado_string(connection_string.as_str()) {
                    Ok(config) => config.redacted_connection_string(),
                    Err(_) => "<invalid>".to_string(),
                }
            }
        }
    }
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceConfig::Sqlserver { .. } => f
                .debug_struct("Sqlserver")
                .field("connection_string", &self.redacted())
                .finish(),
        }
    }
}

/// Checkpoint store selection
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CheckpointConfig {
    /// `dbo.cdc_offsets` in the source database
    #[default]
    Source,
    /// One JSON file per table under `dir`
    File { dir: PathBuf },
}

/// Publisher kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublisherKind {
    /// Print to stdout
    #[default]
    Console,
    /// Emit through `tracing`
    Log,
}

/// Output format for published events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Header line plus indented JSON
    #[default]
    Pretty,
    /// One compact JSON object per line
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PublisherConfig {
    #[serde(rename = "type", default)]
    pub kind: PublisherKind,

    #[serde(default)]
    pub format: OutputFormat,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DeliveryConfig {
    /// Bounded fan-in capacity; unbounded when absent
    #[serde(default)]
    pub channel_capacity: Option<usize>,

    /// Optional bound on the shutdown drain; absent or `null` waits for
    /// every queued event. Events still queued when it expires are lost.
    #[serde(default, deserialize_with = "deserialize_optional_interval")]
    pub drain_timeout: Option<Duration>,
}

impl DeliveryConfig {
    pub fn to_orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            channel_capacity: self.channel_capacity,
            drain_timeout: self.drain_timeout,
        }
    }
}

/// One monitored table
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TableConfig {
    /// `schema.table`, or a bare table name in `dbo`
    pub name: String,

    #[serde(default, deserialize_with = "deserialize_optional_interval")]
    pub poll_interval: Option<Duration>,

    #[serde(default, deserialize_with = "deserialize_optional_interval")]
    pub max_poll_interval: Option<Duration>,

    #[serde(default)]
    pub max_batch_size: Option<usize>,
}

impl TableConfig {
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL)
    }

    pub fn max_poll_interval(&self) -> Duration {
        self.max_poll_interval.unwrap_or(DEFAULT_MAX_POLL_INTERVAL)
    }

    pub fn table_id(&self) -> rivulet_cdc::Result<TableId> {
        let table = TableId::parse(&self.name)?;
        Validator::validate_table(&table)?;
        Ok(table)
    }

    pub fn to_monitor_config(&self) -> rivulet_cdc::Result<TableMonitorConfig> {
        let mut config = TableMonitorConfig::new(self.table_id()?)
            .poll_interval(self.poll_interval())
            .max_poll_interval(self.max_poll_interval());
        if let Some(size) = self.max_batch_size {
            config = config.max_batch_size(size);
        }
        Ok(config)
    }

    fn problems(&self, index: usize) -> Vec<String> {
        let mut problems = Vec::new();
        let label = if self.name.trim().is_empty() {
            format!("tables[{}]", index)
        } else {
            format!("table '{}'", self.name)
        };

        if self.name.trim().is_empty() {
            problems.push(format!("{}: name is required", label));
        } else if let Err(e) = self.table_id() {
            problems.push(format!("{}: {}", label, e));
        }
        if self.poll_interval().is_zero() {
            problems.push(format!("{}: poll_interval must be positive", label));
        }
        if self.max_poll_interval().is_zero() {
            problems.push(format!("{}: max_poll_interval must be positive", label));
        }
        if self.poll_interval() > self.max_poll_interval() {
            problems.push(format!(
                "{}: poll_interval ({:?}) exceeds max_poll_interval ({:?})",
                label,
                self.poll_interval(),
                self.max_poll_interval()
            ));
        }
        if self.max_batch_size == Some(0) {
            problems.push(format!("{}: max_batch_size must be positive", label));
        }
        problems
    }
}

impl RivuletConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration text
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let expanded = Self::expand_env_vars(content);

        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Validate configuration, reporting every problem at once
    pub fn validate(&self) -> anyhow::Result<()> {
        let problems = self.problems();
        if problems.is_empty() {
            return Ok(());
        }
        anyhow::bail!(
            "Invalid configuration ({} problem{}):\n  - {}",
            problems.len(),
            if problems.len() == 1 { "" } else { "s" },
            problems.join("\n  - ")
        )
    }

    /// Every configuration problem, in document order
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        match &self.source {
            SourceConfig::Sqlserver { connection_string } => {
                if connection_string.trim().is_empty() {
                    problems.push("source.connection_string is required".to_string());
                } else if let Err(e) = SqlServerConfig::from_ado_string(connection_string.as_str())
                {
                    problems.push(format!("source.connection_string: {}", e));
                }
            }
        }

        if let CheckpointConfig::File { dir } = &self.checkpoint {
            if dir.as_os_str().is_empty() {
                problems.push("checkpoint.dir is required for file checkpoints".to_string());
            }
        }

        if self.delivery.channel_capacity == Some(0) {
            problems.push("delivery.channel_capacity must be positive".to_string());
        }
        if self.delivery.drain_timeout.is_some_and(|t| t.is_zero()) {
            problems.push("delivery.drain_timeout must be positive".to_string());
        }

        if self.tables.is_empty() {
            problems.push("at least one table must be configured".to_string());
        }

        let mut seen = HashSet::new();
        for (index, table) in self.tables.iter().enumerate() {
            problems.extend(table.problems(index));
            if let Ok(id) = table.table_id() {
                // SQL Server identifiers compare case-insensitively by default
                if !seen.insert(id.full_name().to_lowercase()) {
                    problems.push(format!("table '{}' is configured more than once", id));
                }
            }
        }

        problems
    }

    /// Monitor configuration for every table
    pub fn monitor_configs(&self) -> rivulet_cdc::Result<Vec<TableMonitorConfig>> {
        self.tables.iter().map(TableConfig::to_monitor_config).collect()
    }
}

/// Parse `<n>ms`, `<n>s`, `<n>m`, `<n>h` or `HH:MM:SS`
pub fn parse_interval(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let caps = INTERVAL_REGEX
        .captures(value)
        .ok_or_else(|| format!("invalid interval '{}' (expected e.g. 500ms, 5s, 1m, 1h or 00:00:05)", value))?;

    let number = |i: usize| -> Result<u64, String> {
        caps.get(i)
            .map_or(Ok(0), |m| m.as_str().parse::<u64>())
            .map_err(|e| format!("invalid interval '{}': {}", value, e))
    };

    let duration = match caps.get(2).map(|m| m.as_str()) {
        Some("ms") => Duration::from_millis(number(1)?),
        Some("s") => Duration::from_secs(number(1)?),
        Some("m") => Duration::from_secs(number(1)?.saturating_mul(60)),
        Some("h") => Duration::from_secs(number(1)?.saturating_mul(3600)),
        _ => Duration::from_secs(
            number(3)?
                .saturating_mul(3600)
                .saturating_add(number(4)? * 60)
                .saturating_add(number(5)?),
        ),
    };
    Ok(duration)
}

fn deserialize_optional_interval<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    value
        .map(|v| parse_interval(&v).map_err(serde::de::Error::custom))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const MINIMAL: &str = r#"
source:
  type: sqlserver
  connection_string: "Server=tcp:localhost,1433;Database=app;User Id=sa;Password=secret"
tables:
  - name: dbo.users
"#;

    #[test]
    #[serial]
    fn test_env_var_expansion() {
        std::env::set_var("RIVULET_TEST_HOST", "db.internal");
        let expanded = RivuletConfig::expand_env_vars("host: ${RIVULET_TEST_HOST}");
        assert_eq!(expanded, "host: db.internal");
        std::env::remove_var("RIVULET_TEST_HOST");
    }

    #[test]
    #[serial]
    fn test_env_var_with_default() {
        std::env::remove_var("RIVULET_MISSING_VAR");
        let expanded = RivuletConfig::expand_env_vars("value: ${RIVULET_MISSING_VAR:-fallback}");
        assert_eq!(expanded, "value: fallback");

        let expanded = RivuletConfig::expand_env_vars("value: ${RIVULET_MISSING_VAR}");
        assert_eq!(expanded, "value: ");
    }

    #[test]
    #[serial]
    fn test_env_var_in_connection_string() {
        std::env::set_var("RIVULET_TEST_PASSWORD", "hunter2");
        let config = RivuletConfig::from_yaml(
            r#"
source:
  type: sqlserver
  connection_string: "Server=tcp:${RIVULET_TEST_DB_HOST:-localhost},1433;User Id=sa;Password=${RIVULET_TEST_PASSWORD}"
tables:
  - name: users
"#,
        )
        .unwrap();
        std::env::remove_var("RIVULET_TEST_PASSWORD");

        let SourceConfig::Sqlserver { connection_string } = &config.source;
        assert!(connection_string.contains("tcp:localhost,1433"));
        assert!(connection_string.contains("Password=hunter2"));
    }

    #[test]
    fn test_parse_minimal_config_defaults() {
        let config = RivuletConfig::from_yaml(MINIMAL).unwrap();

        assert_eq!(config.checkpoint, CheckpointConfig::Source);
        assert_eq!(config.publisher.kind, PublisherKind::Console);
        assert_eq!(config.publisher.format, OutputFormat::Pretty);
        assert_eq!(config.delivery.channel_capacity, None);
        assert_eq!(config.delivery.drain_timeout, None);
        assert_eq!(
            config.delivery.to_orchestrator_config(),
            OrchestratorConfig::default()
        );

        let monitors = config.monitor_configs().unwrap();
        assert_eq!(monitors.len(), 1);
        assert_eq!(monitors[0].table, TableId::new("dbo", "users"));
        assert_eq!(monitors[0].poll_interval, Duration::from_secs(5));
        assert_eq!(monitors[0].max_poll_interval, Duration::from_secs(60));
        assert_eq!(monitors[0].max_batch_size, None);
    }

    #[test]
    fn test_parse_full_config() {
        let config = RivuletConfig::from_yaml(
            r#"
source:
  type: sqlserver
  connection_string: "Server=tcp:localhost,1433;Database=app;User Id=sa;Password=secret"
checkpoint:
  type: file
  dir: /var/lib/rivulet
publisher:
  type: log
  format: json
delivery:
  channel_capacity: 500
  drain_timeout: 00:01:30
tables:
  - name: sales.orders
    poll_interval: 250ms
    max_poll_interval: 2m
    max_batch_size: 100
  - name: customers
    poll_interval: 1s
"#,
        )
        .unwrap();

        assert_eq!(
            config.checkpoint,
            CheckpointConfig::File {
                dir: PathBuf::from("/var/lib/rivulet")
            }
        );
        assert_eq!(config.publisher.kind, PublisherKind::Log);
        assert_eq!(config.publisher.format, OutputFormat::Json);

        let orchestrator = config.delivery.to_orchestrator_config();
        assert_eq!(orchestrator.channel_capacity, Some(500));
        assert_eq!(orchestrator.drain_timeout, Some(Duration::from_secs(90)));

        let monitors = config.monitor_configs().unwrap();
        assert_eq!(monitors[0].table, TableId::new("sales", "orders"));
        assert_eq!(monitors[0].poll_interval, Duration::from_millis(250));
        assert_eq!(monitors[0].max_poll_interval, Duration::from_secs(120));
        assert_eq!(monitors[0].max_batch_size, Some(100));
        assert_eq!(monitors[1].table, TableId::new("dbo", "customers"));
    }

    #[test]
    fn test_null_drain_timeout_waits_indefinitely() {
        let yaml = format!("{}delivery:\n  drain_timeout: ~\n", MINIMAL);
        let config = RivuletConfig::from_yaml(&yaml).unwrap();
        assert_eq!(config.delivery.drain_timeout, None);
    }

    #[test]
    fn test_validation_reports_every_problem() {
        let err = RivuletConfig::from_yaml(
            r#"
source:
  type: sqlserver
  connection_string: ""
delivery:
  channel_capacity: 0
tables:
  - name: dbo.users
    poll_interval: 10s
    max_poll_interval: 5s
  - name: DBO.Users
  - name: "dbo.bad-name"
  - name: dbo.orders
    poll_interval: 0s
    max_batch_size: 0
"#,
        )
        .unwrap_err()
        .to_string();

        assert!(err.contains("source.connection_string is required"), "{err}");
        assert!(err.contains("channel_capacity must be positive"), "{err}");
        assert!(err.contains("exceeds max_poll_interval"), "{err}");
        assert!(err.contains("configured more than once"), "{err}");
        assert!(err.contains("dbo.bad-name"), "{err}");
        assert!(err.contains("poll_interval must be positive"), "{err}");
        assert!(err.contains("max_batch_size must be positive"), "{err}");
        assert!(err.contains("7 problems"), "{err}");
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rivulet.yaml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = RivuletConfig::from_file(&path).unwrap();
        assert_eq!(config.tables.len(), 1);

        let err = RivuletConfig::from_file(dir.path().join("missing.yaml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_no_tables_is_invalid() {
        let err = RivuletConfig::from_yaml(
            r#"
source:
  type: sqlserver
  connection_string: "Server=tcp:localhost,1433;User Id=sa;Password=x"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("at least one table"));
    }

    #[test]
    fn test_unknown_source_type_is_rejected() {
        let err = RivuletConfig::from_yaml(
            r#"
source:
  type: oracle
  connection_string: "x"
tables:
  - name: users
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = RivuletConfig::from_yaml(MINIMAL).unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("secret"), "{debug}");
        assert!(debug.contains("dbo.users"));
    }

    #[test]
    fn test_parse_interval() {
        assert_eq!(parse_interval("500ms"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_interval("5s"), Ok(Duration::from_secs(5)));
        assert_eq!(parse_interval("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_interval("1h"), Ok(Duration::from_secs(3600)));
        assert_eq!(parse_interval("01:02:03"), Ok(Duration::from_secs(3723)));
        assert_eq!(parse_interval(" 5 s "), Ok(Duration::from_secs(5)));

        assert!(parse_interval("5").is_err());
        assert!(parse_interval("-5s").is_err());
        assert!(parse_interval("00:60:00").is_err());
        assert!(parse_interval("five seconds").is_err());
    }

    #[test]
    fn test_invalid_interval_fails_parse() {
        let yaml = MINIMAL.replace("- name: dbo.users", "- name: dbo.users\n    poll_interval: soon");
        let err = RivuletConfig::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("invalid interval 'soon'"), "{err}");
    }
}
