//! SQL Server connection settings

use std::time::Duration;
use tiberius::Config;

use super::error::SqlServerError;
use crate::common::Result;

/// Connection settings for the SQL Server adapter.
///
/// Built either from an ADO.NET connection string or with the builder.
///
/// # Example
///
/// ```rust,ignore
/// use rivulet_cdc::sqlserver::SqlServerConfig;
///
/// let config = SqlServerConfig::builder()
///     .host("localhost")
///     .port(1433)
///     .username("sa")
///     .password("YourPassword123!")
///     .database("app")
///     .trust_server_certificate(true)
///     .build()?;
/// ```
#[derive(Clone)]
pub struct SqlServerConfig {
    connection_string: String,
    /// Application name reported to the server
    pub application_name: String,
    /// Bound on TCP connect plus login
    pub connect_timeout: Duration,
}

impl std::fmt::Debug for SqlServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlServerConfig")
            .field("connection_string", &self.redacted_connection_string())
            .field("application_name", &self.application_name)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl SqlServerConfig {
    /// Parse an ADO.NET style connection string
    /// (`Server=tcp:host,1433;Database=app;User Id=sa;Password=...`).
    pub fn from_ado_string(connection_string: impl Into<String>) -> Result<Self> {
        let connection_string = connection_string.into();
        Config::from_ado_string(&connection_string)
            .map_err(|e| SqlServerError::InvalidConnectionString(e.to_string()))?;

        Ok(Self {
            connection_string,
            application_name: "rivulet".to_string(),
            connect_timeout: Duration::from_secs(30),
        })
    }

    pub fn builder() -> SqlServerConfigBuilder {
        SqlServerConfigBuilder::default()
    }

    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Raw connection string (contains credentials)
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Connection string with the password value replaced
    pub fn redacted_connection_string(&self) -> String {
        redact_password(&self.connection_string)
    }

    /// Tiberius configuration for a new connection
    pub fn tiberius_config(&self) -> Result<Config> {
        let mut config = Config::from_ado_string(&self.connection_string)
            .map_err(|e| SqlServerError::InvalidConnectionString(e.to_string()))?;
        config.application_name(&self.application_name);
        Ok(config)
    }
}

fn redact_password(conn_str: &str) -> String {
    conn_str
        .split(';')
        .map(|part| match part.split_once('=') {
            Some((key, _)) => {
                let normalized = key.trim().to_ascii_lowercase();
                if normalized == "password" || normalized == "pwd" {
                    format!("{}=[REDACTED]", key)
                } else {
                    part.to_string()
                }
            }
            None => part.to_string(),
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// Builder for SqlServerConfig
#[derive(Debug, Clone)]
pub struct SqlServerConfigBuilder {
    host: String,
    port: u16,
    username: String,
    password: Option<String>,
    database: String,
    trust_server_certificate: bool,
    encrypt: bool,
    connect_timeout: Duration,
}

impl Default for SqlServerConfigBuilder {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1433,
            username: String::new(),
            password: None,
            database: String::new(),
            trust_server_certificate: false,
            encrypt: true,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl SqlServerConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Trust a self-signed server certificate
    pub fn trust_server_certificate(mut self, trust: bool) -> Self {
        self.trust_server_certificate = trust;
        self
    }

    pub fn encrypt(mut self, encrypt: bool) -> Self {
        self.encrypt = encrypt;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<SqlServerConfig> {
        if self.host.is_empty() {
            return Err(SqlServerError::InvalidConnectionString("Host is required".into()).into());
        }
        if self.username.is_empty() {
            return Err(
                SqlServerError::InvalidConnectionString("Username is required".into()).into(),
            );
        }
        if self.database.is_empty() {
            return Err(
                SqlServerError::InvalidConnectionString("Database is required".into()).into(),
            );
        }

        let mut parts = vec![
            format!("Server=tcp:{},{}", self.host, self.port),
            format!("Database={}", self.database),
            format!("User Id={}", self.username),
        ];
        if let Some(ref password) = self.password {
            parts.push(format!("Password={}", password));
        }
        if self.trust_server_certificate {
            parts.push("TrustServerCertificate=true".to_string());
        }
        parts.push(format!("Encrypt={}", self.encrypt));

        Ok(SqlServerConfig::from_ado_string(parts.join(";"))?.with_connect_timeout(self.connect_timeout))
    }
}
