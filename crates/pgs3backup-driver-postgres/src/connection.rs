//! PostgreSQL connection implementation

use std::time::Duration;

use async_trait::async_trait;
use pgs3backup_core::{
    Connection, Connector, DumpError, QueryContext, Result, RowSource, TlsConfig, TlsMode,
};
use tokio::task::JoinHandle;
use tokio_postgres::config::SslMode;
use tokio_postgres::{CancelToken, Client, NoTls, Statement};

use crate::decode::{Projection, projected_sql};
use crate::row_source::PostgresRowSource;
use crate::tls::PostgresTlsConnector;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pins the session settings that shape rendered date and time values
const SESSION_OPTIONS: &str = "-c TimeZone=UTC -c DateStyle=ISO,MDY";

pub(crate) fn format_postgres_error(error: &tokio_postgres::Error) -> String {
    let Some(db_error) = error.as_db_error() else {
        return error.to_string();
    };

    let code = db_error.code();
    let mut message = db_error.message().to_string();

    if let Some(detail) = db_error.detail() {
        if !detail.trim().is_empty() {
            message.push_str(&format!(" (detail: {})", detail));
        }
    }

    if let Some(hint) = db_error.hint() {
        if !hint.trim().is_empty() {
            message.push_str(&format!(" (hint: {})", hint));
        }
    }

    match code.code() {
        "28P01" | "28000" => format!("authentication failed: {}", message),
        "3D000" => format!("database does not exist: {}", message),
        "42501" => format!("permission denied: {}", message),
        "42P01" => format!("relation does not exist: {}", message),
        "57014" => format!("query cancelled: {}", message),
        _ => format!("{} (code: {})", message, code.code()),
    }
}

async fn prepare(client: &Client, sql: &str, ctx: &QueryContext) -> Result<Statement> {
    ctx.run("prepare", async {
        client.prepare(sql).await.map_err(|e| {
            DumpError::Query(format!(
                "Failed to prepare query: {}",
                format_postgres_error(&e)
            ))
        })
    })
    .await
}

/// Connection settings for a single PostgreSQL database
#[derive(Clone)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
    pub tls: TlsConfig,
}

impl PostgresConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            database: database.into(),
            user: user.into(),
            password: None,
            tls: TlsConfig::disabled(),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    fn ssl_mode(&self) -> SslMode {
        match self.tls.mode {
            TlsMode::Disable => SslMode::Disable,
            TlsMode::Prefer => SslMode::Prefer,
            TlsMode::Require | TlsMode::VerifyCa | TlsMode::VerifyFull => SslMode::Require,
        }
    }

    fn to_pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.database)
            .user(&self.user)
            .application_name("pgs3backup")
            .options(SESSION_OPTIONS)
            .ssl_mode(self.ssl_mode());
        if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
            config.password(password);
        }
        config
    }
}

impl std::fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("tls", &self.tls)
            .finish()
    }
}

/// Opens [`PostgresConnection`]s for the export pipeline
#[derive(Debug, Clone)]
pub struct PostgresConnector {
    config: PostgresConfig,
}

impl PostgresConnector {
    pub fn new(config: PostgresConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PostgresConfig {
        &self.config
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    async fn connect(&self, ctx: &QueryContext) -> Result<Box<dyn Connection>> {
        let connection = ctx
            .run("connect", PostgresConnection::connect(&self.config))
            .await?;
        Ok(Box::new(connection))
    }
}

/// PostgreSQL connection wrapper
pub struct PostgresConnection {
    client: Option<Client>,
    connection_task: Option<JoinHandle<()>>,
    cancel_token: CancelToken,
}

impl PostgresConnection {
    /// Connect to a PostgreSQL database
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        tracing::info!(
            host = %config.host,
            port = %config.port,
            database = %config.database,
            ssl_mode = %config.tls.mode,
            "connecting to PostgreSQL database"
        );

        let pg_config = config.to_pg_config();

        let (client, connection_task) = if config.tls.mode == TlsMode::Disable {
            let (client, connection) = pg_config.connect(NoTls).await.map_err(|e| {
                DumpError::Connection(format!(
                    "Failed to connect to PostgreSQL: {}",
                    format_postgres_error(&e)
                ))
            })?;

            let task = tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!(error = %e, "PostgreSQL connection error");
                }
            });

            (client, task)
        } else {
            let tls = PostgresTlsConnector::build(&config.tls)
                .map_err(|e| DumpError::Connection(format!("{:#}", e)))?;

            let (client, connection) = pg_config.connect(tls).await.map_err(|e| {
                DumpError::Connection(format!(
                    "Failed to connect to PostgreSQL: {}",
                    format_postgres_error(&e)
                ))
            })?;

            let task = tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!(error = %e, "PostgreSQL connection error");
                }
            });

            (client, task)
        };

        let cancel_token = client.cancel_token();

        tracing::info!(
            host = %config.host,
            database = %config.database,
            "PostgreSQL connection established"
        );

        Ok(Self {
            client: Some(client),
            connection_task: Some(connection_task),
            cancel_token,
        })
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| DumpError::Connection("connection is closed".to_string()))
    }
}

#[async_trait]
impl Connection for PostgresConnection {
    #[tracing::instrument(skip(self, sql, params, ctx), fields(sql_preview = %sql.chars().take(100).collect::<String>()))]
    async fn query<'a>(
        &'a self,
        sql: &str,
        params: &[&str],
        ctx: &QueryContext,
    ) -> Result<Box<dyn RowSource + 'a>> {
        let client = self.client()?;

        let described = prepare(client, sql, ctx).await?;
        let columns: Vec<String> = described
            .columns()
            .iter()
            .map(|column| column.name().to_string())
            .collect();
        let projections: Vec<Projection> = described
            .columns()
            .iter()
            .map(|column| Projection::of(column.type_()))
            .collect();

        let statement = match projected_sql(
            sql,
            columns.iter().map(String::as_str).zip(&projections),
        ) {
            Some(projected) => {
                tracing::debug!(
                    rendered = projections.iter().filter(|p| **p == Projection::Rendered).count(),
                    "casting non-native columns to text"
                );
                prepare(client, &projected, ctx).await?
            }
            None => described,
        };

        let stream = ctx
            .run("query", async {
                client
                    .query_raw(&statement, params.iter().copied())
                    .await
                    .map_err(|e| {
                        DumpError::Query(format!(
                            "Failed to execute query: {}",
                            format_postgres_error(&e)
                        ))
                    })
            })
            .await?;

        tracing::debug!(columns = columns.len(), "query started");

        let rendered = projections
            .iter()
            .map(|p| *p == Projection::Rendered)
            .collect();
        Ok(Box::new(PostgresRowSource::new(
            stream,
            columns,
            rendered,
            self.cancel_token.clone(),
        )))
    }

    async fn close(&mut self) -> Result<()> {
        let Some(client) = self.client.take() else {
            return Ok(());
        };
        tracing::info!("closing PostgreSQL connection");
        drop(client);

        if let Some(task) = self.connection_task.take() {
            match tokio::time::timeout(CLOSE_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "PostgreSQL connection task failed"),
                Err(_) => tracing::warn!("PostgreSQL connection did not shut down in time"),
            }
        }
        Ok(())
    }
}
