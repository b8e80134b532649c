//! Command-line and environment configuration

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, ValueEnum};
use pgs3backup_core::{TlsConfig, TlsMode, UploadTarget};
use pgs3backup_driver_postgres::PostgresConfig;
use pgs3backup_dump::BackupOptions;
use pgs3backup_storage::S3Config;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{flag} must not be empty")]
    Missing { flag: &'static str },

    #[error("invalid value for {flag}: {reason}")]
    Invalid { flag: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable output
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// Settings for one backup run. Every flag can also be set through the
/// environment variable shown in `--help`.
#[derive(Parser, Clone)]
#[command(name = "pgs3backup")]
#[command(about = "Stream a PostgreSQL database to S3 as a tar archive")]
#[command(version)]
pub struct BackupConfig {
    /// Database server host
    #[arg(long, env = "DB_HOST", default_value = "localhost")]
    pub db_host: String,

    /// Database server port
    #[arg(long, env = "DB_PORT", default_value_t = 5432)]
    pub db_port: u16,

    /// Database to back up
    #[arg(long, env = "DB_NAME")]
    pub db_name: String,

    /// Database user
    #[arg(long, env = "DB_USER", default_value = "postgres")]
    pub db_user: String,

    /// Database password
    #[arg(long, env = "DB_PASSWORD", default_value = "", hide_env_values = true)]
    pub db_password: String,

    /// TLS mode: disable, prefer, require, verify-ca or verify-full
    #[arg(long, env = "DB_SSLMODE", default_value = "disable", value_parser = parse_sslmode)]
    pub db_sslmode: TlsMode,

    /// CA certificate used to verify the database server
    #[arg(long, env = "DB_SSLROOTCERT")]
    pub db_sslrootcert: Option<PathBuf>,

    /// Destination bucket
    #[arg(long, env = "S3_BUCKET")]
    pub s3_bucket: String,

    /// Bucket region
    #[arg(long, env = "S3_REGION", default_value = "us-east-1")]
    pub s3_region: String,

    /// Access key ID
    #[arg(long, env = "S3_ACCESS_KEY", hide_env_values = true)]
    pub s3_access_key: String,

    /// Secret access key
    #[arg(long, env = "S3_SECRET_KEY", hide_env_values = true)]
    pub s3_secret_key: String,

    /// Endpoint of an S3-compatible store, e.g. http://localhost:9000
    #[arg(long, env = "S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    /// Key prefix the backup is stored under
    #[arg(long, env = "BACKUP_PREFIX", default_value = "backups")]
    pub backup_prefix: String,

    /// Gzip the archive before upload
    #[arg(
        long,
        env = "COMPRESS",
        default_value = "true",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub compress: bool,

    /// Deadline for the whole export, in seconds
    #[arg(long, env = "BACKUP_TIMEOUT_SECS", default_value_t = 300)]
    pub timeout_secs: u64,

    /// Chunks buffered between pipeline stages
    #[arg(long, env = "PIPE_CAPACITY", default_value_t = 16)]
    pub pipe_capacity: usize,

    /// Largest chunk, in bytes, passed between pipeline stages
    #[arg(long, env = "CHUNK_SIZE", default_value_t = 64 * 1024)]
    pub chunk_size: usize,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

fn parse_sslmode(value: &str) -> Result<TlsMode, String> {
    value.parse()
}

impl fmt::Debug for BackupConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupConfig")
            .field("db_host", &self.db_host)
            .field("db_port", &self.db_port)
            .field("db_name", &self.db_name)
            .field("db_user", &self.db_user)
            .field("db_password", &"<redacted>")
            .field("db_sslmode", &self.db_sslmode)
            .field("db_sslrootcert", &self.db_sslrootcert)
            .field("s3_bucket", &self.s3_bucket)
            .field("s3_region", &self.s3_region)
            .field("s3_access_key", &"<redacted>")
            .field("s3_secret_key", &"<redacted>")
            .field("s3_endpoint", &self.s3_endpoint)
            .field("backup_prefix", &self.backup_prefix)
            .field("compress", &self.compress)
            .field("timeout_secs", &self.timeout_secs)
            .field("pipe_capacity", &self.pipe_capacity)
            .field("chunk_size", &self.chunk_size)
            .field("log_format", &self.log_format)
            .finish()
    }
}

impl BackupConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("--db-host", &self.db_host),
            ("--db-name", &self.db_name),
            ("--db-user", &self.db_user),
            ("--s3-bucket", &self.s3_bucket),
            ("--s3-region", &self.s3_region),
            ("--s3-access-key", &self.s3_access_key),
            ("--s3-secret-key", &self.s3_secret_key),
        ];
        if let Some(&(flag, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(ConfigError::Missing { flag });
        }

        if self.db_port == 0 {
            return Err(invalid("--db-port", "port 0 is not a valid server port"));
        }
        if self.timeout_secs == 0 {
            return Err(invalid("--timeout-secs", "must be at least 1 second"));
        }
        if self.pipe_capacity == 0 {
            return Err(invalid("--pipe-capacity", "must be at least 1"));
        }
        if self.chunk_size == 0 {
            return Err(invalid("--chunk-size", "must be at least 1 byte"));
        }

        self.tls_config()
            .validate()
            .map_err(|reason| ConfigError::Invalid {
                flag: "--db-sslrootcert",
                reason,
            })
    }

    /// The prefix without leading or trailing `/`
    pub fn backup_prefix(&self) -> &str {
        self.backup_prefix.trim_matches('/')
    }

    fn tls_config(&self) -> TlsConfig {
        let tls = TlsConfig::new(self.db_sslmode);
        match &self.db_sslrootcert {
            Some(path) => tls.ca_cert(path),
            None => tls,
        }
    }

    pub fn postgres_config(&self) -> PostgresConfig {
        PostgresConfig::new(&self.db_host, self.db_port, &self.db_name, &self.db_user)
            .with_password(&self.db_password)
            .with_tls(self.tls_config())
    }

    pub fn s3_config(&self) -> S3Config {
        let config = S3Config::new(
            &self.s3_bucket,
            &self.s3_region,
            &self.s3_access_key,
            &self.s3_secret_key,
        );
        match &self.s3_endpoint {
            Some(endpoint) => config.with_endpoint(endpoint),
            None => config,
        }
    }

    pub fn backup_options(&self, started_at: DateTime<Utc>) -> BackupOptions {
        BackupOptions {
            compress: self.compress,
            pipe_capacity: self.pipe_capacity,
            chunk_size: self.chunk_size,
            timeout: Duration::from_secs(self.timeout_secs),
            started_at,
            ..Default::default()
        }
    }

    pub fn upload_target(&self, started_at: DateTime<Utc>) -> UploadTarget {
        UploadTarget::new(
            self.backup_prefix(),
            &self.db_name,
            self.compress,
            started_at,
        )
    }
}

fn invalid(flag: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        flag,
        reason: reason.to_string(),
    }
}
