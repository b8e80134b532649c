//! PostgreSQL TLS Support
//!
//! Builds native-tls connectors for tokio-postgres from a [`TlsConfig`].

use anyhow::{Context, Result};
use native_tls::{Certificate, TlsConnector as NativeTlsConnector, TlsConnectorBuilder};
use pgs3backup_core::{TlsConfig, TlsMode};
use postgres_native_tls::MakeTlsConnector;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Error types for TLS operations
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// Failed to load CA certificate
    #[error("Failed to load CA certificate from {path}: {source}")]
    CaCertLoadFailed {
        path: String,
        source: std::io::Error,
    },

    /// Invalid CA certificate format
    #[error("Invalid CA certificate format: {0}")]
    InvalidCaCert(String),

    /// TLS configuration error
    #[error("TLS configuration error: {0}")]
    ConfigurationError(String),

    /// TLS mode not supported
    #[error("TLS mode {mode} is not supported for this operation")]
    UnsupportedMode { mode: TlsMode },
}

/// A PostgreSQL TLS connector builder
#[derive(Debug, Clone)]
pub struct PostgresTlsConnector;

impl PostgresTlsConnector {
    /// Build a TLS connector from configuration
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The TLS mode is Disable (use `NoTls` instead)
    /// - The CA certificate cannot be read or parsed
    pub fn build(config: &TlsConfig) -> Result<MakeTlsConnector> {
        config
            .validate()
            .map_err(TlsError::ConfigurationError)
            .context("Invalid TLS configuration")?;

        if config.mode == TlsMode::Disable {
            return Err(TlsError::UnsupportedMode { mode: config.mode }.into());
        }

        info!(mode = %config.mode, "Building PostgreSQL TLS connector");

        let mut builder = NativeTlsConnector::builder();

        configure_verification(&mut builder, config.mode);

        if let Some(ca_cert_path) = &config.ca_cert {
            apply_ca_cert(&mut builder, ca_cert_path)?;
        }

        let connector = builder
            .build()
            .map_err(|e| TlsError::ConfigurationError(e.to_string()))?;

        debug!("TLS connector built successfully");

        Ok(MakeTlsConnector::new(connector))
    }
}

/// Configure certificate verification based on TLS mode
fn configure_verification(builder: &mut TlsConnectorBuilder, mode: TlsMode) {
    match mode {
        TlsMode::Disable | TlsMode::Prefer | TlsMode::Require => {
            debug!("Disabling certificate verification");
            builder.danger_accept_invalid_certs(true);
            builder.danger_accept_invalid_hostnames(true);
        }
        TlsMode::VerifyCa => {
            debug!("Enabling CA verification only (hostname verification disabled)");
            builder.danger_accept_invalid_hostnames(true);
        }
        TlsMode::VerifyFull => {
            debug!("Enabling full certificate verification");
        }
    }
}

/// Load and apply a PEM-encoded CA certificate to the TLS builder
fn apply_ca_cert(builder: &mut TlsConnectorBuilder, path: &Path) -> Result<()> {
    debug!(path = %path.display(), "Loading CA certificate");

    let pem_data = fs::read(path).map_err(|e| TlsError::CaCertLoadFailed {
        path: path.display().to_string(),
        source: e,
    })?;

    let cert =
        Certificate::from_pem(&pem_data).map_err(|e| TlsError::InvalidCaCert(e.to_string()))?;

    builder.add_root_certificate(cert);

    Ok(())
}
