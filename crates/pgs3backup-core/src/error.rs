//! Error types for pgs3backup

use thiserror::Error;

/// Pipeline stage an error is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connect,
    Query,
    RowScan,
    Metadata,
    Export,
    Encode,
    Archive,
    Compress,
    Upload,
    Pipeline,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Connect => "connect",
            Stage::Query => "query",
            Stage::RowScan => "row-scan",
            Stage::Metadata => "metadata",
            Stage::Export => "export",
            Stage::Encode => "encode",
            Stage::Archive => "archive",
            Stage::Compress => "compress",
            Stage::Upload => "upload",
            Stage::Pipeline => "pipeline",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type shared by every stage of the export pipeline.
///
/// The type is `Clone` because a single failure is observed on both ends of a
/// pipe: the stage that failed returns it, and the same failure travels
/// downstream as the terminal message of the byte stream.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DumpError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Row scan error at row {row}, column {column}: {message}")]
    RowScan {
        row: u64,
        column: String,
        message: String,
    },

    #[error("Metadata lookup failed for {object}")]
    Metadata {
        object: String,
        #[source]
        source: Box<DumpError>,
    },

    #[error("Export of table {table} failed")]
    Export {
        table: String,
        #[source]
        source: Box<DumpError>,
    },

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl DumpError {
    /// Wrap a failure raised while reading catalog metadata
    pub fn metadata(object: impl Into<String>, source: DumpError) -> Self {
        DumpError::Metadata {
            object: object.into(),
            source: Box::new(source),
        }
    }

    /// Wrap a failure raised while exporting a table's rows
    pub fn export(table: impl Into<String>, source: DumpError) -> Self {
        DumpError::Export {
            table: table.into(),
            source: Box::new(source),
        }
    }

    /// The stage this error is attributed to
    pub fn stage(&self) -> Stage {
        match self {
            DumpError::Connection(_) => Stage::Connect,
            DumpError::Query(_) => Stage::Query,
            DumpError::RowScan { .. } => Stage::RowScan,
            DumpError::Metadata { .. } => Stage::Metadata,
            DumpError::Export { .. } => Stage::Export,
            DumpError::Encoding(_) => Stage::Encode,
            DumpError::Framing(_) => Stage::Archive,
            DumpError::Compression(_) => Stage::Compress,
            DumpError::Sink(_) => Stage::Upload,
            DumpError::Timeout(_) | DumpError::Cancelled(_) => Stage::Pipeline,
        }
    }

    /// The innermost error of a `Metadata` / `Export` wrapper chain
    pub fn root_cause(&self) -> &DumpError {
        match self {
            DumpError::Metadata { source, .. } | DumpError::Export { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }

    /// Whether this error only reports that the other side of a pipe went away
    pub fn is_cancellation(&self) -> bool {
        matches!(self.root_cause(), DumpError::Cancelled(_))
    }
}

/// Result type alias for pgs3backup operations
pub type Result<T> = std::result::Result<T, DumpError>;
