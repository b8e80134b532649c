//! pgs3backup core - shared abstractions for the streaming export pipeline
//!
//! This crate provides the types and traits that the driver, dump and
//! storage crates agree on:
//!
//! - `Connector` / `Connection` / `RowSource` - the narrow seam to the database
//! - `ObjectSink` - the narrow seam to the object store
//! - `QueryContext` - the export-wide deadline and cancellation signal
//! - `DumpError` - the error taxonomy shared by every pipeline stage
//! - Common types like `Value`, `TableRef` and `ColumnDescriptor`

mod connection;
mod context;
mod error;
pub mod security;
mod sink;
mod types;

pub use connection::*;
pub use context::*;
pub use error::*;
pub use security::{TlsConfig, TlsMode};
pub use sink::*;
pub use types::*;
