//! PostgreSQL driver implementation

mod connection;
mod decode;
mod row_source;
mod tls;

pub use connection::{PostgresConfig, PostgresConnection, PostgresConnector};
pub use row_source::PostgresRowSource;
pub use tls::{PostgresTlsConnector, TlsError};
