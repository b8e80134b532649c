//! pgs3backup dump - the streaming export pipeline
//!
//! Rows flow from a [`pgs3backup_core::RowSource`] through the record
//! encoder into one data document per table, are framed as tar entries,
//! optionally gzip-compressed, and handed to an object sink as a single
//! byte stream. Stages are connected by bounded [`pipe`]s, so memory use
//! stays at the pipe capacity plus the table currently being framed.

mod archive;
mod compress;
mod extractor;
mod pipe;
mod pipeline;
mod record;

pub use archive::{ArchiveWriter, encode_header};
pub use compress::gzip_stage;
pub use extractor::{
    DataDocument, LIST_TABLES_SQL, SCHEMA_ENTRY_NAME, TABLE_COLUMNS_SQL, TableExtractor,
    create_table_statement, data_entry_name, schema_document,
};
pub use pipe::{PipeReader, PipeWriter, pipe};
pub use pipeline::{BackupOptions, BackupPipeline, BackupReport};
pub use record::{RecordWriter, render_field};
