//! Common test utilities and mocks
#![allow(dead_code)]

use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use pgs3backup_core::{
    ByteStream, ColumnDescriptor, Connection, Connector, DumpError, ObjectSink, QueryContext,
    Result, RowSource, TableRef, UploadReceipt, UploadTarget, Value,
};

/// One table served by [`MockDatabase`]
#[derive(Debug, Clone)]
pub struct MockTable {
    pub table: TableRef,
    pub columns: Vec<ColumnDescriptor>,
    pub rows: Vec<Vec<Value>>,
    /// 1-based row whose decoding fails
    pub fail_at_row: Option<u64>,
    /// Simulated network latency per fetched row
    pub row_delay: Option<Duration>,
}

impl MockTable {
    pub fn new(schema: &str, name: &str) -> Self {
        Self {
            table: TableRef::new(schema, name),
            columns: Vec::new(),
            rows: Vec::new(),
            fail_at_row: None,
            row_delay: None,
        }
    }

    pub fn column(mut self, name: &str, data_type: &str, nullable: bool) -> Self {
        self.columns.push(ColumnDescriptor {
            name: name.into(),
            data_type: data_type.into(),
            nullable,
            default_value: None,
        });
        self
    }

    pub fn column_with_default(mut self, name: &str, data_type: &str, default: &str) -> Self {
        self.columns.push(ColumnDescriptor {
            name: name.into(),
            data_type: data_type.into(),
            nullable: false,
            default_value: Some(default.into()),
        });
        self
    }

    pub fn row(mut self, values: Vec<Value>) -> Self {
        self.rows.push(values);
        self
    }

    pub fn failing_at_row(mut self, row: u64) -> Self {
        self.fail_at_row = Some(row);
        self
    }

    pub fn with_row_delay(mut self, delay: Duration) -> Self {
        self.row_delay = Some(delay);
        self
    }
}

/// In-memory stand-in for a database, answering the catalog and data
/// queries the extractor issues by SQL pattern.
#[derive(Debug, Default)]
pub struct MockDatabase {
    pub tables: Vec<MockTable>,
    pub fail_connect: bool,
    pub fail_table_list: bool,
    /// Query log of every connection, for assertion in tests
    pub query_log: Mutex<Vec<String>>,
    pub connections_opened: AtomicUsize,
    pub connections_closed: AtomicUsize,
    pub cursors_opened: AtomicUsize,
    pub cursors_closed: AtomicUsize,
}

impl MockDatabase {
    pub fn new(tables: Vec<MockTable>) -> Self {
        Self {
            tables,
            ..Default::default()
        }
    }

    /// The `public.users` table: `id` (not null), `name` (nullable), rows
    /// `(1, "Alice")` and `(2, NULL)`
    pub fn users() -> Self {
        Self::new(vec![users_table()])
    }

    pub fn with_connect_failure(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    pub fn with_table_list_failure(mut self) -> Self {
        self.fail_table_list = true;
        self
    }

    pub fn query_log(&self) -> Vec<String> {
        self.query_log.lock().clone()
    }

    /// Every opened connection and cursor was closed
    pub fn all_released(&self) -> bool {
        self.connections_opened.load(Ordering::SeqCst)
            == self.connections_closed.load(Ordering::SeqCst)
            && self.cursors_opened.load(Ordering::SeqCst)
                == self.cursors_closed.load(Ordering::SeqCst)
    }

    fn find(&self, quoted: &str) -> Option<&MockTable> {
        self.tables.iter().find(|t| t.table.quoted() == quoted)
    }
}

pub fn users_table() -> MockTable {
    MockTable::new("public", "users")
        .column("id", "integer", false)
        .column("name", "text", true)
        .row(vec![Value::Int(1), Value::Text("Alice".into())])
        .row(vec![Value::Int(2), Value::Null])
}

pub struct MockConnector {
    pub db: Arc<MockDatabase>,
}

impl MockConnector {
    pub fn new(db: Arc<MockDatabase>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _ctx: &QueryContext) -> Result<Box<dyn Connection>> {
        if self.db.fail_connect {
            return Err(DumpError::Connection(
                "connection refused (127.0.0.1:5432)".into(),
            ));
        }
        self.db.connections_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            db: Arc::clone(&self.db),
            closed: false,
        }))
    }
}

pub struct MockConnection {
    db: Arc<MockDatabase>,
    closed: bool,
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

#[async_trait]
impl Connection for MockConnection {
    async fn query<'a>(
        &'a self,
        sql: &str,
        params: &[&str],
        _ctx: &QueryContext,
    ) -> Result<Box<dyn RowSource + 'a>> {
        self.db.query_log.lock().push(sql.to_string());

        let (columns, rows, fail_at_row, row_delay) = if sql.contains("information_schema.tables") {
            if self.db.fail_table_list {
                return Err(DumpError::Query(
                    "permission denied for schema information_schema".into(),
                ));
            }
            let rows: Vec<Vec<Value>> = self
                .db
                .tables
                .iter()
                .map(|t| vec![text(&t.table.schema), text(&t.table.name)])
                .collect();
            (vec!["table_schema", "table_name"], rows, None, None)
        } else if sql.contains("information_schema.columns") {
            let [schema, name] = params else {
                return Err(DumpError::Query("expected two parameters".into()));
            };
            let table = TableRef::new(*schema, *name);
            let rows: Vec<Vec<Value>> = self
                .db
                .find(&table.quoted())
                .map(|t| {
                    t.columns
                        .iter()
                        .map(|c| {
                            vec![
                                text(&c.name),
                                text(&c.data_type),
                                text(if c.nullable { "YES" } else { "NO" }),
                                c.default_value.as_deref().map(text).unwrap_or(Value::Null),
                            ]
                        })
                        .collect()
                })
                .unwrap_or_default();
            (
                vec!["column_name", "data_type", "is_nullable", "column_default"],
                rows,
                None,
                None,
            )
        } else if let Some(quoted) = sql.strip_prefix("SELECT * FROM ") {
            let Some(table) = self.db.find(quoted) else {
                return Err(DumpError::Query(format!("relation {} does not exist", quoted)));
            };
            (
                table.columns.iter().map(|c| c.name.as_str()).collect(),
                table.rows.clone(),
                table.fail_at_row,
                table.row_delay,
            )
        } else {
            return Err(DumpError::Query(format!("unexpected query: {}", sql)));
        };

        self.db.cursors_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockRowSource {
            db: Arc::clone(&self.db),
            columns: columns.into_iter().map(str::to_string).collect(),
            rows: rows.into_iter(),
            rows_read: 0,
            fail_at_row,
            row_delay,
            closed: false,
        }))
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.db.connections_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

pub struct MockRowSource {
    db: Arc<MockDatabase>,
    columns: Vec<String>,
    rows: std::vec::IntoIter<Vec<Value>>,
    rows_read: u64,
    fail_at_row: Option<u64>,
    row_delay: Option<Duration>,
    closed: bool,
}

#[async_trait]
impl RowSource for MockRowSource {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn next_row(&mut self, ctx: &QueryContext) -> Result<Option<Vec<Value>>> {
        if let Some(delay) = self.row_delay {
            ctx.run("row fetch", async {
                tokio::time::sleep(delay).await;
                Ok(())
            })
            .await?;
        }
        let Some(row) = self.rows.next() else {
            return Ok(None);
        };
        self.rows_read += 1;
        if self.fail_at_row == Some(self.rows_read) {
            return Err(DumpError::RowScan {
                row: self.rows_read,
                column: self.columns.first().cloned().unwrap_or_default(),
                message: "invalid byte sequence for encoding \"UTF8\"".into(),
            });
        }
        Ok(Some(row))
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.db.cursors_closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn rows_read(&self) -> u64 {
        self.rows_read
    }
}

/// Object sink that keeps everything it receives in memory.
///
/// `stored` is only set when the stream finished cleanly, mirroring an
/// all-or-nothing upload.
#[derive(Default)]
pub struct RecordingSink {
    pub received: Mutex<Vec<u8>>,
    pub stored: Mutex<Option<(String, Vec<u8>)>>,
    /// Fail the upload after this many chunks
    pub fail_after_chunks: Option<usize>,
}

impl RecordingSink {
    pub fn failing_after(chunks: usize) -> Self {
        Self {
            fail_after_chunks: Some(chunks),
            ..Default::default()
        }
    }

    pub fn received(&self) -> Vec<u8> {
        self.received.lock().clone()
    }

    pub fn stored(&self) -> Option<(String, Vec<u8>)> {
        self.stored.lock().clone()
    }
}

#[async_trait]
impl ObjectSink for RecordingSink {
    async fn upload(&self, target: &UploadTarget, mut body: ByteStream) -> Result<UploadReceipt> {
        let mut chunks = 0;
        while let Some(chunk) = body.next().await {
            if self.fail_after_chunks == Some(chunks) {
                return Err(DumpError::Sink("simulated upload failure".into()));
            }
            let chunk = chunk?;
            self.received.lock().extend_from_slice(&chunk);
            chunks += 1;
        }

        let key = target.object_key();
        let data = self.received();
        let bytes = data.len() as u64;
        *self.stored.lock() = Some((key.clone(), data));
        Ok(UploadReceipt {
            location: format!("memory://{}", key),
            key,
            bytes,
        })
    }
}

/// Decompress a gzip stream
pub fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(data)
        .read_to_end(&mut out)
        .expect("valid gzip stream");
    out
}

/// Read every entry of a complete tar archive as (name, body)
pub fn untar(data: &[u8]) -> Vec<(String, Vec<u8>)> {
    let mut archive = tar::Archive::new(data);
    archive
        .entries()
        .expect("readable archive")
        .map(|entry| {
            let mut entry = entry.expect("readable entry");
            let name = entry
                .path()
                .expect("entry path")
                .to_string_lossy()
                .into_owned();
            let mut body = Vec::new();
            entry.read_to_end(&mut body).expect("entry body");
            (name, body)
        })
        .collect()
}

/// Walk the archive frame by frame using only the declared sizes.
///
/// Returns the entry names and sizes, and the offset where the zero trailer
/// starts (or where the data ran out).
pub fn walk_frames(data: &[u8]) -> (Vec<(String, u64)>, usize) {
    let mut frames = Vec::new();
    let mut offset = 0;
    let mut pending_long_name: Option<String> = None;
    while offset + 512 <= data.len() {
        let block = &data[offset..offset + 512];
        if block.iter().all(|b| *b == 0) {
            break;
        }
        let header = tar::Header::from_byte_slice(block);
        let size = header.entry_size().expect("declared size");
        let body_start = offset + 512;
        let body_end = body_start + size as usize;
        if body_end > data.len() {
            break;
        }
        let padded = size.div_ceil(512) as usize * 512;

        if header.entry_type() == tar::EntryType::GNULongName {
            let name = &data[body_start..body_end];
            let name = name.strip_suffix(&[0]).unwrap_or(name);
            pending_long_name = Some(String::from_utf8_lossy(name).into_owned());
        } else {
            let name = pending_long_name.take().unwrap_or_else(|| {
                String::from_utf8_lossy(&header.path_bytes()).into_owned()
            });
            frames.push((name, size));
        }
        offset = body_start + padded;
    }
    (frames, offset)
}
