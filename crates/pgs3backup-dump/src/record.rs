//! Delimited-text record encoding for data documents
//!
//! Fields are comma separated and records end with `\n`. A field is wrapped
//! in double quotes only when it contains the delimiter, a quote, or a line
//! break; embedded quotes are doubled.

use std::borrow::Cow;
use std::io::Write;

use pgs3backup_core::{DumpError, Result, Value};

/// Render one value as the raw bytes of its field, before quoting.
///
/// Null becomes the empty field, byte strings are written as-is, and every
/// other value uses its canonical text form.
pub fn render_field(value: &Value) -> Cow<'_, [u8]> {
    match value {
        Value::Null => Cow::Borrowed(b""),
        Value::Bytes(bytes) => Cow::Borrowed(bytes),
        Value::Text(s) | Value::Other(s) => Cow::Borrowed(s.as_bytes()),
        Value::Bool(true) => Cow::Borrowed(b"true"),
        Value::Bool(false) => Cow::Borrowed(b"false"),
        Value::Int(n) => Cow::Owned(n.to_string().into_bytes()),
    }
}

fn builder() -> csv::WriterBuilder {
    let mut builder = csv::WriterBuilder::new();
    builder
        .delimiter(b',')
        .quote_style(csv::QuoteStyle::Necessary)
        .terminator(csv::Terminator::Any(b'\n'))
        .flexible(false);
    builder
}

fn encoding_error(e: csv::Error) -> DumpError {
    DumpError::Encoding(e.to_string())
}

/// Streams a header record followed by data records into `W`
pub struct RecordWriter<W: Write> {
    inner: csv::Writer<W>,
    column_count: usize,
    records: u64,
}

impl<W: Write> RecordWriter<W> {
    /// Create a writer and emit the header record immediately
    pub fn new(out: W, columns: &[String]) -> Result<Self> {
        let mut inner = builder().from_writer(out);
        inner.write_record(columns).map_err(encoding_error)?;
        Ok(Self {
            inner,
            column_count: columns.len(),
            records: 0,
        })
    }

    /// Append one data record
    pub fn write_row(&mut self, row: &[Value]) -> Result<()> {
        if row.len() != self.column_count {
            return Err(DumpError::Encoding(format!(
                "row {} has {} values but the header has {} columns",
                self.records + 1,
                row.len(),
                self.column_count
            )));
        }
        self.inner
            .write_record(row.iter().map(render_field))
            .map_err(encoding_error)?;
        self.records += 1;
        Ok(())
    }

    /// Number of data records written, header excluded
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Flush and return the underlying writer
    pub fn into_inner(self) -> Result<W> {
        self.inner
            .into_inner()
            .map_err(|e| DumpError::Encoding(e.to_string()))
    }
}
