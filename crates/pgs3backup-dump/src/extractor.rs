//! Table discovery, schema rendering and per-table data extraction

use pgs3backup_core::{
    ColumnDescriptor, Connection, DumpError, QueryContext, Result, RowSource, TableRef, Value,
    quote_identifier,
};

use crate::record::RecordWriter;

/// Base tables outside the system schemas
pub const LIST_TABLES_SQL: &str = "SELECT table_schema, table_name \
     FROM information_schema.tables \
     WHERE table_type = 'BASE TABLE' \
       AND table_schema NOT IN ('pg_catalog', 'information_schema') \
     ORDER BY table_schema, table_name";

/// Columns of one table in physical order
pub const TABLE_COLUMNS_SQL: &str = "SELECT column_name, data_type, is_nullable, column_default \
     FROM information_schema.columns \
     WHERE table_schema = $1::text AND table_name = $2::text \
     ORDER BY ordinal_position";

/// Archive entry holding the schema document
pub const SCHEMA_ENTRY_NAME: &str = "schema.sql";

/// Archive entry name of a table's data document
pub fn data_entry_name(table: &TableRef) -> String {
    format!("data/{}.{}.csv", table.schema, table.name)
}

/// A rendered data document, ready to be framed as one archive entry
#[derive(Debug, Clone, PartialEq)]
pub struct DataDocument {
    pub entry_name: String,
    pub body: Vec<u8>,
    pub rows: u64,
}

/// Render the `CREATE TABLE` statement for one table
pub fn create_table_statement(table: &TableRef, columns: &[ColumnDescriptor]) -> String {
    let column_lines: Vec<String> = columns
        .iter()
        .map(|column| {
            let mut line = format!("\t{} {}", quote_identifier(&column.name), column.data_type);
            if let Some(default) = &column.default_value {
                line.push_str(" DEFAULT ");
                line.push_str(default);
            }
            if !column.nullable {
                line.push_str(" NOT NULL");
            }
            line
        })
        .collect();

    format!(
        "CREATE TABLE {} (\n{}\n);",
        table.quoted(),
        column_lines.join(",\n")
    )
}

/// Render the schema document: one statement per table, each followed by a
/// blank line
pub fn schema_document(tables: &[(TableRef, Vec<ColumnDescriptor>)]) -> String {
    let mut document = String::new();
    for (table, columns) in tables {
        document.push_str(&create_table_statement(table, columns));
        document.push_str("\n\n");
    }
    document
}

fn text_column(row: &[Value], idx: usize, what: &str) -> Result<String> {
    match row.get(idx) {
        Some(Value::Text(s)) | Some(Value::Other(s)) => Ok(s.clone()),
        Some(Value::Bytes(b)) => Ok(String::from_utf8_lossy(b).into_owned()),
        other => Err(DumpError::Query(format!(
            "unexpected {} in catalog row: {:?}",
            what, other
        ))),
    }
}

/// Reads catalog metadata and table contents over one connection
pub struct TableExtractor<'a> {
    connection: &'a dyn Connection,
    ctx: &'a QueryContext,
}

impl<'a> TableExtractor<'a> {
    pub fn new(connection: &'a dyn Connection, ctx: &'a QueryContext) -> Self {
        Self { connection, ctx }
    }

    /// List every user base table, ordered by (schema, table) in byte order
    pub async fn discover_tables(&self) -> Result<Vec<TableRef>> {
        let rows = self
            .connection
            .query_all(LIST_TABLES_SQL, &[], self.ctx)
            .await
            .map_err(|e| DumpError::metadata("table list", e))?;

        let mut tables = rows
            .iter()
            .map(|row| {
                Ok(TableRef::new(
                    text_column(row, 0, "schema name")?,
                    text_column(row, 1, "table name")?,
                ))
            })
            .collect::<Result<Vec<_>>>()
            .map_err(|e| DumpError::metadata("table list", e))?;

        // The server's ORDER BY follows its collation; the archive order must not.
        tables.sort();
        tables.dedup();

        tracing::info!(tables = tables.len(), "discovered tables");
        Ok(tables)
    }

    /// Column layout of one table
    pub async fn describe_table(&self, table: &TableRef) -> Result<Vec<ColumnDescriptor>> {
        let describe = async {
            let rows = self
                .connection
                .query_all(
                    TABLE_COLUMNS_SQL,
                    &[table.schema.as_str(), table.name.as_str()],
                    self.ctx,
                )
                .await?;

            rows.iter()
                .map(|row| {
                    let default_value = match row.get(3) {
                        None | Some(Value::Null) => None,
                        Some(_) => Some(text_column(row, 3, "column default")?),
                    };
                    Ok(ColumnDescriptor {
                        name: text_column(row, 0, "column name")?,
                        data_type: text_column(row, 1, "data type")?,
                        nullable: text_column(row, 2, "nullability")?.eq_ignore_ascii_case("YES"),
                        default_value,
                    })
                })
                .collect::<Result<Vec<_>>>()
        };

        let columns = describe
            .await
            .map_err(|e| DumpError::metadata(table.to_string(), e))?;
        tracing::debug!(table = %table, columns = columns.len(), "described table");
        Ok(columns)
    }

    /// Describe every table and render the schema document
    pub async fn build_schema(&self, tables: &[TableRef]) -> Result<String> {
        let mut described = Vec::with_capacity(tables.len());
        for table in tables {
            described.push((table.clone(), self.describe_table(table).await?));
        }
        Ok(schema_document(&described))
    }

    /// Stream every row of `table` into a data document.
    ///
    /// The cursor is closed on every exit path.
    pub async fn export_table(&self, table: &TableRef) -> Result<DataDocument> {
        let sql = format!("SELECT * FROM {}", table.quoted());
        let mut source = self
            .connection
            .query(&sql, &[], self.ctx)
            .await
            .map_err(|e| DumpError::export(table.to_string(), e))?;

        let outcome = self.drain(source.as_mut()).await;
        source.close().await;

        let (body, rows, columns) = outcome.map_err(|e| DumpError::export(table.to_string(), e))?;
        tracing::info!(table = %table, columns, rows, bytes = body.len(), "exported table");

        Ok(DataDocument {
            entry_name: data_entry_name(table),
            body,
            rows,
        })
    }

    async fn drain(&self, source: &mut (dyn RowSource + '_)) -> Result<(Vec<u8>, u64, usize)> {
        let columns = source.columns().to_vec();
        let mut writer = RecordWriter::new(Vec::new(), &columns)?;
        while let Some(row) = source.next_row(self.ctx).await? {
            writer.write_row(&row)?;
        }
        let rows = writer.records();
        Ok((writer.into_inner()?, rows, columns.len()))
    }
}
