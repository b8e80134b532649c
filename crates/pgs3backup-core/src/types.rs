//! Core types for pgs3backup

use std::fmt;

/// A database value as decoded from a driver row.
///
/// Driver-native typing is collapsed into a closed set of variants so that
/// every value renders deterministically.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// NULL value
    Null,
    /// Boolean
    Bool(bool),
    /// Any integer type, widened to 64 bits
    Int(i64),
    /// UTF-8 text
    Text(String),
    /// Binary data
    Bytes(Vec<u8>),
    /// Any other type, already rendered to its textual form by the driver
    Other(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Text(v) | Value::Other(v) => write!(f, "{}", v),
            Value::Bytes(v) => write!(f, "{}", String::from_utf8_lossy(v)),
        }
    }
}

/// A table discovered in the catalog.
///
/// Ordering is by schema name, then table name, comparing bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// `"schema"."table"`, safe to splice into SQL
    pub fn quoted(&self) -> String {
        format!(
            "{}.{}",
            quote_identifier(&self.schema),
            quote_identifier(&self.name)
        )
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Column metadata read from the catalog, in physical column order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ColumnDescriptor {
    /// Column name
    pub name: String,
    /// Declared data type as reported by the catalog
    pub data_type: String,
    /// Whether the column can be NULL
    pub nullable: bool,
    /// Default value expression
    pub default_value: Option<String>,
}

/// Quote an SQL identifier with double quotes, doubling embedded quotes
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
