//! Result set projection and row decoding
//!
//! Only booleans, integers, character strings and `bytea` are read in binary
//! form. Every other column is cast to `text` on the server, so its value is
//! the type's own output rendering: arrays, ranges, domains, network types,
//! money, timestamps and anything user defined.

use pgs3backup_core::{DumpError, Result, Value, quote_identifier};
use tokio_postgres::Row as PgRow;
use tokio_postgres::types::{Kind, Type};

const NATIVE_TYPES: [Type; 9] = [
    Type::BOOL,
    Type::INT2,
    Type::INT4,
    Type::INT8,
    Type::TEXT,
    Type::VARCHAR,
    Type::BPCHAR,
    Type::NAME,
    Type::BYTEA,
];

/// How one result column is fetched
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Projection {
    /// Read in binary form as declared
    Native,
    /// Domain over a native type, cast back to that type
    Base(Type),
    /// Cast to `text` and rendered by the server
    Rendered,
}

impl Projection {
    pub(crate) fn of(ty: &Type) -> Self {
        if NATIVE_TYPES.contains(ty) {
            return Projection::Native;
        }
        match native_base(ty) {
            Some(base) => Projection::Base(base.clone()),
            None => Projection::Rendered,
        }
    }
}

fn native_base(ty: &Type) -> Option<&Type> {
    if NATIVE_TYPES.contains(ty) {
        return Some(ty);
    }
    match ty.kind() {
        Kind::Domain(base) => native_base(base),
        _ => None,
    }
}

/// Wrap `sql` in a projection that applies `projections` column by column.
///
/// Returns `None` when every column is already native.
pub(crate) fn projected_sql<'a>(
    sql: &str,
    columns: impl IntoIterator<Item = (&'a str, &'a Projection)>,
) -> Option<String> {
    let mut rewritten = false;
    let select_list: Vec<String> = columns
        .into_iter()
        .map(|(name, projection)| {
            let quoted = quote_identifier(name);
            match projection {
                Projection::Native => quoted,
                Projection::Base(base) => {
                    rewritten = true;
                    format!("{quoted}::pg_catalog.{} AS {quoted}", base.name())
                }
                Projection::Rendered => {
                    rewritten = true;
                    format!("{quoted}::pg_catalog.text AS {quoted}")
                }
            }
        })
        .collect();

    rewritten.then(|| {
        let inner = sql.trim().trim_end_matches(';');
        format!("SELECT {} FROM ({}) AS src", select_list.join(", "), inner)
    })
}

/// Decode column `idx` of `row`.
///
/// `rendered` marks columns the server cast to text, which surface as
/// [`Value::Other`]. `row_number` is the 1-based position of the row in its
/// result set and only feeds the error report.
pub(crate) fn decode_column(
    row: &PgRow,
    idx: usize,
    rendered: bool,
    row_number: u64,
) -> Result<Value> {
    let column = &row.columns()[idx];
    let scan_error = |message: String| DumpError::RowScan {
        row: row_number,
        column: column.name().to_string(),
        message,
    };

    macro_rules! get {
        ($ty:ty) => {
            row.try_get::<_, Option<$ty>>(idx)
                .map_err(|e| scan_error(format!("{} ({})", e, column.type_().name())))?
        };
    }

    let value = match column.type_().name() {
        "bool" => get!(bool).map(Value::Bool),
        "int2" => get!(i16).map(|v| Value::Int(v.into())),
        "int4" => get!(i32).map(|v| Value::Int(v.into())),
        "int8" => get!(i64).map(Value::Int),
        "bytea" => get!(Vec<u8>).map(Value::Bytes),
        "text" | "varchar" | "bpchar" | "name" if rendered => get!(String).map(Value::Other),
        "text" | "varchar" | "bpchar" | "name" => get!(String).map(Value::Text),
        type_name => {
            return Err(scan_error(format!(
                "column type {type_name} was not projected to a readable type"
            )));
        }
    };

    Ok(value.unwrap_or(Value::Null))
}
