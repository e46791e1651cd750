use std::error::Error;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use conduit_postgres::numeric::PgNumeric;
use tokio_postgres::Row;
use tokio_postgres::types::{FromSql, IsNull, ToSql, Type, to_sql_checked};
use tokio_postgres::types::Format;
use uuid::Uuid;

use crate::error::{ConduitResult, ErrorKind};
use crate::conduit_error;
use crate::types::{Record, UniversalType, Value};

/// Maps a PostgreSQL type name, as found in `pg_type.typname`, to the universal lattice.
///
/// Names of array types start with `_`. Types without a dedicated universal type, such as
/// network addresses, intervals, geometric and text search types, map to `STRING`.
pub fn universal_type_for(type_name: &str) -> UniversalType {
    if type_name.starts_with('_') {
        return UniversalType::Array;
    }

    match type_name {
        "int2" | "int4" | "smallint" | "integer" | "serial" | "smallserial" | "serial2"
        | "serial4" => UniversalType::Integer,
        "int8" | "bigint" | "bigserial" | "serial8" | "oid" => UniversalType::Long,
        "float4" | "real" => UniversalType::Float,
        "float8" | "double precision" | "double" => UniversalType::Double,
        "numeric" | "decimal" | "money" => UniversalType::Decimal,
        "bool" | "boolean" => UniversalType::Boolean,
        "date" => UniversalType::Date,
        "time" | "timetz" => UniversalType::Time,
        "timestamp" => UniversalType::DateTime,
        "timestamptz" => UniversalType::Timestamp,
        "bytea" => UniversalType::Binary,
        "json" | "jsonb" => UniversalType::Json,
        "xml" => UniversalType::Xml,
        _ => UniversalType::String,
    }
}

/// Types the row decoder reads in binary form. Other columns are selected as text.
const DECODED_TYPES: &[&str] = &[
    "bool",
    "int2",
    "int4",
    "int8",
    "oid",
    "float4",
    "float8",
    "numeric",
    "text",
    "varchar",
    "bpchar",
    "name",
    "date",
    "time",
    "timestamp",
    "timestamptz",
    "bytea",
    "json",
    "jsonb",
    "xml",
    "uuid",
];

/// Returns the expression selecting a column so that the decoder understands it.
///
/// `money` is converted to `numeric`, the remaining undecoded types to `text`.
pub fn select_expression(quoted_column: &str, type_name: &str) -> Option<String> {
    let element = type_name.strip_prefix('_').unwrap_or(type_name);
    if DECODED_TYPES.contains(&element) {
        return None;
    }

    let is_array = element.len() != type_name.len();
    let target = match (element, is_array) {
        ("money", false) => "numeric",
        ("money", true) => "numeric[]",
        (_, false) => "text",
        (_, true) => "text[]",
    };

    Some(format!("{quoted_column}::{target}"))
}

/// Decodes every column of a row, keyed by column name.
pub fn decode_row(row: &Row) -> ConduitResult<Record> {
    let mut record = Record::with_capacity(row.len());
    for (index, column) in row.columns().iter().enumerate() {
        let value = decode_value(row, index, column.type_())?;
        record.insert(column.name().to_string(), value);
    }

    Ok(record)
}

fn get<'a, T: FromSql<'a>>(row: &'a Row, index: usize) -> ConduitResult<Option<T>> {
    row.try_get::<_, Option<T>>(index).map_err(|err| {
        conduit_error!(
            ErrorKind::ConversionError,
            "Failed to decode column",
            format!("column {index}: {err}")
        )
    })
}

fn array<'a, T: FromSql<'a>>(
    row: &'a Row,
    index: usize,
    convert: impl Fn(T) -> Value,
) -> ConduitResult<Value> {
    Ok(get::<Vec<Option<T>>>(row, index)?
        .map(|values| {
            Value::Array(
                values
                    .into_iter()
                    .map(|value| value.map(&convert).unwrap_or(Value::Null))
                    .collect(),
            )
        })
        .unwrap_or(Value::Null))
}

fn numeric(value: PgNumeric) -> Value {
    match value {
        PgNumeric::Value(value) => Value::Decimal(value),
        // Special values have no decimal representation.
        other => Value::String(other.to_string()),
    }
}

fn decode_value(row: &Row, index: usize, ty: &Type) -> ConduitResult<Value> {
    let value = match *ty {
        Type::BOOL => get::<bool>(row, index)?.map(Value::Bool),
        Type::INT2 => get::<i16>(row, index)?.map(|v| Value::Integer(v.into())),
        Type::INT4 => get::<i32>(row, index)?.map(Value::Integer),
        Type::INT8 => get::<i64>(row, index)?.map(Value::Long),
        Type::OID => get::<u32>(row, index)?.map(|v| Value::Long(v.into())),
        Type::FLOAT4 => get::<f32>(row, index)?.map(Value::Float),
        Type::FLOAT8 => get::<f64>(row, index)?.map(Value::Double),
        Type::NUMERIC => get::<PgNumeric>(row, index)?.map(numeric),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            get::<String>(row, index)?.map(Value::String)
        }
        Type::DATE => get::<NaiveDate>(row, index)?.map(Value::Date),
        Type::TIME => get::<NaiveTime>(row, index)?.map(Value::Time),
        Type::TIMESTAMP => get::<NaiveDateTime>(row, index)?.map(Value::DateTime),
        Type::TIMESTAMPTZ => get::<DateTime<Utc>>(row, index)?.map(Value::Timestamp),
        Type::BYTEA => get::<Vec<u8>>(row, index)?.map(|v| Value::Binary(Bytes::from(v))),
        Type::JSON | Type::JSONB => get::<serde_json::Value>(row, index)?.map(Value::Json),
        Type::UUID => get::<Uuid>(row, index)?.map(|v| Value::String(v.to_string())),
        // The binary form of xml is the document text.
        Type::XML => get::<RawBytes>(row, index)?
            .map(|raw| Value::Xml(String::from_utf8_lossy(&raw.0).into_owned())),
        Type::BOOL_ARRAY => return array(row, index, Value::Bool),
        Type::INT2_ARRAY => return array(row, index, |v: i16| Value::Integer(v.into())),
        Type::INT4_ARRAY => return array(row, index, Value::Integer),
        Type::INT8_ARRAY => return array(row, index, Value::Long),
        Type::FLOAT4_ARRAY => return array(row, index, Value::Float),
        Type::FLOAT8_ARRAY => return array(row, index, Value::Double),
        Type::NUMERIC_ARRAY => return array(row, index, numeric),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY | Type::BPCHAR_ARRAY | Type::NAME_ARRAY => {
            return array(row, index, Value::String);
        }
        Type::DATE_ARRAY => return array(row, index, Value::Date),
        Type::TIME_ARRAY => return array(row, index, Value::Time),
        Type::TIMESTAMP_ARRAY => return array(row, index, Value::DateTime),
        Type::TIMESTAMPTZ_ARRAY => return array(row, index, Value::Timestamp),
        Type::BYTEA_ARRAY => {
            return array(row, index, |v: Vec<u8>| Value::Binary(Bytes::from(v)));
        }
        Type::JSON_ARRAY | Type::JSONB_ARRAY => return array(row, index, Value::Json),
        Type::UUID_ARRAY => return array(row, index, |v: Uuid| Value::String(v.to_string())),
        // Raw queries may return types the decoder does not know; their wire bytes are kept.
        _ => get::<RawBytes>(row, index)?.map(|raw| Value::Binary(Bytes::from(raw.0))),
    };

    Ok(value.unwrap_or(Value::Null))
}

/// Binary representation of a value of any type.
struct RawBytes(Vec<u8>);

impl<'a> FromSql<'a> for RawBytes {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
        Ok(RawBytes(raw.to_vec()))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

/// A query parameter sent in text format, leaving type inference and parsing to the server.
///
/// Every universal value has a text rendering PostgreSQL accepts for the matching column type,
/// so parameters never depend on the inferred parameter type.
#[derive(Debug, Clone, PartialEq)]
pub struct TextParam(pub Option<String>);

impl From<&Value> for TextParam {
    fn from(value: &Value) -> Self {
        TextParam(value.to_text())
    }
}

impl ToSql for TextParam {
    fn to_sql(
        &self,
        _ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match &self.0 {
            Some(text) => {
                out.put_slice(text.as_bytes());
                Ok(IsNull::No)
            }
            None => Ok(IsNull::Yes),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn encode_format(&self, _ty: &Type) -> Format {
        Format::Text
    }

    to_sql_checked!();
}

/// Borrows parameters in the form the client expects.
pub fn as_sql_params(params: &[TextParam]) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|param| param as &(dyn ToSql + Sync))
        .collect()
}
