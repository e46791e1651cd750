use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use bigdecimal::{BigDecimal, FromPrimitive, ToPrimitive};
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::bail;
use crate::error::{ConduitResult, ErrorKind};

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M:%S%.f";
pub const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// The type lattice every adapter translates its native types into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UniversalType {
    #[serde(rename = "STRING")]
    String,
    #[serde(rename = "INTEGER")]
    Integer,
    #[serde(rename = "LONG")]
    Long,
    #[serde(rename = "FLOAT")]
    Float,
    #[serde(rename = "DOUBLE")]
    Double,
    #[serde(rename = "DECIMAL")]
    Decimal,
    #[serde(rename = "BOOLEAN")]
    Boolean,
    #[serde(rename = "DATE")]
    Date,
    #[serde(rename = "TIME")]
    Time,
    #[serde(rename = "DATETIME")]
    DateTime,
    #[serde(rename = "TIMESTAMP")]
    Timestamp,
    #[serde(rename = "BINARY")]
    Binary,
    #[serde(rename = "JSON")]
    Json,
    #[serde(rename = "XML")]
    Xml,
    #[serde(rename = "ARRAY")]
    Array,
}

impl UniversalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UniversalType::String => "STRING",
            UniversalType::Integer => "INTEGER",
            UniversalType::Long => "LONG",
            UniversalType::Float => "FLOAT",
            UniversalType::Double => "DOUBLE",
            UniversalType::Decimal => "DECIMAL",
            UniversalType::Boolean => "BOOLEAN",
            UniversalType::Date => "DATE",
            UniversalType::Time => "TIME",
            UniversalType::DateTime => "DATETIME",
            UniversalType::Timestamp => "TIMESTAMP",
            UniversalType::Binary => "BINARY",
            UniversalType::Json => "JSON",
            UniversalType::Xml => "XML",
            UniversalType::Array => "ARRAY",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            UniversalType::Integer
                | UniversalType::Long
                | UniversalType::Float
                | UniversalType::Double
                | UniversalType::Decimal
        )
    }
}

impl fmt::Display for UniversalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single field value, drawn from the [`UniversalType`] lattice.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Decimal(BigDecimal),
    String(String),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    Timestamp(DateTime<Utc>),
    Binary(Bytes),
    Json(serde_json::Value),
    Xml(String),
    Array(Vec<Value>),
}

impl Value {
    /// Returns the universal type of this value, `None` for null.
    pub fn universal_type(&self) -> Option<UniversalType> {
        let ty = match self {
            Value::Null => return None,
            Value::Bool(_) => UniversalType::Boolean,
            Value::Integer(_) => UniversalType::Integer,
            Value::Long(_) => UniversalType::Long,
            Value::Float(_) => UniversalType::Float,
            Value::Double(_) => UniversalType::Double,
            Value::Decimal(_) => UniversalType::Decimal,
            Value::String(_) => UniversalType::String,
            Value::Date(_) => UniversalType::Date,
            Value::Time(_) => UniversalType::Time,
            Value::DateTime(_) => UniversalType::DateTime,
            Value::Timestamp(_) => UniversalType::Timestamp,
            Value::Binary(_) => UniversalType::Binary,
            Value::Json(_) => UniversalType::Json,
            Value::Xml(_) => UniversalType::Xml,
            Value::Array(_) => UniversalType::Array,
        };

        Some(ty)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(value) | Value::Xml(value) => Some(value),
            Value::Json(serde_json::Value::String(value)) => Some(value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            Value::Json(serde_json::Value::Bool(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(value) => Some(i64::from(*value)),
            Value::Long(value) => Some(*value),
            Value::Decimal(value) if value.with_scale(0) == *value => value.to_i64(),
            Value::Json(value) => value.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(value) => Some(f64::from(*value)),
            Value::Long(value) => Some(*value as f64),
            Value::Float(value) => Some(f64::from(*value)),
            Value::Double(value) => Some(*value),
            Value::Decimal(value) => value.to_f64(),
            Value::Json(value) => value.as_f64(),
            _ => None,
        }
    }

    fn as_decimal(&self) -> Option<BigDecimal> {
        match self {
            Value::Integer(value) => Some(BigDecimal::from(*value)),
            Value::Long(value) => Some(BigDecimal::from(*value)),
            Value::Float(value) => BigDecimal::from_f32(*value),
            Value::Double(value) => BigDecimal::from_f64(*value),
            Value::Decimal(value) => Some(value.clone()),
            Value::Json(serde_json::Value::Number(number)) => {
                BigDecimal::from_str(&number.to_string()).ok()
            }
            _ => None,
        }
    }

    /// Compares two values of compatible types.
    ///
    /// Numbers compare across numeric variants, everything else only within its own variant.
    /// Returns `None` for incompatible values and for nulls.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (Value::Long(a), Value::Long(b)) => Some(a.cmp(b)),
            (Value::Decimal(_), _) | (_, Value::Decimal(_)) => {
                Some(self.as_decimal()?.cmp(&other.as_decimal()?))
            }
            (Value::String(a), Value::String(b)) | (Value::Xml(a), Value::Xml(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::Time(a), Value::Time(b)) => Some(a.cmp(b)),
            (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Binary(a), Value::Binary(b)) => Some(a.cmp(b)),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => match (self.as_str(), other.as_str()) {
                    (Some(a), Some(b)) => Some(a.cmp(b)),
                    _ => None,
                },
            },
        }
    }

    /// Loose equality used by filters and conditions: numbers compare by value across variants.
    pub fn loosely_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(a, b)| a.loosely_equals(b))
            }
            (Value::Json(a), b) => a == &b.to_json(),
            (a, Value::Json(b)) => &a.to_json() == b,
            _ => self.compare(other) == Some(Ordering::Equal),
        }
    }

    /// Converts the value into its JSON representation.
    ///
    /// Temporal values render as ISO-8601 strings, binary as `\x`-prefixed hex and decimals as
    /// JSON numbers when representable.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;

        match self {
            Value::Null => Json::Null,
            Value::Bool(value) => Json::Bool(*value),
            Value::Integer(value) => Json::from(*value),
            Value::Long(value) => Json::from(*value),
            Value::Float(value) => float_to_json(f64::from(*value)),
            Value::Double(value) => float_to_json(*value),
            Value::Decimal(value) => match value.to_f64() {
                Some(float) if float.is_finite() => float_to_json(float),
                _ => Json::String(value.to_string()),
            },
            Value::String(value) | Value::Xml(value) => Json::String(value.clone()),
            Value::Json(value) => value.clone(),
            Value::Array(values) => Json::Array(values.iter().map(Value::to_json).collect()),
            other => other
                .to_text()
                .map(Json::String)
                .unwrap_or(Json::Null),
        }
    }

    /// Builds a value from JSON. Objects are kept as [`Value::Json`].
    pub fn from_json(json: serde_json::Value) -> Value {
        use serde_json::Value as Json;

        match json {
            Json::Null => Value::Null,
            Json::Bool(value) => Value::Bool(value),
            Json::Number(number) => match number.as_i64() {
                Some(value) => Value::Long(value),
                None => number.as_f64().map(Value::Double).unwrap_or(Value::Null),
            },
            Json::String(value) => Value::String(value),
            Json::Array(values) => Value::Array(values.into_iter().map(Value::from_json).collect()),
            object @ Json::Object(_) => Value::Json(object),
        }
    }

    /// Renders the value in the text format PostgreSQL accepts for its type, `None` for null.
    pub fn to_text(&self) -> Option<String> {
        let text = match self {
            Value::Null => return None,
            Value::Bool(value) => value.to_string(),
            Value::Integer(value) => value.to_string(),
            Value::Long(value) => value.to_string(),
            Value::Float(value) => value.to_string(),
            Value::Double(value) => value.to_string(),
            Value::Decimal(value) => value.to_string(),
            Value::String(value) | Value::Xml(value) => value.clone(),
            Value::Date(value) => value.format(DATE_FORMAT).to_string(),
            Value::Time(value) => value.format(TIME_FORMAT).to_string(),
            Value::DateTime(value) => value.format(DATETIME_FORMAT).to_string(),
            Value::Timestamp(value) => value.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            Value::Binary(value) => {
                let mut hex = String::with_capacity(2 + value.len() * 2);
                hex.push_str("\\x");
                for byte in value.iter() {
                    hex.push_str(&format!("{byte:02x}"));
                }
                hex
            }
            Value::Json(value) => value.to_string(),
            Value::Array(values) => array_literal(values),
        };

        Some(text)
    }

    /// Converts the value to `target`, parsing strings where needed.
    pub fn coerce(&self, target: UniversalType) -> ConduitResult<Value> {
        if self.is_null() || self.universal_type() == Some(target) {
            return Ok(self.clone());
        }

        let coerced = match target {
            UniversalType::String => self.to_text().map(Value::String),
            UniversalType::Xml => self.to_text().map(Value::Xml),
            UniversalType::Integer => self.as_whole_number()?.and_then(|v| i32::try_from(v).ok()).map(Value::Integer),
            UniversalType::Long => self.as_whole_number()?.map(Value::Long),
            UniversalType::Float => self.as_float()?.map(|v| Value::Float(v as f32)),
            UniversalType::Double => self.as_float()?.map(Value::Double),
            UniversalType::Decimal => match self.as_str() {
                Some(text) => Some(Value::Decimal(BigDecimal::from_str(text.trim())?)),
                None => self.as_decimal().map(Value::Decimal),
            },
            UniversalType::Boolean => match self {
                Value::String(text) => Some(Value::Bool(parse_bool(text)?)),
                _ => self.as_i64().map(|value| Value::Bool(value != 0)),
            },
            UniversalType::Date => match self {
                Value::String(text) => Some(Value::Date(NaiveDate::parse_from_str(text, DATE_FORMAT)?)),
                Value::DateTime(value) => Some(Value::Date(value.date())),
                Value::Timestamp(value) => Some(Value::Date(value.date_naive())),
                _ => None,
            },
            UniversalType::Time => match self {
                Value::String(text) => Some(Value::Time(NaiveTime::parse_from_str(text, TIME_FORMAT)?)),
                Value::DateTime(value) => Some(Value::Time(value.time())),
                _ => None,
            },
            UniversalType::DateTime => match self {
                Value::String(text) => Some(Value::DateTime(parse_datetime(text)?)),
                Value::Timestamp(value) => Some(Value::DateTime(value.naive_utc())),
                _ => None,
            },
            UniversalType::Timestamp => match self {
                Value::String(text) => Some(Value::Timestamp(
                    DateTime::parse_from_rfc3339(text)?.with_timezone(&Utc),
                )),
                Value::DateTime(value) => Some(Value::Timestamp(value.and_utc())),
                _ => None,
            },
            UniversalType::Binary => match self {
                Value::String(text) => Some(Value::Binary(Bytes::from(text.clone().into_bytes()))),
                _ => None,
            },
            UniversalType::Json => match self {
                Value::String(text) => Some(Value::Json(serde_json::from_str(text)?)),
                other => Some(Value::Json(other.to_json())),
            },
            UniversalType::Array => match self {
                Value::Json(serde_json::Value::Array(_)) => Some(Value::from_json(self.to_json())),
                Value::String(text) => match serde_json::from_str::<serde_json::Value>(text)? {
                    array @ serde_json::Value::Array(_) => Some(Value::from_json(array)),
                    _ => None,
                },
                _ => None,
            },
        };

        match coerced {
            Some(value) => Ok(value),
            None => bail!(
                ErrorKind::ConversionError,
                "Value cannot be converted",
                format!(
                    "cannot convert {} to {target}",
                    self.universal_type().map(|ty| ty.as_str()).unwrap_or("NULL")
                )
            ),
        }
    }

    fn as_whole_number(&self) -> ConduitResult<Option<i64>> {
        match self {
            Value::String(text) => Ok(Some(text.trim().parse::<i64>()?)),
            Value::Bool(value) => Ok(Some(i64::from(*value))),
            Value::Float(_) | Value::Double(_) => Ok(self.as_f64().map(|value| value.trunc() as i64)),
            Value::Decimal(value) => Ok(value.with_scale(0).to_i64()),
            _ => Ok(self.as_i64()),
        }
    }

    fn as_float(&self) -> ConduitResult<Option<f64>> {
        match self {
            Value::String(text) => Ok(Some(text.trim().parse::<f64>()?)),
            Value::Bool(value) => Ok(Some(if *value { 1.0 } else { 0.0 })),
            _ => Ok(self.as_f64()),
        }
    }
}

fn float_to_json(value: f64) -> serde_json::Value {
    serde_json::Number::from_f64(value)
        .map(serde_json::Value::Number)
        .unwrap_or_else(|| serde_json::Value::String(value.to_string()))
}

fn parse_bool(text: &str) -> ConduitResult<bool> {
    match text.trim().to_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "on" | "1" => Ok(true),
        "false" | "f" | "no" | "n" | "off" | "0" => Ok(false),
        other => bail!(
            ErrorKind::ConversionError,
            "Boolean parsing failed",
            format!("'{other}' is not a boolean")
        ),
    }
}

fn parse_datetime(text: &str) -> ConduitResult<NaiveDateTime> {
    let text = text.trim();
    match NaiveDateTime::parse_from_str(text, DATETIME_FORMAT) {
        Ok(value) => Ok(value),
        Err(_) => Ok(NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")?),
    }
}

/// Renders a PostgreSQL array literal such as `{1,"a b",NULL}`.
fn array_literal(values: &[Value]) -> String {
    let elements = values
        .iter()
        .map(|value| match value {
            Value::Null => "NULL".to_string(),
            Value::Array(nested) => array_literal(nested),
            other => {
                let text = other.to_text().unwrap_or_default();
                let escaped = text.replace('\\', "\\\\").replace('"', "\\\"");
                format!("\"{escaped}\"")
            }
        })
        .collect::<Vec<_>>();

    format!("{{{}}}", elements.join(","))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_text() {
            Some(text) => f.write_str(&text),
            None => f.write_str("NULL"),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from_json)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Value::from_json(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Long(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn numbers_compare_across_variants() {
        assert_eq!(Value::Integer(3).compare(&Value::Long(3)), Some(Ordering::Equal));
        assert_eq!(
            Value::Decimal(BigDecimal::from_str("2.5").unwrap()).compare(&Value::Integer(3)),
            Some(Ordering::Less)
        );
        assert_eq!(Value::Double(1.5).compare(&Value::Long(1)), Some(Ordering::Greater));
        assert_eq!(Value::String("a".into()).compare(&Value::Integer(1)), None);
        assert!(Value::Long(7).loosely_equals(&Value::Json(json!(7))));
    }

    #[test]
    fn text_rendering_matches_postgres_input_formats() {
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(Value::Date(date).to_text().unwrap(), "2024-02-29");
        assert_eq!(
            Value::Binary(Bytes::from_static(&[0xde, 0xad])).to_text().unwrap(),
            "\\xdead"
        );
        assert_eq!(
            Value::Array(vec![Value::Long(1), Value::Null, Value::String("a \"b\"".into())])
                .to_text()
                .unwrap(),
            r#"{"1",NULL,"a \"b\""}"#
        );
        assert_eq!(Value::Null.to_text(), None);
    }

    #[test]
    fn json_objects_stay_json() {
        let value = Value::from_json(json!({"a": [1, 2]}));
        assert_eq!(value.universal_type(), Some(UniversalType::Json));

        let value = Value::from_json(json!([1, "x"]));
        assert_eq!(
            value,
            Value::Array(vec![Value::Long(1), Value::String("x".into())])
        );
    }

    #[test]
    fn coercion_parses_strings() {
        assert_eq!(
            Value::String(" 42 ".into()).coerce(UniversalType::Integer).unwrap(),
            Value::Integer(42)
        );
        assert_eq!(
            Value::String("yes".into()).coerce(UniversalType::Boolean).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            Value::Long(5).coerce(UniversalType::String).unwrap(),
            Value::String("5".into())
        );

        let err = Value::String("abc".into())
            .coerce(UniversalType::Long)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConversionError);
    }

    #[test]
    fn universal_type_serializes_in_upper_case() {
        assert_eq!(
            serde_json::to_value(UniversalType::DateTime).unwrap(),
            json!("DATETIME")
        );
    }
}
