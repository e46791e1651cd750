use indexmap::IndexMap;

use crate::bail;
use crate::error::{ConduitResult, ErrorKind};
use crate::types::Value;

/// An ordered mapping of field name to value.
///
/// Stages never mutate a record they received; they build a new one.
pub type Record = IndexMap<String, Value>;

/// Builds a record from `(name, value)` pairs.
pub fn record_from_pairs<I, K, V>(pairs: I) -> Record
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(key, value)| (key.into(), value.into()))
        .collect()
}

/// Converts a record into a JSON object, keeping the field order.
pub fn record_to_json(record: &Record) -> serde_json::Value {
    serde_json::Value::Object(
        record
            .iter()
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect(),
    )
}

/// Converts a JSON object into a record. Fails with `ConversionError` for any other JSON value.
pub fn record_from_json(json: serde_json::Value) -> ConduitResult<Record> {
    match json {
        serde_json::Value::Object(map) => Ok(map
            .into_iter()
            .map(|(key, value)| (key, Value::from_json(value)))
            .collect()),
        other => bail!(
            ErrorKind::ConversionError,
            "Record must be a JSON object",
            format!("got {other}")
        ),
    }
}

/// Resolves a dot separated path inside a JSON document. Numeric segments index arrays.
pub fn json_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    if path.is_empty() {
        return Some(value);
    }

    path.split('.').try_fold(value, |current, segment| match current {
        serde_json::Value::Object(map) => map.get(segment),
        serde_json::Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Resolves a dot separated path in a record.
///
/// The first segment names a field, the remaining ones descend into JSON and array values.
pub fn record_path(record: &Record, path: &str) -> Option<Value> {
    let (field, rest) = match path.split_once('.') {
        Some((field, rest)) => (field, Some(rest)),
        None => (path, None),
    };

    // Field names may contain dots themselves.
    if let Some(value) = record.get(path) {
        return Some(value.clone());
    }

    let value = record.get(field)?;
    let Some(rest) = rest else {
        return Some(value.clone());
    };

    match value {
        Value::Array(items) => {
            let (index, tail) = match rest.split_once('.') {
                Some((index, tail)) => (index, Some(tail)),
                None => (rest, None),
            };
            let item = items.get(index.parse::<usize>().ok()?)?;
            match tail {
                None => Some(item.clone()),
                Some(tail) => json_path(&item.to_json(), tail).cloned().map(Value::from_json),
            }
        }
        other => json_path(&other.to_json(), rest)
            .cloned()
            .map(Value::from_json),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn paths_descend_into_json_and_arrays() {
        let record = record_from_json(json!({
            "id": 1,
            "address": {"city": "Berlin", "zip": ["10115"]},
            "tags": ["a", "b"]
        }))
        .unwrap();

        assert_eq!(record_path(&record, "id"), Some(Value::Long(1)));
        assert_eq!(
            record_path(&record, "address.city"),
            Some(Value::String("Berlin".into()))
        );
        assert_eq!(
            record_path(&record, "address.zip.0"),
            Some(Value::String("10115".into()))
        );
        assert_eq!(record_path(&record, "tags.1"), Some(Value::String("b".into())));
        assert_eq!(record_path(&record, "tags.9"), None);
        assert_eq!(record_path(&record, "missing"), None);
    }

    #[test]
    fn non_objects_are_not_records() {
        let err = record_from_json(json!([1, 2])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConversionError);
    }
}
