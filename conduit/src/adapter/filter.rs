use std::cmp::Ordering;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{ConduitResult, ErrorKind};
use crate::types::{Record, Value, json_path, record_path};
use crate::{bail, conduit_error};

/// A predicate on one column. Several filters combine with AND.
///
/// Serialized as `{"column": "age", "operator": "gte", "value": 18}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    #[serde(flatten)]
    pub condition: FilterCondition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operator", content = "value", rename_all = "camelCase")]
pub enum FilterCondition {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    /// SQL `LIKE` pattern with `%` and `_` wildcards.
    Like(String),
    #[serde(rename = "ilike")]
    ILike(String),
    In(Vec<Value>),
    /// Inclusive bounds.
    Between(Value, Value),
    Regex(String),
    /// The column's JSON document contains the given document, like PostgreSQL `@>`.
    JsonContains(serde_json::Value),
    /// The given JSON path exists in the column's document.
    JsonPath(String),
}

impl Filter {
    /// Creates a new filter on `column`.
    pub fn new(column: impl Into<String>, condition: FilterCondition) -> Self {
        Self {
            column: column.into(),
            condition,
        }
    }

    /// Creates a new equality filter.
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, FilterCondition::Eq(value.into()))
    }

    /// Evaluates the filter against a record, for adapters without a native query language.
    ///
    /// A missing column behaves like null: only `ne` matches it.
    pub fn matches(&self, record: &Record) -> ConduitResult<bool> {
        let value = record_path(record, &self.column).unwrap_or(Value::Null);
        self.condition.matches(&value)
    }
}

impl FilterCondition {
    /// Returns the operator name as used in serialized filters.
    pub fn operator(&self) -> &'static str {
        match self {
            FilterCondition::Eq(_) => "eq",
            FilterCondition::Ne(_) => "ne",
            FilterCondition::Gt(_) => "gt",
            FilterCondition::Gte(_) => "gte",
            FilterCondition::Lt(_) => "lt",
            FilterCondition::Lte(_) => "lte",
            FilterCondition::Like(_) => "like",
            FilterCondition::ILike(_) => "ilike",
            FilterCondition::In(_) => "in",
            FilterCondition::Between(_, _) => "between",
            FilterCondition::Regex(_) => "regex",
            FilterCondition::JsonContains(_) => "jsonContains",
            FilterCondition::JsonPath(_) => "jsonPath",
        }
    }

    /// Evaluates the condition against `value`.
    pub fn matches(&self, value: &Value) -> ConduitResult<bool> {
        let matched = match self {
            FilterCondition::Eq(expected) => value.loosely_equals(expected),
            FilterCondition::Ne(expected) => !value.loosely_equals(expected),
            FilterCondition::Gt(bound) => value.compare(bound) == Some(Ordering::Greater),
            FilterCondition::Gte(bound) => matches!(
                value.compare(bound),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterCondition::Lt(bound) => value.compare(bound) == Some(Ordering::Less),
            FilterCondition::Lte(bound) => {
                matches!(value.compare(bound), Some(Ordering::Less | Ordering::Equal))
            }
            FilterCondition::Like(pattern) => match value.as_str() {
                Some(text) => like_regex(pattern, false)?.is_match(text),
                None => false,
            },
            FilterCondition::ILike(pattern) => match value.as_str() {
                Some(text) => like_regex(pattern, true)?.is_match(text),
                None => false,
            },
            FilterCondition::In(candidates) => candidates
                .iter()
                .any(|candidate| value.loosely_equals(candidate)),
            FilterCondition::Between(low, high) => {
                matches!(
                    value.compare(low),
                    Some(Ordering::Greater | Ordering::Equal)
                ) && matches!(value.compare(high), Some(Ordering::Less | Ordering::Equal))
            }
            FilterCondition::Regex(pattern) => match value.as_str() {
                Some(text) => Regex::new(pattern)
                    .map_err(|err| {
                        conduit_error!(ErrorKind::QueryInvalid, "Invalid regex filter", err)
                    })?
                    .is_match(text),
                None => false,
            },
            FilterCondition::JsonContains(expected) => {
                !value.is_null() && json_contains(&json_document(value), expected)
            }
            FilterCondition::JsonPath(path) => {
                let path = path.trim_start_matches('$').trim_start_matches('.');
                !value.is_null() && json_path(&json_document(value), path).is_some()
            }
        };

        Ok(matched)
    }
}

fn json_document(value: &Value) -> serde_json::Value {
    match value {
        // Documents stored as text are parsed so that containment works on both.
        Value::String(text) => serde_json::from_str(text).unwrap_or_else(|_| value.to_json()),
        other => other.to_json(),
    }
}

/// JSON containment with the semantics of PostgreSQL's `jsonb @> jsonb`.
pub fn json_contains(document: &serde_json::Value, expected: &serde_json::Value) -> bool {
    use serde_json::Value as Json;

    match (document, expected) {
        (Json::Object(document), Json::Object(expected)) => expected.iter().all(|(key, value)| {
            document
                .get(key)
                .is_some_and(|actual| json_contains(actual, value))
        }),
        (Json::Array(document), Json::Array(expected)) => expected
            .iter()
            .all(|value| document.iter().any(|actual| json_contains(actual, value))),
        (Json::Array(document), scalar) if !scalar.is_object() => {
            document.iter().any(|actual| actual == scalar)
        }
        (document, expected) => document == expected,
    }
}

/// Translates a SQL `LIKE` pattern into an anchored regex. `\` escapes a wildcard.
pub fn like_regex(pattern: &str, case_insensitive: bool) -> ConduitResult<Regex> {
    let mut translated = String::with_capacity(pattern.len() + 4);
    translated.push('^');

    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '%' => translated.push_str(".*"),
            '_' => translated.push('.'),
            '\\' => match chars.next() {
                Some(escaped) => translated.push_str(&regex::escape(&escaped.to_string())),
                None => bail!(
                    ErrorKind::QueryInvalid,
                    "Invalid LIKE pattern",
                    "pattern ends with an escape character"
                ),
            },
            other => translated.push_str(&regex::escape(&other.to_string())),
        }
    }
    translated.push('$');

    RegexBuilder::new(&translated)
        .case_insensitive(case_insensitive)
        .dot_matches_new_line(true)
        .build()
        .map_err(|err| conduit_error!(ErrorKind::QueryInvalid, "Invalid LIKE pattern", err))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::record_from_json;

    fn record() -> Record {
        record_from_json(json!({
            "id": 7,
            "name": "Ada Lovelace",
            "score": 9.5,
            "profile": {"langs": ["en", "fr"], "active": true}
        }))
        .unwrap()
    }

    #[test]
    fn comparison_operators() {
        let record = record();
        assert!(Filter::eq("id", 7).matches(&record).unwrap());
        assert!(
            Filter::new("score", FilterCondition::Between(Value::Long(9), Value::Long(10)))
                .matches(&record)
                .unwrap()
        );
        assert!(
            !Filter::new("score", FilterCondition::Gt(Value::Double(9.5)))
                .matches(&record)
                .unwrap()
        );
        assert!(
            Filter::new(
                "id",
                FilterCondition::In(vec![Value::Long(1), Value::Integer(7)])
            )
            .matches(&record)
            .unwrap()
        );
        assert!(
            Filter::new("missing", FilterCondition::Ne(Value::Long(1)))
                .matches(&record)
                .unwrap()
        );
    }

    #[test]
    fn pattern_operators() {
        let record = record();
        let like = |pattern: &str| FilterCondition::Like(pattern.to_string());

        assert!(Filter::new("name", like("Ada%")).matches(&record).unwrap());
        assert!(!Filter::new("name", like("ada%")).matches(&record).unwrap());
        assert!(
            Filter::new("name", FilterCondition::ILike("ada_lovelace".into()))
                .matches(&record)
                .unwrap()
        );
        assert!(
            Filter::new("name", FilterCondition::Regex("^A.a\\s".into()))
                .matches(&record)
                .unwrap()
        );

        let err = Filter::new("name", FilterCondition::Regex("(".into()))
            .matches(&record)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueryInvalid);
    }

    #[test]
    fn json_operators() {
        let record = record();
        assert!(
            Filter::new(
                "profile",
                FilterCondition::JsonContains(json!({"langs": ["fr"]}))
            )
            .matches(&record)
            .unwrap()
        );
        assert!(
            !Filter::new(
                "profile",
                FilterCondition::JsonContains(json!({"active": false}))
            )
            .matches(&record)
            .unwrap()
        );
        assert!(
            Filter::new("profile", FilterCondition::JsonPath("$.langs.1".into()))
                .matches(&record)
                .unwrap()
        );
    }

    #[test]
    fn filters_use_the_operator_value_format() {
        let filter: Filter =
            serde_json::from_value(json!({"column": "age", "operator": "gte", "value": 18}))
                .unwrap();
        assert_eq!(filter.condition, FilterCondition::Gte(Value::Long(18)));

        let filter: Filter = serde_json::from_value(
            json!({"column": "age", "operator": "between", "value": [1, 2]}),
        )
        .unwrap();
        assert_eq!(filter.condition.operator(), "between");
    }
}
