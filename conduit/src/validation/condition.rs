//! Conditions over JSON documents.
//!
//! A condition is written as a JSON object. Keys starting with `$` combine conditions (`$and`,
//! `$or`, `$not`); any other key is a dot separated field path whose value is either a literal,
//! meaning equality, or an object of comparison operators (`$eq`, `$ne`, `$gt`, `$gte`, `$lt`,
//! `$lte`, `$in`, `$nin`, `$regex` with optional `$options`, `$exists`). The keys of one object
//! must all hold.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use regex::{Regex, RegexBuilder};
use serde_json::Value as Json;

use crate::bail;
use crate::error::{ConduitResult, ErrorKind};
use crate::types::json_path;

/// Predicate supplied by code.
pub type ConditionFn = Arc<dyn Fn(&Json) -> bool + Send + Sync>;

#[derive(Clone)]
pub enum Condition {
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
    Field { path: String, ops: Vec<FieldOp> },
    Function(ConditionFn),
}

#[derive(Debug, Clone)]
pub enum FieldOp {
    Eq(Json),
    Ne(Json),
    Gt(Json),
    Gte(Json),
    Lt(Json),
    Lte(Json),
    In(Vec<Json>),
    Nin(Vec<Json>),
    Regex(Regex),
    Exists(bool),
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::And(conditions) => f.debug_tuple("And").field(conditions).finish(),
            Condition::Or(conditions) => f.debug_tuple("Or").field(conditions).finish(),
            Condition::Not(condition) => f.debug_tuple("Not").field(condition).finish(),
            Condition::Field { path, ops } => f
                .debug_struct("Field")
                .field("path", path)
                .field("ops", ops)
                .finish(),
            Condition::Function(_) => f.write_str("Function(..)"),
        }
    }
}

impl Condition {
    /// Creates a new condition from a predicate function.
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&Json) -> bool + Send + Sync + 'static,
    {
        Condition::Function(Arc::new(f))
    }

    /// Parses the JSON form of a condition.
    pub fn parse(json: &Json) -> ConduitResult<Condition> {
        let Json::Object(map) = json else {
            bail!(
                ErrorKind::ConfigInvalid,
                "Condition must be an object",
                json.to_string()
            );
        };

        let mut conditions = Vec::with_capacity(map.len());
        for (key, value) in map {
            let condition = match key.as_str() {
                "$and" => Condition::And(parse_list(key, value)?),
                "$or" => Condition::Or(parse_list(key, value)?),
                "$not" => Condition::Not(Box::new(Condition::parse(value)?)),
                other if other.starts_with('$') => bail!(
                    ErrorKind::ConfigInvalid,
                    "Unknown condition operator",
                    other
                ),
                path => Condition::Field {
                    path: path.to_string(),
                    ops: parse_ops(value)?,
                },
            };
            conditions.push(condition);
        }

        if conditions.len() == 1 {
            if let Some(condition) = conditions.pop() {
                return Ok(condition);
            }
        }

        Ok(Condition::And(conditions))
    }

    /// Evaluates the condition against `document`.
    pub fn matches(&self, document: &Json) -> bool {
        match self {
            Condition::And(conditions) => conditions.iter().all(|c| c.matches(document)),
            Condition::Or(conditions) => conditions.iter().any(|c| c.matches(document)),
            Condition::Not(condition) => !condition.matches(document),
            Condition::Field { path, ops } => {
                let value = json_path(document, path);
                ops.iter().all(|op| op.matches(value))
            }
            Condition::Function(f) => f(document),
        }
    }
}

fn parse_list(key: &str, value: &Json) -> ConduitResult<Vec<Condition>> {
    match value {
        Json::Array(items) => items.iter().map(Condition::parse).collect(),
        _ => bail!(
            ErrorKind::ConfigInvalid,
            "Logical operator expects an array",
            key
        ),
    }
}

fn operand_list(operator: &str, value: &Json) -> ConduitResult<Vec<Json>> {
    match value {
        Json::Array(items) => Ok(items.clone()),
        _ => bail!(
            ErrorKind::ConfigInvalid,
            "Operator expects an array",
            operator
        ),
    }
}

fn parse_ops(value: &Json) -> ConduitResult<Vec<FieldOp>> {
    let operators = match value {
        Json::Object(map) if !map.is_empty() && map.keys().all(|key| key.starts_with('$')) => map,
        literal => return Ok(vec![FieldOp::Eq(literal.clone())]),
    };

    let case_insensitive = operators
        .get("$options")
        .and_then(Json::as_str)
        .is_some_and(|options| options.contains('i'));

    let mut ops = Vec::with_capacity(operators.len());
    for (operator, operand) in operators {
        let op = match operator.as_str() {
            "$eq" => FieldOp::Eq(operand.clone()),
            "$ne" => FieldOp::Ne(operand.clone()),
            "$gt" => FieldOp::Gt(operand.clone()),
            "$gte" => FieldOp::Gte(operand.clone()),
            "$lt" => FieldOp::Lt(operand.clone()),
            "$lte" => FieldOp::Lte(operand.clone()),
            "$in" => FieldOp::In(operand_list(operator, operand)?),
            "$nin" => FieldOp::Nin(operand_list(operator, operand)?),
            "$regex" => {
                let Some(pattern) = operand.as_str() else {
                    bail!(
                        ErrorKind::ConfigInvalid,
                        "$regex expects a string",
                        operand.to_string()
                    );
                };
                let regex = RegexBuilder::new(pattern)
                    .case_insensitive(case_insensitive)
                    .build()
                    .map_err(|err| {
                        crate::conduit_error!(
                            ErrorKind::ConfigInvalid,
                            "Invalid $regex pattern",
                            err
                        )
                    })?;
                FieldOp::Regex(regex)
            }
            "$options" => continue,
            "$exists" => FieldOp::Exists(operand.as_bool().unwrap_or(true)),
            other => bail!(
                ErrorKind::ConfigInvalid,
                "Unknown field operator",
                other
            ),
        };
        ops.push(op);
    }

    Ok(ops)
}

/// Equality where numbers compare by value, so `1` equals `1.0`.
pub fn json_equals(a: &Json, b: &Json) -> bool {
    match (a, b) {
        (Json::Number(a), Json::Number(b)) => a.as_f64() == b.as_f64(),
        _ => a == b,
    }
}

/// Orders numbers with numbers and strings with strings. Other pairs are unordered.
pub fn json_compare(a: &Json, b: &Json) -> Option<Ordering> {
    match (a, b) {
        (Json::Number(a), Json::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Json::String(a), Json::String(b)) => Some(a.cmp(b)),
        (Json::Bool(a), Json::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

impl FieldOp {
    /// Evaluates the operator against the value at the field path, `None` when it is absent.
    fn matches(&self, value: Option<&Json>) -> bool {
        let present = value.unwrap_or(&Json::Null);
        let ordered = |expected: &Json, accept: fn(Ordering) -> bool| {
            value
                .and_then(|value| json_compare(value, expected))
                .is_some_and(accept)
        };

        match self {
            FieldOp::Eq(expected) => json_equals(present, expected),
            FieldOp::Ne(expected) => !json_equals(present, expected),
            FieldOp::Gt(expected) => ordered(expected, Ordering::is_gt),
            FieldOp::Gte(expected) => ordered(expected, Ordering::is_ge),
            FieldOp::Lt(expected) => ordered(expected, Ordering::is_lt),
            FieldOp::Lte(expected) => ordered(expected, Ordering::is_le),
            FieldOp::In(options) => options.iter().any(|option| json_equals(present, option)),
            FieldOp::Nin(options) => !options.iter().any(|option| json_equals(present, option)),
            FieldOp::Regex(regex) => value
                .and_then(Json::as_str)
                .is_some_and(|text| regex.is_match(text)),
            FieldOp::Exists(expected) => value.is_some() == *expected,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn parse(json: Json) -> Condition {
        Condition::parse(&json).unwrap()
    }

    #[test]
    fn literals_mean_equality() {
        let condition = parse(json!({"status": "active", "age": 30}));

        assert!(condition.matches(&json!({"status": "active", "age": 30.0})));
        assert!(!condition.matches(&json!({"status": "active", "age": 31})));
    }

    #[test]
    fn operators_and_logic_compose() {
        let condition = parse(json!({
            "$or": [
                {"age": {"$gte": 18, "$lt": 65}},
                {"$not": {"tags": {"$exists": true}}}
            ],
            "country": {"$in": ["FR", "DE"]}
        }));

        assert!(condition.matches(&json!({"age": 20, "country": "FR", "tags": []})));
        assert!(condition.matches(&json!({"age": 80, "country": "DE"})));
        assert!(!condition.matches(&json!({"age": 80, "country": "DE", "tags": []})));
        assert!(!condition.matches(&json!({"age": 20, "country": "US"})));
    }

    #[test]
    fn regex_honours_options_and_paths() {
        let condition = parse(json!({"address.city": {"$regex": "^par", "$options": "i"}}));

        assert!(condition.matches(&json!({"address": {"city": "Paris"}})));
        assert!(!condition.matches(&json!({"address": {"city": "Lyon"}})));
        assert!(!condition.matches(&json!({})));
    }

    #[test]
    fn missing_fields_compare_as_null() {
        assert!(parse(json!({"deleted": {"$ne": true}})).matches(&json!({})));
        assert!(!parse(json!({"score": {"$gt": 1}})).matches(&json!({})));
        assert!(parse(json!({"kind": {"$nin": ["a"]}})).matches(&json!({})));
    }

    #[test]
    fn rejects_unknown_operators() {
        let err = Condition::parse(&json!({"age": {"$near": 1}})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
        assert!(Condition::parse(&json!({"$xor": []})).is_err());
        assert!(Condition::parse(&json!([1])).is_err());
    }

    #[test]
    fn functions_are_predicates() {
        let condition = Condition::function(|doc| doc.get("id").is_some());
        assert!(condition.matches(&json!({"id": 1})));
        assert!(!condition.matches(&json!({})));
    }
}
