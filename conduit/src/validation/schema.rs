use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::conduit_error;
use crate::error::{ConduitResult, ErrorKind};
use crate::validation::condition::json_equals;
use crate::validation::result::{ValidationIssue, ValidationResult};
use crate::validation::validator::{
    ValidationContext, Validator, ValidatorOptions, ValidatorStats, join_path,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Null,
}

impl JsonType {
    /// Returns the JSON type of `value`. Integral numbers are reported as integers.
    pub fn of(value: &Json) -> JsonType {
        match value {
            Json::Null => JsonType::Null,
            Json::Bool(_) => JsonType::Boolean,
            Json::Number(number) if number.is_i64() || number.is_u64() => JsonType::Integer,
            Json::Number(_) => JsonType::Number,
            Json::String(_) => JsonType::String,
            Json::Array(_) => JsonType::Array,
            Json::Object(_) => JsonType::Object,
        }
    }

    /// Whether `value` is of this type. Integers are numbers, and integral floats are integers.
    pub fn accepts(&self, value: &Json) -> bool {
        match (self, value) {
            (JsonType::Number, Json::Number(_)) => true,
            (JsonType::Integer, Json::Number(number)) => {
                number.is_i64() || number.is_u64() || number.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            _ => *self == JsonType::of(value),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JsonType::String => "string",
            JsonType::Number => "number",
            JsonType::Integer => "integer",
            JsonType::Boolean => "boolean",
            JsonType::Array => "array",
            JsonType::Object => "object",
            JsonType::Null => "null",
        }
    }
}

impl fmt::Display for JsonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypeSpec {
    Single(JsonType),
    Union(Vec<JsonType>),
}

impl TypeSpec {
    fn types(&self) -> &[JsonType] {
        match self {
            TypeSpec::Single(ty) => std::slice::from_ref(ty),
            TypeSpec::Union(types) => types,
        }
    }

    fn describe(&self) -> String {
        self.types()
            .iter()
            .map(JsonType::as_str)
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Format {
    #[serde(rename = "email")]
    Email,
    #[serde(rename = "uri")]
    Uri,
    #[serde(rename = "date")]
    Date,
    #[serde(rename = "date-time")]
    DateTime,
    #[serde(rename = "time")]
    Time,
    #[serde(rename = "ipv4")]
    Ipv4,
    #[serde(rename = "ipv6")]
    Ipv6,
    #[serde(rename = "uuid")]
    Uuid,
}

fn is_email(text: &str) -> bool {
    let Some((local, domain)) = text.split_once('@') else {
        return false;
    };
    let labels_ok = domain
        .split_once('.')
        .is_some_and(|(head, tail)| !head.is_empty() && !tail.is_empty() && !tail.ends_with('.'));

    !local.is_empty() && !domain.contains('@') && labels_ok && !text.contains(char::is_whitespace)
}

impl Format {
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Email => "email",
            Format::Uri => "uri",
            Format::Date => "date",
            Format::DateTime => "date-time",
            Format::Time => "time",
            Format::Ipv4 => "ipv4",
            Format::Ipv6 => "ipv6",
            Format::Uuid => "uuid",
        }
    }

    pub fn matches(&self, text: &str) -> bool {
        match self {
            Format::Email => is_email(text),
            Format::Uri => url::Url::parse(text).is_ok(),
            Format::Date => NaiveDate::parse_from_str(text, "%Y-%m-%d").is_ok(),
            Format::DateTime => DateTime::parse_from_rfc3339(text).is_ok(),
            Format::Time => NaiveTime::parse_from_str(text, "%H:%M:%S%.f").is_ok(),
            Format::Ipv4 => text.parse::<Ipv4Addr>().is_ok(),
            Format::Ipv6 => text.parse::<Ipv6Addr>().is_ok(),
            Format::Uuid => uuid::Uuid::parse_str(text).is_ok(),
        }
    }
}

/// Check attached to a schema node in code. Returns a message when the value is rejected.
#[derive(Clone)]
pub struct CustomCheck(Arc<dyn Fn(&Json) -> Option<String> + Send + Sync>);

impl CustomCheck {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Json) -> Option<String> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for CustomCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomCheck(..)")
    }
}

/// A JSON-Schema-like contract for one node of a document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchemaNode {
    #[serde(rename = "type")]
    pub ty: Option<TypeSpec>,
    pub nullable: bool,
    pub required: Vec<String>,
    pub properties: IndexMap<String, SchemaNode>,
    /// Only enforced when the validator runs in strict mode.
    pub additional_properties: Option<bool>,
    pub min_properties: Option<usize>,
    pub max_properties: Option<usize>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub pattern: Option<String>,
    #[serde(rename = "enum")]
    pub enum_values: Option<Vec<Json>>,
    pub format: Option<Format>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub exclusive_minimum: Option<f64>,
    pub exclusive_maximum: Option<f64>,
    pub multiple_of: Option<f64>,
    /// Requires numbers to be integral.
    pub integer: bool,
    pub min_items: Option<usize>,
    pub max_items: Option<usize>,
    pub unique_items: bool,
    pub items: Option<Box<SchemaNode>>,
    #[serde(skip)]
    pub custom: Option<CustomCheck>,
}

impl SchemaNode {
    /// Creates a new node accepting any value of type `ty`.
    pub fn of_type(ty: JsonType) -> Self {
        Self {
            ty: Some(TypeSpec::Single(ty)),
            ..Self::default()
        }
    }

    /// Creates a new object node with the given properties.
    pub fn object<I, K>(properties: I) -> Self
    where
        I: IntoIterator<Item = (K, SchemaNode)>,
        K: Into<String>,
    {
        Self {
            ty: Some(TypeSpec::Single(JsonType::Object)),
            properties: properties
                .into_iter()
                .map(|(key, node)| (key.into(), node))
                .collect(),
            ..Self::default()
        }
    }

    pub fn with_required<I, S>(mut self, required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required = required.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_custom(mut self, check: CustomCheck) -> Self {
        self.custom = Some(check);
        self
    }

    fn collect_patterns(&self, patterns: &mut HashMap<String, Regex>) -> ConduitResult<()> {
        if let Some(pattern) = &self.pattern {
            if !patterns.contains_key(pattern) {
                let regex = Regex::new(pattern).map_err(|err| {
                    conduit_error!(ErrorKind::ConfigInvalid, "Invalid schema pattern", err)
                })?;
                patterns.insert(pattern.clone(), regex);
            }
        }
        for node in self.properties.values() {
            node.collect_patterns(patterns)?;
        }
        if let Some(items) = &self.items {
            items.collect_patterns(patterns)?;
        }

        Ok(())
    }
}

/// Converts `value` to `target` when a lossless textual conversion exists.
pub fn coerce(value: &Json, target: JsonType) -> Option<Json> {
    match (value, target) {
        (Json::String(text), JsonType::Integer) => text.trim().parse::<i64>().ok().map(Json::from),
        (Json::String(text), JsonType::Number) => text
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Json::Number),
        (Json::String(text), JsonType::Boolean) => match text.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Some(Json::Bool(true)),
            "false" | "0" | "no" => Some(Json::Bool(false)),
            _ => None,
        },
        (Json::String(text), JsonType::Array) | (Json::String(text), JsonType::Object) => {
            serde_json::from_str::<Json>(text)
                .ok()
                .filter(|parsed| JsonType::of(parsed) == target)
        }
        (Json::Number(number), JsonType::String) => Some(Json::String(number.to_string())),
        (Json::Bool(flag), JsonType::String) => Some(Json::String(flag.to_string())),
        (Json::Bool(flag), JsonType::Integer) => Some(Json::from(i64::from(*flag))),
        (Json::Number(number), JsonType::Boolean) => number.as_f64().map(|f| Json::Bool(f != 0.0)),
        (Json::Array(_), JsonType::String) | (Json::Object(_), JsonType::String) => {
            Some(Json::String(value.to_string()))
        }
        _ => None,
    }
}

/// Validates documents against a [`SchemaNode`].
#[derive(Debug)]
pub struct SchemaValidator {
    name: String,
    root: SchemaNode,
    strict_mode: bool,
    coerce_types: bool,
    patterns: HashMap<String, Regex>,
    options: ValidatorOptions,
    stats: ValidatorStats,
}

impl SchemaValidator {
    /// Compiles the patterns of `root`. Invalid patterns fail with [`ErrorKind::ConfigInvalid`].
    pub fn new(name: impl Into<String>, root: SchemaNode) -> ConduitResult<Self> {
        let mut patterns = HashMap::new();
        root.collect_patterns(&mut patterns)?;

        Ok(Self {
            name: name.into(),
            root,
            strict_mode: false,
            coerce_types: false,
            patterns,
            options: ValidatorOptions::default(),
            stats: ValidatorStats::default(),
        })
    }

    /// Rejects properties not declared by `properties` unless `additionalProperties` allows them.
    pub fn with_strict_mode(mut self, strict_mode: bool) -> Self {
        self.strict_mode = strict_mode;
        self
    }

    /// Coerces values to the declared type before checking them.
    ///
    /// The coerced document is reported under the `coerced` metadata key.
    pub fn with_coercion(mut self, coerce_types: bool) -> Self {
        self.coerce_types = coerce_types;
        self
    }

    pub fn with_options(mut self, options: ValidatorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn root(&self) -> &SchemaNode {
        &self.root
    }

    fn halted(&self, result: &ValidationResult) -> bool {
        self.options.stop_on_error && !result.valid
    }

    fn check_node(&self, node: &SchemaNode, value: &mut Json, path: &str, result: &mut ValidationResult) {
        if value.is_null() {
            let null_allowed = node.nullable
                || node
                    .ty
                    .as_ref()
                    .is_none_or(|ty| ty.types().contains(&JsonType::Null));
            if !null_allowed {
                result.add_error(path, "Value must not be null");
            }
            return;
        }

        if let Some(ty) = &node.ty {
            let mut accepted = ty.types().iter().any(|candidate| candidate.accepts(value));
            if !accepted && self.coerce_types {
                let coerced = ty
                    .types()
                    .iter()
                    .find_map(|candidate| coerce(value, *candidate));
                if let Some(coerced) = coerced {
                    *value = coerced;
                    accepted = true;
                }
            }
            if !accepted {
                result.push(
                    ValidationIssue::error(
                        path,
                        format!("Expected {}, got {}", ty.describe(), JsonType::of(value)),
                    )
                    .with_details(serde_json::json!({ "expected": ty.describe() })),
                );
                return;
            }
        }

        if let Some(options) = &node.enum_values {
            if !options.iter().any(|option| json_equals(value, option)) {
                result.add_error(path, "Value is not one of the allowed values");
            }
        }

        match value {
            Json::String(text) => self.check_string(node, text, path, result),
            Json::Number(number) => {
                if let Some(number) = number.as_f64() {
                    check_number(node, number, path, result);
                }
            }
            Json::Array(items) => self.check_array(node, items, path, result),
            Json::Object(map) => self.check_object(node, map, path, result),
            _ => {}
        }

        if let Some(custom) = &node.custom {
            if let Some(message) = (custom.0)(value) {
                result.add_error(path, message);
            }
        }
    }

    fn check_string(&self, node: &SchemaNode, text: &str, path: &str, result: &mut ValidationResult) {
        let length = text.chars().count();
        if let Some(min) = node.min_length.filter(|min| length < *min) {
            result.add_error(path, format!("String is shorter than {min}"));
        }
        if let Some(max) = node.max_length.filter(|max| length > *max) {
            result.add_error(path, format!("String is longer than {max}"));
        }
        if let Some(pattern) = &node.pattern {
            let matched = self
                .patterns
                .get(pattern)
                .is_some_and(|regex| regex.is_match(text));
            if !matched {
                result.add_error(path, format!("String does not match pattern {pattern}"));
            }
        }
        if let Some(format) = node.format {
            if !format.matches(text) {
                result.add_error(path, format!("String is not a valid {}", format.as_str()));
            }
        }
    }

    fn check_array(
        &self,
        node: &SchemaNode,
        items: &mut [Json],
        path: &str,
        result: &mut ValidationResult,
    ) {
        if node.min_items.is_some_and(|min| items.len() < min) {
            result.add_error(path, "Array has too few items");
        }
        if node.max_items.is_some_and(|max| items.len() > max) {
            result.add_error(path, "Array has too many items");
        }
        if node.unique_items {
            let duplicated = items.iter().enumerate().any(|(index, item)| {
                items[..index].iter().any(|earlier| json_equals(earlier, item))
            });
            if duplicated {
                result.add_error(path, "Array items are not unique");
            }
        }
        if let Some(item_node) = &node.items {
            for (index, item) in items.iter_mut().enumerate() {
                if self.halted(result) {
                    return;
                }
                self.check_node(item_node, item, &join_path(path, &index.to_string()), result);
            }
        }
    }

    fn check_object(
        &self,
        node: &SchemaNode,
        map: &mut serde_json::Map<String, Json>,
        path: &str,
        result: &mut ValidationResult,
    ) {
        for required in &node.required {
            if !map.contains_key(required) {
                result.add_error(join_path(path, required), "Field is required");
            }
        }
        if node.min_properties.is_some_and(|min| map.len() < min) {
            result.add_error(path, "Object has too few properties");
        }
        if node.max_properties.is_some_and(|max| map.len() > max) {
            result.add_error(path, "Object has too many properties");
        }
        if self.strict_mode && node.additional_properties != Some(true) && !node.properties.is_empty() {
            for key in map.keys() {
                if !node.properties.contains_key(key) {
                    result.add_error(join_path(path, key), "Property is not allowed");
                }
            }
        }

        for (key, property) in &node.properties {
            if self.halted(result) {
                return;
            }
            if let Some(value) = map.get_mut(key) {
                self.check_node(property, value, &join_path(path, key), result);
            }
        }
    }
}

fn check_number(node: &SchemaNode, number: f64, path: &str, result: &mut ValidationResult) {
    if node.integer && number.fract() != 0.0 {
        result.add_error(path, "Number must be an integer");
    }
    if let Some(minimum) = node.minimum {
        if number < minimum {
            result.add_error(path, format!("Number is less than {minimum}"));
        }
    }
    if let Some(maximum) = node.maximum {
        if number > maximum {
            result.add_error(path, format!("Number is greater than {maximum}"));
        }
    }
    if let Some(minimum) = node.exclusive_minimum {
        if number <= minimum {
            result.add_error(path, format!("Number must be greater than {minimum}"));
        }
    }
    if let Some(maximum) = node.exclusive_maximum {
        if number >= maximum {
            result.add_error(path, format!("Number must be less than {maximum}"));
        }
    }
    if let Some(divisor) = node.multiple_of {
        let quotient = number / divisor;
        if divisor != 0.0 && (quotient - quotient.round()).abs() > 1e-9 {
            result.add_error(path, format!("Number is not a multiple of {divisor}"));
        }
    }
}

impl Validator for SchemaValidator {
    fn name(&self) -> &str {
        &self.name
    }

    fn options(&self) -> ValidatorOptions {
        self.options
    }

    fn stats(&self) -> &ValidatorStats {
        &self.stats
    }

    fn check(&self, data: &Json, context: &ValidationContext) -> ValidationResult {
        let mut result = ValidationResult::valid();
        let mut document = data.clone();
        self.check_node(&self.root, &mut document, &context.path, &mut result);

        if self.coerce_types && document != *data {
            result.metadata.insert("coerced".to_string(), document);
        }

        result
    }
}
