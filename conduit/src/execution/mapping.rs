use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::adapter::{DEFAULT_WRITE_BATCH_SIZE, Filter, ReadOptions, WriteMode, WriteOptions};
use crate::error::{ConduitResult, ErrorKind};
use crate::types::{Record, SchemaRef, UniversalType, Value, record_path};
use crate::validation::{
    BusinessRuleValidator, Condition, RuleDefinition, SchemaNode, SchemaValidator, Validator,
};
use crate::{bail, conduit_error};

/// Built-in value transforms usable from declarative mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Transform {
    Trim,
    Lowercase,
    Uppercase,
    ToString,
    ToInteger,
    ToFloat,
    ToBoolean,
    /// Serializes the value to JSON text.
    ToJson,
    /// Parses JSON text.
    FromJson,
}

impl Transform {
    /// Applies the transform. Null stays null.
    pub fn apply(&self, value: Value) -> ConduitResult<Value> {
        if value.is_null() {
            return Ok(value);
        }

        let transformed = match self {
            Transform::Trim => map_text(value, |text| text.trim().to_string()),
            Transform::Lowercase => map_text(value, |text| text.to_lowercase()),
            Transform::Uppercase => map_text(value, |text| text.to_uppercase()),
            Transform::ToString => value.coerce(UniversalType::String)?,
            Transform::ToInteger => value.coerce(UniversalType::Long)?,
            Transform::ToFloat => value.coerce(UniversalType::Double)?,
            Transform::ToBoolean => value.coerce(UniversalType::Boolean)?,
            Transform::ToJson => Value::String(value.to_json().to_string()),
            Transform::FromJson => match value {
                Value::String(text) => Value::from_json(serde_json::from_str(&text).map_err(|err| {
                    conduit_error!(ErrorKind::ConversionError, "Value is not valid JSON", source: err)
                })?),
                other => other,
            },
        };

        Ok(transformed)
    }
}

fn map_text(value: Value, f: impl FnOnce(&str) -> String) -> Value {
    match value {
        Value::String(text) => Value::String(f(&text)),
        other => other,
    }
}

pub type TransformFn = Arc<dyn Fn(&Record) -> ConduitResult<Value> + Send + Sync>;

/// Where a target field gets its value from.
#[derive(Clone)]
pub enum FieldSource {
    /// A dot separated source path such as `address.city` or `tags.0`.
    Path(String),
    Transformed {
        path: String,
        transform: Option<Transform>,
        /// Used when the source value is missing or null.
        default: Option<Json>,
    },
    /// Computed from the whole source record.
    Function(TransformFn),
}

impl fmt::Debug for FieldSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldSource::Path(path) => f.debug_tuple("Path").field(path).finish(),
            FieldSource::Transformed {
                path,
                transform,
                default,
            } => f
                .debug_struct("Transformed")
                .field("path", path)
                .field("transform", transform)
                .field("default", default)
                .finish(),
            FieldSource::Function(_) => f.write_str("Function(..)"),
        }
    }
}

impl FieldSource {
    fn resolve(&self, record: &Record) -> ConduitResult<Value> {
        match self {
            FieldSource::Path(path) => Ok(record_path(record, path).unwrap_or(Value::Null)),
            FieldSource::Transformed {
                path,
                transform,
                default,
            } => {
                let mut value = record_path(record, path).unwrap_or(Value::Null);
                if value.is_null() {
                    if let Some(default) = default {
                        value = Value::from_json(default.clone());
                    }
                }
                match transform {
                    Some(transform) => transform.apply(value),
                    None => Ok(value),
                }
            }
            FieldSource::Function(f) => f(record),
        }
    }
}

/// Serialized form of a [`FieldSource`]: a plain path or `{path, transform, default}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldMappingDefinition {
    Path(String),
    Spec {
        path: String,
        #[serde(default)]
        transform: Option<Transform>,
        #[serde(default)]
        default: Option<Json>,
    },
}

impl From<&FieldMappingDefinition> for FieldSource {
    fn from(definition: &FieldMappingDefinition) -> Self {
        match definition {
            FieldMappingDefinition::Path(path) => FieldSource::Path(path.clone()),
            FieldMappingDefinition::Spec {
                path,
                transform,
                default,
            } => FieldSource::Transformed {
                path: path.clone(),
                transform: *transform,
                default: default.clone(),
            },
        }
    }
}

/// Declarative description of a mapping, as loaded from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingDefinition {
    pub id: String,
    pub source: SchemaRef,
    pub target: SchemaRef,
    /// Target field to source. Empty copies records unchanged.
    #[serde(default)]
    pub fields: IndexMap<String, FieldMappingDefinition>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub pre_condition: Option<Json>,
    #[serde(default)]
    pub post_condition: Option<Json>,
    #[serde(default)]
    pub mode: WriteMode,
    #[serde(default)]
    pub conflict_columns: Vec<String>,
    #[serde(default)]
    pub update_columns: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub input_schema: Option<SchemaNode>,
    #[serde(default)]
    pub output_schema: Option<SchemaNode>,
    /// Business rules checked on source records.
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
}

fn default_batch_size() -> usize {
    DEFAULT_WRITE_BATCH_SIZE
}

/// A mapping ready to run.
#[derive(Debug, Clone)]
pub struct Mapping {
    pub id: String,
    pub source: SchemaRef,
    pub target: SchemaRef,
    pub fields: IndexMap<String, FieldSource>,
    /// Options of the source read. Limit and offset bound the whole run.
    pub read: ReadOptions,
    pub write: WriteOptions,
    /// Source records not matching it are skipped without being counted as failures.
    pub pre_condition: Option<Condition>,
    /// Checked on every transformed record.
    pub post_condition: Option<Condition>,
    pub input_validators: Vec<Arc<dyn Validator>>,
    pub output_validators: Vec<Arc<dyn Validator>>,
}

impl Mapping {
    /// Creates a new identity mapping from `source` to `target`.
    pub fn new(id: impl Into<String>, source: SchemaRef, target: SchemaRef) -> Self {
        Self {
            id: id.into(),
            source,
            target,
            fields: IndexMap::new(),
            read: ReadOptions::default(),
            write: WriteOptions::default(),
            pre_condition: None,
            post_condition: None,
            input_validators: Vec::new(),
            output_validators: Vec::new(),
        }
    }

    /// Builds a mapping from its declarative form, validating it.
    pub fn from_definition(definition: &MappingDefinition) -> ConduitResult<Self> {
        let mut mapping = Mapping::new(
            definition.id.clone(),
            definition.source.clone(),
            definition.target.clone(),
        );
        mapping.fields = definition
            .fields
            .iter()
            .map(|(target, source)| (target.clone(), FieldSource::from(source)))
            .collect();
        mapping.read.filters = definition.filters.clone();
        mapping.pre_condition = definition.pre_condition.as_ref().map(Condition::parse).transpose()?;
        mapping.post_condition = definition.post_condition.as_ref().map(Condition::parse).transpose()?;
        mapping.write = WriteOptions {
            mode: definition.mode,
            batch_size: definition.batch_size,
            conflict_columns: definition.conflict_columns.clone(),
            update_columns: definition.update_columns.clone(),
            ..WriteOptions::default()
        };

        if let Some(schema) = &definition.input_schema {
            let name = format!("{}:input", definition.id);
            mapping
                .input_validators
                .push(Arc::new(SchemaValidator::new(name, schema.clone())?));
        }
        if !definition.rules.is_empty() {
            let name = format!("{}:rules", definition.id);
            mapping.input_validators.push(Arc::new(BusinessRuleValidator::from_definitions(
                name,
                &definition.rules,
            )?));
        }
        if let Some(schema) = &definition.output_schema {
            let name = format!("{}:output", definition.id);
            mapping
                .output_validators
                .push(Arc::new(SchemaValidator::new(name, schema.clone())?));
        }

        mapping.validate()?;

        Ok(mapping)
    }

    /// Maps the source `path` to the `target` field.
    pub fn map(mut self, target: impl Into<String>, path: impl Into<String>) -> Self {
        self.fields.insert(target.into(), FieldSource::Path(path.into()));
        self
    }

    pub fn map_with(
        mut self,
        target: impl Into<String>,
        path: impl Into<String>,
        transform: Transform,
    ) -> Self {
        self.fields.insert(
            target.into(),
            FieldSource::Transformed {
                path: path.into(),
                transform: Some(transform),
                default: None,
            },
        );
        self
    }

    pub fn compute<F>(mut self, target: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Record) -> ConduitResult<Value> + Send + Sync + 'static,
    {
        self.fields.insert(target.into(), FieldSource::Function(Arc::new(f)));
        self
    }

    pub fn with_write_options(mut self, write: WriteOptions) -> Self {
        self.write = write;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.write.batch_size = batch_size;
        self
    }

    pub fn with_read_options(mut self, read: ReadOptions) -> Self {
        self.read = read;
        self
    }

    pub fn with_pre_condition(mut self, condition: Condition) -> Self {
        self.pre_condition = Some(condition);
        self
    }

    pub fn with_post_condition(mut self, condition: Condition) -> Self {
        self.post_condition = Some(condition);
        self
    }

    pub fn with_input_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.input_validators.push(validator);
        self
    }

    pub fn with_output_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.output_validators.push(validator);
        self
    }

    /// Number of fields computed by functions, a proxy for the cost of the transform stage.
    pub fn function_transforms(&self) -> usize {
        self.fields
            .values()
            .filter(|source| matches!(source, FieldSource::Function(_)))
            .count()
    }

    /// Checks that the mapping can run.
    pub fn validate(&self) -> ConduitResult<()> {
        if self.id.trim().is_empty() {
            bail!(ErrorKind::ConfigInvalid, "Mapping id must not be empty");
        }
        if self.write.batch_size == 0 {
            bail!(
                ErrorKind::ConfigInvalid,
                "Mapping batch size must be greater than 0",
                self.id.as_str()
            );
        }

        Ok(())
    }

    /// Builds the target record. Identity when no field is mapped.
    pub fn apply(&self, record: &Record) -> ConduitResult<Record> {
        if self.fields.is_empty() {
            return Ok(record.clone());
        }

        self.fields
            .iter()
            .map(|(target, source)| {
                let value = source.resolve(record).map_err(|err| {
                    let detail = format!("field '{target}': {}", err.detail().unwrap_or(err.description()));
                    conduit_error!(err.kind(), "Field transform failed", detail)
                })?;
                Ok((target.clone(), value))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::{record_from_json, record_from_pairs};

    fn refs() -> (SchemaRef, SchemaRef) {
        (
            SchemaRef::new("src", "public", "users"),
            SchemaRef::new("dst", "public", "people"),
        )
    }

    #[test]
    fn builtin_transforms() {
        assert_eq!(
            Transform::Trim.apply(Value::from("  ada ")).unwrap(),
            Value::from("ada")
        );
        assert_eq!(
            Transform::Uppercase.apply(Value::from("ada")).unwrap(),
            Value::from("ADA")
        );
        assert_eq!(
            Transform::ToInteger.apply(Value::from("42")).unwrap(),
            Value::Long(42)
        );
        assert_eq!(
            Transform::ToBoolean.apply(Value::from("true")).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            Transform::ToJson.apply(Value::Json(json!({"a": 1}))).unwrap(),
            Value::from(r#"{"a":1}"#)
        );
        assert_eq!(
            Transform::FromJson.apply(Value::from(r#"{"a":1}"#)).unwrap(),
            Value::Json(json!({"a": 1}))
        );
        assert_eq!(Transform::ToFloat.apply(Value::Null).unwrap(), Value::Null);
        assert_eq!(
            Transform::FromJson.apply(Value::from("{")).unwrap_err().kind(),
            ErrorKind::ConversionError
        );
    }

    #[test]
    fn applies_paths_transforms_defaults_and_functions() {
        let (source, target) = refs();
        let mapping = Mapping::new("people", source, target)
            .map("id", "id")
            .map("city", "address.city")
            .map("first_tag", "tags.0")
            .map_with("name", "name", Transform::Uppercase)
            .compute("label", |record| {
                Ok(Value::String(format!("user-{}", record["id"])))
            });

        let record = record_from_json(json!({
            "id": 7,
            "name": "ada",
            "address": {"city": "London"},
            "tags": ["math", "engines"]
        }))
        .unwrap();
        let mapped = mapping.apply(&record).unwrap();

        assert_eq!(
            mapped,
            record_from_pairs([
                ("id", Value::Long(7)),
                ("city", Value::from("London")),
                ("first_tag", Value::from("math")),
                ("name", Value::from("ADA")),
                ("label", Value::from("user-7")),
            ])
        );
        assert_eq!(mapping.function_transforms(), 1);
    }

    #[test]
    fn definitions_build_runnable_mappings() {
        let definition: MappingDefinition = serde_json::from_value(json!({
            "id": "users-to-people",
            "source": {"systemId": "src", "namespace": "public", "name": "users"},
            "target": {"systemId": "dst", "namespace": "public", "name": "people"},
            "fields": {
                "id": "id",
                "name": {"path": "name", "transform": "trim", "default": "unknown"}
            },
            "preCondition": {"active": true},
            "mode": "upsert",
            "conflictColumns": ["id"],
            "batchSize": 2,
            "rules": [{"name": "name required", "field": "name", "check": "required"}]
        }))
        .unwrap();

        let mapping = Mapping::from_definition(&definition).unwrap();
        assert_eq!(mapping.write.mode, WriteMode::Upsert);
        assert_eq!(mapping.write.batch_size, 2);
        assert_eq!(mapping.input_validators.len(), 1);
        assert!(mapping.pre_condition.is_some());

        let mapped = mapping
            .apply(&record_from_pairs([("id", Value::Long(1)), ("name", Value::Null)]))
            .unwrap();
        assert_eq!(mapped["name"], Value::from("unknown"));
    }

    #[test]
    fn rejects_empty_batches() {
        let (source, target) = refs();
        let err = Mapping::new("m", source, target)
            .with_batch_size(0)
            .validate()
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    }
}
