use serde_json::Value as Json;

use crate::types::json_path;
use crate::validation::result::{ValidationIssue, ValidationResult};
use crate::validation::schema::JsonType;
use crate::validation::validator::{ValidationContext, Validator, ValidatorOptions, ValidatorStats};

/// Checks that a value, or one field of a document, has a single expected type.
#[derive(Debug)]
pub struct TypeValidator {
    name: String,
    expected: JsonType,
    field: Option<String>,
    allow_null: bool,
    allow_undefined: bool,
    options: ValidatorOptions,
    stats: ValidatorStats,
}

impl TypeValidator {
    /// Creates a new validator expecting values of type `expected`.
    pub fn new(name: impl Into<String>, expected: JsonType) -> Self {
        Self {
            name: name.into(),
            expected,
            field: None,
            allow_null: false,
            allow_undefined: false,
            options: ValidatorOptions::default(),
            stats: ValidatorStats::default(),
        }
    }

    /// Checks the value at a dot separated path instead of the whole document.
    pub fn for_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn allow_null(mut self, allow: bool) -> Self {
        self.allow_null = allow;
        self
    }

    /// Accepts documents where the field is absent.
    pub fn allow_undefined(mut self, allow: bool) -> Self {
        self.allow_undefined = allow;
        self
    }

    pub fn with_options(mut self, options: ValidatorOptions) -> Self {
        self.options = options;
        self
    }
}

impl Validator for TypeValidator {
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
        let field = self.field.as_deref().unwrap_or_default();
        let path = context.field_path(field);

        let value = match json_path(data, field) {
            Some(value) => value,
            None if self.allow_undefined => return ValidationResult::valid(),
            None => return ValidationResult::invalid(ValidationIssue::error(path, "Value is missing")),
        };

        if value.is_null() {
            return if self.allow_null || self.expected == JsonType::Null {
                ValidationResult::valid()
            } else {
                ValidationResult::invalid(ValidationIssue::error(path, "Value must not be null"))
            };
        }

        if self.expected.accepts(value) {
            ValidationResult::valid()
        } else {
            ValidationResult::invalid(ValidationIssue::error(
                path,
                format!("Expected {}, got {}", self.expected, JsonType::of(value)),
            ))
        }
    }
}
