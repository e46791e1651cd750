use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::validation::result::ValidationResult;
use crate::validation::validator::{ValidationContext, Validator, ValidatorOptions, ValidatorStats};

pub type ValidateFn = Arc<dyn Fn(&Json, &ValidationContext) -> ValidationResult + Send + Sync>;

/// A validator backed by a function.
pub struct CustomValidator {
    name: String,
    f: ValidateFn,
    options: ValidatorOptions,
    stats: ValidatorStats,
}

impl CustomValidator {
    /// Creates a new validator from a function.
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Json, &ValidationContext) -> ValidationResult + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Arc::new(f),
            options: ValidatorOptions::default(),
            stats: ValidatorStats::default(),
        }
    }

    pub fn with_options(mut self, options: ValidatorOptions) -> Self {
        self.options = options;
        self
    }
}

impl fmt::Debug for CustomValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomValidator")
            .field("name", &self.name)
            .finish()
    }
}

impl Validator for CustomValidator {
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
        (self.f)(data, context)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompositeMode {
    /// Runs every validator and merges the results.
    #[default]
    All,
    /// Returns the first valid result, or all results merged when none is valid.
    Any,
    /// Runs validators in order, stopping at the first invalid result when `stop_on_error` is set.
    Sequential,
}

#[derive(Debug)]
pub struct CompositeValidator {
    name: String,
    mode: CompositeMode,
    validators: Vec<Arc<dyn Validator>>,
    options: ValidatorOptions,
    stats: ValidatorStats,
}

impl CompositeValidator {
    /// Creates a new composite validator.
    pub fn new(
        name: impl Into<String>,
        mode: CompositeMode,
        validators: Vec<Arc<dyn Validator>>,
    ) -> Self {
        Self {
            name: name.into(),
            mode,
            validators,
            options: ValidatorOptions::default(),
            stats: ValidatorStats::default(),
        }
    }

    pub fn with_options(mut self, options: ValidatorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn validators(&self) -> &[Arc<dyn Validator>] {
        &self.validators
    }
}

impl Validator for CompositeValidator {
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
        let mut merged = ValidationResult::valid();

        for validator in &self.validators {
            let result = validator.validate(data, context);
            match self.mode {
                CompositeMode::Any if result.valid => return result,
                CompositeMode::Sequential if !result.valid => {
                    let stop = self.options.stop_on_error || validator.options().stop_on_error;
                    merged.merge(result);
                    if stop {
                        break;
                    }
                }
                _ => merged.merge(result),
            }
        }

        merged
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::validation::result::ValidationIssue;
    use crate::validation::schema::JsonType;
    use crate::validation::type_check::TypeValidator;

    fn failing(name: &'static str) -> Arc<dyn Validator> {
        Arc::new(CustomValidator::new(name, move |_, _| {
            ValidationResult::invalid(ValidationIssue::error("", name))
        }))
    }

    fn passing() -> Arc<dyn Validator> {
        Arc::new(TypeValidator::new("object", JsonType::Object))
    }

    #[test]
    fn all_merges_everything() {
        let composite = CompositeValidator::new(
            "all",
            CompositeMode::All,
            vec![failing("a"), passing(), failing("b")],
        );

        let result = composite.validate(&json!({}), &ValidationContext::default());
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn any_returns_the_first_valid_result() {
        let composite = CompositeValidator::new(
            "any",
            CompositeMode::Any,
            vec![failing("a"), passing(), failing("b")],
        );
        assert!(composite.validate(&json!({}), &ValidationContext::default()).valid);

        let none = CompositeValidator::new("any", CompositeMode::Any, vec![failing("a"), failing("b")]);
        assert_eq!(
            none.validate(&json!({}), &ValidationContext::default()).errors.len(),
            2
        );
    }

    #[test]
    fn sequential_stops_on_error_when_asked() {
        let composite = CompositeValidator::new(
            "seq",
            CompositeMode::Sequential,
            vec![failing("a"), failing("b")],
        )
        .with_options(ValidatorOptions {
            enabled: true,
            stop_on_error: true,
        });

        let result = composite.validate(&json!({}), &ValidationContext::default());
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].message, "a");
    }
}
