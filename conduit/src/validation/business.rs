use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::ConduitResult;
use crate::types::json_path;
use crate::validation::condition::Condition;
use crate::validation::result::{Severity, ValidationIssue, ValidationResult};
use crate::validation::schema::Format;
use crate::validation::validator::{ValidationContext, Validator, ValidatorOptions, ValidatorStats};

/// Built-in checks a rule can reference by name. They apply to the rule's field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NamedCheck {
    /// Present and not null.
    Required,
    /// Present, not null, and not an empty string, array or object.
    NotEmpty,
    Email,
    Uuid,
    Positive,
    NonNegative,
}

impl NamedCheck {
    fn passes(&self, value: Option<&Json>) -> bool {
        let value = value.filter(|value| !value.is_null());
        match self {
            NamedCheck::Required => value.is_some(),
            NamedCheck::NotEmpty => value.is_some_and(|value| match value {
                Json::String(text) => !text.trim().is_empty(),
                Json::Array(items) => !items.is_empty(),
                Json::Object(map) => !map.is_empty(),
                _ => true,
            }),
            NamedCheck::Email => value
                .and_then(Json::as_str)
                .is_some_and(|text| Format::Email.matches(text)),
            NamedCheck::Uuid => value
                .and_then(Json::as_str)
                .is_some_and(|text| Format::Uuid.matches(text)),
            NamedCheck::Positive => value.and_then(Json::as_f64).is_some_and(|n| n > 0.0),
            NamedCheck::NonNegative => value.and_then(Json::as_f64).is_some_and(|n| n >= 0.0),
        }
    }
}

pub type RuleFn = Arc<dyn Fn(&Json) -> bool + Send + Sync>;

/// What a rule asserts about a document.
#[derive(Clone)]
pub enum RuleCheck {
    /// The document matches a condition.
    Predicate(Condition),
    /// The rule's field passes a built-in check.
    Named(NamedCheck),
    /// The document passes another validator.
    Validator(Arc<dyn Validator>),
    Custom(RuleFn),
}

impl fmt::Debug for RuleCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleCheck::Predicate(condition) => f.debug_tuple("Predicate").field(condition).finish(),
            RuleCheck::Named(check) => f.debug_tuple("Named").field(check).finish(),
            RuleCheck::Validator(validator) => {
                f.debug_tuple("Validator").field(&validator.name()).finish()
            }
            RuleCheck::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusinessRule {
    pub name: String,
    pub field: Option<String>,
    /// The rule only applies to documents matching this condition.
    pub condition: Option<Condition>,
    pub severity: Severity,
    pub check: RuleCheck,
    pub message: Option<String>,
}

impl BusinessRule {
    /// Creates a new rule applying `check` to the whole record.
    pub fn new(name: impl Into<String>, check: RuleCheck) -> Self {
        Self {
            name: name.into(),
            field: None,
            condition: None,
            severity: Severity::Error,
            check,
            message: None,
        }
    }

    /// Creates a new rule applying `check` to the value of `field`.
    pub fn named(name: impl Into<String>, field: impl Into<String>, check: NamedCheck) -> Self {
        Self::new(name, RuleCheck::Named(check)).on_field(field)
    }

    /// Creates a new rule failing when `condition` does not match the record.
    pub fn predicate(name: impl Into<String>, condition: Condition) -> Self {
        Self::new(name, RuleCheck::Predicate(condition))
    }

    /// Creates a new rule from a function of the whole record.
    pub fn custom<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Json) -> bool + Send + Sync + 'static,
    {
        Self::new(name, RuleCheck::Custom(Arc::new(f)))
    }

    pub fn on_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// Only applies the rule to records matching `condition`.
    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    fn evaluate(&self, data: &Json, context: &ValidationContext) -> ValidationResult {
        if self
            .condition
            .as_ref()
            .is_some_and(|condition| !condition.matches(data))
        {
            return ValidationResult::valid();
        }

        let passed = match &self.check {
            RuleCheck::Predicate(condition) => condition.matches(data),
            RuleCheck::Named(check) => {
                check.passes(json_path(data, self.field.as_deref().unwrap_or_default()))
            }
            RuleCheck::Custom(f) => f(data),
            RuleCheck::Validator(validator) => {
                let mut result = validator.validate(data, context);
                if self.severity != Severity::Error {
                    // A softer rule reports the nested errors at its own severity.
                    for mut issue in result.errors.drain(..) {
                        issue.severity = self.severity;
                        match self.severity {
                            Severity::Info => result.suggestions.push(issue.message),
                            _ => result.warnings.push(issue),
                        }
                    }
                    result.valid = true;
                }
                return result;
            }
        };

        if passed {
            return ValidationResult::valid();
        }

        let message = self
            .message
            .clone()
            .unwrap_or_else(|| format!("Rule '{}' failed", self.name));
        let field = context.field_path(self.field.as_deref().unwrap_or_default());
        let mut result = ValidationResult::valid();
        result.push(
            ValidationIssue::new(field, message, self.severity)
                .with_details(serde_json::json!({ "rule": self.name })),
        );

        result
    }
}

/// Serialized form of a [`BusinessRule`].
///
/// Exactly one of `predicate` and `check` is expected; `predicate` wins when both are set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDefinition {
    pub name: String,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub condition: Option<Json>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub predicate: Option<Json>,
    #[serde(default)]
    pub check: Option<NamedCheck>,
    #[serde(default)]
    pub message: Option<String>,
}

impl TryFrom<&RuleDefinition> for BusinessRule {
    type Error = crate::error::ConduitError;

    fn try_from(definition: &RuleDefinition) -> ConduitResult<Self> {
        let check = match (&definition.predicate, definition.check) {
            (Some(predicate), _) => RuleCheck::Predicate(Condition::parse(predicate)?),
            (None, Some(check)) => RuleCheck::Named(check),
            (None, None) => RuleCheck::Named(NamedCheck::Required),
        };

        Ok(BusinessRule {
            name: definition.name.clone(),
            field: definition.field.clone(),
            condition: definition
                .condition
                .as_ref()
                .map(Condition::parse)
                .transpose()?,
            severity: definition.severity,
            check,
            message: definition.message.clone(),
        })
    }
}

/// Evaluates a list of business rules in order.
#[derive(Debug)]
pub struct BusinessRuleValidator {
    name: String,
    rules: Vec<BusinessRule>,
    options: ValidatorOptions,
    stats: ValidatorStats,
}

impl BusinessRuleValidator {
    /// Creates a new validator over `rules`.
    pub fn new(name: impl Into<String>, rules: Vec<BusinessRule>) -> Self {
        Self {
            name: name.into(),
            rules,
            options: ValidatorOptions::default(),
            stats: ValidatorStats::default(),
        }
    }

    /// Creates a new validator from declarative rule definitions.
    pub fn from_definitions(
        name: impl Into<String>,
        definitions: &[RuleDefinition],
    ) -> ConduitResult<Self> {
        let rules = definitions
            .iter()
            .map(BusinessRule::try_from)
            .collect::<ConduitResult<Vec<_>>>()?;

        Ok(Self::new(name, rules))
    }

    pub fn with_options(mut self, options: ValidatorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn rules(&self) -> &[BusinessRule] {
        &self.rules
    }
}

impl Validator for BusinessRuleValidator {
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
        for rule in &self.rules {
            result.merge(rule.evaluate(data, context));
            if self.options.stop_on_error && !result.valid {
                break;
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::validation::schema::JsonType;
    use crate::validation::type_check::TypeValidator;

    #[test]
    fn rules_report_at_their_severity() {
        let validator = BusinessRuleValidator::new(
            "users",
            vec![
                BusinessRule::named("name required", "name", NamedCheck::Required),
                BusinessRule::predicate(
                    "adult",
                    Condition::parse(&json!({"age": {"$gte": 18}})).unwrap(),
                )
                .on_field("age")
                .with_severity(Severity::Warning)
                .with_message("Should be an adult"),
            ],
        );

        let result = validator.validate(&json!({"age": 12}), &ValidationContext::default());
        assert!(!result.valid);
        assert_eq!(result.errors[0].field, "name");
        assert_eq!(result.warnings[0].message, "Should be an adult");
    }

    #[test]
    fn conditions_gate_rules() {
        let rule = BusinessRule::named("vat id", "vatId", NamedCheck::NotEmpty)
            .when(Condition::parse(&json!({"country": "FR"})).unwrap());
        let validator = BusinessRuleValidator::new("companies", vec![rule]);
        let context = ValidationContext::default();

        assert!(validator.validate(&json!({"country": "US"}), &context).valid);
        assert!(!validator.validate(&json!({"country": "FR", "vatId": " "}), &context).valid);
    }

    #[test]
    fn stop_on_error_keeps_the_first_failure() {
        let validator = BusinessRuleValidator::new(
            "strict",
            vec![
                BusinessRule::custom("never", |_| false),
                BusinessRule::named("id", "id", NamedCheck::Positive),
            ],
        )
        .with_options(ValidatorOptions {
            enabled: true,
            stop_on_error: true,
        });

        let result = validator.validate(&json!({"id": -1}), &ValidationContext::default());
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].message, "Rule 'never' failed");
    }

    #[test]
    fn rules_can_delegate_to_validators() {
        let nested: Arc<dyn Validator> =
            Arc::new(TypeValidator::new("id type", JsonType::Integer).for_field("id"));
        let rule = BusinessRule::new("typed id", RuleCheck::Validator(nested))
            .with_severity(Severity::Warning);
        let validator = BusinessRuleValidator::new("delegating", vec![rule]);

        let result = validator.validate(&json!({"id": "x"}), &ValidationContext::default());
        assert!(result.valid);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn definitions_are_parsed() {
        let definitions: Vec<RuleDefinition> = serde_json::from_value(json!([
            {"name": "name required", "field": "name", "check": "required"},
            {"name": "positive", "predicate": {"amount": {"$gt": 0}}, "severity": "warning"}
        ]))
        .unwrap();

        let validator = BusinessRuleValidator::from_definitions("orders", &definitions).unwrap();
        let result = validator.validate(&json!({"name": null, "amount": 0}), &ValidationContext::default());

        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.warnings.len(), 1);
    }
}
