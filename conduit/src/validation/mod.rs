//! Composable validators over JSON documents.
//!
//! Every validator implements [`Validator`] and produces a [`ValidationResult`]. Results merge
//! associatively, so validators compose freely through [`CompositeValidator`] and business rules.
//! A shared [`ValidationCache`] memoizes results across runs.

mod business;
mod cache;
mod composite;
mod condition;
mod result;
mod schema;
mod type_check;
mod validator;

pub use business::{
    BusinessRule, BusinessRuleValidator, NamedCheck, RuleCheck, RuleDefinition, RuleFn,
};
pub use cache::{CacheStats, ValidationCache};
pub use composite::{CompositeMode, CompositeValidator, CustomValidator, ValidateFn};
pub use condition::{Condition, ConditionFn, FieldOp, json_compare, json_equals};
pub use result::{Severity, ValidationIssue, ValidationResult};
pub use schema::{CustomCheck, Format, JsonType, SchemaNode, SchemaValidator, TypeSpec, coerce};
pub use type_check::TypeValidator;
pub use validator::{
    ValidationContext, Validator, ValidatorMetrics, ValidatorOptions, ValidatorStats,
};
