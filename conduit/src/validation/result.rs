use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Error,
    Warning,
    Info,
}

/// One finding of a validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    /// Dot separated path of the offending field, empty for the whole document.
    pub field: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

impl ValidationIssue {
    /// Creates a new issue on `field`.
    pub fn new(field: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            details: None,
            severity,
            timestamp: Utc::now(),
        }
    }

    pub fn error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(field, message, Severity::Error)
    }

    pub fn warning(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(field, message, Severity::Warning)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Outcome of a validation.
///
/// Results merge associatively: the merged result is invalid when either side is, and the lists
/// of both sides are concatenated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    pub suggestions: Vec<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::valid()
    }
}

impl ValidationResult {
    /// Creates a new result without issues.
    pub fn valid() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            suggestions: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Creates a new result holding one issue.
    pub fn invalid(issue: ValidationIssue) -> Self {
        let mut result = Self::valid();
        result.push(issue);
        result
    }

    /// Files an issue by its severity. Only errors make the result invalid.
    pub fn push(&mut self, issue: ValidationIssue) {
        match issue.severity {
            Severity::Error => {
                self.valid = false;
                self.errors.push(issue);
            }
            Severity::Warning => self.warnings.push(issue),
            Severity::Info => self.suggestions.push(issue.message),
        }
    }

    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.push(ValidationIssue::error(field, message));
    }

    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.push(ValidationIssue::warning(field, message));
    }

    /// Adds the issues of `other`.
    pub fn merge(&mut self, other: ValidationResult) {
        self.valid &= other.valid;
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self.suggestions.extend(other.suggestions);
        self.metadata.extend(other.metadata);
    }

    pub fn merged(mut self, other: ValidationResult) -> Self {
        self.merge(other);
        self
    }

    /// Turns every warning into an error.
    pub fn promote_warnings(&mut self) {
        for mut warning in self.warnings.drain(..) {
            warning.severity = Severity::Error;
            self.errors.push(warning);
        }
        self.valid = self.errors.is_empty();
    }

    /// Joins the error messages into one line, e.g. for an error detail.
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|issue| {
                if issue.field.is_empty() {
                    issue.message.clone()
                } else {
                    format!("{}: {}", issue.field, issue.message)
                }
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}
