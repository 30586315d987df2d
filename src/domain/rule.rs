//! Override rule types.
//!
//! Rules are user-authored and loaded from a JSON file. Each rule is a
//! conjunction of conditions and the decision it forces when they all hold.

use serde::{Deserialize, Serialize};

use super::Disposition;

/// A user-authored rule that takes precedence over the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideRule {
    /// Rule name, recorded as the decision reason.
    pub name: String,
    /// Higher priorities are evaluated first.
    #[serde(default)]
    pub priority: i32,
    /// All conditions must match.
    pub when: Vec<Condition>,
    /// Disposition forced by the rule.
    pub disposition: Disposition,
    /// Labels attached by the rule.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Still ask the model, but only to merge its labels.
    #[serde(default)]
    pub merge_model_labels: bool,
}

/// A single `(field, operator, value)` predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub field: RuleField,
    #[serde(rename = "op")]
    pub operator: RuleOperator,
    pub value: String,
}

impl Condition {
    pub fn new(field: RuleField, operator: RuleOperator, value: impl Into<String>) -> Self {
        Self {
            field,
            operator,
            value: value.into(),
        }
    }
}

/// Message field a condition inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleField {
    /// The full `From` header.
    From,
    Subject,
    Body,
    /// Message size in bytes.
    Size,
    /// Labels of the message's current decision; matches if any label does.
    Labels,
}

/// Comparison a condition performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperator {
    /// Case-insensitive equality.
    Equals,
    /// Case-insensitive substring.
    Contains,
    /// Case-insensitive regular expression.
    Matches,
    GreaterThan,
    LessThan,
}

impl RuleOperator {
    pub fn is_numeric(&self) -> bool {
        matches!(self, RuleOperator::GreaterThan | RuleOperator::LessThan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_deserializes_with_defaults() {
        let rule: OverrideRule = serde_json::from_str(
            r#"{
                "name": "bank alerts",
                "when": [{"field": "from", "op": "matches", "value": "@bank\\."}],
                "disposition": "keep"
            }"#,
        )
        .unwrap();

        assert_eq!(rule.priority, 0);
        assert!(rule.labels.is_empty());
        assert!(!rule.merge_model_labels);
        assert_eq!(rule.when[0].operator, RuleOperator::Matches);
        assert_eq!(rule.when[0].field, RuleField::From);
    }

    #[test]
    fn labels_field_name() {
        let condition: Condition =
            serde_json::from_str(r#"{"field": "labels", "op": "equals", "value": "Newsletter"}"#).unwrap();
        assert_eq!(condition.field, RuleField::Labels);
    }

    #[test]
    fn numeric_operators() {
        assert!(RuleOperator::GreaterThan.is_numeric());
        assert!(!RuleOperator::Contains.is_numeric());
    }
}
