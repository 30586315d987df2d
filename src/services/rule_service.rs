//! Override rule evaluation.
//!
//! Rules are loaded once per run from a JSON array. Patterns are compiled at
//! load time, so a bad regex fails the run before any message is touched.

use std::path::{Path, PathBuf};

use regex::{Regex, RegexBuilder};
use thiserror::Error;

use crate::domain::{Decision, DecisionSource, Message, OverrideRule, RuleField, RuleOperator};

/// Errors that can occur while loading override rules.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("Failed to read rules file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid rules file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("rule '{rule}': invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        rule: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("rule '{rule}': {message}")]
    InvalidCondition { rule: String, message: String },
}

/// Result type for rule operations.
pub type Result<T> = std::result::Result<T, RuleError>;

/// The outcome of the first matching rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub rule_name: String,
    /// Decision with `source = override`; labels are not normalized yet.
    pub decision: Decision,
    /// Ask the model anyway and merge its labels into the decision.
    pub merge_model_labels: bool,
}

enum Test {
    Equals(String),
    Contains(String),
    Matches(Regex),
    GreaterThan(u64),
    LessThan(u64),
    SizeEquals(u64),
}

struct CompiledCondition {
    field: RuleField,
    test: Test,
}

impl CompiledCondition {
    fn compile(rule: &str, field: RuleField, operator: RuleOperator, value: &str) -> Result<Self> {
        let invalid = |message: String| RuleError::InvalidCondition {
            rule: rule.to_string(),
            message,
        };
        let number = || {
            value
                .trim()
                .parse::<u64>()
                .map_err(|_| invalid(format!("'{}' is not a byte count", value)))
        };

        let test = match (field, operator) {
            (RuleField::Size, RuleOperator::GreaterThan) => Test::GreaterThan(number()?),
            (RuleField::Size, RuleOperator::LessThan) => Test::LessThan(number()?),
            (RuleField::Size, RuleOperator::Equals) => Test::SizeEquals(number()?),
            (RuleField::Size, op) => {
                return Err(invalid(format!("size does not support {:?}", op)));
            }
            (_, op) if op.is_numeric() => {
                return Err(invalid(format!("{:?} only applies to size", op)));
            }
            (_, RuleOperator::Equals) => Test::Equals(value.trim().to_lowercase()),
            (_, RuleOperator::Contains) => Test::Contains(value.to_lowercase()),
            (_, _) => Test::Matches(
                RegexBuilder::new(value)
                    .case_insensitive(true)
                    .build()
                    .map_err(|source| RuleError::InvalidPattern {
                        rule: rule.to_string(),
                        pattern: value.to_string(),
                        source,
                    })?,
            ),
        };

        Ok(Self { field, test })
    }

    fn matches(&self, message: &Message) -> bool {
        match self.field {
            RuleField::From => self.matches_text(&message.from),
            RuleField::Subject => self.matches_text(message.subject.as_deref().unwrap_or("")),
            RuleField::Body => self.matches_text(message.body_text.as_deref().unwrap_or("")),
            RuleField::Labels => message
                .decision
                .as_ref()
                .is_some_and(|current| current.decision.labels.iter().any(|l| self.matches_text(l))),
            RuleField::Size => match &self.test {
                Test::GreaterThan(n) => message.size_bytes > *n,
                Test::LessThan(n) => message.size_bytes < *n,
                Test::SizeEquals(n) => message.size_bytes == *n,
                _ => false,
            },
        }
    }

    fn matches_text(&self, text: &str) -> bool {
        match &self.test {
            Test::Equals(expected) => text.trim().to_lowercase() == *expected,
            Test::Contains(needle) => text.to_lowercase().contains(needle.as_str()),
            Test::Matches(re) => re.is_match(text),
            _ => false,
        }
    }
}

struct CompiledRule {
    rule: OverrideRule,
    conditions: Vec<CompiledCondition>,
}

/// Override rules in evaluation order.
#[derive(Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl std::fmt::Debug for RuleSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.rules.iter().map(|r| &r.rule.name))
            .finish()
    }
}

impl RuleSet {
    /// An empty rule set; nothing overrides the model.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compiles rules, ordering them by priority (highest first, ties keep
    /// their original order).
    pub fn new(rules: Vec<OverrideRule>) -> Result<Self> {
        let mut compiled = rules
            .into_iter()
            .map(|rule| {
                if rule.when.is_empty() {
                    return Err(RuleError::InvalidCondition {
                        rule: rule.name.clone(),
                        message: "rule has no conditions".to_string(),
                    });
                }
                let conditions = rule
                    .when
                    .iter()
                    .map(|c| CompiledCondition::compile(&rule.name, c.field, c.operator, &c.value))
                    .collect::<Result<Vec<_>>>()?;
                Ok(CompiledRule { rule, conditions })
            })
            .collect::<Result<Vec<_>>>()?;

        compiled.sort_by(|a, b| b.rule.priority.cmp(&a.rule.priority));
        Ok(Self { rules: compiled })
    }

    /// Loads rules from a JSON file. A missing file means no rules.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = match std::fs::read_to_string(path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No rules file, model decides alone");
                return Ok(Self::empty());
            }
            Err(source) => {
                return Err(RuleError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let rules: Vec<OverrideRule> = serde_json::from_str(&json).map_err(|source| RuleError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let set = Self::new(rules)?;
        tracing::info!(path = %path.display(), rules = set.len(), "Loaded override rules");
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Returns the decision of the first rule whose conditions all hold.
    pub fn evaluate(&self, message: &Message, cycle: &str) -> Option<RuleMatch> {
        let matched = self
            .rules
            .iter()
            .find(|r| r.conditions.iter().all(|c| c.matches(message)))?;

        let rule = &matched.rule;
        let decision = Decision::new(rule.disposition, DecisionSource::Override, cycle)
            .with_labels(rule.labels.iter().cloned())
            .with_reason(format!("rule: {}", rule.name));

        Some(RuleMatch {
            rule_name: rule.name.clone(),
            decision,
            merge_model_labels: rule.merge_model_labels,
        })
    }
}
