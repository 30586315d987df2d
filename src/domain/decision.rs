//! Decision domain types.
//!
//! A [`Decision`] is the outcome of classifying one message in one cycle:
//! what to do with it, which labels it gets, and where that came from.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::DecisionVersion;

/// What should happen to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    Keep,
    Archive,
    Delete,
}

impl Disposition {
    pub const ALL: [Disposition; 3] = [Disposition::Keep, Disposition::Archive, Disposition::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Keep => "keep",
            Disposition::Archive => "archive",
            Disposition::Delete => "delete",
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when text is not one of the three dispositions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown disposition: {0:?}")]
pub struct UnknownDisposition(pub String);

impl FromStr for Disposition {
    type Err = UnknownDisposition;

    /// Parses a disposition, ignoring case and surrounding whitespace.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keep" => Ok(Disposition::Keep),
            "archive" => Ok(Disposition::Archive),
            "delete" => Ok(Disposition::Delete),
            _ => Err(UnknownDisposition(s.to_string())),
        }
    }
}

/// Provenance of a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionSource {
    /// Parsed from model output.
    Model,
    /// Produced by a user override rule.
    Override,
    /// Conservative default after the model output could not be parsed.
    Fallback,
}

impl DecisionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionSource::Model => "model",
            DecisionSource::Override => "override",
            DecisionSource::Fallback => "fallback",
        }
    }
}

impl fmt::Display for DecisionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecisionSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "model" => Ok(DecisionSource::Model),
            "override" => Ok(DecisionSource::Override),
            "fallback" => Ok(DecisionSource::Fallback),
            other => Err(format!("unknown decision source: {}", other)),
        }
    }
}

/// A classification outcome for one message in one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub disposition: Disposition,
    pub labels: BTreeSet<String>,
    pub source: DecisionSource,
    /// Model confidence in `[0, 1]`, when reported.
    pub confidence: Option<f32>,
    /// Model reason, rule name, or fallback cause.
    pub reason: Option<String>,
    /// One-line summary from the model.
    pub summary: Option<String>,
    /// Raw generated text, kept for audit and debugging.
    pub raw_model_output: Option<String>,
    /// Cycle identifier this decision was made under.
    pub cycle: String,
}

impl Decision {
    pub fn new(disposition: Disposition, source: DecisionSource, cycle: impl Into<String>) -> Self {
        Self {
            disposition,
            labels: BTreeSet::new(),
            source,
            confidence: None,
            reason: None,
            summary: None,
            raw_model_output: None,
            cycle: cycle.into(),
        }
    }

    /// The decision recorded when model output cannot be salvaged.
    pub fn fallback(cycle: impl Into<String>, raw_output: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(Disposition::Keep, DecisionSource::Fallback, cycle)
            .with_raw_output(raw_output)
            .with_reason(reason)
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_raw_output(mut self, raw: impl Into<String>) -> Self {
        self.raw_model_output = Some(raw.into());
        self
    }

    /// Returns true if both decisions would leave the mailbox in the same state.
    pub fn same_outcome(&self, other: &Decision) -> bool {
        self.disposition == other.disposition && self.labels == other.labels
    }
}

/// A decision as persisted in the store, with its version stamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDecision {
    pub version: DecisionVersion,
    pub decision: Decision,
    pub decided_at: DateTime<Utc>,
    /// Set once this version has been applied to the remote mailbox.
    pub applied_at: Option<DateTime<Utc>>,
}

impl StoredDecision {
    pub fn is_applied(&self) -> bool {
        self.applied_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposition_parses_case_insensitively() {
        assert_eq!(" Archive ".parse::<Disposition>(), Ok(Disposition::Archive));
        assert_eq!("DELETE".parse::<Disposition>(), Ok(Disposition::Delete));
        assert!("trash".parse::<Disposition>().is_err());
        assert!("keep|archive".parse::<Disposition>().is_err());
    }

    #[test]
    fn disposition_serde_is_lowercase() {
        assert_eq!(serde_json::to_string(&Disposition::Keep).unwrap(), "\"keep\"");
        let parsed: Disposition = serde_json::from_str("\"archive\"").unwrap();
        assert_eq!(parsed, Disposition::Archive);
    }

    #[test]
    fn fallback_is_keep() {
        let decision = Decision::fallback("c1", "garbage", "unparseable");
        assert_eq!(decision.disposition, Disposition::Keep);
        assert_eq!(decision.source, DecisionSource::Fallback);
        assert!(decision.labels.is_empty());
        assert_eq!(decision.raw_model_output.as_deref(), Some("garbage"));
    }

    #[test]
    fn confidence_is_clamped() {
        let decision = Decision::new(Disposition::Keep, DecisionSource::Model, "c1")
            .with_confidence(1.7);
        assert_eq!(decision.confidence, Some(1.0));
    }

    #[test]
    fn same_outcome_ignores_provenance() {
        let a = Decision::new(Disposition::Archive, DecisionSource::Model, "c1")
            .with_labels(["News"])
            .with_confidence(0.4);
        let b = Decision::new(Disposition::Archive, DecisionSource::Override, "c2")
            .with_labels(["News"]);
        assert!(a.same_outcome(&b));
    }
}
