//! Domain layer types for mailsift.
//!
//! Messages, decisions, override rules, and the mutations that carry a
//! decision to the remote mailbox.

mod action;
mod decision;
mod email;
mod label;
mod rule;
mod types;

pub use action::{ActionLogEntry, ActionOutcome, ApplyMode, Mutation, MutationSet};
pub use decision::{Decision, DecisionSource, Disposition, StoredDecision, UnknownDisposition};
pub use email::{Message, NewMessage};
pub use label::{
    all_markers, clean_label, disposition_marker, normalize_labels, system_labels,
    DEFAULT_MARKER_PREFIX, MAX_LABELS,
};
pub use rule::{Condition, OverrideRule, RuleField, RuleOperator};
pub use types::{DecisionVersion, EmailId, RemoteId};
