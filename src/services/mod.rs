//! Business services layer.
//!
//! Services sit between the command line and the infrastructure layer:
//!
//! ```text
//! Application Layer (CLI commands)
//!          |
//!          v
//!    Services Layer  <-- You are here
//!          |
//!          v
//! Infrastructure (Providers, Storage)
//! ```
//!
//! # Services Overview
//!
//! - [`DecisionService`]: decides unprocessed messages from rules or the model
//! - [`ApplyService`]: syncs decisions to the mailbox and runs the purge path
//! - [`RuleSet`]: compiled override rules
//! - [`AuditLogger`]: append-only record of every planned or executed mutation

mod apply_service;
mod audit_service;
mod decision_service;
mod record_writer;
mod rule_service;
mod salvage;
mod stats_service;
mod transfer_service;

#[cfg(test)]
mod test_support;

pub use apply_service::{ApplyError, ApplyOptions, ApplyReport, ApplyService};
pub use audit_service::{annotate, last_run_id, read_entries, render_table, AuditError, AuditLogger};
pub use decision_service::{
    build_prompt, DecideOptions, DecideOutcome, DecideReport, DecisionError, DecisionService, OverridesReport,
};
pub use record_writer::{DecisionRecord, DecisionRecordWriter, RecordError, RAW_EXCERPT_CHARS};
pub use rule_service::{RuleError, RuleMatch, RuleSet};
pub use salvage::{salvage, ParseFailure, ParseFailureKind, SalvageMethod, Salvaged};
pub use stats_service::{preview, PendingChange, Preview};
pub use transfer_service::{export_decisions, import_messages, ImportReport, TransferError};
