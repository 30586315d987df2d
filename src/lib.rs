//! mailsift - sort a mailbox with a local language model
//!
//! This crate decides keep/archive/delete plus labels for stored messages
//! using a local model and user override rules, records every decision with a
//! version, and syncs the result to Gmail with a dry-run default and an
//! append-only audit log.

pub mod app;
pub mod config;
pub mod domain;
pub mod providers;
pub mod services;
pub mod storage;

pub use app::{App, Cli, RunStatus};
