//! Command dispatch and wiring.
//!
//! [`App`] loads settings once, opens the store, builds the services a command
//! needs and prints a summary. Failures inside a batch come back as
//! [`RunStatus::WithFailures`] so the binary can exit non-zero after the
//! summary has been printed.

mod cli;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use uuid::Uuid;

pub use cli::{ApplyArgs, AuthArgs, Cli, Command, DecideArgs, OverridesArgs, SyncArgs};

use crate::config::Settings;
use crate::domain::{ApplyMode, Disposition};
use crate::providers::ai::OllamaClient;
use crate::providers::email::{GmailCredentials, GmailMailbox, MailboxApi};
use crate::services::{
    export_decisions, import_messages, last_run_id, preview, read_entries, render_table, ApplyOptions,
    ApplyReport, ApplyService, AuditLogger, DecideOptions, DecisionRecordWriter, DecisionService, RuleSet,
};
use crate::storage::{KeychainAccess, MessageStore, StorageLayer};

/// How a command finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Clean,
    /// The command completed but some messages failed.
    WithFailures,
}

impl RunStatus {
    fn from_failures(failed: bool) -> Self {
        if failed {
            RunStatus::WithFailures
        } else {
            RunStatus::Clean
        }
    }
}

/// Main application entry point
pub struct App {
    settings: Settings,
    db_path: PathBuf,
    stop: Arc<AtomicBool>,
}

impl App {
    /// Loads settings and resolves the database path.
    pub fn new(config: Option<PathBuf>, db: Option<PathBuf>, stop: Arc<AtomicBool>) -> Result<Self> {
        let config_path = match config {
            Some(path) => path,
            None => Settings::default_path().context("Failed to locate settings file")?,
        };
        let settings = Settings::load(&config_path)
            .with_context(|| format!("Failed to load settings from {}", config_path.display()))?;

        let db_path = match db {
            Some(path) => path,
            None => settings
                .paths
                .database_path()
                .context("Failed to locate database")?,
        };

        Ok(Self { settings, db_path, stop })
    }

    /// Builds an app from already loaded settings.
    pub fn with_settings(settings: Settings, db_path: PathBuf, stop: Arc<AtomicBool>) -> Self {
        Self { settings, db_path, stop }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Runs one command.
    pub async fn run(&self, command: Command) -> Result<RunStatus> {
        match command {
            Command::Import { file } => self.import(file).await,
            Command::Decide(args) => self.decide(args).await,
            Command::Overrides(args) => self.overrides(args).await,
            Command::Apply(args) => self.apply(args.sync, args.only, false).await,
            Command::Purge(args) => self.apply(args, None, true).await,
            Command::Preview { limit, json } => self.preview(limit, json).await,
            Command::Export { out } => self.export(out).await,
            Command::Review { last_run } => self.review(last_run),
            Command::Auth(args) => self.auth(args).await,
        }
    }

    async fn store(&self) -> Result<Arc<dyn MessageStore>> {
        let storage = StorageLayer::new(&self.db_path)
            .await
            .with_context(|| format!("Failed to open database {}", self.db_path.display()))?;
        Ok(storage.message_store())
    }

    fn rules(&self, path: Option<PathBuf>) -> Result<Arc<RuleSet>> {
        let path = match path {
            Some(path) => path,
            None => self.settings.paths.rules_path()?,
        };
        let rules = RuleSet::load(&path).with_context(|| format!("Failed to load rules from {}", path.display()))?;
        Ok(Arc::new(rules))
    }

    fn limit(&self, flag: Option<usize>) -> Option<usize> {
        flag.or(self.settings.sync.default_limit)
    }

    fn decide_options(&self, model: Option<String>, cycle: Option<String>, limit: Option<usize>) -> DecideOptions {
        let ai = &self.settings.ai;
        DecideOptions {
            model: model.unwrap_or_else(|| ai.model.clone()),
            params: ai.generation_params(),
            clip_chars: ai.clip_chars,
            cycle: cycle.unwrap_or_else(|| self.settings.decide.cycle.clone()),
            reprocess: false,
            limit: self.limit(limit),
            min_confidence_delete: ai.min_confidence_delete,
            marker_prefix: self.settings.sync.marker_prefix.clone(),
            warm_up: ai.warm_up,
        }
    }

    fn decision_service(&self, store: Arc<dyn MessageStore>, rules: Arc<RuleSet>, options: DecideOptions) -> Result<DecisionService> {
        let ai = &self.settings.ai;
        let client = OllamaClient::new(&ai.base_url, ai.timeout()).context("Failed to create Ollama client")?;
        Ok(DecisionService::new(store, Arc::new(client), rules, options)
            .with_retry(self.settings.retry.policy())
            .with_stop_flag(self.stop.clone()))
    }

    async fn import(&self, file: PathBuf) -> Result<RunStatus> {
        let store = self.store().await?;
        let report = import_messages(&store, &file)
            .await
            .with_context(|| format!("Failed to import {}", file.display()))?;
        println!(
            "imported {} of {} records ({} already present)",
            report.inserted, report.read, report.duplicates
        );
        Ok(RunStatus::Clean)
    }

    async fn decide(&self, args: DecideArgs) -> Result<RunStatus> {
        let store = self.store().await?;
        let rules = self.rules(args.rules)?;
        let options = DecideOptions {
            reprocess: args.reprocess,
            ..self.decide_options(args.model, args.cycle, args.limit)
        };

        let mut service = self.decision_service(store, rules, options)?;
        if let Some(path) = &args.out_jsonl {
            let writer = DecisionRecordWriter::append(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            service = service.with_records(writer);
        }

        let report = service.decide_batch().await.context("Decision pass failed")?;
        println!(
            "selected {}, decided {} (override {}, model {}, fallback {}), generation failures {}{}",
            report.selected,
            report.decided(),
            report.by_override,
            report.by_model,
            report.by_fallback,
            report.generation_failures,
            if report.stopped { ", stopped early" } else { "" }
        );
        Ok(RunStatus::from_failures(report.has_failures()))
    }

    async fn overrides(&self, args: OverridesArgs) -> Result<RunStatus> {
        let store = self.store().await?;
        let rules = self.rules(args.rules)?;
        let options = self.decide_options(None, args.cycle, args.limit);

        let report = self
            .decision_service(store, rules, options)?
            .reapply_overrides(args.force)
            .await
            .context("Override pass failed")?;
        println!(
            "examined {}, changed {}, skipped {} applied{}",
            report.examined,
            report.changed,
            report.skipped_applied,
            if report.skipped_applied > 0 && !args.force {
                " (use --force to supersede them)"
            } else {
                ""
            }
        );
        Ok(RunStatus::Clean)
    }

    async fn apply(&self, args: SyncArgs, only: Option<Disposition>, purge: bool) -> Result<RunStatus> {
        let store = self.store().await?;
        let mode = ApplyMode::from_real_flag(args.real);

        let audit_path = self.settings.paths.audit_log_path()?;
        let audit = AuditLogger::open(&audit_path, Uuid::new_v4())
            .with_context(|| format!("Failed to open audit log {}", audit_path.display()))?;

        let mut mailbox = GmailMailbox::new(&self.settings.sync.gmail_account)?;
        if !mode.is_dry_run() {
            let keychain = KeychainAccess::new();
            mailbox
                .authenticate(&keychain)
                .await
                .context("Gmail authentication failed; run `mailsift auth` again")?;
        }
        let mailbox: Arc<dyn MailboxApi> = Arc::new(mailbox);

        let options = ApplyOptions {
            archive: self.settings.sync.archive,
            marker_prefix: self.settings.sync.marker_prefix.clone(),
            limit: self.limit(args.limit),
            only,
        };
        let service = ApplyService::new(store, mailbox, Arc::new(audit), options)
            .with_retry(self.settings.retry.policy())
            .with_stop_flag(self.stop.clone());

        let report = if purge {
            service.purge(mode).await.context("Purge failed")?
        } else {
            service.apply_batch(mode).await.context("Apply failed")?
        };
        print_apply_report(&report, purge, &audit_path);
        Ok(RunStatus::from_failures(report.has_failures()))
    }

    async fn preview(&self, limit: usize, json: bool) -> Result<RunStatus> {
        let store = self.store().await?;
        let preview = preview(&store, Some(limit)).await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&preview)?);
        } else {
            print!("{}", preview.render());
        }
        Ok(RunStatus::Clean)
    }

    async fn export(&self, out: PathBuf) -> Result<RunStatus> {
        let store = self.store().await?;
        let writer = DecisionRecordWriter::append(&out).with_context(|| format!("Failed to open {}", out.display()))?;
        let written = export_decisions(&store, &writer).await?;
        println!("exported {} decisions to {}", written, out.display());
        Ok(RunStatus::Clean)
    }

    fn review(&self, last_run: bool) -> Result<RunStatus> {
        let path = self.settings.paths.audit_log_path()?;
        let mut entries = read_entries(&path)?;
        if last_run {
            if let Some(run_id) = last_run_id(&entries) {
                entries.retain(|e| e.run_id == run_id);
            }
        }
        if entries.is_empty() {
            println!("no audit entries in {}", path.display());
        } else {
            print!("{}", render_table(&entries));
        }
        Ok(RunStatus::Clean)
    }

    async fn auth(&self, args: AuthArgs) -> Result<RunStatus> {
        let account = args
            .account
            .unwrap_or_else(|| self.settings.sync.gmail_account.clone());
        let credentials = GmailCredentials {
            refresh_token: args.refresh_token,
            client_id: args.client_id,
            client_secret: args.client_secret,
        };

        if !args.no_verify {
            GmailMailbox::new(&account)?
                .with_credentials(credentials.clone())
                .authenticate(&KeychainAccess::new())
                .await
                .context("Credentials were rejected")?;
        }

        GmailMailbox::save_credentials(&KeychainAccess::new(), &account, &credentials)
            .await
            .context("Failed to store credentials")?;
        println!("stored Gmail credentials for {}", account);
        Ok(RunStatus::Clean)
    }
}

fn print_apply_report(report: &ApplyReport, purge: bool, audit_path: &std::path::Path) {
    let verb = if purge { "trash" } else { "change" };
    println!(
        "[{}] selected {}, {} {}, unchanged {}, not found {}, rescued {}, failed {}{}",
        report.mode,
        report.selected,
        verb,
        report.changed,
        report.unchanged,
        report.not_found,
        report.rescued,
        report.failed,
        if report.stopped { ", stopped early" } else { "" }
    );
    println!("audit log: {}", audit_path.display());
}
