//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::domain::Disposition;

/// mailsift - sort a mailbox with a local language model
#[derive(Parser, Debug)]
#[command(name = "mailsift")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the settings file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to the message database
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load message records (JSON Lines) into the store
    Import {
        /// Input file, one message record per line
        file: PathBuf,
    },

    /// Decide keep/archive/delete for unprocessed messages
    Decide(DecideArgs),

    /// Re-evaluate override rules over decided messages
    Overrides(OverridesArgs),

    /// Sync decided labels and archiving to the mailbox
    Apply(ApplyArgs),

    /// Move messages with an applied delete decision to trash
    Purge(SyncArgs),

    /// Show store counts and pending changes
    Preview {
        /// Pending changes to list
        #[arg(long, default_value = "20")]
        limit: usize,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write the current decisions as JSON Lines
    Export {
        /// Output file (appended to)
        #[arg(long)]
        out: PathBuf,
    },

    /// Print the audit log as a table
    Review {
        /// Only show entries of the most recent run
        #[arg(long)]
        last_run: bool,
    },

    /// Store Gmail OAuth credentials in the OS keychain
    Auth(AuthArgs),
}

#[derive(Args, Debug, Default)]
pub struct DecideArgs {
    /// Model name (overrides settings)
    #[arg(long)]
    pub model: Option<String>,

    /// Maximum messages to decide
    #[arg(long)]
    pub limit: Option<usize>,

    /// Decision cycle identifier (overrides settings)
    #[arg(long)]
    pub cycle: Option<String>,

    /// Decide again even if already decided in this cycle
    #[arg(long)]
    pub reprocess: bool,

    /// Override rules file (overrides settings)
    #[arg(long)]
    pub rules: Option<PathBuf>,

    /// Stream a decision record per message to this file
    #[arg(long)]
    pub out_jsonl: Option<PathBuf>,
}

#[derive(Args, Debug, Default)]
pub struct OverridesArgs {
    /// Override rules file (overrides settings)
    #[arg(long)]
    pub rules: Option<PathBuf>,

    /// Decision cycle identifier (overrides settings)
    #[arg(long)]
    pub cycle: Option<String>,

    /// Supersede decisions that were already applied
    #[arg(long)]
    pub force: bool,

    /// Maximum messages to examine
    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Args, Debug, Default)]
pub struct ApplyArgs {
    #[command(flatten)]
    pub sync: SyncArgs,

    /// Apply only decisions with this disposition (all by default)
    #[arg(long, value_name = "keep|archive|delete")]
    pub only: Option<Disposition>,
}

#[derive(Args, Debug, Default)]
pub struct SyncArgs {
    /// Execute against the mailbox (dry-run otherwise)
    #[arg(long)]
    pub real: bool,

    /// Maximum messages to process
    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Args, Debug)]
pub struct AuthArgs {
    /// OAuth client id
    #[arg(long)]
    pub client_id: String,

    /// OAuth client secret
    #[arg(long)]
    pub client_secret: String,

    /// Long-lived refresh token with the gmail.modify scope
    #[arg(long)]
    pub refresh_token: String,

    /// Keychain account name (overrides settings)
    #[arg(long)]
    pub account: Option<String>,

    /// Skip the token exchange check
    #[arg(long)]
    pub no_verify: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_defaults_to_dry_run() {
        let cli = Cli::parse_from(["mailsift", "apply"]);
        match cli.command {
            Command::Apply(args) => {
                assert!(!args.sync.real);
                assert_eq!(args.sync.limit, None);
                assert_eq!(args.only, None);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn apply_only_takes_a_disposition() {
        let cli = Cli::parse_from(["mailsift", "apply", "--only", "Archive", "--real"]);
        match cli.command {
            Command::Apply(args) => {
                assert_eq!(args.only, Some(Disposition::Archive));
                assert!(args.sync.real);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(Cli::try_parse_from(["mailsift", "apply", "--only", "trash"]).is_err());
        assert!(Cli::try_parse_from(["mailsift", "purge", "--only", "delete"]).is_err());
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::parse_from([
            "mailsift",
            "decide",
            "--model",
            "llama3",
            "--limit",
            "5",
            "--reprocess",
            "--db",
            "/tmp/m.db",
        ]);
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/m.db")));
        match cli.command {
            Command::Decide(args) => {
                assert_eq!(args.model.as_deref(), Some("llama3"));
                assert_eq!(args.limit, Some(5));
                assert!(args.reprocess);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
