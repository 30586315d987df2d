//! mailsift - Entry point for the command-line tool

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use mailsift::{App, Cli, RunStatus};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Stop cleanly between messages on Ctrl-C
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, finishing the current message");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let result = match App::new(cli.config, cli.db, stop) {
        Ok(app) => app.run(cli.command).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(RunStatus::Clean) => {}
        Ok(RunStatus::WithFailures) => {
            tracing::warn!("Some messages failed, see the summary above");
            std::process::exit(2);
        }
        Err(e) => {
            tracing::error!("Application error: {:#}", e);
            std::process::exit(1);
        }
    }
}
