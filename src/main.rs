//! jobstats - command-line entrypoint.
//!
//! Usage:
//!   jobstats --queue jobs --command checkQueue
//!   jobstats --backend tube --queue jobs --command sendToQueue '{"id":1}'
//!   jobstats --secure --ca-cert ca.pem --queue jobs --command consume

use clap::Parser;
use jobstats::cli::{commands, Cli};
use jobstats::ops::{init_tracing, LOG_LEVEL_ENV};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = std::env::var(LOG_LEVEL_ENV).ok();
    if let Err(err) = init_tracing(log_level.as_deref(), cli.log_json) {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    match commands::run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
