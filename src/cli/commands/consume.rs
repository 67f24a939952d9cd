//! The `consume` command: print jobs as they arrive until interrupted.

use anyhow::{Context, Result};
use base64::Engine;
use chrono::Utc;
use serde::Serialize;
use std::io::Write;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::broker::{Job, JobId};
use crate::cli::OutputFormat;
use crate::client::{handler_fn, ChannelRegistry, Consumer};
use crate::core::ClientConfig;

/// Wait for shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() -> Result<&'static str> {
    let mut sigint = signal(SignalKind::interrupt()).context("register SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("register SIGTERM handler")?;

    Ok(tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    })
}

pub async fn run_consume(
    registry: &ChannelRegistry,
    config: &ClientConfig,
    format: OutputFormat,
) -> Result<()> {
    let channel = registry.create_channel(Some(&config.channel)).await?;
    let cancel = CancellationToken::new();
    let handler = handler_fn(move |job: Job| async move { print_job(format, &job) });
    let consumer = Consumer::new(channel, handler)
        .with_options(config.consumer)
        .with_cancellation(cancel.clone());

    let mut task = tokio::spawn(consumer.run());
    let joined = tokio::select! {
        joined = &mut task => joined,
        signal = shutdown_signal() => {
            info!(signal = signal?, "stopping consumer");
            cancel.cancel();
            task.await
        }
    };
    let report = joined.context("consumer task panicked")??;
    info!(
        processed = report.processed,
        failed = report.failed,
        errors = report.errors,
        "consume finished"
    );
    Ok(())
}

#[derive(Serialize)]
struct JobOutput<'a> {
    ts: String,
    queue: &'a str,
    job: JobId,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    redelivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_b64: Option<String>,
}

fn print_job(format: OutputFormat, job: &Job) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    output_job(&mut stdout, format, job)?;
    stdout.flush()?;
    Ok(())
}

/// Write one consumed job to `out`: a JSON line, or the bare payload.
pub fn output_job(out: &mut impl Write, format: OutputFormat, job: &Job) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let (payload, payload_b64) = match job.text() {
                Some(s) => (Some(s), None),
                None => (
                    None,
                    Some(base64::engine::general_purpose::STANDARD.encode(&job.payload)),
                ),
            };
            let line = JobOutput {
                ts: Utc::now().to_rfc3339(),
                queue: &job.channel,
                job: job.id,
                redelivered: job.redelivered,
                payload,
                payload_b64,
            };
            serde_json::to_writer(&mut *out, &line)?;
            out.write_all(b"\n")?;
        }
        OutputFormat::Raw => {
            out.write_all(&job.payload)?;
            out.write_all(b"\n")?;
        }
    }
    Ok(())
}
