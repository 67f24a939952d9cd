//! One-shot administrative commands.

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::time::sleep;
use tracing::info;

use super::Command;
use crate::broker::JobId;
use crate::client::ChannelRegistry;
use crate::core::ClientConfig;

#[derive(Serialize)]
struct PurgeOutput<'a> {
    queue: &'a str,
    purged: u64,
}

#[derive(Serialize)]
struct DeleteOutput<'a> {
    queue: &'a str,
    deleted: bool,
    messages: u64,
}

#[derive(Serialize)]
struct SendOutput<'a> {
    queue: &'a str,
    job: JobId,
    bytes: usize,
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Run a one-shot command, print its result and wait out the close grace
/// period so in-flight sends can drain.
pub async fn run_admin(
    command: Command,
    registry: &ChannelRegistry,
    config: &ClientConfig,
    payload: Option<&str>,
) -> Result<()> {
    let queue = config.channel.as_str();

    match command {
        Command::CheckQueue => {
            let channel = registry.create_channel(Some(queue)).await?;
            let stats = channel
                .inspect()
                .await
                .with_context(|| format!("check queue {queue}"))?;
            print_json(&stats)?;
        }
        Command::PurgeQueue => {
            let channel = registry.create_channel(Some(queue)).await?;
            let purged = channel
                .purge()
                .await
                .with_context(|| format!("purge queue {queue}"))?;
            info!(queue, purged, "queue purged");
            print_json(&PurgeOutput { queue, purged })?;
        }
        Command::DeleteQueue => {
            let channel = registry.create_channel(Some(queue)).await?;
            let messages = channel
                .remove()
                .await
                .with_context(|| format!("delete queue {queue}"))?;
            info!(queue, messages, "queue deleted");
            print_json(&DeleteOutput {
                queue,
                deleted: true,
                messages,
            })?;
        }
        Command::SendToQueue => {
            let payload = payload.context("sendToQueue requires a JOB argument")?;
            let channel = registry.create_channel(Some(queue)).await?;
            let job = channel
                .enqueue(payload.as_bytes(), &config.put)
                .await
                .with_context(|| format!("send to queue {queue}"))?;
            info!(queue, %job, "job enqueued");
            print_json(&SendOutput {
                queue,
                job,
                bytes: payload.len(),
            })?;
        }
        Command::ListQueues => {
            let queues = registry.list_remote().await.context("list queues")?;
            print_json(&queues)?;
        }
        Command::Consume => anyhow::bail!("consume is not a one-shot command"),
    }

    sleep(config.close_grace).await;
    Ok(())
}
