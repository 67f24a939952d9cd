//! The per-channel job consumer loop.
//!
//! Each cycle walks `Watching → Reserving → Processing → Acknowledging` and
//! then yields to the scheduler before starting the next one. Errors in any
//! stage are logged and the loop carries on; only cancellation or a
//! terminally failed connection ends it. Jobs are handled strictly one at a
//! time per channel.

use anyhow::anyhow;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handler::JobHandler;
use super::registry::Channel;
use crate::broker::error::error_chain;
use crate::broker::{BrokerError, JobId};

/// What to do with a job whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum FailurePolicy {
    /// Acknowledge it anyway; the job is never redelivered to this consumer.
    #[default]
    Delete,
    /// Hand it back to the broker for redelivery.
    Release,
}

#[derive(Debug, Clone, Copy)]
pub struct ConsumerOptions {
    pub failure_policy: FailurePolicy,
    /// Pause after a failed cycle before trying again.
    pub error_backoff: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::Delete,
            error_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStage {
    Watching,
    Reserving,
    Processing,
    Acknowledging,
}

impl fmt::Display for CycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CycleStage::Watching => "watching",
            CycleStage::Reserving => "reserving",
            CycleStage::Processing => "processing",
            CycleStage::Acknowledging => "acknowledging",
        };
        f.write_str(s)
    }
}

/// Counters returned when a consumer stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerReport {
    pub cycles: u64,
    pub processed: u64,
    pub failed: u64,
    pub errors: u64,
}

struct CycleError {
    stage: CycleStage,
    error: BrokerError,
}

trait AtStage<T> {
    fn at(self, stage: CycleStage) -> Result<T, CycleError>;
}

impl<T> AtStage<T> for Result<T, BrokerError> {
    fn at(self, stage: CycleStage) -> Result<T, CycleError> {
        self.map_err(|error| CycleError { stage, error })
    }
}

enum Cycle {
    Completed,
    Cancelled,
}

/// Consumes one channel until cancelled.
pub struct Consumer<H> {
    channel: Channel,
    handler: H,
    options: ConsumerOptions,
    cancel: CancellationToken,
}

impl<H: JobHandler> Consumer<H> {
    pub fn new(channel: Channel, handler: H) -> Self {
        Self {
            channel,
            handler,
            options: ConsumerOptions::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_options(mut self, options: ConsumerOptions) -> Self {
        self.options = options;
        self
    }

    /// Stop the loop when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until cancelled. Returns an error only when the connection has
    /// failed for good.
    pub async fn run(self) -> Result<ConsumerReport, BrokerError> {
        let channel = self.channel.name().to_string();
        info!(%channel, policy = ?self.options.failure_policy, "consumer started");
        let mut report = ConsumerReport::default();

        while !self.cancel.is_cancelled() {
            match self.cycle(&mut report).await {
                Ok(Cycle::Completed) => {}
                Ok(Cycle::Cancelled) => break,
                Err(CycleError { stage, error }) => {
                    if error.is_terminal() {
                        error!(%channel, %stage, error = %error_chain(&error), "consumer stopping: connection lost");
                        return Err(error);
                    }
                    report.errors += 1;
                    error!(%channel, %stage, error = %error_chain(&error), "consumer cycle failed");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = sleep(self.options.error_backoff) => {}
                    }
                }
            }
            report.cycles += 1;
            tokio::task::yield_now().await;
        }

        info!(
            %channel,
            cycles = report.cycles,
            processed = report.processed,
            failed = report.failed,
            errors = report.errors,
            "consumer stopped"
        );
        Ok(report)
    }

    async fn cycle(&self, report: &mut ConsumerReport) -> Result<Cycle, CycleError> {
        self.channel.watch().await.at(CycleStage::Watching)?;

        let job = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(Cycle::Cancelled),
            job = self.channel.reserve() => job.at(CycleStage::Reserving)?,
        };
        let id = job.id;
        debug!(channel = %job.channel, job = %id, bytes = job.payload.len(), "job reserved");

        let outcome = AssertUnwindSafe(self.handler.process(&job))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(anyhow!("handler panicked: {}", panic_message(&*panic))));
        match outcome {
            Ok(()) => {
                self.channel.delete(id).await.at(CycleStage::Acknowledging)?;
                report.processed += 1;
                debug!(channel = %job.channel, job = %id, "job processed, deleted");
            }
            Err(source) => {
                report.failed += 1;
                let failure = BrokerError::Processing { job: id, source };
                error!(
                    channel = %job.channel,
                    stage = %CycleStage::Processing,
                    error = %error_chain(&failure),
                    "job failed"
                );
                self.settle_failed(id).await?;
            }
        }
        Ok(Cycle::Completed)
    }

    async fn settle_failed(&self, id: JobId) -> Result<(), CycleError> {
        match self.options.failure_policy {
            FailurePolicy::Delete => self.channel.delete(id).await,
            FailurePolicy::Release => {
                warn!(channel = %self.channel.name(), job = %id, "releasing failed job for redelivery");
                self.channel.release(id).await
            }
        }
        .at(CycleStage::Acknowledging)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string payload")
}
