//! CLI argument definitions using clap.

use anyhow::Result;
use clap::{Args, Parser};
use std::path::PathBuf;
use std::time::Duration;

use super::commands::Command;
use crate::broker::{BrokerError, PutOptions};
use crate::client::{ConsumerOptions, FailurePolicy, ReconnectPolicy};
use crate::core::{Backend, ClientConfig, Endpoint};
use crate::net::TlsFiles;

/// jobstats - inspect, feed and drain AMQP queues and beanstalkd tubes.
#[derive(Parser, Debug)]
#[command(name = "jobstats")]
#[command(version)]
#[command(about = "Queue statistics, administration and a job consumer for AMQP and beanstalkd")]
pub struct Cli {
    /// Broker protocol
    #[arg(long, value_enum, default_value = "queue", env = "JOBSTATS_BACKEND")]
    pub backend: Backend,

    /// Broker hostname or IP
    #[arg(long, default_value = "localhost", env = "JOBSTATS_HOST")]
    pub host: String,

    /// Plaintext port [default: 5672 for queue, 11300 for tube]
    #[arg(short, long, env = "JOBSTATS_PORT")]
    pub port: Option<u16>,

    /// TLS port [default: 5671 for queue, 11400 for tube]
    #[arg(long, env = "JOBSTATS_SECURE_PORT")]
    pub secure_port: Option<u16>,

    /// Connect over TLS
    #[arg(short, long)]
    pub secure: bool,

    #[command(flatten)]
    pub tls: TlsArgs,

    /// Queue (or tube) to operate on
    #[arg(short, long, default_value = "default", env = "JOBSTATS_QUEUE")]
    pub queue: String,

    /// checkQueue, purgeQueue, deleteQueue, sendToQueue, listQueues or consume
    #[arg(short, long, default_value = "checkQueue")]
    pub command: String,

    /// Job payload for sendToQueue
    #[arg(value_name = "JOB")]
    pub job: Option<String>,

    #[command(flatten)]
    pub put: PutArgs,

    /// What to do with a job whose processing failed
    #[arg(long, value_enum, default_value = "delete")]
    pub on_failure: FailurePolicy,

    /// Connection attempts before giving up (0 disables reconnection)
    #[arg(long, default_value_t = 3, env = "JOBSTATS_RECONNECT_ATTEMPTS")]
    pub reconnect_attempts: u32,

    /// Delay between reconnection attempts in milliseconds
    #[arg(long, default_value_t = 10_000, env = "JOBSTATS_RECONNECT_DELAY_MS")]
    pub reconnect_delay_ms: u64,

    /// Delay before closing the connection after a one-shot command
    #[arg(long, default_value_t = 1_000)]
    pub close_grace_ms: u64,

    /// Output format for consumed jobs
    #[arg(long, value_enum, default_value = "json")]
    pub format: OutputFormat,

    /// Print the resolved options before running
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,
}

// -----------------------------------------------------------------------------
// Shared argument groups
// -----------------------------------------------------------------------------

/// PEM files used with `--secure`.
#[derive(Args, Clone, Debug, Default)]
pub struct TlsArgs {
    /// PEM file containing the broker CA certificate
    #[arg(long, value_name = "PATH", env = "JOBSTATS_CA_CERT")]
    pub ca_cert: Option<PathBuf>,

    /// PEM file containing the client certificate chain
    #[arg(long, value_name = "PATH", env = "JOBSTATS_CLIENT_CERT")]
    pub client_cert: Option<PathBuf>,

    /// PEM file containing the client private key
    #[arg(long, value_name = "PATH", env = "JOBSTATS_CLIENT_KEY")]
    pub client_key: Option<PathBuf>,
}

/// Options applied to jobs enqueued with sendToQueue (tube backend).
#[derive(Args, Clone, Debug)]
pub struct PutArgs {
    /// Job priority, lower is more urgent
    #[arg(long, default_value_t = 1024)]
    pub priority: u32,

    /// Seconds before the job becomes ready
    #[arg(long, default_value_t = 0)]
    pub delay: u64,

    /// Seconds a worker may hold the job before it is released
    #[arg(long, default_value_t = 60)]
    pub ttr: u64,
}

/// Output format for consumed jobs.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON objects, one per line
    #[default]
    Json,
    /// Raw payload only (no metadata)
    Raw,
}

impl Cli {
    /// Resolve the requested command. Fails before any broker call when the
    /// name is unknown.
    pub fn command(&self) -> Result<Command, BrokerError> {
        self.command.parse()
    }

    /// Resolve and validate the connection settings.
    pub fn config(&self) -> Result<ClientConfig> {
        let endpoint = Endpoint::resolve(
            self.backend,
            &self.host,
            self.port,
            self.secure_port,
            self.secure,
        );
        let reconnect = (self.reconnect_attempts > 0).then(|| ReconnectPolicy {
            max_attempts: self.reconnect_attempts,
            delay: Duration::from_millis(self.reconnect_delay_ms),
        });
        let config = ClientConfig {
            endpoint,
            tls: TlsFiles {
                ca_cert: self.tls.ca_cert.clone(),
                client_cert: self.tls.client_cert.clone(),
                client_key: self.tls.client_key.clone(),
            },
            channel: self.queue.clone(),
            reconnect,
            put: PutOptions {
                priority: self.put.priority,
                delay: Duration::from_secs(self.put.delay),
                ttr: Duration::from_secs(self.put.ttr),
            },
            consumer: ConsumerOptions {
                failure_policy: self.on_failure,
                ..ConsumerOptions::default()
            },
            close_grace: Duration::from_millis(self.close_grace_ms),
        };
        config.validate()?;
        Ok(config)
    }
}
