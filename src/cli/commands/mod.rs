//! CLI command implementations.

mod admin;
mod consume;

use anyhow::{Context, Result};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::args::Cli;
use crate::broker::queue::QueueConnector;
use crate::broker::tube::TubeConnector;
use crate::broker::BrokerError;
use crate::client::{ChannelRegistry, ConnectionManager};
use crate::core::{Backend, ClientConfig};
use crate::net::{build_tls_config, read_ca_pem};

pub use admin::run_admin;
pub use consume::{output_job, run_consume};

/// Operations selectable with `--command`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    CheckQueue,
    PurgeQueue,
    DeleteQueue,
    SendToQueue,
    ListQueues,
    Consume,
}

impl Command {
    pub const ALL: [Command; 6] = [
        Command::CheckQueue,
        Command::PurgeQueue,
        Command::DeleteQueue,
        Command::SendToQueue,
        Command::ListQueues,
        Command::Consume,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Command::CheckQueue => "checkQueue",
            Command::PurgeQueue => "purgeQueue",
            Command::DeleteQueue => "deleteQueue",
            Command::SendToQueue => "sendToQueue",
            Command::ListQueues => "listQueues",
            Command::Consume => "consume",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Command {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| BrokerError::InvalidCommand(s.to_string()))
    }
}

/// Build the connection manager for the configured backend.
pub fn connection_manager(config: &ClientConfig) -> Result<ConnectionManager> {
    let endpoint = &config.endpoint;
    let manager = match endpoint.backend {
        Backend::Queue => {
            let mut connector = QueueConnector::new(endpoint.uri());
            if endpoint.secure {
                if let Some(ca) = &config.tls.ca_cert {
                    connector = connector.with_ca_pem(read_ca_pem(ca)?);
                }
                if config.tls.has_client_identity() {
                    warn!("client certificates are not presented on the queue backend; using the CA bundle only");
                }
            }
            ConnectionManager::new(connector, config.reconnect)
        }
        Backend::Tube => {
            let mut connector = TubeConnector::new(endpoint.host.clone(), endpoint.port);
            if endpoint.secure {
                let tls = build_tls_config(&config.tls).context("build TLS config")?;
                connector = connector.with_tls(Arc::new(tls));
            }
            ConnectionManager::new(connector, config.reconnect)
        }
    };
    Ok(manager)
}

/// Resolve the command and settings. Nothing here touches the network.
fn prepare(cli: &Cli) -> Result<(Command, ClientConfig)> {
    let command = cli.command()?;
    let config = cli.config()?;
    if cli.verbose {
        eprintln!("{}", serde_json::to_string_pretty(&config.summary())?);
    }
    if command == Command::SendToQueue && cli.job.is_none() {
        anyhow::bail!("sendToQueue requires a JOB argument");
    }
    Ok((command, config))
}

/// Run the command line against the configured broker.
pub async fn run(cli: Cli) -> Result<()> {
    let (command, config) = prepare(&cli)?;
    let manager = connection_manager(&config)?;
    execute(command, &config, manager, &cli).await
}

/// Run the command line over an already built connection manager.
pub async fn run_with_manager(cli: &Cli, manager: ConnectionManager) -> Result<()> {
    let (command, config) = prepare(cli)?;
    execute(command, &config, manager, cli).await
}

async fn execute(
    command: Command,
    config: &ClientConfig,
    manager: ConnectionManager,
    cli: &Cli,
) -> Result<()> {
    manager
        .connect()
        .await
        .with_context(|| format!("connect to {}", manager.endpoint()))?;
    info!(endpoint = %manager.endpoint(), %command, queue = %config.channel, "connected");
    let registry = ChannelRegistry::new(manager.clone());

    let result = match command {
        Command::Consume => run_consume(&registry, config, cli.format).await,
        other => run_admin(other, &registry, config, cli.job.as_deref()).await,
    };

    if let Err(err) = manager.close().await {
        debug!(error = %err, "close after {command}");
    }
    result
}
