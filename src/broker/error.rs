//! Error taxonomy shared by the transports, the connection manager and the CLI.

use thiserror::Error;

use super::JobId;

/// Failures reported by a broker transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The broker answered with an error status (e.g. `NOT_FOUND`, `BAD_FORMAT`).
    #[error("broker rejected {command}: {reason}")]
    Rejected { command: String, reason: String },
    #[error("operation not supported by the {backend} backend: {operation}")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },
    #[error("transport closed")]
    Closed,
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),
}

impl TransportError {
    pub fn rejected(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            command: command.into(),
            reason: reason.into(),
        }
    }
}

/// Connection-level failures.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("no active connection")]
    NoActiveConnection,
    #[error("connection to {endpoint} failed after {attempts} attempt(s): {last}")]
    Exhausted {
        endpoint: String,
        attempts: u32,
        #[source]
        last: TransportError,
    },
    #[error("connection to {0} failed and is no longer usable")]
    Failed(String),
}

/// Top-level error for client operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("channel '{0}' not found")]
    ChannelNotFound(String),
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("processing job {job} failed")]
    Processing {
        job: JobId,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl BrokerError {
    /// True when the connection behind the operation is gone for good,
    /// either failed or closed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BrokerError::Connection(_))
    }
}

pub type Result<T, E = BrokerError> = std::result::Result<T, E>;

/// Render an error with all of its sources, outermost first.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
