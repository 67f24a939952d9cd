//! Transport capability consumed by the client core.
//!
//! A [`Connector`] performs the handshake and yields a [`Session`]; a session
//! multiplexes named [`ChannelTransport`]s over one physical connection.

use async_trait::async_trait;

use super::{Job, JobId, PutOptions, QueueStats, TransportError};

/// Why a session stopped being usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The peer closed the connection (or we did).
    Closed,
    /// The transport failed with the given description.
    Error(String),
}

/// Establishes sessions against one endpoint with fixed credentials.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn Session>, TransportError>;

    /// Human-readable endpoint used in logs and errors.
    fn endpoint(&self) -> String;
}

/// One live connection to the broker.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    async fn open_channel(&self, name: &str) -> Result<Box<dyn ChannelTransport>, TransportError>;

    /// Resolves once the session closes or fails. Safe to call repeatedly.
    async fn closed(&self) -> LinkEvent;

    async fn close(&self) -> Result<(), TransportError>;

    /// Names of the channels known to the broker.
    async fn list_channels(&self) -> Result<Vec<String>, TransportError>;
}

/// Per-channel broker primitives.
#[async_trait]
pub trait ChannelTransport: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Register interest in this channel. Idempotent.
    async fn watch(&self) -> Result<(), TransportError>;

    /// Block until a job is available on this channel.
    async fn reserve(&self) -> Result<Job, TransportError>;

    /// Acknowledge (delete) a reserved job.
    async fn delete(&self, id: JobId) -> Result<(), TransportError>;

    /// Hand a reserved job back to the broker for redelivery.
    async fn release(&self, id: JobId) -> Result<(), TransportError>;

    async fn inspect(&self) -> Result<QueueStats, TransportError>;

    /// Drop every pending job, returning how many were removed.
    async fn purge(&self) -> Result<u64, TransportError>;

    /// Remove the channel itself when it is unused and empty.
    async fn remove(&self) -> Result<u64, TransportError>;

    async fn enqueue(&self, payload: &[u8], options: &PutOptions) -> Result<JobId, TransportError>;
}
