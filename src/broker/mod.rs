//! Broker transports and the data types that flow through them.
//!
//! The client core never talks to a wire protocol directly; it drives the
//! [`transport`] traits, which are implemented by:
//! - [`tube`] - beanstalkd text protocol over TCP or TLS
//! - [`queue`] - AMQP 0-9-1 via `lapin`
//! - [`memory`] - in-process broker used by tests

pub mod error;
pub mod memory;
pub mod queue;
pub mod transport;
pub mod tube;

pub use error::{error_chain, BrokerError, ConnectionError, Result, TransportError};
pub use transport::{ChannelTransport, Connector, LinkEvent, Session};

use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Channel name used when the caller does not pick one.
pub const DEFAULT_CHANNEL: &str = "default";

/// Broker-assigned job identifier (beanstalkd job id or AMQP delivery tag).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unit of work reserved from a channel.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub channel: String,
    pub payload: Bytes,
    /// Set when the broker reports this is not the first delivery.
    pub redelivered: bool,
}

impl Job {
    pub fn new(id: u64, channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: JobId(id),
            channel: channel.into(),
            payload: payload.into(),
            redelivered: false,
        }
    }

    /// Payload as UTF-8, if it is valid text.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Statistics reported by `inspect`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumers: Option<u64>,
    /// Raw broker fields (e.g. the full `stats-tube` document).
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
}

/// Options for `enqueue`. Only the tube backend honours them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOptions {
    pub priority: u32,
    pub delay: Duration,
    pub ttr: Duration,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            priority: 1024,
            delay: Duration::ZERO,
            ttr: Duration::from_secs(60),
        }
    }
}
