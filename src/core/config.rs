//! Resolved client settings: backend, endpoint, TLS files, reconnect policy
//! and consumer options, validated before anything connects.

use anyhow::{bail, Result};
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::time::Duration;

use crate::broker::PutOptions;
use crate::client::{ConsumerOptions, ReconnectPolicy};
use crate::net::TlsFiles;

/// Which wire protocol to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// AMQP 0-9-1 queues.
    Queue,
    /// beanstalkd tubes.
    Tube,
}

impl Backend {
    pub fn default_port(self) -> u16 {
        match self {
            Backend::Queue => 5672,
            Backend::Tube => 11300,
        }
    }

    pub fn default_secure_port(self) -> u16 {
        match self {
            Backend::Queue => 5671,
            Backend::Tube => 11400,
        }
    }

    fn scheme(self, secure: bool) -> &'static str {
        match (self, secure) {
            (Backend::Queue, false) => "amqp",
            (Backend::Queue, true) => "amqps",
            (Backend::Tube, false) => "beanstalk",
            (Backend::Tube, true) => "beanstalks",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Backend::Queue => "queue",
            Backend::Tube => "tube",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub backend: Backend,
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

impl Endpoint {
    /// Pick the plain or secure port, applying the backend defaults for
    /// whichever was not given.
    pub fn resolve(
        backend: Backend,
        host: &str,
        port: Option<u16>,
        secure_port: Option<u16>,
        secure: bool,
    ) -> Self {
        let port = if secure {
            secure_port.unwrap_or(backend.default_secure_port())
        } else {
            port.unwrap_or(backend.default_port())
        };
        Self {
            backend,
            host: host.to_string(),
            port,
            secure,
        }
    }

    pub fn uri(&self) -> String {
        format!(
            "{}://{}:{}",
            self.backend.scheme(self.secure),
            self.host,
            self.port
        )
    }
}

/// Everything needed to connect and run a command.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: Endpoint,
    pub tls: TlsFiles,
    pub channel: String,
    /// `None` disables reconnection.
    pub reconnect: Option<ReconnectPolicy>,
    pub put: PutOptions,
    pub consumer: ConsumerOptions,
    /// Pause before closing after a one-shot command.
    pub close_grace: Duration,
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.host.trim().is_empty() {
            bail!("host must be non-empty");
        }
        if self.endpoint.port == 0 {
            bail!("port must be > 0");
        }
        if self.channel.is_empty() {
            bail!("queue name must be non-empty");
        }
        if self.endpoint.backend == Backend::Tube && self.channel.len() > 200 {
            bail!("tube names are limited to 200 bytes");
        }
        if self.tls.client_cert.is_some() != self.tls.client_key.is_some() {
            bail!("--client-cert and --client-key must be given together");
        }
        if !self.endpoint.secure && (self.tls.ca_cert.is_some() || self.tls.has_client_identity()) {
            tracing::warn!("TLS files given without --secure; they will be ignored");
        }
        if self.endpoint.secure {
            for path in [&self.tls.ca_cert, &self.tls.client_cert, &self.tls.client_key]
                .into_iter()
                .flatten()
            {
                if !path.exists() {
                    bail!("TLS file {} missing", path.display());
                }
            }
        }
        if self.put.ttr.is_zero() {
            bail!("ttr must be at least one second");
        }
        Ok(())
    }

    /// Resolved options as printed by `--verbose`.
    pub fn summary(&self) -> serde_json::Value {
        json!({
            "backend": self.endpoint.backend,
            "endpoint": self.endpoint.uri(),
            "secure": self.endpoint.secure,
            "queue": self.channel,
            "ca_cert": self.tls.ca_cert,
            "client_cert": self.tls.client_cert,
            "client_key": self.tls.client_key,
            "reconnect": self.reconnect.map(|p| json!({
                "max_attempts": p.max_attempts,
                "delay_ms": p.delay.as_millis() as u64,
            })),
            "put": {
                "priority": self.put.priority,
                "delay_secs": self.put.delay.as_secs(),
                "ttr_secs": self.put.ttr.as_secs(),
            },
            "on_failure": format!("{:?}", self.consumer.failure_policy).to_lowercase(),
            "close_grace_ms": self.close_grace.as_millis() as u64,
        })
    }
}
