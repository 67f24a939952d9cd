//! AMQP 0-9-1 ("queue") backend built on `lapin`.
//!
//! Each named channel gets its own AMQP channel on the shared connection.
//! Consuming uses `basic.consume` with a prefetch of one, so a channel never
//! holds more than one unacknowledged delivery.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
};
use lapin::tcp::OwnedTLSConfig;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use super::transport::{ChannelTransport, Connector, LinkEvent, Session};
use super::{Job, JobId, PutOptions, QueueStats, TransportError};

/// Connects to an AMQP broker.
pub struct QueueConnector {
    uri: String,
    ca_pem: Option<String>,
}

impl QueueConnector {
    /// `uri` is a full `amqp://` or `amqps://` URI.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ca_pem: None,
        }
    }

    /// Trust the given PEM bundle when connecting over `amqps://`.
    pub fn with_ca_pem(mut self, pem: String) -> Self {
        self.ca_pem = Some(pem);
        self
    }
}

#[async_trait]
impl Connector for QueueConnector {
    async fn connect(&self) -> Result<Box<dyn Session>, TransportError> {
        let properties = ConnectionProperties::default();
        let connection = match &self.ca_pem {
            Some(pem) => {
                let mut tls = OwnedTLSConfig::default();
                tls.cert_chain = Some(pem.clone());
                Connection::connect_with_config(&self.uri, properties, tls).await?
            }
            None => Connection::connect(&self.uri, properties).await?,
        };

        let (state, _) = watch::channel(None);
        let state = Arc::new(state);
        let on_error = state.clone();
        connection.on_error(move |err| {
            warn!(error = %err, "amqp connection error");
            on_error.send_replace(Some(LinkEvent::Error(err.to_string())));
        });
        debug!(endpoint = %self.endpoint(), "queue session established");
        Ok(Box::new(QueueSession { connection, state }))
    }

    fn endpoint(&self) -> String {
        self.uri.clone()
    }
}

struct QueueSession {
    connection: Connection,
    state: Arc<watch::Sender<Option<LinkEvent>>>,
}

#[async_trait]
impl Session for QueueSession {
    async fn open_channel(&self, name: &str) -> Result<Box<dyn ChannelTransport>, TransportError> {
        let channel = self.connection.create_channel().await?;
        Ok(Box::new(QueueChannel {
            channel,
            name: name.to_string(),
            consumer: Mutex::new(None),
        }))
    }

    async fn closed(&self) -> LinkEvent {
        let mut rx = self.state.subscribe();
        let event = match rx.wait_for(Option::is_some).await {
            Ok(event) => event.clone().unwrap_or(LinkEvent::Closed),
            Err(_) => LinkEvent::Closed,
        };
        event
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.state.send_replace(Some(LinkEvent::Closed));
        self.connection.close(200, "bye").await?;
        Ok(())
    }

    async fn list_channels(&self) -> Result<Vec<String>, TransportError> {
        Err(TransportError::Unsupported {
            backend: "queue",
            operation: "list",
        })
    }
}

struct QueueChannel {
    channel: Channel,
    name: String,
    consumer: Mutex<Option<Consumer>>,
}

impl QueueChannel {
    async fn declare(&self) -> Result<lapin::Queue, TransportError> {
        let options = QueueDeclareOptions {
            durable: false,
            ..QueueDeclareOptions::default()
        };
        Ok(self
            .channel
            .queue_declare(&self.name, options, FieldTable::default())
            .await?)
    }
}

#[async_trait]
impl ChannelTransport for QueueChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn watch(&self) -> Result<(), TransportError> {
        let mut consumer = self.consumer.lock().await;
        if consumer.is_some() {
            return Ok(());
        }
        self.declare().await?;
        self.channel
            .basic_qos(1, BasicQosOptions::default())
            .await?;
        let tag = format!("jobstats-{}", uuid::Uuid::new_v4().simple());
        let created = self
            .channel
            .basic_consume(
                &self.name,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        *consumer = Some(created);
        Ok(())
    }

    async fn reserve(&self) -> Result<Job, TransportError> {
        let mut guard = self.consumer.lock().await;
        let consumer = guard.as_mut().ok_or_else(|| {
            TransportError::Protocol(format!("reserve on '{}' before watch", self.name))
        })?;
        match consumer.next().await {
            Some(Ok(delivery)) => Ok(Job {
                id: JobId(delivery.delivery_tag),
                channel: self.name.clone(),
                payload: delivery.data.into(),
                redelivered: delivery.redelivered,
            }),
            Some(Err(err)) => {
                // a failed consumer stream never recovers; re-subscribe on next watch
                *guard = None;
                Err(err.into())
            }
            None => {
                *guard = None;
                Err(TransportError::Closed)
            }
        }
    }

    async fn delete(&self, id: JobId) -> Result<(), TransportError> {
        self.channel
            .basic_ack(id.0, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn release(&self, id: JobId) -> Result<(), TransportError> {
        let options = BasicNackOptions {
            requeue: true,
            ..BasicNackOptions::default()
        };
        self.channel.basic_nack(id.0, options).await?;
        Ok(())
    }

    async fn inspect(&self) -> Result<QueueStats, TransportError> {
        let options = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };
        let queue = self
            .channel
            .queue_declare(&self.name, options, FieldTable::default())
            .await?;
        Ok(QueueStats {
            name: self.name.clone(),
            messages: Some(u64::from(queue.message_count())),
            consumers: Some(u64::from(queue.consumer_count())),
            ..QueueStats::default()
        })
    }

    async fn purge(&self) -> Result<u64, TransportError> {
        let purged = self
            .channel
            .queue_purge(&self.name, QueuePurgeOptions::default())
            .await?;
        Ok(u64::from(purged))
    }

    async fn remove(&self) -> Result<u64, TransportError> {
        let options = QueueDeleteOptions {
            if_unused: true,
            if_empty: true,
            ..QueueDeleteOptions::default()
        };
        let deleted = self.channel.queue_delete(&self.name, options).await?;
        Ok(u64::from(deleted))
    }

    async fn enqueue(&self, payload: &[u8], _options: &PutOptions) -> Result<JobId, TransportError> {
        self.declare().await?;
        self.channel
            .basic_publish(
                "",
                &self.name,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default(),
            )
            .await?
            .await?;
        // AMQP assigns no id at publish time
        Ok(JobId(0))
    }
}
