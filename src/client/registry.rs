//! Named channels multiplexed over the managed connection.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::connection::{Connection, ConnectionManager};
use crate::broker::{
    BrokerError, ChannelTransport, ConnectionError, Job, JobId, PutOptions, QueueStats,
    DEFAULT_CHANNEL,
};

struct Binding {
    generation: u64,
    transport: Arc<dyn ChannelTransport>,
}

struct ChannelInner {
    name: String,
    connection: Arc<Connection>,
    binding: Mutex<Option<Binding>>,
}

/// Handle to a named channel. Clones refer to the same channel.
///
/// The transport side is re-opened lazily when the connection has
/// reconnected since it was last used.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("name", &self.inner.name).finish()
    }
}

impl Channel {
    fn new(name: &str, connection: &Arc<Connection>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                name: name.to_string(),
                connection: connection.clone(),
                binding: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// True if both handles are the same cached channel.
    pub fn ptr_eq(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    async fn transport(&self) -> Result<Arc<dyn ChannelTransport>, BrokerError> {
        let (session, generation) = self.inner.connection.ready_session().await?;

        let mut binding = self.inner.binding.lock().await;
        if let Some(bound) = binding.as_ref() {
            if bound.generation == generation {
                return Ok(bound.transport.clone());
            }
        }
        debug!(channel = %self.inner.name, generation, "opening channel");
        let transport: Arc<dyn ChannelTransport> =
            Arc::from(session.open_channel(&self.inner.name).await?);
        *binding = Some(Binding {
            generation,
            transport: transport.clone(),
        });
        Ok(transport)
    }

    pub async fn watch(&self) -> Result<(), BrokerError> {
        Ok(self.transport().await?.watch().await?)
    }

    pub async fn reserve(&self) -> Result<Job, BrokerError> {
        Ok(self.transport().await?.reserve().await?)
    }

    /// Acknowledge a reserved job, removing it from the broker.
    pub async fn delete(&self, id: JobId) -> Result<(), BrokerError> {
        Ok(self.transport().await?.delete(id).await?)
    }

    pub async fn release(&self, id: JobId) -> Result<(), BrokerError> {
        Ok(self.transport().await?.release(id).await?)
    }

    pub async fn inspect(&self) -> Result<QueueStats, BrokerError> {
        Ok(self.transport().await?.inspect().await?)
    }

    pub async fn purge(&self) -> Result<u64, BrokerError> {
        Ok(self.transport().await?.purge().await?)
    }

    pub async fn remove(&self) -> Result<u64, BrokerError> {
        Ok(self.transport().await?.remove().await?)
    }

    pub async fn enqueue(&self, payload: &[u8], options: &PutOptions) -> Result<JobId, BrokerError> {
        Ok(self.transport().await?.enqueue(payload, options).await?)
    }
}

#[derive(Default)]
struct Cache {
    connection_id: Option<u64>,
    channels: HashMap<String, Channel>,
}

impl Cache {
    /// Drop every handle built for a connection other than `connection_id`.
    fn sync_to(&mut self, connection_id: Option<u64>) {
        if self.connection_id != connection_id {
            if !self.channels.is_empty() {
                debug!(dropped = self.channels.len(), "connection changed; clearing channel cache");
            }
            self.channels.clear();
            self.connection_id = connection_id;
        }
    }
}

/// Creates and caches channels by name for one [`ConnectionManager`].
#[derive(Clone)]
pub struct ChannelRegistry {
    manager: ConnectionManager,
    cache: Arc<Mutex<Cache>>,
}

impl ChannelRegistry {
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            cache: Arc::new(Mutex::new(Cache::default())),
        }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Return the channel called `name` (default `"default"`), opening it on
    /// first use.
    pub async fn create_channel(&self, name: Option<&str>) -> Result<Channel, BrokerError> {
        let name = name.unwrap_or(DEFAULT_CHANNEL);
        let connection = self
            .manager
            .current()
            .ok_or(ConnectionError::NoActiveConnection)?;

        let mut cache = self.cache.lock().await;
        cache.sync_to(Some(connection.id()));
        if let Some(channel) = cache.channels.get(name) {
            return Ok(channel.clone());
        }

        let channel = Channel::new(name, &connection);
        channel.transport().await?;
        cache.channels.insert(name.to_string(), channel.clone());
        debug!(channel = %name, "channel created");
        Ok(channel)
    }

    /// Look up a channel created earlier. Never creates one.
    pub async fn channel(&self, name: &str) -> Result<Channel, BrokerError> {
        let mut cache = self.cache.lock().await;
        cache.sync_to(self.manager.current().map(|c| c.id()));
        cache
            .channels
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::ChannelNotFound(name.to_string()))
    }

    pub async fn channel_names(&self) -> Vec<String> {
        let mut cache = self.cache.lock().await;
        cache.sync_to(self.manager.current().map(|c| c.id()));
        let mut names: Vec<String> = cache.channels.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of the channels the broker knows about.
    pub async fn list_remote(&self) -> Result<Vec<String>, BrokerError> {
        let connection = self
            .manager
            .current()
            .ok_or(ConnectionError::NoActiveConnection)?;
        let (session, _) = connection.ready_session().await?;
        Ok(session.list_channels().await?)
    }
}
