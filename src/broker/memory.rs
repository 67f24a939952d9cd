//! In-process broker implementing the transport traits.
//!
//! Behaves like a single-node tube broker: jobs wait in a per-channel ready
//! queue, `reserve` moves one into the reserved set, `delete` drops it and
//! `release` puts it back at the front. Fault hooks (refused connects, failed
//! reserves, dropped sessions) let tests drive the reconnection and recovery
//! paths, and counters expose what the client actually asked for.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};

use super::transport::{ChannelTransport, Connector, LinkEvent, Session};
use super::{Job, JobId, PutOptions, QueueStats, TransportError};

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Job>,
    reserved: HashMap<JobId, Job>,
    watchers: u32,
}

#[derive(Default)]
struct BrokerState {
    queues: Mutex<HashMap<String, QueueState>>,
    job_ready: Notify,
    next_id: AtomicU64,
    connect_attempts: AtomicU32,
    handshakes: AtomicU32,
    refuse_connects: AtomicU32,
    fail_reserves: AtomicU32,
    fail_deletes: AtomicU32,
    deleted: Mutex<Vec<JobId>>,
    released: Mutex<Vec<JobId>>,
    links: Mutex<Vec<Arc<watch::Sender<Option<LinkEvent>>>>>,
}

impl BrokerState {
    fn take_ready(&self, channel: &str) -> Option<Job> {
        let mut queues = self.queues.lock();
        let queue = queues.get_mut(channel)?;
        let job = queue.ready.pop_front()?;
        queue.reserved.insert(job.id, job.clone());
        Some(job)
    }

    fn push(&self, job: Job) {
        self.queues
            .lock()
            .entry(job.channel.clone())
            .or_default()
            .ready
            .push_back(job);
        self.job_ready.notify_waiters();
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Decrements a fault counter; `u32::MAX` means "forever".
fn consume_fault(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
            0 => None,
            u32::MAX => Some(u32::MAX),
            n => Some(n - 1),
        })
        .is_ok()
}

/// Handle to an in-memory broker. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            state: self.state.clone(),
        }
    }

    /// Queue a job with a broker-assigned id.
    pub fn put(&self, channel: &str, payload: impl Into<Bytes>) -> JobId {
        let id = self.state.allocate_id();
        self.state.push(Job::new(id, channel, payload));
        JobId(id)
    }

    /// Queue a job with a fixed id.
    pub fn put_job(&self, job: Job) {
        self.state.next_id.fetch_max(job.id.0, Ordering::Relaxed);
        self.state.push(job);
    }

    /// Refuse the next `n` connection attempts (`u32::MAX` refuses all).
    pub fn refuse_connects(&self, n: u32) {
        self.state.refuse_connects.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` reserve calls with an I/O error.
    pub fn fail_reserves(&self, n: u32) {
        self.state.fail_reserves.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` delete calls with an I/O error, leaving the job reserved.
    pub fn fail_deletes(&self, n: u32) {
        self.state.fail_deletes.store(n, Ordering::SeqCst);
    }

    /// Simulate the network dropping every open session.
    pub fn drop_sessions(&self) {
        let links = std::mem::take(&mut *self.state.links.lock());
        for link in links {
            link.send_replace(Some(LinkEvent::Error("connection reset by peer".into())));
        }
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    /// Successful handshakes only.
    pub fn handshakes(&self) -> u32 {
        self.state.handshakes.load(Ordering::SeqCst)
    }

    pub fn deleted(&self) -> Vec<JobId> {
        self.state.deleted.lock().clone()
    }

    pub fn released(&self) -> Vec<JobId> {
        self.state.released.lock().clone()
    }

    pub fn ready_len(&self, channel: &str) -> usize {
        self.state
            .queues
            .lock()
            .get(channel)
            .map_or(0, |q| q.ready.len())
    }

    pub fn reserved_len(&self, channel: &str) -> usize {
        self.state
            .queues
            .lock()
            .get(channel)
            .map_or(0, |q| q.reserved.len())
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.state.queues.lock().contains_key(channel)
    }
}

pub struct MemoryConnector {
    state: Arc<BrokerState>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn Session>, TransportError> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if consume_fault(&self.state.refuse_connects) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        self.state.handshakes.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = watch::channel(None);
        let link = Arc::new(tx);
        self.state.links.lock().push(link.clone());
        Ok(Box::new(MemorySession {
            state: self.state.clone(),
            link,
            link_rx: rx,
        }))
    }

    fn endpoint(&self) -> String {
        "memory://local".to_string()
    }
}

struct MemorySession {
    state: Arc<BrokerState>,
    link: Arc<watch::Sender<Option<LinkEvent>>>,
    link_rx: watch::Receiver<Option<LinkEvent>>,
}

async fn wait_closed(mut rx: watch::Receiver<Option<LinkEvent>>) -> LinkEvent {
    match rx.wait_for(Option::is_some).await {
        Ok(event) => event.clone().unwrap_or(LinkEvent::Closed),
        Err(_) => LinkEvent::Closed,
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn open_channel(&self, name: &str) -> Result<Box<dyn ChannelTransport>, TransportError> {
        if self.link_rx.borrow().is_some() {
            return Err(TransportError::Closed);
        }
        self.state.queues.lock().entry(name.to_string()).or_default();
        Ok(Box::new(MemoryChannel {
            state: self.state.clone(),
            name: name.to_string(),
            link_rx: self.link_rx.clone(),
            watching: AtomicBool::new(false),
        }))
    }

    async fn closed(&self) -> LinkEvent {
        wait_closed(self.link_rx.clone()).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.link.send_replace(Some(LinkEvent::Closed));
        let mut links = self.state.links.lock();
        links.retain(|l| !Arc::ptr_eq(l, &self.link));
        Ok(())
    }

    async fn list_channels(&self) -> Result<Vec<String>, TransportError> {
        let mut names: Vec<String> = self.state.queues.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

struct MemoryChannel {
    state: Arc<BrokerState>,
    name: String,
    link_rx: watch::Receiver<Option<LinkEvent>>,
    watching: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.link_rx.borrow().is_some() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChannelTransport for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn watch(&self) -> Result<(), TransportError> {
        self.ensure_open()?;
        if !self.watching.swap(true, Ordering::SeqCst) {
            self.state
                .queues
                .lock()
                .entry(self.name.clone())
                .or_default()
                .watchers += 1;
        }
        Ok(())
    }

    async fn reserve(&self) -> Result<Job, TransportError> {
        self.ensure_open()?;
        if consume_fault(&self.state.fail_reserves) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "reserve failed",
            )));
        }
        loop {
            let notified = self.state.job_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(job) = self.state.take_ready(&self.name) {
                return Ok(job);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = wait_closed(self.link_rx.clone()) => return Err(TransportError::Closed),
            }
        }
    }

    async fn delete(&self, id: JobId) -> Result<(), TransportError> {
        self.ensure_open()?;
        if consume_fault(&self.state.fail_deletes) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "delete failed",
            )));
        }
        let removed = self
            .state
            .queues
            .lock()
            .get_mut(&self.name)
            .and_then(|q| q.reserved.remove(&id));
        if removed.is_none() {
            return Err(TransportError::rejected(format!("delete {id}"), "NOT_FOUND"));
        }
        self.state.deleted.lock().push(id);
        Ok(())
    }

    async fn release(&self, id: JobId) -> Result<(), TransportError> {
        self.ensure_open()?;
        {
            let mut queues = self.state.queues.lock();
            let queue = queues.entry(self.name.clone()).or_default();
            let mut job = queue
                .reserved
                .remove(&id)
                .ok_or_else(|| TransportError::rejected(format!("release {id}"), "NOT_FOUND"))?;
            job.redelivered = true;
            queue.ready.push_front(job);
        }
        self.state.released.lock().push(id);
        self.state.job_ready.notify_waiters();
        Ok(())
    }

    async fn inspect(&self) -> Result<QueueStats, TransportError> {
        self.ensure_open()?;
        let queues = self.state.queues.lock();
        let queue = queues
            .get(&self.name)
            .ok_or_else(|| TransportError::rejected(format!("inspect {}", self.name), "NOT_FOUND"))?;
        let mut stats = QueueStats {
            name: self.name.clone(),
            messages: Some(queue.ready.len() as u64),
            consumers: Some(u64::from(queue.watchers)),
            ..QueueStats::default()
        };
        stats
            .details
            .insert("reserved".into(), serde_json::json!(queue.reserved.len()));
        Ok(stats)
    }

    async fn purge(&self) -> Result<u64, TransportError> {
        self.ensure_open()?;
        let mut queues = self.state.queues.lock();
        let purged = queues.get_mut(&self.name).map_or(0, |q| {
            let n = q.ready.len() as u64;
            q.ready.clear();
            n
        });
        Ok(purged)
    }

    async fn remove(&self) -> Result<u64, TransportError> {
        self.ensure_open()?;
        let mut queues = self.state.queues.lock();
        if let Some(queue) = queues.get(&self.name) {
            if !queue.ready.is_empty() || !queue.reserved.is_empty() {
                return Err(TransportError::rejected(format!("remove {}", self.name), "not empty"));
            }
            if queue.watchers > u32::from(self.watching.load(Ordering::SeqCst)) {
                return Err(TransportError::rejected(format!("remove {}", self.name), "in use"));
            }
        }
        queues.remove(&self.name);
        Ok(0)
    }

    async fn enqueue(&self, payload: &[u8], _options: &PutOptions) -> Result<JobId, TransportError> {
        self.ensure_open()?;
        let id = self.state.allocate_id();
        self.state
            .push(Job::new(id, self.name.clone(), Bytes::copy_from_slice(payload)));
        Ok(JobId(id))
    }
}
