//! beanstalkd ("tube") backend.
//!
//! One TCP (optionally TLS) socket per session. Commands are serialized on the
//! socket; every channel operation takes the link lock for the whole
//! request/reply exchange. Reserves are issued as `reserve-with-timeout` in
//! short slices and the lock is released between slices, so channels sharing
//! the session take turns instead of waiting behind an idle tube. Before each
//! slice the connection's watch list is pinned to the channel's own tube so a
//! job is never handed to the wrong channel.

pub mod protocol;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::{
    AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use self::protocol::{read_reply, PeekKind, Reply, Request};
use super::transport::{ChannelTransport, Connector, LinkEvent, Session};
use super::{Job, JobId, PutOptions, QueueStats, TransportError, DEFAULT_CHANNEL};

/// Priority used when a failed job is released back to its tube.
const RELEASE_PRIORITY: u32 = 1024;

/// Server-side wait of one reserve slice, in seconds.
const RESERVE_SLICE_SECS: u64 = 1;

trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

type BoxedStream = Box<dyn IoStream>;

/// Connects to a beanstalkd server.
pub struct TubeConnector {
    host: String,
    port: u16,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl TubeConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: None,
        }
    }

    pub fn with_tls(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }
}

#[async_trait]
impl Connector for TubeConnector {
    async fn connect(&self) -> Result<Box<dyn Session>, TransportError> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port)).await?;
        tcp.set_nodelay(true)?;
        let stream: BoxedStream = match &self.tls {
            Some(config) => {
                let server_name = rustls::ServerName::try_from(self.host.as_str())
                    .map_err(|e| TransportError::Tls(format!("invalid server name: {e}")))?;
                let tls = TlsConnector::from(config.clone())
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| TransportError::Tls(e.to_string()))?;
                Box::new(tls)
            }
            None => Box::new(tcp),
        };
        debug!(endpoint = %self.endpoint(), "tube session established");
        Ok(Box::new(TubeSession::new(stream)))
    }

    fn endpoint(&self) -> String {
        let scheme = if self.tls.is_some() { "beanstalks" } else { "beanstalk" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

struct Link {
    reader: BufReader<ReadHalf<BoxedStream>>,
    writer: WriteHalf<BoxedStream>,
    using: String,
    watching: Vec<String>,
    /// Left behind by an exchange whose future was dropped.
    pending: Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Idle,
    /// The request may be partially written; the stream cannot be resynced.
    Writing,
    /// The request was sent and its reply has not been read yet.
    Reply(&'static str),
}

struct Shared {
    link: Mutex<Link>,
    state: watch::Sender<Option<LinkEvent>>,
}

impl Shared {
    fn fail(&self, reason: String) {
        self.state.send_if_modified(|state| {
            if state.is_none() {
                warn!(%reason, "tube session lost");
                *state = Some(LinkEvent::Error(reason));
                true
            } else {
                false
            }
        });
    }

    async fn exchange(&self, link: &mut Link, request: Request<'_>) -> Result<Reply, TransportError> {
        if self.state.borrow().is_some() {
            return Err(TransportError::Closed);
        }
        self.settle_abandoned(link).await?;
        let result = roundtrip(link, &request).await;
        if let Err(err) = &result {
            if !matches!(err, TransportError::Rejected { .. }) {
                self.fail(format!("{} failed: {err}", request.verb()));
            }
        }
        result
    }

    /// Consume the reply owed to a request whose caller went away. A job
    /// reserved on its behalf is released straight back to its tube.
    async fn settle_abandoned(&self, link: &mut Link) -> Result<(), TransportError> {
        let verb = match link.pending {
            Pending::Idle => return Ok(()),
            Pending::Writing => {
                self.fail("request abandoned mid-write".into());
                return Err(TransportError::Closed);
            }
            Pending::Reply(verb) => verb,
        };
        debug!(verb, "draining reply to an abandoned request");
        let drained = read_reply(&mut link.reader, verb).await;
        let id = match drained {
            Ok(Reply::Reserved { id, .. }) => {
                link.pending = Pending::Idle;
                id
            }
            Ok(_) | Err(TransportError::Rejected { .. }) => {
                link.pending = Pending::Idle;
                return Ok(());
            }
            Err(err) => {
                self.fail(format!("{verb} failed: {err}"));
                return Err(err);
            }
        };
        let release = Request::Release {
            id,
            priority: RELEASE_PRIORITY,
            delay: 0,
        };
        match roundtrip(link, &release).await {
            Ok(_) | Err(TransportError::Rejected { .. }) => {
                debug!(job = id, "released job reserved by an abandoned reserve");
                Ok(())
            }
            Err(err) => {
                self.fail(format!("release failed: {err}"));
                Err(err)
            }
        }
    }

    async fn use_tube(&self, link: &mut Link, tube: &str) -> Result<(), TransportError> {
        if link.using == tube {
            return Ok(());
        }
        match self.exchange(link, Request::Use(tube)).await? {
            Reply::Using(name) => {
                link.using = name;
                Ok(())
            }
            other => Err(unexpected("use", &other)),
        }
    }

    /// Make `tube` the only watched tube on this connection.
    async fn watch_only(&self, link: &mut Link, tube: &str) -> Result<(), TransportError> {
        if !link.watching.iter().any(|t| t == tube) {
            match self.exchange(link, Request::Watch(tube)).await? {
                Reply::Watching(_) => link.watching.push(tube.to_string()),
                other => return Err(unexpected("watch", &other)),
            }
        }
        let others: Vec<String> = link
            .watching
            .iter()
            .filter(|t| t.as_str() != tube)
            .cloned()
            .collect();
        for other in others {
            match self.exchange(link, Request::Ignore(&other)).await? {
                Reply::Watching(_) => link.watching.retain(|t| t != &other),
                Reply::NotIgnored => {}
                reply => return Err(unexpected("ignore", &reply)),
            }
        }
        Ok(())
    }

    async fn stats(&self, link: &mut Link, tube: &str) -> Result<QueueStats, TransportError> {
        match self.exchange(link, Request::StatsTube(tube)).await? {
            Reply::Ok(body) => {
                let fields: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_slice(&body)
                    .map_err(|e| TransportError::Protocol(format!("stats-tube yaml: {e}")))?;
                let count = |key: &str| fields.get(key).and_then(serde_yaml::Value::as_u64);
                let messages = count("current-jobs-ready");
                let consumers = count("current-watching");
                let details = fields
                    .iter()
                    .filter_map(|(k, v)| serde_json::to_value(v).ok().map(|v| (k.clone(), v)))
                    .collect();
                Ok(QueueStats {
                    name: tube.to_string(),
                    messages,
                    consumers,
                    details,
                })
            }
            Reply::NotFound => Err(TransportError::rejected(format!("stats-tube {tube}"), "NOT_FOUND")),
            other => Err(unexpected("stats-tube", &other)),
        }
    }

    async fn purge(&self, link: &mut Link, tube: &str) -> Result<u64, TransportError> {
        self.use_tube(link, tube).await?;
        let mut purged = 0;
        for kind in [PeekKind::Ready, PeekKind::Delayed, PeekKind::Buried] {
            loop {
                match self.exchange(link, Request::Peek(kind)).await? {
                    Reply::Found { id, .. } => match self.exchange(link, Request::Delete(id)).await? {
                        Reply::Deleted => purged += 1,
                        // reserved by another client between peek and delete
                        Reply::NotFound => {}
                        other => return Err(unexpected("delete", &other)),
                    },
                    Reply::NotFound => break,
                    other => return Err(unexpected("peek", &other)),
                }
            }
        }
        Ok(purged)
    }
}

async fn roundtrip(link: &mut Link, request: &Request<'_>) -> Result<Reply, TransportError> {
    link.pending = Pending::Writing;
    link.writer.write_all(&request.encode()).await?;
    link.writer.flush().await?;
    link.pending = Pending::Reply(request.verb());
    let reply = read_reply(&mut link.reader, request.verb()).await;
    if matches!(reply, Ok(_) | Err(TransportError::Rejected { .. })) {
        link.pending = Pending::Idle;
    }
    reply
}

fn unexpected(verb: &str, reply: &Reply) -> TransportError {
    TransportError::Protocol(format!("unexpected reply to {verb}: {reply:?}"))
}

/// A live beanstalkd connection.
pub struct TubeSession {
    shared: Arc<Shared>,
}

impl TubeSession {
    fn new(stream: BoxedStream) -> Self {
        let (read, write) = tokio::io::split(stream);
        let link = Link {
            reader: BufReader::new(read),
            writer: write,
            using: DEFAULT_CHANNEL.to_string(),
            watching: vec![DEFAULT_CHANNEL.to_string()],
            pending: Pending::Idle,
        };
        let (state, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                link: Mutex::new(link),
                state,
            }),
        }
    }
}

#[async_trait]
impl Session for TubeSession {
    async fn open_channel(&self, name: &str) -> Result<Box<dyn ChannelTransport>, TransportError> {
        if self.shared.state.borrow().is_some() {
            return Err(TransportError::Closed);
        }
        Ok(Box::new(TubeChannel {
            shared: self.shared.clone(),
            name: name.to_string(),
        }))
    }

    async fn closed(&self) -> LinkEvent {
        let mut rx = self.shared.state.subscribe();
        let event = match rx.wait_for(Option::is_some).await {
            Ok(event) => event.clone().unwrap_or(LinkEvent::Closed),
            Err(_) => LinkEvent::Closed,
        };
        event
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut link = self.shared.link.lock().await;
        // quit has no reply
        let _ = link.writer.write_all(&Request::Quit.encode()).await;
        let _ = link.writer.shutdown().await;
        self.shared.state.send_replace(Some(LinkEvent::Closed));
        Ok(())
    }

    async fn list_channels(&self) -> Result<Vec<String>, TransportError> {
        let mut link = self.shared.link.lock().await;
        match self.shared.exchange(&mut link, Request::ListTubes).await? {
            Reply::Ok(body) => serde_yaml::from_slice(&body)
                .map_err(|e| TransportError::Protocol(format!("list-tubes yaml: {e}"))),
            other => Err(unexpected("list-tubes", &other)),
        }
    }
}

struct TubeChannel {
    shared: Arc<Shared>,
    name: String,
}

#[async_trait]
impl ChannelTransport for TubeChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn watch(&self) -> Result<(), TransportError> {
        let mut link = self.shared.link.lock().await;
        self.shared.watch_only(&mut link, &self.name).await
    }

    async fn reserve(&self) -> Result<Job, TransportError> {
        loop {
            let mut link = self.shared.link.lock().await;
            self.shared.watch_only(&mut link, &self.name).await?;
            let slice = Request::ReserveWithTimeout(RESERVE_SLICE_SECS);
            match self.shared.exchange(&mut link, slice).await? {
                Reply::Reserved { id, body } => {
                    return Ok(Job {
                        id: JobId(id),
                        channel: self.name.clone(),
                        payload: body,
                        redelivered: false,
                    })
                }
                Reply::TimedOut => {}
                Reply::DeadlineSoon => {
                    debug!(tube = %self.name, "deadline soon on a reserved job; reserving again");
                }
                other => return Err(unexpected("reserve-with-timeout", &other)),
            }
            drop(link);
            // the link mutex is fair; queued channels get the socket first
            tokio::task::yield_now().await;
        }
    }

    async fn delete(&self, id: JobId) -> Result<(), TransportError> {
        let mut link = self.shared.link.lock().await;
        match self.shared.exchange(&mut link, Request::Delete(id.0)).await? {
            Reply::Deleted => Ok(()),
            Reply::NotFound => Err(TransportError::rejected(format!("delete {id}"), "NOT_FOUND")),
            other => Err(unexpected("delete", &other)),
        }
    }

    async fn release(&self, id: JobId) -> Result<(), TransportError> {
        let mut link = self.shared.link.lock().await;
        let request = Request::Release {
            id: id.0,
            priority: RELEASE_PRIORITY,
            delay: 0,
        };
        match self.shared.exchange(&mut link, request).await? {
            Reply::Released => Ok(()),
            Reply::Buried(_) => Err(TransportError::rejected(format!("release {id}"), "BURIED")),
            Reply::NotFound => Err(TransportError::rejected(format!("release {id}"), "NOT_FOUND")),
            other => Err(unexpected("release", &other)),
        }
    }

    async fn inspect(&self) -> Result<QueueStats, TransportError> {
        let mut link = self.shared.link.lock().await;
        self.shared.stats(&mut link, &self.name).await
    }

    async fn purge(&self) -> Result<u64, TransportError> {
        let mut link = self.shared.link.lock().await;
        self.shared.purge(&mut link, &self.name).await
    }

    /// beanstalkd drops a tube once nothing uses, watches or fills it, so
    /// removal drains it and stops watching it from this connection.
    async fn remove(&self) -> Result<u64, TransportError> {
        let mut link = self.shared.link.lock().await;
        let stats = self.shared.stats(&mut link, &self.name).await?;
        let ours = u64::from(link.watching.iter().any(|t| t == &self.name));
        if stats.consumers.unwrap_or(0) > ours {
            return Err(TransportError::rejected(format!("remove {}", self.name), "in use"));
        }
        let purged = self.shared.purge(&mut link, &self.name).await?;
        if ours == 1 && link.watching.len() > 1 {
            if let Reply::Watching(_) = self.shared.exchange(&mut link, Request::Ignore(&self.name)).await? {
                link.watching.retain(|t| t != &self.name);
            }
        }
        if link.using == self.name && self.name != DEFAULT_CHANNEL {
            self.shared.use_tube(&mut link, DEFAULT_CHANNEL).await?;
        }
        Ok(purged)
    }

    async fn enqueue(&self, payload: &[u8], options: &PutOptions) -> Result<JobId, TransportError> {
        let mut link = self.shared.link.lock().await;
        self.shared.use_tube(&mut link, &self.name).await?;
        let request = Request::Put {
            priority: options.priority,
            delay: options.delay.as_secs(),
            ttr: options.ttr.as_secs().max(1),
            body: payload,
        };
        match self.shared.exchange(&mut link, request).await? {
            Reply::Inserted(id) => Ok(JobId(id)),
            Reply::Buried(id) => Err(TransportError::rejected(
                "put",
                format!("BURIED {}", id.map(|i| i.to_string()).unwrap_or_default()),
            )),
            other => Err(unexpected("put", &other)),
        }
    }
}
