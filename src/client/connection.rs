//! Connection lifecycle: connect, close and bounded-retry reconnection.
//!
//! A [`ConnectionManager`] owns at most one live [`Connection`]. The
//! connection object survives reconnects; only its transport session is
//! swapped, and every swap bumps the connection's generation so channels know
//! to re-open themselves against the new session.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::broker::{BrokerError, ConnectionError, Connector, LinkEvent, Session};

/// Fixed-delay, bounded-retry reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Total connection attempts before giving up (at least one is made).
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    /// Reconnection attempts exhausted; terminal.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The single logical connection to the broker.
pub struct Connection {
    id: u64,
    endpoint: String,
    state: watch::Sender<ConnectionState>,
    session: RwLock<Option<Arc<dyn Session>>>,
    generation: AtomicU64,
    retries: AtomicU32,
    closing: AtomicBool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish()
    }
}

impl Connection {
    fn new(id: u64, endpoint: String) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            id,
            endpoint,
            state,
            session: RwLock::new(None),
            generation: AtomicU64::new(0),
            retries: AtomicU32::new(0),
            closing: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Number of successful handshakes behind this connection.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Consecutive failed attempts in the current (re)connect sequence.
    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::SeqCst)
    }

    fn is_live(&self) -> bool {
        !matches!(
            self.state(),
            ConnectionState::Failed | ConnectionState::Disconnected | ConnectionState::Closing
        )
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
    }

    fn install(&self, session: Arc<dyn Session>) {
        *self.session.write() = Some(session);
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.retries.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
    }

    fn detach(&self) -> Option<Arc<dyn Session>> {
        self.session.write().take()
    }

    /// Wait out any reconnect in progress and return the current session
    /// together with its generation.
    pub async fn ready_session(&self) -> Result<(Arc<dyn Session>, u64), ConnectionError> {
        let mut rx = self.state.subscribe();
        let state = *rx
            .wait_for(|s| *s != ConnectionState::Connecting)
            .await
            .map_err(|_| ConnectionError::NoActiveConnection)?;
        match state {
            ConnectionState::Connected => {
                let session = self.session.read().clone();
                session
                    .map(|s| (s, self.generation()))
                    .ok_or(ConnectionError::NoActiveConnection)
            }
            ConnectionState::Failed => Err(ConnectionError::Failed(self.endpoint.clone())),
            _ => Err(ConnectionError::NoActiveConnection),
        }
    }
}

struct ManagerInner {
    connector: Box<dyn Connector>,
    policy: Option<ReconnectPolicy>,
    current: Mutex<Option<Arc<Connection>>>,
    lifecycle: tokio::sync::Mutex<()>,
    next_id: AtomicU64,
}

impl ManagerInner {
    fn forget(&self, conn: &Arc<Connection>) {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn)) {
            *current = None;
        }
    }

    /// Run connect attempts until one succeeds or the policy is exhausted.
    async fn establish(&self, conn: &Connection) -> Result<Arc<dyn Session>, ConnectionError> {
        let max_attempts = self.policy.map_or(1, |p| p.max_attempts.max(1));
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.connector.connect().await {
                Ok(session) => return Ok(Arc::from(session)),
                Err(err) => {
                    conn.retries.store(attempt, Ordering::SeqCst);
                    let policy = match self.policy {
                        Some(policy) if attempt < max_attempts => policy,
                        _ => {
                            return Err(ConnectionError::Exhausted {
                                endpoint: conn.endpoint.clone(),
                                attempts: attempt,
                                last: err,
                            })
                        }
                    };
                    if conn.closing.load(Ordering::SeqCst) {
                        return Err(ConnectionError::NoActiveConnection);
                    }
                    warn!(
                        endpoint = %conn.endpoint,
                        attempt,
                        max_attempts,
                        delay_ms = policy.delay.as_millis() as u64,
                        error = %err,
                        "Reconnect attempt {}", attempt
                    );
                    sleep(policy.delay).await;
                }
            }
        }
    }
}

/// Owns the process's broker connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// `policy = None` makes every transport failure surface immediately.
    pub fn new(connector: impl Connector, policy: Option<ReconnectPolicy>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                connector: Box::new(connector),
                policy,
                current: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn policy(&self) -> Option<ReconnectPolicy> {
        self.inner.policy
    }

    pub fn endpoint(&self) -> String {
        self.inner.connector.endpoint()
    }

    /// The live connection, if any (including one that is reconnecting).
    pub fn current(&self) -> Option<Arc<Connection>> {
        self.inner
            .current
            .lock()
            .as_ref()
            .filter(|c| c.is_live())
            .cloned()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner
            .current
            .lock()
            .as_ref()
            .map_or(ConnectionState::Disconnected, |c| c.state())
    }

    /// Connect, or return the live connection without a new handshake.
    pub async fn connect(&self) -> Result<Arc<Connection>, BrokerError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if let Some(conn) = self.current() {
            return Ok(conn);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(id, self.inner.connector.endpoint()));
        conn.set_state(ConnectionState::Connecting);
        match self.inner.establish(&conn).await {
            Ok(session) => {
                conn.install(session.clone());
                *self.inner.current.lock() = Some(conn.clone());
                info!(endpoint = %conn.endpoint, connection = id, "connected");
                tokio::spawn(supervise(Arc::downgrade(&self.inner), conn.clone(), session));
                Ok(conn)
            }
            Err(err) => {
                error!(endpoint = %conn.endpoint, error = %err, "connect failed");
                conn.set_state(ConnectionState::Failed);
                Err(err.into())
            }
        }
    }

    /// Close the live connection.
    pub async fn close(&self) -> Result<(), BrokerError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let conn = self
            .inner
            .current
            .lock()
            .take()
            .ok_or(ConnectionError::NoActiveConnection)?;
        conn.closing.store(true, Ordering::SeqCst);
        conn.set_state(ConnectionState::Closing);
        if let Some(session) = conn.detach() {
            if let Err(err) = session.close().await {
                warn!(endpoint = %conn.endpoint, error = %err, "error while closing session");
            }
        }
        conn.set_state(ConnectionState::Disconnected);
        info!(endpoint = %conn.endpoint, connection = conn.id, "connection closed");
        Ok(())
    }
}

/// Watches a connection's session and drives reconnection when it drops.
async fn supervise(manager: Weak<ManagerInner>, conn: Arc<Connection>, mut session: Arc<dyn Session>) {
    loop {
        let event = session.closed().await;
        if conn.closing.load(Ordering::SeqCst) {
            return;
        }
        let Some(inner) = manager.upgrade() else {
            return;
        };
        match &event {
            LinkEvent::Closed => info!(endpoint = %conn.endpoint, "Got a close event"),
            LinkEvent::Error(reason) => {
                warn!(endpoint = %conn.endpoint, %reason, "connection error")
            }
        }
        if inner.policy.is_none() {
            conn.set_state(ConnectionState::Failed);
            conn.detach();
            inner.forget(&conn);
            return;
        }

        // state first, so readers never see Connected without a session
        conn.set_state(ConnectionState::Connecting);
        conn.detach();
        match inner.establish(&conn).await {
            Ok(next) => {
                if conn.closing.load(Ordering::SeqCst) {
                    let _ = next.close().await;
                    return;
                }
                conn.install(next.clone());
                session = next;
                info!(
                    endpoint = %conn.endpoint,
                    generation = conn.generation(),
                    "reconnected"
                );
            }
            Err(err) => {
                error!(endpoint = %conn.endpoint, error = %err, "giving up on connection");
                conn.set_state(ConnectionState::Failed);
                inner.forget(&conn);
                return;
            }
        }
    }
}
