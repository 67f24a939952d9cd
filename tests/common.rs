//! Common test harness utilities for integration tests.
//!
//! This module provides helpers for:
//! - Building connection managers over the in-memory broker
//! - Waiting on asynchronous conditions with a deadline
//! - Capturing log output
//! - Generating ephemeral TLS materials
//! - Running a small beanstalkd-compatible server on loopback

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use jobstats::broker::memory::MemoryBroker;
use jobstats::client::{ConnectionManager, ReconnectPolicy};
use parking_lot::Mutex;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};

/// Reconnect policy with a short delay so tests run quickly.
pub fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts,
        delay: Duration::from_millis(10),
    }
}

pub fn memory_manager(broker: &MemoryBroker, policy: Option<ReconnectPolicy>) -> ConnectionManager {
    ConnectionManager::new(broker.connector(), policy)
}

/// Poll `check` until it holds, panicking after two seconds.
pub async fn eventually(what: &str, check: impl FnMut() -> bool) {
    eventually_within(what, Duration::from_secs(2), check).await
}

/// Poll `check` until it holds, panicking after `limit`.
pub async fn eventually_within(what: &str, limit: Duration, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + limit;
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Await `fut`, panicking if it takes longer than two seconds.
pub async fn within<T>(what: &str, fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), fut)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

// =============================================================================
// Log capture
// =============================================================================

/// Collects formatted log output so tests can assert on what was reported.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    /// A plain-text subscriber writing into this capture. Install it with
    /// `tracing::subscriber::set_default` on a current-thread runtime.
    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync {
        let sink = self.clone();
        tracing_subscriber::fmt()
            .with_writer(move || sink.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// =============================================================================
// TLS materials
// =============================================================================

/// TLS material paths returned by [`write_tls_materials`].
#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub chain: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

/// Generate a self-signed CA and a localhost leaf signed by it, and write
/// `ca.pem`, `chain.pem` (leaf + CA) and `key.pem` into `dir`.
pub fn write_tls_materials(dir: &Path) -> TlsPaths {
    let ca_key = KeyPair::generate().expect("generate CA key");
    let mut ca_params = CertificateParams::default();
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "jobstats-test-ca");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_cert = ca_params.self_signed(&ca_key).expect("self-sign CA");
    let ca_pem = ca_cert.pem();

    let leaf_key = KeyPair::generate().expect("generate leaf key");
    let mut leaf_params =
        CertificateParams::new(vec!["localhost".into()]).expect("leaf cert params");
    leaf_params
        .distinguished_name
        .push(DnType::CommonName, "jobstats-client");
    let leaf_cert = leaf_params
        .signed_by(&leaf_key, &ca_cert, &ca_key)
        .expect("sign leaf cert");

    let mut chain = leaf_cert.pem();
    chain.push_str(&ca_pem);

    let ca_path = dir.join("ca.pem");
    let chain_path = dir.join("chain.pem");
    let key_path = dir.join("key.pem");
    fs::write(&ca_path, &ca_pem).expect("write CA");
    fs::write(&chain_path, &chain).expect("write chain");
    fs::write(&key_path, leaf_key.serialize_pem()).expect("write key");

    TlsPaths {
        chain: chain_path,
        key: key_path,
        ca: ca_path,
    }
}

// =============================================================================
// Fake beanstalkd
// =============================================================================

#[derive(Default)]
struct Tube {
    ready: VecDeque<(u64, Vec<u8>)>,
    watching: u64,
    using: u64,
}

#[derive(Default)]
struct FakeState {
    tubes: BTreeMap<String, Tube>,
    reserved: HashMap<u64, (String, Vec<u8>)>,
    deleted: Vec<u64>,
    released: Vec<u64>,
    log: Vec<String>,
    next_id: u64,
}

impl FakeState {
    fn tube(&mut self, name: &str) -> &mut Tube {
        self.tubes.entry(name.to_string()).or_default()
    }

    fn take_ready(&mut self, watching: &[String]) -> Option<(u64, Vec<u8>)> {
        for name in watching {
            if let Some(job) = self.tubes.get_mut(name).and_then(|t| t.ready.pop_front()) {
                self.reserved.insert(job.0, (name.clone(), job.1.clone()));
                return Some(job);
            }
        }
        None
    }
}

/// A loopback server speaking enough of the beanstalkd protocol for the tube
/// backend: use/watch/ignore, put, reserve and reserve-with-timeout, delete,
/// release, peek-*,
/// stats-tube, list-tubes and quit.
#[derive(Clone)]
pub struct FakeBeanstalkd {
    pub addr: SocketAddr,
    state: Arc<Mutex<FakeState>>,
    job_ready: Arc<Notify>,
    kill: Arc<watch::Sender<u64>>,
}

impl FakeBeanstalkd {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake beanstalkd");
        let addr = listener.local_addr().expect("fake beanstalkd addr");
        let (kill, _) = watch::channel(0);
        let server = Self {
            addr,
            state: Arc::new(Mutex::new(FakeState::default())),
            job_ready: Arc::new(Notify::new()),
            kill: Arc::new(kill),
        };
        let accept = server.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let conn = accept.clone();
                tokio::spawn(async move {
                    let _ = conn.serve(stream).await;
                });
            }
        });
        server
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn put(&self, tube: &str, body: &str) -> u64 {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.tube(tube).ready.push_back((id, body.as_bytes().to_vec()));
        drop(state);
        self.job_ready.notify_waiters();
        id
    }

    pub fn ready(&self, tube: &str) -> Vec<String> {
        self.state
            .lock()
            .tubes
            .get(tube)
            .map(|t| {
                t.ready
                    .iter()
                    .map(|(_, body)| String::from_utf8_lossy(body).into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn deleted(&self) -> Vec<u64> {
        self.state.lock().deleted.clone()
    }

    pub fn released(&self) -> Vec<u64> {
        self.state.lock().released.clone()
    }

    /// Every command line received, across all connections.
    pub fn log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    /// Drop every open client connection.
    pub fn kill_connections(&self) {
        self.kill.send_modify(|n| *n += 1);
    }

    async fn serve(&self, stream: TcpStream) -> std::io::Result<()> {
        let mut killed = self.kill.subscribe();
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        let mut using = "default".to_string();
        let mut watching = vec!["default".to_string()];
        {
            let mut state = self.state.lock();
            state.tube("default").watching += 1;
            state.tube("default").using += 1;
        }

        let result = loop {
            let mut line = String::new();
            let read = tokio::select! {
                read = reader.read_line(&mut line) => read?,
                _ = killed.changed() => break Ok(()),
            };
            if read == 0 {
                break Ok(());
            }
            let line = line.trim_end().to_string();
            self.state.lock().log.push(line.clone());
            let mut parts = line.split(' ');
            let verb = parts.next().unwrap_or_default();
            let arg = parts.next().unwrap_or_default().to_string();
            let num = |s: &str| s.parse::<u64>().unwrap_or_default();

            let reply: Vec<u8> = match verb {
                "use" => {
                    let mut state = self.state.lock();
                    state.tube(&using).using -= 1;
                    state.tube(&arg).using += 1;
                    using = arg;
                    format!("USING {using}\r\n").into_bytes()
                }
                "watch" => {
                    if !watching.contains(&arg) {
                        self.state.lock().tube(&arg).watching += 1;
                        watching.push(arg);
                    }
                    format!("WATCHING {}\r\n", watching.len()).into_bytes()
                }
                "ignore" => {
                    if watching == [arg.clone()] {
                        b"NOT_IGNORED\r\n".to_vec()
                    } else {
                        if watching.contains(&arg) {
                            self.state.lock().tube(&arg).watching -= 1;
                            watching.retain(|t| t != &arg);
                        }
                        format!("WATCHING {}\r\n", watching.len()).into_bytes()
                    }
                }
                "put" => {
                    let rest: Vec<&str> = line.split(' ').collect();
                    let len = num(rest.get(4).copied().unwrap_or_default()) as usize;
                    let mut body = vec![0; len + 2];
                    reader.read_exact(&mut body).await?;
                    body.truncate(len);
                    let mut state = self.state.lock();
                    state.next_id += 1;
                    let id = state.next_id;
                    state.tube(&using).ready.push_back((id, body));
                    drop(state);
                    self.job_ready.notify_waiters();
                    format!("INSERTED {id}\r\n").into_bytes()
                }
                "reserve" | "reserve-with-timeout" => {
                    let limit =
                        (verb == "reserve-with-timeout").then(|| Duration::from_secs(num(&arg)));
                    let expired = async move {
                        match limit {
                            Some(limit) => tokio::time::sleep(limit).await,
                            None => std::future::pending().await,
                        }
                    };
                    tokio::pin!(expired);
                    // None: connection killed; Some(None): timed out
                    let reserved = loop {
                        let notified = self.job_ready.notified();
                        tokio::pin!(notified);
                        notified.as_mut().enable();
                        let job = self.state.lock().take_ready(&watching);
                        if job.is_some() {
                            break Some(job);
                        }
                        tokio::select! {
                            _ = &mut notified => {}
                            _ = &mut expired => break Some(None),
                            _ = killed.changed() => break None,
                        }
                    };
                    match reserved {
                        None => break Ok(()),
                        Some(None) => b"TIMED_OUT\r\n".to_vec(),
                        Some(Some((id, body))) => {
                            let mut out = format!("RESERVED {id} {}\r\n", body.len()).into_bytes();
                            out.extend_from_slice(&body);
                            out.extend_from_slice(b"\r\n");
                            out
                        }
                    }
                }
                "delete" => {
                    let id = num(&arg);
                    let mut state = self.state.lock();
                    let reserved = state.reserved.remove(&id).is_some();
                    let mut ready = false;
                    for tube in state.tubes.values_mut() {
                        let before = tube.ready.len();
                        tube.ready.retain(|(j, _)| *j != id);
                        ready |= tube.ready.len() != before;
                    }
                    if reserved || ready {
                        state.deleted.push(id);
                        b"DELETED\r\n".to_vec()
                    } else {
                        b"NOT_FOUND\r\n".to_vec()
                    }
                }
                "release" => {
                    let id = num(&arg);
                    let mut state = self.state.lock();
                    match state.reserved.remove(&id) {
                        Some((tube, body)) => {
                            state.tube(&tube).ready.push_front((id, body));
                            state.released.push(id);
                            drop(state);
                            self.job_ready.notify_waiters();
                            b"RELEASED\r\n".to_vec()
                        }
                        None => b"NOT_FOUND\r\n".to_vec(),
                    }
                }
                "peek-ready" => {
                    let state = self.state.lock();
                    match state.tubes.get(&using).and_then(|t| t.ready.front()) {
                        Some((id, body)) => {
                            let mut out = format!("FOUND {id} {}\r\n", body.len()).into_bytes();
                            out.extend_from_slice(body);
                            out.extend_from_slice(b"\r\n");
                            out
                        }
                        None => b"NOT_FOUND\r\n".to_vec(),
                    }
                }
                "peek-delayed" | "peek-buried" => b"NOT_FOUND\r\n".to_vec(),
                "stats-tube" => {
                    let state = self.state.lock();
                    match state.tubes.get(&arg) {
                        Some(tube) => {
                            let reserved =
                                state.reserved.values().filter(|(t, _)| t == &arg).count();
                            let yaml = format!(
                                "---\nname: {arg}\ncurrent-jobs-urgent: 0\ncurrent-jobs-ready: {}\n\
                                 current-jobs-reserved: {reserved}\ncurrent-jobs-delayed: 0\n\
                                 current-jobs-buried: 0\ncurrent-using: {}\ncurrent-watching: {}\n",
                                tube.ready.len(),
                                tube.using,
                                tube.watching,
                            );
                            ok_body(&yaml)
                        }
                        None => b"NOT_FOUND\r\n".to_vec(),
                    }
                }
                "list-tubes" => {
                    let state = self.state.lock();
                    let mut yaml = String::from("---\n");
                    for name in state.tubes.keys() {
                        yaml.push_str(&format!("- {name}\n"));
                    }
                    ok_body(&yaml)
                }
                "quit" => break Ok(()),
                _ => b"UNKNOWN_COMMAND\r\n".to_vec(),
            };
            write.write_all(&reply).await?;
        };

        let mut state = self.state.lock();
        for name in &watching {
            state.tube(name).watching -= 1;
        }
        state.tube(&using).using -= 1;
        result
    }
}

fn ok_body(body: &str) -> Vec<u8> {
    let mut out = format!("OK {}\r\n", body.len()).into_bytes();
    out.extend_from_slice(body.as_bytes());
    out.extend_from_slice(b"\r\n");
    out
}
