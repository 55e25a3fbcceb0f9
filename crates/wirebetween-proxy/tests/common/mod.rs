#![allow(dead_code)]

use std::collections::HashSet;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use wirebetween_common::{Network, ProxyConfig, UpstreamOptions};
use wirebetween_proxy::{
    Accept, Backend, BackendError, BoundAddress, BoxedStream, ProxyError, ProxySupervisor,
    ShutdownSignal, Upstream, UpstreamHandle, Upstreams,
};

pub const PRIMARY: &str = "primary.test:5432";
pub const FAILOVER: &str = "failover.test:5432";
pub const WAIT: Duration = Duration::from_secs(5);

/// What the mock handler does with an accepted connection.
#[derive(Debug, Clone)]
pub enum Behaviour {
    /// Echo every chunk until the client closes its write half.
    Echo,
    /// Never return on its own and ignore the forced signal.
    Hang,
    /// Block until the token is cancelled, then write `bye`.
    HoldUntil(CancellationToken),
    /// Panic as soon as the connection is handed over.
    Panic,
}

#[derive(Debug)]
pub struct MockUpstream {
    pub address: String,
    pub closes: AtomicU32,
}

#[async_trait]
impl Upstream for MockUpstream {
    fn address(&self) -> &str {
        &self.address
    }

    async fn checkout(&self) -> Result<BoxedStream, BackendError> {
        Err(BackendError::Unavailable(self.address.clone()))
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct MockBackend {
    behaviour: Behaviour,
    failing: Mutex<HashSet<String>>,
    panic_at: Mutex<HashSet<String>>,
    panics_remaining: AtomicU32,
    pub contacted: Mutex<Vec<String>>,
    pub upstreams: Mutex<Vec<Arc<MockUpstream>>>,
    pub handled: AtomicUsize,
    pub finished: AtomicUsize,
}

impl MockBackend {
    pub fn new(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            failing: Mutex::new(HashSet::new()),
            panic_at: Mutex::new(HashSet::new()),
            panics_remaining: AtomicU32::new(0),
            contacted: Mutex::new(Vec::new()),
            upstreams: Mutex::new(Vec::new()),
            handled: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        }
    }

    /// Refuse `connect` for the given upstream address.
    pub fn failing(self, address: &str) -> Self {
        self.failing.lock().insert(address.to_owned());
        self
    }

    /// Panic inside the next `count` calls to `connect`.
    pub fn panicking(self, count: u32) -> Self {
        self.panics_remaining.store(count, Ordering::SeqCst);
        self
    }

    /// Panic once, on the first `connect` to the given upstream address.
    pub fn panicking_at(self, address: &str) -> Self {
        self.panic_at.lock().insert(address.to_owned());
        self
    }

    pub fn contacted(&self) -> Vec<String> {
        self.contacted.lock().clone()
    }

    pub fn handled(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn closes_for(&self, address: &str) -> u32 {
        self.upstreams
            .lock()
            .iter()
            .filter(|upstream| upstream.address == address)
            .map(|upstream| upstream.closes.load(Ordering::SeqCst))
            .sum()
    }

    /// Close count of every handle created for `address`, in creation order.
    pub fn close_counts(&self, address: &str) -> Vec<u32> {
        self.upstreams
            .lock()
            .iter()
            .filter(|upstream| upstream.address == address)
            .map(|upstream| upstream.closes.load(Ordering::SeqCst))
            .collect()
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn connect(
        &self,
        options: &UpstreamOptions,
        _probe: bool,
    ) -> Result<UpstreamHandle, BackendError> {
        self.contacted.lock().push(options.address.clone());
        let should_panic = self
            .panics_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_panic {
            panic!("synthetic connect failure");
        }
        if self.panic_at.lock().remove(&options.address) {
            panic!("synthetic connect failure for {}", options.address);
        }
        if self.failing.lock().contains(&options.address) {
            return Err(BackendError::Unavailable(options.address.clone()));
        }
        let upstream = Arc::new(MockUpstream {
            address: options.address.clone(),
            closes: AtomicU32::new(0),
        });
        self.upstreams.lock().push(upstream.clone());
        Ok(upstream)
    }

    async fn handle(
        &self,
        conn: &mut BoxedStream,
        _upstreams: &Upstreams,
        _forced: &ShutdownSignal,
    ) -> Result<(), BackendError> {
        self.handled.fetch_add(1, Ordering::SeqCst);
        match &self.behaviour {
            Behaviour::Echo => {
                let mut buf = [0u8; 1024];
                loop {
                    let read = conn.read(&mut buf).await?;
                    if read == 0 {
                        break;
                    }
                    conn.write_all(&buf[..read]).await?;
                }
            }
            Behaviour::Hang => std::future::pending::<()>().await,
            Behaviour::Panic => panic!("synthetic handler failure"),
            Behaviour::HoldUntil(release) => {
                release.cancelled().await;
                conn.write_all(b"bye").await?;
            }
        }
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Upstreams for driving an acceptor directly.
pub fn mock_upstreams() -> Upstreams {
    Upstreams::new(
        Arc::new(MockUpstream {
            address: PRIMARY.to_owned(),
            closes: AtomicU32::new(0),
        }),
        None,
    )
}

/// TCP accept source whose first `failures` accepts fail with a transient error.
pub struct FlakyAccept {
    listener: TcpListener,
    failures: AtomicU32,
}

impl FlakyAccept {
    pub async fn bind(failures: u32) -> Self {
        Self {
            listener: TcpListener::bind("127.0.0.1:0").await.expect("bind flaky listener"),
            failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl Accept for FlakyAccept {
    fn local_addr(&self) -> io::Result<BoundAddress> {
        self.listener.local_addr().map(BoundAddress::Tcp)
    }

    async fn accept(&self) -> io::Result<(BoxedStream, String)> {
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if fail {
            return Err(io::Error::new(io::ErrorKind::Other, "too many open files"));
        }
        let (stream, peer) = self.listener.accept().await?;
        Ok((Box::new(stream), peer.to_string()))
    }
}

/// Accept source that reports `address` and panics when asked for a connection.
pub struct PanickingAccept(pub BoundAddress);

#[async_trait]
impl Accept for PanickingAccept {
    fn local_addr(&self) -> io::Result<BoundAddress> {
        Ok(self.0.clone())
    }

    async fn accept(&self) -> io::Result<(BoxedStream, String)> {
        panic!("synthetic accept failure")
    }
}

pub fn tcp_config(label: &str) -> ProxyConfig {
    let mut config = ProxyConfig::new(Network::Tcp, "127.0.0.1:0", UpstreamOptions::new(PRIMARY));
    config.label = Some(label.to_owned());
    config
}

type Running = JoinHandle<Result<(), ProxyError>>;

/// Spawn `run()` and wait until the listener is bound.
pub async fn start(supervisor: &ProxySupervisor) -> (Running, BoundAddress) {
    let mut bound = supervisor.watch_address();
    let runner = supervisor.clone();
    let handle = tokio::spawn(async move { runner.run().await });
    let address = tokio::time::timeout(WAIT, bound.wait_for(|address| address.is_some()))
        .await
        .expect("listener bound in time")
        .expect("address publisher alive")
        .clone()
        .expect("address present");
    (handle, address)
}

pub async fn start_tcp(supervisor: &ProxySupervisor) -> (Running, SocketAddr) {
    let (handle, address) = start(supervisor).await;
    (handle, address.tcp().expect("tcp listener"))
}

/// Poll `condition` until it holds or the wait budget runs out.
pub async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn within<F: Future>(what: &str, future: F) -> F::Output {
    tokio::time::timeout(WAIT, future)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
}

/// A plain TCP echo server standing in for a real upstream.
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo server");
    let address = listener.local_addr().expect("echo address");
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    address
}

/// An address nothing listens on.
pub async fn dead_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind probe");
    let address = listener.local_addr().expect("probe address");
    drop(listener);
    address
}
