//! ---
//! wb_section: "02-connection-lifecycle"
//! wb_subsection: "module"
//! wb_type: "source"
//! wb_scope: "code"
//! wb_description: "Listening transports: TCP and unix-domain sockets."
//! wb_version: "v0.1.0"
//! wb_owner: "tbd"
//! ---
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
#[cfg(unix)]
use parking_lot::{Mutex, MutexGuard};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tracing::{debug, warn};
use wirebetween_common::{Network, ProxyConfig};

use crate::backend::BoxedStream;
use crate::error::ProxyError;

/// Address a listener actually bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundAddress {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl BoundAddress {
    pub fn tcp(&self) -> Option<SocketAddr> {
        match self {
            BoundAddress::Tcp(addr) => Some(*addr),
            BoundAddress::Unix(_) => None,
        }
    }
}

impl fmt::Display for BoundAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundAddress::Tcp(addr) => write!(f, "tcp://{}", addr),
            BoundAddress::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Source of accepted client connections for one acceptor.
#[async_trait]
pub trait Accept: Send + Sync {
    fn local_addr(&self) -> io::Result<BoundAddress>;

    /// Accept one client, returning the stream and its remote address (may be empty).
    async fn accept(&self) -> io::Result<(BoxedStream, String)>;
}

/// Listening socket owned by a single acceptor. Dropping it closes the socket.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixSocket),
}

impl Listener {
    /// Bind the transport described by `config`.
    pub async fn bind(config: &ProxyConfig) -> Result<Self, ProxyError> {
        match config.network {
            Network::Tcp => {
                let listener = TcpListener::bind(config.address.as_str())
                    .await
                    .map_err(|source| ProxyError::Bind {
                        address: config.address.clone(),
                        source,
                    })?;
                Ok(Listener::Tcp(listener))
            }
            #[cfg(unix)]
            Network::Unix => {
                UnixSocket::bind(Path::new(&config.address), config.unlink).map(Listener::Unix)
            }
            #[cfg(not(unix))]
            Network::Unix => Err(ProxyError::Bind {
                address: config.address.clone(),
                source: io::Error::new(
                    io::ErrorKind::Unsupported,
                    "unix sockets are not supported on this platform",
                ),
            }),
        }
    }
}

#[async_trait]
impl Accept for Listener {
    fn local_addr(&self) -> io::Result<BoundAddress> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().map(BoundAddress::Tcp),
            #[cfg(unix)]
            Listener::Unix(socket) => Ok(BoundAddress::Unix(socket.path.clone())),
        }
    }

    async fn accept(&self) -> io::Result<(BoxedStream, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(error = %err, "failed to set TCP_NODELAY");
                }
                Ok((Box::new(stream), peer.to_string()))
            }
            #[cfg(unix)]
            Listener::Unix(socket) => {
                let (stream, peer) = socket.listener.accept().await?;
                let remote = peer
                    .as_pathname()
                    .map(|path| path.display().to_string())
                    .unwrap_or_default();
                Ok((Box::new(stream), remote))
            }
        }
    }
}

/// Unix-domain listener that removes its socket file when dropped.
#[cfg(unix)]
#[derive(Debug)]
pub struct UnixSocket {
    listener: UnixListener,
    path: PathBuf,
}

#[cfg(unix)]
impl UnixSocket {
    fn bind(path: &Path, unlink: bool) -> Result<Self, ProxyError> {
        if unlink {
            unlink_stale(path)?;
        }
        let listener = {
            let _umask = UmaskGuard::clear();
            UnixListener::bind(path)
        }
        .map_err(|source| ProxyError::Bind {
            address: path.display().to_string(),
            source,
        })?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }
}

#[cfg(unix)]
impl Drop for UnixSocket {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "failed to remove socket file");
            }
        }
    }
}

/// Remove a leftover socket file. A missing file is not an error.
#[cfg(unix)]
fn unlink_stale(path: &Path) -> Result<(), ProxyError> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed stale socket file");
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ProxyError::Unlink {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Serializes every mask swap in the process so concurrent binds restore in order.
#[cfg(unix)]
static UMASK_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Clears the process file-creation mask and restores the previous one on drop.
///
/// The mask lock is held for the guard's lifetime and released after the restore.
#[cfg(unix)]
struct UmaskGuard {
    previous: libc::mode_t,
    _lock: MutexGuard<'static, ()>,
}

#[cfg(unix)]
impl UmaskGuard {
    fn clear() -> Self {
        let lock = UMASK_LOCK.lock();
        // SAFETY: umask only swaps the process mask and cannot fail.
        let previous = unsafe { libc::umask(0) };
        Self {
            previous,
            _lock: lock,
        }
    }
}

#[cfg(unix)]
impl Drop for UmaskGuard {
    fn drop(&mut self) {
        // SAFETY: see `UmaskGuard::clear`.
        unsafe {
            libc::umask(self.previous);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use wirebetween_common::UpstreamOptions;

    fn unix_config(path: &Path, unlink: bool) -> ProxyConfig {
        let mut config = ProxyConfig::new(
            Network::Unix,
            path.display().to_string(),
            UpstreamOptions::new("127.0.0.1:5432"),
        );
        config.unlink = unlink;
        config
    }

    // Only test in this binary that touches the process umask.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn unix_bind_clears_and_restores_umask() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.sock");

        let outer = unsafe { libc::umask(0o077) };
        let listener = Listener::bind(&unix_config(&path, false)).await;
        let restored = unsafe { libc::umask(outer) };

        let listener = listener.expect("bind succeeds");
        assert_eq!(restored, 0o077);
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);
        assert_eq!(
            listener.local_addr().unwrap(),
            BoundAddress::Unix(path.clone())
        );

        drop(listener);
        assert!(!path.exists());

        let outer = unsafe { libc::umask(0o027) };
        let mut binds = Vec::new();
        for index in 0..16 {
            let config = unix_config(&dir.path().join(format!("p{}.sock", index)), false);
            binds.push(tokio::spawn(async move { Listener::bind(&config).await.map(|_| ()) }));
        }
        for bind in binds {
            bind.await.unwrap().expect("concurrent bind succeeds");
        }
        let restored = unsafe { libc::umask(outer) };
        assert_eq!(restored, 0o027);
    }

    #[test]
    fn unlink_ignores_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        unlink_stale(&dir.path().join("absent.sock")).unwrap();
    }

    #[tokio::test]
    async fn tcp_bind_failure_names_the_address() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = taken.local_addr().unwrap().to_string();
        let config = ProxyConfig::new(Network::Tcp, address.clone(), UpstreamOptions::new("x:1"));
        match Listener::bind(&config).await {
            Err(ProxyError::Bind { address: reported, source }) => {
                assert_eq!(reported, address);
                assert_eq!(source.kind(), io::ErrorKind::AddrInUse);
            }
            other => panic!("unexpected bind outcome: {:?}", other.map(|_| ())),
        }
    }
}
