//! Ephemeral TLS-terminating endpoint owned by a single tunnel.
//!
//! The endpoint listens on a Unix socket inside a fresh 0700 temp
//! directory. It accepts exactly one connection (the tunnel's bridge),
//! unlinks its socket, terminates TLS with the tunnel's certificate and
//! serves the decrypted stream as HTTP/1 through the dispatcher.
//!
//! Closing is idempotent: whichever side gets there first (the served
//! connection ending, or the tunnel closing the endpoint) performs the
//! close action, later calls are no-ops.

use super::context::Transport;
use super::dispatch::{ConnInfo, Dispatcher};
use super::error::{ProxyError, ProxyResult};
use std::fs;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};
use uuid::Uuid;

const SOCKET_NAME: &str = "endpoint.sock";

struct Shared {
    id: Uuid,
    path: PathBuf,
    closed: AtomicBool,
    dir: Mutex<Option<TempDir>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        if let Ok(mut task) = self.task.lock()
            && let Some(handle) = task.take()
        {
            handle.abort();
        }

        let dir = self.dir.lock().ok().and_then(|mut dir| dir.take());
        if let Some(dir) = dir
            && let Err(e) = dir.close()
        {
            debug!("Tunnel {} endpoint dir cleanup failed: {}", self.id, e);
        }

        debug!("Tunnel {} endpoint closed", self.id);
        true
    }
}

/// Private rendezvous point where one tunnel's TLS is terminated.
pub struct EphemeralEndpoint {
    shared: Arc<Shared>,
}

impl EphemeralEndpoint {
    /// Bind a fresh endpoint and start serving it.
    ///
    /// Requests decrypted here enter `dispatcher` as [`Transport::Tls`],
    /// attributed to `remote_addr` (the original client).
    pub fn start(
        id: Uuid,
        acceptor: TlsAcceptor,
        dispatcher: Arc<Dispatcher>,
        remote_addr: SocketAddr,
    ) -> ProxyResult<Self> {
        let dir = tempfile::Builder::new()
            .prefix("interpose-tunnel-")
            .tempdir()?;
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700))?;

        let path = dir.path().join(SOCKET_NAME);
        let listener = UnixListener::bind(&path)?;

        let shared = Arc::new(Shared {
            id,
            path,
            closed: AtomicBool::new(false),
            dir: Mutex::new(Some(dir)),
            task: Mutex::new(None),
        });

        let conn = ConnInfo {
            transport: Transport::Tls,
            remote_addr,
        };
        let task_shared = shared.clone();
        let handle = tokio::spawn(async move {
            match serve(listener, &task_shared.path, acceptor, dispatcher, conn).await {
                Ok(()) => debug!("Tunnel {} endpoint connection finished", task_shared.id),
                Err(e) if e.is_disconnect() => {
                    debug!("Tunnel {} endpoint connection ended: {}", task_shared.id, e)
                }
                Err(e) => warn!("Tunnel {} endpoint failed: {}", task_shared.id, e),
            }
            task_shared.close();
        });

        if let Ok(mut task) = shared.task.lock() {
            if shared.closed.load(Ordering::Acquire) {
                handle.abort();
            } else {
                *task = Some(handle);
            }
        }

        Ok(Self { shared })
    }

    /// Socket the tunnel's bridge connects to.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Whether the endpoint has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Close the endpoint.
    ///
    /// Returns `true` only for the call that actually performed the close.
    pub fn close(&self) -> bool {
        self.shared.close()
    }
}

impl Drop for EphemeralEndpoint {
    fn drop(&mut self) {
        self.shared.close();
    }
}

async fn serve(
    listener: UnixListener,
    path: &Path,
    acceptor: TlsAcceptor,
    dispatcher: Arc<Dispatcher>,
    conn: ConnInfo,
) -> ProxyResult<()> {
    let (stream, _) = listener.accept().await?;
    drop(listener);
    if let Err(e) = tokio::fs::remove_file(path).await {
        debug!("Failed to unlink endpoint socket {:?}: {}", path, e);
    }

    let tls = acceptor
        .accept(stream)
        .await
        .map_err(|e| ProxyError::Tls(format!("Client TLS handshake failed: {}", e)))?;

    dispatcher.serve_http(tls, conn).await
}
