//! Port-forward handles and readiness checks

use crate::error::{Error, Result};
use crate::options::{AdapterKind, KubeCluster};
use async_net::{TcpListener, TcpStream};
use async_process::Child;
use futures::io::{AsyncBufReadExt, AsyncRead, BufReader};
use futures::StreamExt;
use smol::Timer;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default bound on waiting for a forward to come up
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

const PROBE_INTERVAL: Duration = Duration::from_millis(50);

/// Settings for starting a port forward
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForwardOptions {
    /// Namespace (Kubernetes)
    pub namespace: Option<String>,
    /// kubeconfig context and file (Kubernetes)
    pub cluster: KubeCluster,
    /// Bound on waiting for the forward to be confirmed
    pub ready_timeout: Duration,
}

impl Default for PortForwardOptions {
    fn default() -> Self {
        Self {
            namespace: None,
            cluster: KubeCluster::default(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

impl PortForwardOptions {
    /// Set the kubeconfig context and file
    pub fn on_cluster(mut self, cluster: KubeCluster) -> Self {
        self.cluster = cluster;
        self
    }
}

/// A local port forwarded to a remote endpoint
///
/// Starts closed and opens once the forward is confirmed listening. The
/// backing process ends on [`stop`](Self::stop) or drop.
pub struct PortForward {
    target: String,
    local_port: AtomicU16,
    remote_port: u16,
    open: AtomicBool,
    child: Mutex<Option<Child>>,
    keepalive: Mutex<Option<Box<dyn Send>>>,
}

impl fmt::Debug for PortForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortForward")
            .field("target", &self.target)
            .field("local_port", &self.local_port())
            .field("remote_port", &self.remote_port)
            .field("open", &self.is_open())
            .finish()
    }
}

impl PortForward {
    pub(crate) fn new(target: impl Into<String>, local_port: u16, remote_port: u16) -> Self {
        Self {
            target: target.into(),
            local_port: AtomicU16::new(local_port),
            remote_port,
            open: AtomicBool::new(false),
            child: Mutex::new(None),
            keepalive: Mutex::new(None),
        }
    }

    /// Hand over the forwarding process and anything that must outlive it
    pub(crate) fn attach(&self, child: Child, keepalive: Option<Box<dyn Send>>) {
        *self
            .child
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(child);
        *self
            .keepalive
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = keepalive;
    }

    pub(crate) fn mark_open(&self, local_port: u16) {
        self.local_port.store(local_port, Ordering::SeqCst);
        self.open.store(true, Ordering::SeqCst);
        debug!(
            "forwarding 127.0.0.1:{} -> {}:{}",
            local_port, self.target, self.remote_port
        );
    }

    /// What the forward points at
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The local port; the assigned one when 0 was requested
    pub fn local_port(&self) -> u16 {
        self.local_port.load(Ordering::SeqCst)
    }

    /// The remote port
    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// Whether the forward is confirmed and not stopped
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Tear the forward down. Idempotent.
    pub fn stop(&self) {
        let was_open = self.open.swap(false, Ordering::SeqCst);
        let child = self
            .child
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(mut child) = child {
            let _ = child.kill();
        }
        self.keepalive
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if was_open {
            debug!("stopped forward to {}:{}", self.target, self.remote_port);
        }
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Ask the OS for a free local port
pub(crate) async fn free_local_port(adapter: AdapterKind) -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(|e| Error::adapter_with(adapter, "port-forward", e))?;
    let port = listener
        .local_addr()
        .map_err(|e| Error::adapter_with(adapter, "port-forward", e))?
        .port();
    Ok(port)
}

/// Poll until something accepts connections on `127.0.0.1:port`
pub(crate) async fn wait_until_listening(port: u16, bound: Duration) -> bool {
    let deadline = Instant::now() + bound;
    loop {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        Timer::after(PROBE_INTERVAL).await;
    }
}

/// Parse kubectl's `Forwarding from 127.0.0.1:8080 -> 80` line
pub(crate) fn parse_forwarding_line(line: &str) -> Option<u16> {
    let rest = line.trim().strip_prefix("Forwarding from ")?;
    let local = rest.split(" -> ").next()?;
    local.rsplit(':').next()?.trim().parse().ok()
}

/// Read lines from `reader` until kubectl reports the bound local port
///
/// The remaining output keeps being drained in the background so the
/// forwarding process never blocks on a full pipe.
pub(crate) async fn await_forwarding<R>(reader: R) -> Option<u16>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next().await {
        let Ok(line) = line else { return None };
        if let Some(port) = parse_forwarding_line(&line) {
            smol::spawn(async move { while lines.next().await.is_some() {} }).detach();
            return Some(port);
        }
    }
    None
}
