//! Cancellable line-by-line log subscriptions

use crate::command::Command;
use crate::error::{Error, Result};
use crate::options::{AdapterKind, KubeCluster};
use crate::stream::pump_lines;
use async_channel::{Receiver, Sender};
use async_process::{Child, Stdio};
use futures::io::{AsyncRead, AsyncWriteExt};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

type LineCallback = Box<dyn FnMut(String) + Send>;

/// Extra wiring for a log source process
#[derive(Default)]
pub(crate) struct StreamSetup {
    /// Written to the source's stdin, which is then closed
    pub stdin: Option<Vec<u8>>,
    /// Kept alive until the stream stops or its source closes (e.g. a pooled ssh session)
    pub keepalive: Option<Box<dyn Send>>,
}

/// What to read from a log source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    /// Namespace (Kubernetes)
    pub namespace: Option<String>,
    /// kubeconfig context and file (Kubernetes)
    pub cluster: KubeCluster,
    /// Container within the pod (Kubernetes)
    pub container: Option<String>,
    /// Keep reading as new lines arrive
    pub follow: bool,
    /// Start with the last N lines
    pub tail: Option<u32>,
    /// Prefix lines with timestamps
    pub timestamps: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            namespace: None,
            cluster: KubeCluster::default(),
            container: None,
            follow: true,
            tail: None,
            timestamps: false,
        }
    }
}

impl LogOptions {
    /// Read what is there and stop
    pub fn snapshot() -> Self {
        Self {
            follow: false,
            ..Self::default()
        }
    }

    /// Start with the last `lines` lines
    pub fn with_tail(mut self, lines: u32) -> Self {
        self.tail = Some(lines);
        self
    }

    /// Set the kubeconfig context and file
    pub fn on_cluster(mut self, cluster: KubeCluster) -> Self {
        self.cluster = cluster;
        self
    }
}

struct Inner {
    source: String,
    callback: Mutex<Option<LineCallback>>,
    child: Mutex<Option<Child>>,
    keepalive: Mutex<Option<Box<dyn Send>>>,
    pumps: AtomicUsize,
    done: Receiver<()>,
}

impl Inner {
    fn callback(&self) -> MutexGuard<'_, Option<LineCallback>> {
        self.callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deliver(&self, line: String) -> bool {
        let mut callback = self.callback();
        match callback.as_mut() {
            Some(on_line) => {
                on_line(line);
                true
            }
            None => false,
        }
    }

    /// Drop the callback, the child and the keepalive; true if the callback was still set
    fn release(&self) -> bool {
        let callback = self.callback().take();
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
        callback.is_some()
    }
}

/// A running log subscription
///
/// Lines from the source's stdout and stderr go to the callback until
/// [`stop`](Self::stop) is called or the source closes. The callback must
/// not call `stop` itself.
#[derive(Clone)]
pub struct LogStream {
    inner: Arc<Inner>,
}

impl fmt::Debug for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogStream")
            .field("source", &self.inner.source)
            .field("active", &self.is_active())
            .finish()
    }
}

impl LogStream {
    /// Spawn `command` and deliver its output lines to `on_line`
    pub(crate) fn spawn<F>(
        adapter: AdapterKind,
        command: Command,
        setup: StreamSetup,
        source: impl Into<String>,
        on_line: F,
    ) -> Result<Self>
    where
        F: FnMut(String) + Send + 'static,
    {
        let source = source.into();
        let mut cmd = command.prepare();
        let stdin = if setup.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        };
        cmd.stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::adapter_with(adapter, "stream-logs", e))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        if let (Some(mut pipe), Some(bytes)) = (child.stdin.take(), setup.stdin) {
            smol::spawn(async move {
                let _ = pipe.write_all(&bytes).await;
                let _ = pipe.close().await;
            })
            .detach();
        }

        let (done_tx, done_rx) = async_channel::bounded::<()>(1);
        let pumps = usize::from(stdout.is_some()) + usize::from(stderr.is_some());
        let inner = Arc::new(Inner {
            source,
            callback: Mutex::new(Some(Box::new(on_line))),
            child: Mutex::new(Some(child)),
            keepalive: Mutex::new(setup.keepalive),
            pumps: AtomicUsize::new(pumps),
            done: done_rx,
        });
        if pumps == 0 {
            inner.release();
        }

        if let Some(stdout) = stdout {
            spawn_pump(inner.clone(), stdout, done_tx.clone());
        }
        if let Some(stderr) = stderr {
            spawn_pump(inner.clone(), stderr, done_tx.clone());
        }
        debug!("streaming logs from {}", inner.source);
        Ok(Self { inner })
    }

    /// What this stream reads
    pub fn source(&self) -> &str {
        &self.inner.source
    }

    /// Whether lines may still be delivered
    pub fn is_active(&self) -> bool {
        self.inner.callback().is_some() && !self.inner.done.is_closed()
    }

    /// Stop delivery and terminate the source
    ///
    /// Returns after any in-flight callback finished; the callback is never
    /// invoked again. Idempotent.
    pub fn stop(&self) {
        if self.inner.release() {
            debug!("stopped log stream from {}", self.inner.source);
        }
    }

    /// Wait until the source closes (or was stopped)
    ///
    /// Once the source closed on its own, its resources are already released.
    pub async fn wait(&self) {
        let _ = self.inner.done.recv().await;
    }
}

fn spawn_pump<R>(inner: Arc<Inner>, reader: R, done: Sender<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    smol::spawn(async move {
        let result = pump_lines(reader, |line| inner.deliver(line)).await;
        if let Err(e) = result {
            trace!("log pump for {} ended: {}", inner.source, e);
        }
        if inner.pumps.fetch_sub(1, Ordering::AcqRel) == 1 && inner.release() {
            debug!("log stream from {} closed", inner.source);
        }
        drop(done);
    })
    .detach();
}
