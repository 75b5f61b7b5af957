//! Tracking of resources an adapter created and must tear down
//!
//! Containers move through [`ContainerState`] and stay in the registry once
//! removed, so a second dispose finds nothing live and does nothing.

use crate::error::Result;
use crate::log_stream::LogStream;
use crate::port_forward::PortForward;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Lifecycle of a container the adapter created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// Not known to the registry
    Absent,
    /// Creation in progress
    Creating,
    /// Created and in use
    Running,
    /// Teardown in progress
    Stopping,
    /// Torn down
    Removed,
}

/// How a container is torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// `docker rm -f`
    Remove,
    /// `docker stop`; the container is left in place
    Stop,
}

/// A container created on behalf of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralContainer {
    /// Container name
    pub name: String,
    /// Where the container lives (`local` or an ssh destination)
    pub backend: String,
    /// Teardown on dispose
    pub teardown: Teardown,
    /// Current state
    pub state: ContainerState,
}

impl EphemeralContainer {
    /// A fresh `unified-exec-<id>` name
    pub fn generated_name() -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("unified-exec-{}", &id[..12])
    }
}

/// Per-adapter registry of containers, port forwards and log streams
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    containers: Mutex<Vec<EphemeralContainer>>,
    forwards: Mutex<Vec<Arc<PortForward>>>,
    streams: Mutex<Vec<LogStream>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ResourceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `name` is being created; false if it is already live
    pub fn begin_create(
        &self,
        name: impl Into<String>,
        backend: impl Into<String>,
        teardown: Teardown,
    ) -> bool {
        let name = name.into();
        let backend = backend.into();
        let mut containers = locked(&self.containers);
        if let Some(existing) = containers
            .iter_mut()
            .find(|c| c.name == name && c.backend == backend)
        {
            if matches!(
                existing.state,
                ContainerState::Creating | ContainerState::Running
            ) {
                return false;
            }
            existing.state = ContainerState::Creating;
            existing.teardown = teardown;
            return true;
        }
        containers.push(EphemeralContainer {
            name,
            backend,
            teardown,
            state: ContainerState::Creating,
        });
        true
    }

    /// Creation succeeded
    pub fn mark_running(&self, name: &str, backend: &str) {
        self.set_state(name, backend, ContainerState::Running);
    }

    /// Creation failed; forget the entry
    pub fn abandon(&self, name: &str, backend: &str) {
        locked(&self.containers).retain(|c| !(c.name == name && c.backend == backend));
    }

    fn set_state(&self, name: &str, backend: &str, state: ContainerState) {
        if let Some(container) = locked(&self.containers)
            .iter_mut()
            .find(|c| c.name == name && c.backend == backend)
        {
            container.state = state;
        }
    }

    /// State of `name` on `backend`
    pub fn container_state(&self, name: &str, backend: &str) -> ContainerState {
        locked(&self.containers)
            .iter()
            .find(|c| c.name == name && c.backend == backend)
            .map(|c| c.state)
            .unwrap_or(ContainerState::Absent)
    }

    /// Snapshot of every tracked container
    pub fn containers(&self) -> Vec<EphemeralContainer> {
        locked(&self.containers).clone()
    }

    /// Track a port forward for teardown
    pub fn track_forward(&self, forward: Arc<PortForward>) {
        let mut forwards = locked(&self.forwards);
        forwards.retain(|f| f.is_open());
        forwards.push(forward);
    }

    /// Track a log stream for teardown
    pub fn track_stream(&self, stream: LogStream) {
        let mut streams = locked(&self.streams);
        streams.retain(|s| s.is_active());
        streams.push(stream);
    }

    /// Stop every tracked forward and stream; returns how many were stopped
    pub fn stop_streams(&self) -> usize {
        let forwards: Vec<_> = locked(&self.forwards).drain(..).collect();
        let streams: Vec<_> = locked(&self.streams).drain(..).collect();
        let count = forwards.len() + streams.len();
        for forward in forwards {
            forward.stop();
        }
        for stream in streams {
            stream.stop();
        }
        if count > 0 {
            debug!("stopped {} forwards and log streams", count);
        }
        count
    }

    /// Tear down every running container with `teardown`
    ///
    /// Failures are logged and swallowed; each container is attempted once.
    pub async fn dispose_containers<F, Fut>(&self, teardown: F)
    where
        F: Fn(EphemeralContainer) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let live: Vec<EphemeralContainer> = {
            let mut containers = locked(&self.containers);
            containers
                .iter_mut()
                .filter(|c| c.state == ContainerState::Running)
                .map(|c| {
                    c.state = ContainerState::Stopping;
                    c.clone()
                })
                .collect()
        };

        for container in live {
            let name = container.name.clone();
            let backend = container.backend.clone();
            match teardown(container).await {
                Ok(()) => info!("removed container {} on {}", name, backend),
                Err(e) => warn!("failed to tear down container {} on {}: {}", name, backend, e),
            }
            self.set_state(&name, &backend, ContainerState::Removed);
        }
    }
}
