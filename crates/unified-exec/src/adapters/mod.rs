//! Transport adapters
//!
//! One adapter per backend, all behind [`Adapter`]. Each adapter validates
//! its options, builds the backend invocation, runs it through
//! [`process::run`](crate::process::run) and hands the outcome to a
//! [`ResultContext`](crate::policy::ResultContext).

pub mod docker;
pub mod kubernetes;
pub mod local;
pub mod remote_docker;
pub mod ssh;

pub use docker::DockerAdapter;
pub use kubernetes::KubernetesAdapter;
pub use local::LocalAdapter;
pub use remote_docker::RemoteDockerAdapter;
pub use ssh::SshAdapter;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::options::{AdapterKind, AdapterOptions, KubeCluster};
use crate::policy::ResultContext;
use crate::request::ExecutionRequest;
use crate::result::ExecutionResult;
use async_trait::async_trait;

/// A backend that can run an [`ExecutionRequest`]
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Which backend this is
    fn kind(&self) -> AdapterKind;

    /// Whether the backend's client tooling is usable; never errors
    async fn is_available(&self) -> bool;

    /// Run `request` to completion under the adapter's failure policy
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult>;

    /// Release pooled connections and tear down owned resources. Idempotent.
    async fn dispose(&self);
}

/// Direction of a file copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopyDirection {
    /// Local to remote
    #[default]
    Upload,
    /// Remote to local
    Download,
}

/// Settings for `copy_files`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyOptions {
    /// Namespace (Kubernetes)
    pub namespace: Option<String>,
    /// kubeconfig context and file (Kubernetes)
    pub cluster: KubeCluster,
    /// Container within the pod (Kubernetes)
    pub container: Option<String>,
    /// Which side is remote
    pub direction: CopyDirection,
}

impl CopyOptions {
    /// Copy from the local side to the remote one
    pub fn upload() -> Self {
        Self::default()
    }

    /// Copy from the remote side to the local one
    pub fn download() -> Self {
        Self {
            direction: CopyDirection::Download,
            ..Self::default()
        }
    }

    /// Set the namespace
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Set the kubeconfig context and file
    pub fn on_cluster(mut self, cluster: KubeCluster) -> Self {
        self.cluster = cluster;
        self
    }
}

/// Start the per-execution bookkeeping for `request`
pub(crate) fn result_context(
    config: &EngineConfig,
    kind: AdapterKind,
    request: &ExecutionRequest,
) -> ResultContext {
    ResultContext::new(
        kind,
        request.display_command(),
        config.effective_timeout(request.timeout_ms),
        request.nothrow,
        config.failure_policy(),
    )
}

/// The validation error for a request without options for `kind`
pub(crate) fn missing_options(kind: AdapterKind, found: Option<&AdapterOptions>) -> Error {
    match found {
        Some(other) => Error::execution(
            kind,
            format!("expected {} adapter options, got {}", kind, other.kind()),
        ),
        None => Error::execution(kind, format!("{} adapter requires adapter_options", kind)),
    }
}

/// Pull the options variant for `kind` out of `request`
macro_rules! take_options {
    ($request:expr, $variant:ident, $kind:expr) => {
        match $request.adapter_options.take() {
            Some($crate::options::AdapterOptions::$variant(options)) => Ok(options),
            other => Err($crate::adapters::missing_options($kind, other.as_ref())),
        }
    };
}
pub(crate) use take_options;

/// Split `<target>:<path>`; the target must be non-empty
pub(crate) fn split_remote(spec: &str) -> Option<(&str, &str)> {
    let (target, path) = spec.split_once(':')?;
    if target.is_empty() || target.contains('/') {
        return None;
    }
    Some((target, path))
}
