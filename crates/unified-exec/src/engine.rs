//! The execution engine: one entry point over every adapter

use crate::adapters::{
    Adapter, DockerAdapter, KubernetesAdapter, LocalAdapter, RemoteDockerAdapter, SshAdapter,
};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::options::AdapterKind;
use crate::request::ExecutionRequest;
use crate::result::ExecutionResult;
use crate::ssh::{PoolStats, SshTransport};
use std::sync::Arc;
use tracing::debug;

/// Routes requests to the adapter their options select
///
/// The SSH and remote Docker adapters share one transport, so both draw
/// from the same connection pool.
#[derive(Debug)]
pub struct ExecutionEngine {
    config: EngineConfig,
    local: LocalAdapter,
    ssh: SshAdapter,
    docker: DockerAdapter,
    kubernetes: KubernetesAdapter,
    remote_docker: RemoteDockerAdapter,
    transport: Arc<SshTransport>,
}

impl ExecutionEngine {
    /// Create an engine after validating `config`
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let transport = Arc::new(SshTransport::new(&config.tools));
        Ok(Self {
            local: LocalAdapter::new(&config),
            ssh: SshAdapter::with_transport(&config, transport.clone()),
            docker: DockerAdapter::new(&config),
            kubernetes: KubernetesAdapter::new(&config),
            remote_docker: RemoteDockerAdapter::with_transport(&config, transport.clone()),
            transport,
            config,
        })
    }

    /// Create an engine from a YAML configuration document
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Self::new(EngineConfig::from_yaml_str(content)?)
    }

    /// The engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Which adapter `request` would run on
    pub fn select(&self, request: &ExecutionRequest) -> Result<AdapterKind> {
        match &request.adapter_options {
            Some(options) => Ok(options.kind()),
            None if self.config.default_adapter == AdapterKind::Local => Ok(AdapterKind::Local),
            None => Err(Error::execution(
                self.config.default_adapter,
                format!(
                    "default adapter is {} but the request carries no adapter_options",
                    self.config.default_adapter
                ),
            )),
        }
    }

    /// The adapter for `kind`
    pub fn adapter(&self, kind: AdapterKind) -> &dyn Adapter {
        match kind {
            AdapterKind::Local => &self.local,
            AdapterKind::Ssh => &self.ssh,
            AdapterKind::Docker => &self.docker,
            AdapterKind::Kubernetes => &self.kubernetes,
            AdapterKind::RemoteDocker => &self.remote_docker,
        }
    }

    /// Run `request` on the selected adapter
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        let kind = self.select(&request)?;
        debug!("executing on {} adapter", kind);
        self.adapter(kind).execute(request).await
    }

    /// Whether the adapter's tooling is usable
    pub async fn is_available(&self, kind: AdapterKind) -> bool {
        self.adapter(kind).is_available().await
    }

    /// The local adapter
    pub fn local(&self) -> &LocalAdapter {
        &self.local
    }

    /// The SSH adapter
    pub fn ssh(&self) -> &SshAdapter {
        &self.ssh
    }

    /// The Docker adapter
    pub fn docker(&self) -> &DockerAdapter {
        &self.docker
    }

    /// The Kubernetes adapter
    pub fn kubernetes(&self) -> &KubernetesAdapter {
        &self.kubernetes
    }

    /// The remote Docker adapter
    pub fn remote_docker(&self) -> &RemoteDockerAdapter {
        &self.remote_docker
    }

    /// Summary of the shared SSH pool
    pub fn pool_stats(&self) -> PoolStats {
        self.transport.pool_stats()
    }

    /// Dispose every adapter. Idempotent.
    ///
    /// Remote containers are torn down before the shared SSH pool closes.
    pub async fn dispose(&self) {
        self.remote_docker.dispose().await;
        self.docker.dispose().await;
        self.kubernetes.dispose().await;
        self.ssh.dispose().await;
        self.local.dispose().await;
    }
}
