//! Remote Docker adapter: the docker CLI on an SSH host
//!
//! Invocations are built exactly as for the local Docker adapter and sent as
//! the ssh command string. With auto-create enabled, a keep-alive container
//! (`<image> tail -f /dev/null`) is started on first use of a name and
//! reused afterwards.

use super::docker::{DockerCli, PROVISION_TIMEOUT, logs_argv, normalize_not_found};
use super::{Adapter, CopyDirection, result_context, take_options};
use crate::builder::{self, DockerFlags, RunSpec};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::log_stream::{LogOptions, LogStream};
use crate::options::{AdapterKind, RemoteDockerOptions, SshOptions};
use crate::policy::ResultContext;
use crate::process::{ExecIo, RawOutput};
use crate::request::ExecutionRequest;
use crate::resources::{EphemeralContainer, ResourceRegistry, Teardown};
use crate::result::ExecutionResult;
use crate::ssh::SshTransport;
use crate::sudo::SudoWrap;
use async_trait::async_trait;
use futures::lock::Mutex as AsyncMutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Runs commands in containers on a Docker host reached over SSH
#[derive(Debug)]
pub struct RemoteDockerAdapter {
    config: EngineConfig,
    transport: Arc<SshTransport>,
    resources: ResourceRegistry,
    provisioned: AsyncMutex<HashSet<String>>,
    hosts: Mutex<HashMap<String, SshOptions>>,
}

impl RemoteDockerAdapter {
    /// Create a remote Docker adapter with its own SSH transport
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_transport(config, Arc::new(SshTransport::new(&config.tools)))
    }

    /// Create a remote Docker adapter sharing `transport` (and its pool)
    pub fn with_transport(config: &EngineConfig, transport: Arc<SshTransport>) -> Self {
        Self {
            config: config.clone(),
            transport,
            resources: ResourceRegistry::new(),
            provisioned: AsyncMutex::new(HashSet::new()),
            hosts: Mutex::new(HashMap::new()),
        }
    }

    /// Containers and streams owned by this adapter
    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    fn cli(&self, ssh: &SshOptions) -> DockerCli {
        DockerCli::remote(self.transport.clone(), ssh.clone(), &self.config.tools.remote_docker)
    }

    /// Start the configured container unless it already exists
    ///
    /// Serialized so concurrent first uses of one name create it once.
    async fn ensure_container(&self, cli: &DockerCli, options: &RemoteDockerOptions) -> Result<()> {
        let name = options.docker.container.as_str();
        let backend = cli.backend();
        let key = format!("{}/{}", backend, name);

        let mut provisioned = self.provisioned.lock().await;
        if provisioned.contains(&key) {
            return Ok(());
        }
        if cli.container_exists(name).await? {
            debug!("container {} already present on {}", name, backend);
            provisioned.insert(key);
            return Ok(());
        }

        let teardown = if options.auto_create.auto_remove {
            Teardown::Remove
        } else {
            Teardown::Stop
        };
        self.resources.begin_create(name, backend.as_str(), teardown);
        let mut pending = PendingCreate {
            adapter: self,
            name,
            backend: &backend,
            ssh: &options.ssh,
            armed: true,
        };
        let spec = RunSpec {
            name: Some(name),
            detach: true,
            volumes: &options.auto_create.volumes,
            ..RunSpec::default()
        };
        let argv = builder::docker_run_argv(
            cli.program(),
            &options.auto_create.image,
            &spec,
            &DockerFlags::default(),
            vec!["tail".to_string(), "-f".to_string(), "/dev/null".to_string()],
        );
        let created = cli.run(argv, ExecIo::bounded(Some(PROVISION_TIMEOUT))).await;
        match created {
            Ok(raw) if raw.status.success() && !raw.timed_out => {
                pending.settle();
                info!(
                    "created container {} from {} on {}",
                    name, options.auto_create.image, backend
                );
                provisioned.insert(key);
                Ok(())
            }
            Ok(raw) => {
                pending.abandon();
                Err(Error::adapter(
                    AdapterKind::RemoteDocker,
                    "create-container",
                    raw.stderr_lossy().trim(),
                ))
            }
            Err(e) => {
                pending.abandon();
                Err(e)
            }
        }
    }

    fn record_running(&self, name: &str, backend: &str, ssh: &SshOptions) {
        self.resources.mark_running(name, backend);
        self.hosts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(backend.to_string(), ssh.clone());
    }

    /// Follow the configured container's output line by line
    pub async fn stream_logs<F>(
        &self,
        options: &RemoteDockerOptions,
        on_line: F,
        log_options: LogOptions,
    ) -> Result<LogStream>
    where
        F: FnMut(String) + Send + 'static,
    {
        options.validate()?;
        let cli = self.cli(&options.ssh);
        let argv = logs_argv(cli.program(), &options.docker.container, &log_options);
        let source = format!("docker://{}/{}", cli.backend(), options.docker.container);
        let stream = cli.stream(argv, source, on_line).await?;
        self.resources.track_stream(stream.clone());
        Ok(stream)
    }

    /// Copy between this machine and the configured container
    ///
    /// Files are staged in a temp path on the host: scp then `docker cp`
    /// for uploads, the reverse for downloads.
    pub async fn copy_files(
        &self,
        options: &RemoteDockerOptions,
        source: &str,
        dest: &str,
        direction: CopyDirection,
    ) -> Result<()> {
        options.validate()?;
        let cli = self.cli(&options.ssh);
        let container = &options.docker.container;
        let staging = format!("/tmp/{}", EphemeralContainer::generated_name());

        let copied = match direction {
            CopyDirection::Upload => {
                self.transport.upload(&options.ssh, source, &staging).await?;
                self.docker_cp(&cli, &staging, &format!("{}:{}", container, dest))
                    .await
            }
            CopyDirection::Download => {
                let staged = self
                    .docker_cp(&cli, &format!("{}:{}", container, source), &staging)
                    .await;
                match staged {
                    Ok(()) => self.transport.download(&options.ssh, &staging, dest).await,
                    Err(e) => Err(e),
                }
            }
        };

        let cleanup = SudoWrap::apply(
            &options.ssh.sudo,
            &format!("rm -rf {}", crate::command::shell_escape(&staging)),
        );
        if let Err(e) = self
            .transport
            .run(&options.ssh, &cleanup, ExecIo::default())
            .await
        {
            warn!("failed to remove staging path {}: {}", staging, e);
        }
        copied
    }

    async fn docker_cp(&self, cli: &DockerCli, from: &str, to: &str) -> Result<()> {
        let argv = vec![
            cli.program().to_string(),
            "cp".to_string(),
            from.to_string(),
            to.to_string(),
        ];
        let raw = cli.run(argv, ExecIo::bounded(Some(PROVISION_TIMEOUT))).await?;
        if raw.status.success() && !raw.timed_out {
            Ok(())
        } else {
            Err(Error::adapter(
                AdapterKind::RemoteDocker,
                "copy-files",
                raw.stderr_lossy().trim(),
            ))
        }
    }

    async fn run_request(
        &self,
        ctx: &ResultContext,
        options: &RemoteDockerOptions,
        request: &mut ExecutionRequest,
    ) -> Result<RawOutput> {
        let cli = self.cli(&options.ssh);
        if options.auto_create.enabled {
            ctx.within(self.ensure_container(&cli, options)).await?;
        }

        let command = builder::command_argv(request, &self.config.shell);
        let stdin = std::mem::take(&mut request.stdin);
        let flags = DockerFlags {
            interactive: !stdin.is_none(),
            tty: options.docker.tty,
            user: options.docker.user.as_deref(),
            workdir: request.cwd.as_deref().or(options.docker.workdir.as_deref()),
            env: Some(&request.env),
            extra: &options.docker.exec_flags,
        };
        let argv = builder::docker_exec_argv(cli.program(), &options.docker.container, &flags, command);
        let io = ExecIo {
            stdin,
            stdout: request.stdout,
            stderr: request.stderr,
            timeout: ctx.remaining(),
        };
        let raw = cli.run(argv, io).await?;
        Ok(normalize_not_found(raw, &options.docker.container))
    }
}

/// A container creation in flight
///
/// Dropped while still armed (the request ran out of time), the container is
/// assumed started and stays on the teardown list.
struct PendingCreate<'a> {
    adapter: &'a RemoteDockerAdapter,
    name: &'a str,
    backend: &'a str,
    ssh: &'a SshOptions,
    armed: bool,
}

impl PendingCreate<'_> {
    fn settle(&mut self) {
        self.armed = false;
        self.adapter.record_running(self.name, self.backend, self.ssh);
    }

    fn abandon(&mut self) {
        self.armed = false;
        self.adapter.resources.abandon(self.name, self.backend);
    }
}

impl Drop for PendingCreate<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("creation of {} on {} interrupted", self.name, self.backend);
            self.adapter.record_running(self.name, self.backend, self.ssh);
        }
    }
}

#[async_trait]
impl Adapter for RemoteDockerAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::RemoteDocker
    }

    async fn is_available(&self) -> bool {
        self.transport.client_available().await
    }

    async fn execute(&self, mut request: ExecutionRequest) -> Result<ExecutionResult> {
        let options: RemoteDockerOptions =
            take_options!(request, RemoteDocker, AdapterKind::RemoteDocker)?;
        options.validate()?;
        builder::validate_command(AdapterKind::RemoteDocker, &request)?;

        let ctx = result_context(&self.config, AdapterKind::RemoteDocker, &request);
        debug!(
            "remote-docker {}/{}: {}",
            options.ssh.destination(),
            options.docker.container,
            ctx.command()
        );
        let outcome = self.run_request(&ctx, &options, &mut request).await;
        ctx.conclude(outcome)
    }

    async fn dispose(&self) {
        self.resources.stop_streams();
        let hosts = self
            .hosts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        self.resources
            .dispose_containers(|container| {
                let cli = hosts.get(&container.backend).map(|ssh| self.cli(ssh));
                async move {
                    match cli {
                        Some(cli) => cli.teardown(container).await,
                        None => Err(Error::adapter(
                            AdapterKind::RemoteDocker,
                            "remove-container",
                            format!("no ssh settings recorded for {}", container.backend),
                        )),
                    }
                }
            })
            .await;
        self.provisioned.lock().await.clear();
        self.transport.shutdown().await;
    }
}
