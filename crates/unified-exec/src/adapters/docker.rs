//! Docker adapter: `docker exec` into a container or `docker run` an image
//!
//! [`DockerCli`] is also how the remote Docker adapter drives the CLI, with
//! the invocation carried over SSH instead of spawned locally.

use super::{Adapter, CopyDirection, CopyOptions, result_context, split_remote, take_options};
use crate::builder::{self, DockerFlags, RunSpec};
use crate::command::{Command, join_shell};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::log_stream::{LogOptions, LogStream, StreamSetup};
use crate::options::{AdapterKind, DockerOptions, DockerTarget, SshOptions};
use crate::policy::ResultContext;
use crate::process::{self, ExecIo, RawOutput};
use crate::request::ExecutionRequest;
use crate::resources::{EphemeralContainer, ResourceRegistry, Teardown};
use crate::result::ExecutionResult;
use crate::ssh::SshTransport;
use crate::sudo::SudoWrap;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Bound on management commands (`inspect`, `rm`, `stop`, `version`)
pub(crate) const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on creating a container, which may pull the image
pub(crate) const PROVISION_TIMEOUT: Duration = Duration::from_secs(300);

/// Backend name recorded for containers on the local daemon
pub(crate) const LOCAL_BACKEND: &str = "local";

#[derive(Debug, Clone)]
enum DockerHost {
    Local,
    Remote {
        transport: Arc<SshTransport>,
        ssh: Box<SshOptions>,
    },
}

/// The docker CLI on the local machine or on an SSH host
#[derive(Debug, Clone)]
pub(crate) struct DockerCli {
    program: String,
    host: DockerHost,
    adapter: AdapterKind,
}

impl DockerCli {
    pub(crate) fn local(docker: &Path) -> Self {
        Self {
            program: docker.to_string_lossy().into_owned(),
            host: DockerHost::Local,
            adapter: AdapterKind::Docker,
        }
    }

    pub(crate) fn remote(transport: Arc<SshTransport>, ssh: SshOptions, program: &str) -> Self {
        Self {
            program: program.to_string(),
            host: DockerHost::Remote {
                transport,
                ssh: Box::new(ssh),
            },
            adapter: AdapterKind::RemoteDocker,
        }
    }

    pub(crate) fn program(&self) -> &str {
        &self.program
    }

    /// Where containers created through this CLI live
    pub(crate) fn backend(&self) -> String {
        match &self.host {
            DockerHost::Local => LOCAL_BACKEND.to_string(),
            DockerHost::Remote { ssh, .. } => format!("{}:{}", ssh.destination(), ssh.port),
        }
    }

    fn argv(&self, args: &[&str]) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(args.iter().map(|a| a.to_string()))
            .collect()
    }

    /// Run a full docker argv
    pub(crate) async fn run(&self, argv: Vec<String>, io: ExecIo) -> Result<RawOutput> {
        match &self.host {
            DockerHost::Local => {
                let command = Command::from_argv(argv)
                    .ok_or_else(|| Error::execution(self.adapter, "empty docker invocation"))?;
                let (spec, stdin) = io.into_spec(command);
                process::run(spec, stdin).await
            }
            DockerHost::Remote { transport, ssh } => {
                let wrap = SudoWrap::apply(&ssh.sudo, &join_shell(&argv));
                transport.run(ssh, &wrap, io).await
            }
        }
    }

    /// Run a management command with a short bound
    pub(crate) async fn control(&self, args: &[&str]) -> Result<RawOutput> {
        self.run(self.argv(args), ExecIo::bounded(Some(CONTROL_TIMEOUT)))
            .await
    }

    /// Whether the daemon answers
    pub(crate) async fn daemon_available(&self) -> bool {
        matches!(
            self.control(&["version", "--format", "{{.Server.Version}}"]).await,
            Ok(raw) if raw.status.success()
        )
    }

    /// Whether `name` exists on the daemon
    pub(crate) async fn container_exists(&self, name: &str) -> Result<bool> {
        let raw = self
            .control(&["inspect", "--type", "container", "--format", "{{.State.Running}}", name])
            .await?;
        Ok(raw.status.success())
    }

    /// Remove or stop a container this CLI created
    pub(crate) async fn teardown(&self, container: EphemeralContainer) -> Result<()> {
        let (mut argv, operation) = match container.teardown {
            Teardown::Remove => (self.argv(&["rm", "-f"]), "remove-container"),
            Teardown::Stop => (self.argv(&["stop"]), "stop-container"),
        };
        argv.push(container.name.clone());
        let raw = self.run(argv, ExecIo::bounded(Some(CONTROL_TIMEOUT))).await?;
        if raw.status.success() {
            Ok(())
        } else {
            Err(Error::adapter(self.adapter, operation, raw.stderr_lossy().trim()))
        }
    }

    /// Spawn a long-running docker invocation whose output feeds `on_line`
    pub(crate) async fn stream<F>(&self, argv: Vec<String>, source: String, on_line: F) -> Result<LogStream>
    where
        F: FnMut(String) + Send + 'static,
    {
        match &self.host {
            DockerHost::Local => {
                let command = Command::from_argv(argv)
                    .ok_or_else(|| Error::execution(self.adapter, "empty docker invocation"))?;
                LogStream::spawn(self.adapter, command, StreamSetup::default(), source, on_line)
            }
            DockerHost::Remote { transport, ssh } => {
                let session = transport.session(ssh).await?;
                let wrap = SudoWrap::apply(&ssh.sudo, &join_shell(&argv));
                let command = session.command(&wrap.command);
                let setup = StreamSetup {
                    stdin: wrap.stdin_prefix.clone(),
                    keepalive: Some(Box::new(session)),
                };
                LogStream::spawn(self.adapter, command, setup, source, on_line)
            }
        }
    }
}

/// `docker logs [-f] [--tail N] [-t] <container>`
pub(crate) fn logs_argv(docker: &str, container: &str, options: &LogOptions) -> Vec<String> {
    let mut argv = vec![docker.to_string(), "logs".to_string()];
    if options.follow {
        argv.push("--follow".to_string());
    }
    if let Some(tail) = options.tail {
        argv.push("--tail".to_string());
        argv.push(tail.to_string());
    }
    if options.timestamps {
        argv.push("--timestamps".to_string());
    }
    argv.push(container.to_string());
    argv
}

/// Rewrite the daemon's "No such container" diagnostic into a stable message
pub(crate) fn normalize_not_found(mut raw: RawOutput, container: &str) -> RawOutput {
    if raw.status.success() || raw.timed_out {
        return raw;
    }
    let stderr = raw.stderr_lossy();
    if stderr.to_lowercase().contains("no such container") {
        raw.stderr = format!("container '{}' not found: {}\n", container, stderr.trim()).into_bytes();
    }
    raw
}

/// Runs commands in containers on the local Docker daemon
#[derive(Debug)]
pub struct DockerAdapter {
    config: EngineConfig,
    cli: DockerCli,
    resources: ResourceRegistry,
}

impl DockerAdapter {
    /// Create a Docker adapter
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            config: config.clone(),
            cli: DockerCli::local(&config.tools.docker),
            resources: ResourceRegistry::new(),
        }
    }

    /// Containers, forwards and streams owned by this adapter
    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    /// Whether `name` exists on the daemon
    pub async fn container_exists(&self, name: &str) -> Result<bool> {
        self.cli.container_exists(name).await
    }

    /// Follow a container's output line by line
    pub async fn stream_logs<F>(&self, container: &str, on_line: F, options: LogOptions) -> Result<LogStream>
    where
        F: FnMut(String) + Send + 'static,
    {
        let argv = logs_argv(self.cli.program(), container, &options);
        let stream = self
            .cli
            .stream(argv, format!("docker://{}", container), on_line)
            .await?;
        self.resources.track_stream(stream.clone());
        Ok(stream)
    }

    /// `docker cp`; the container side is written `<container>:<path>`
    pub async fn copy_files(&self, source: &str, dest: &str, options: CopyOptions) -> Result<()> {
        let remote = match options.direction {
            CopyDirection::Upload => dest,
            CopyDirection::Download => source,
        };
        if split_remote(remote).is_none() {
            return Err(Error::execution(
                AdapterKind::Docker,
                format!("expected <container>:<path>, got '{}'", remote),
            ));
        }
        let raw = self
            .cli
            .run(
                self.cli.argv(&["cp", source, dest]),
                ExecIo::bounded(Some(PROVISION_TIMEOUT)),
            )
            .await?;
        if !raw.status.success() {
            return Err(Error::adapter(
                AdapterKind::Docker,
                "copy-files",
                raw.stderr_lossy().trim(),
            ));
        }
        debug!("copied {} -> {}", source, dest);
        Ok(())
    }

    async fn run_request(
        &self,
        ctx: &ResultContext,
        options: &DockerOptions,
        target: DockerTarget,
        request: &mut ExecutionRequest,
    ) -> Result<RawOutput> {
        let command = builder::command_argv(request, &self.config.shell);
        let stdin = std::mem::take(&mut request.stdin);
        let flags = DockerFlags {
            interactive: !stdin.is_none(),
            tty: options.tty,
            user: options.user.as_deref(),
            workdir: request.cwd.as_deref().or(options.workdir.as_deref()),
            env: Some(&request.env),
            extra: &options.exec_flags,
        };
        let io = ExecIo {
            stdin,
            stdout: request.stdout,
            stderr: request.stderr,
            timeout: ctx.remaining(),
        };

        match target {
            DockerTarget::Exec { container } => {
                let argv = builder::docker_exec_argv(self.cli.program(), &container, &flags, command);
                let raw = self.cli.run(argv, io).await?;
                Ok(normalize_not_found(raw, &container))
            }
            DockerTarget::Run { image, auto_remove: true } => {
                let spec = RunSpec {
                    auto_remove: true,
                    volumes: &options.volumes,
                    ..RunSpec::default()
                };
                let argv = builder::docker_run_argv(self.cli.program(), &image, &spec, &flags, command);
                self.cli.run(argv, io).await
            }
            DockerTarget::Run { image, auto_remove: false } => {
                let name = EphemeralContainer::generated_name();
                self.resources
                    .begin_create(name.as_str(), LOCAL_BACKEND, Teardown::Remove);
                let spec = RunSpec {
                    name: Some(&name),
                    volumes: &options.volumes,
                    ..RunSpec::default()
                };
                let argv = builder::docker_run_argv(self.cli.program(), &image, &spec, &flags, command);
                match self.cli.run(argv, io).await {
                    Ok(raw) => {
                        info!("created container {} from {}", name, image);
                        self.resources.mark_running(&name, LOCAL_BACKEND);
                        Ok(raw)
                    }
                    Err(e) => {
                        self.resources.abandon(&name, LOCAL_BACKEND);
                        Err(e)
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Adapter for DockerAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Docker
    }

    async fn is_available(&self) -> bool {
        self.cli.daemon_available().await
    }

    async fn execute(&self, mut request: ExecutionRequest) -> Result<ExecutionResult> {
        let options: DockerOptions = take_options!(request, Docker, AdapterKind::Docker)?;
        let target = options.target()?;
        builder::validate_command(AdapterKind::Docker, &request)?;

        let ctx = result_context(&self.config, AdapterKind::Docker, &request);
        debug!("docker {:?}: {}", target, ctx.command());
        let outcome = self.run_request(&ctx, &options, target, &mut request).await;
        ctx.conclude(outcome)
    }

    async fn dispose(&self) {
        self.resources.stop_streams();
        self.resources
            .dispose_containers(|container| self.cli.teardown(container))
            .await;
    }
}
