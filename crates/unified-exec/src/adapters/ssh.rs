//! SSH adapter: run commands on remote hosts through the ssh client

use super::{Adapter, CopyDirection, result_context, take_options};
use crate::builder;
use crate::command::join_shell;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::log_stream::{LogOptions, LogStream, StreamSetup};
use crate::options::{AdapterKind, SshOptions};
use crate::port_forward::{self, PortForward, PortForwardOptions};
use crate::process::ExecIo;
use crate::request::ExecutionRequest;
use crate::resources::ResourceRegistry;
use crate::result::ExecutionResult;
use crate::ssh::{PoolStats, SshTransport};
use crate::sudo::SudoWrap;
use async_process::Stdio;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use futures_lite::future;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;
use tracing::{debug, info};

const DEFAULT_TAIL_LINES: u32 = 10;

/// Runs commands on remote hosts over pooled SSH connections
#[derive(Debug)]
pub struct SshAdapter {
    config: EngineConfig,
    transport: Arc<SshTransport>,
    resources: ResourceRegistry,
}

impl SshAdapter {
    /// Create an SSH adapter with its own transport
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_transport(config, Arc::new(SshTransport::new(&config.tools)))
    }

    /// Create an SSH adapter sharing `transport` (and its pool)
    pub fn with_transport(config: &EngineConfig, transport: Arc<SshTransport>) -> Self {
        Self {
            config: config.clone(),
            transport,
            resources: ResourceRegistry::new(),
        }
    }

    /// The underlying transport
    pub fn transport(&self) -> &Arc<SshTransport> {
        &self.transport
    }

    /// Pool summary
    pub fn pool_stats(&self) -> PoolStats {
        self.transport.pool_stats()
    }

    /// Forwards and streams owned by this adapter
    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    /// Whether a trivial command succeeds on the host
    pub async fn check_connection(&self, options: &SshOptions) -> bool {
        if options.validate(AdapterKind::Ssh).is_err() {
            return false;
        }
        let io = ExecIo::bounded(Some(options.default_connect_options.ready_timeout()));
        match self.transport.run(options, &SudoWrap::none("true"), io).await {
            Ok(raw) => raw.status.success() && !raw.timed_out,
            Err(e) => {
                debug!("connection check to {} failed: {}", options.host, e);
                false
            }
        }
    }

    /// Forward `127.0.0.1:<local_port>` to `<remote_host>:<remote_port>` as seen from the host
    ///
    /// With `local_port` 0 a free port is picked.
    pub async fn port_forward(
        &self,
        options: &SshOptions,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
        forward_options: PortForwardOptions,
    ) -> Result<Arc<PortForward>> {
        options.validate(AdapterKind::Ssh)?;
        let local_port = match local_port {
            0 => port_forward::free_local_port(AdapterKind::Ssh).await?,
            port => port,
        };
        let to_err = |e: std::io::Error| Error::adapter_with(AdapterKind::Ssh, "port-forward", e);

        let session = self.transport.session(options).await?;
        let mut stderr_file = tempfile::tempfile().map_err(to_err)?;
        let stderr_handle = stderr_file.try_clone().map_err(to_err)?;
        let mut cmd = session
            .forward_command(local_port, remote_host, remote_port)
            .prepare();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr_handle))
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(to_err)?;

        let ready = {
            let listening = port_forward::wait_until_listening(local_port, forward_options.ready_timeout);
            let exited = async {
                let _ = child.status().await;
                false
            };
            future::or(listening, exited).await
        };

        let target = format!("{}:{}", options.host, remote_host);
        if !ready {
            let _ = child.kill();
            let mut diagnostic = String::new();
            let _ = stderr_file.seek(SeekFrom::Start(0));
            let _ = stderr_file.read_to_string(&mut diagnostic);
            let reason = match diagnostic.trim() {
                "" => format!("forward to {} did not come up", target),
                text => text.to_string(),
            };
            return Err(Error::adapter(AdapterKind::Ssh, "port-forward", reason));
        }

        let forward = Arc::new(PortForward::new(target, local_port, remote_port));
        forward.attach(child, Some(Box::new(session)));
        forward.mark_open(local_port);
        self.resources.track_forward(forward.clone());
        info!(
            "ssh forward 127.0.0.1:{} -> {}:{} via {}",
            local_port, remote_host, remote_port, options.host
        );
        Ok(forward)
    }

    /// Copy one file or directory with scp
    pub async fn copy_files(
        &self,
        options: &SshOptions,
        source: &str,
        dest: &str,
        direction: CopyDirection,
    ) -> Result<()> {
        options.validate(AdapterKind::Ssh)?;
        match direction {
            CopyDirection::Upload => self.transport.upload(options, source, dest).await?,
            CopyDirection::Download => self.transport.download(options, source, dest).await?,
        }
        debug!("copied {} -> {} ({:?})", source, dest, direction);
        Ok(())
    }

    /// Copy several `(source, dest)` pairs, at most `sftp.concurrency` at a time
    pub async fn copy_many(
        &self,
        options: &SshOptions,
        pairs: Vec<(String, String)>,
        direction: CopyDirection,
    ) -> Result<()> {
        let concurrency = options.sftp.concurrency.max(1);
        futures::stream::iter(pairs)
            .map(|(source, dest)| async move {
                self.copy_files(options, &source, &dest, direction).await
            })
            .buffer_unordered(concurrency)
            .try_collect::<Vec<()>>()
            .await?;
        Ok(())
    }

    /// Follow a remote file with `tail`
    pub async fn stream_logs<F>(
        &self,
        options: &SshOptions,
        path: &str,
        on_line: F,
        log_options: LogOptions,
    ) -> Result<LogStream>
    where
        F: FnMut(String) + Send + 'static,
    {
        options.validate(AdapterKind::Ssh)?;
        let mut argv = vec![
            "tail".to_string(),
            "-n".to_string(),
            log_options.tail.unwrap_or(DEFAULT_TAIL_LINES).to_string(),
        ];
        if log_options.follow {
            argv.push("-F".to_string());
        }
        argv.push(path.to_string());
        let wrap = SudoWrap::apply(&options.sudo, &join_shell(&argv));

        let session = self.transport.session(options).await?;
        let command = session.command(&wrap.command);
        let setup = StreamSetup {
            stdin: wrap.stdin_prefix.clone(),
            keepalive: Some(Box::new(session)),
        };
        let stream = LogStream::spawn(
            AdapterKind::Ssh,
            command,
            setup,
            format!("ssh://{}{}", options.destination(), path),
            on_line,
        )?;
        self.resources.track_stream(stream.clone());
        Ok(stream)
    }
}

#[async_trait]
impl Adapter for SshAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Ssh
    }

    async fn is_available(&self) -> bool {
        self.transport.client_available().await
    }

    async fn execute(&self, mut request: ExecutionRequest) -> Result<ExecutionResult> {
        let options: SshOptions = take_options!(request, Ssh, AdapterKind::Ssh)?;
        options.validate(AdapterKind::Ssh)?;
        builder::validate_command(AdapterKind::Ssh, &request)?;

        let ctx = result_context(&self.config, AdapterKind::Ssh, &request);
        let remote = builder::remote_command(&request, &self.config.shell);
        let wrap = SudoWrap::apply(&options.sudo, &remote);
        debug!("ssh {}: {}", options.destination(), ctx.command());

        let io = ExecIo {
            stdin: std::mem::take(&mut request.stdin),
            stdout: request.stdout,
            stderr: request.stderr,
            timeout: ctx.remaining(),
        };
        ctx.conclude(self.transport.run(&options, &wrap, io).await)
    }

    async fn dispose(&self) {
        self.resources.stop_streams();
        self.transport.shutdown().await;
    }
}
