//! Driving the `ssh` and `scp` clients
//!
//! With pooling enabled, each pooled connection is an OpenSSH control master
//! (`ssh -M -N -f`) bound to its own socket; sessions attach to it with
//! `ControlMaster=no`. With pooling disabled but multiplexing enabled, ssh
//! manages the master itself (`ControlMaster=auto`). Otherwise every session
//! is a fresh connection.

use super::credentials::{Credentials, fingerprint};
use super::pool::{ConnectionKey, ConnectionLease, ConnectionPool, PoolStats, PooledConnection};
use crate::command::Command;
use crate::config::ToolPaths;
use crate::error::{Error, Result};
use crate::options::{AdapterKind, SshOptions};
use crate::process::{self, ExecIo, ProcessSpec, RawOutput};
use crate::request::StdinSource;
use crate::sudo::SudoWrap;
use crate::timeout::{self, Outcome};
use async_process::Stdio;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Bound on control commands (`-O check`, `-O exit`, `-V`)
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on a single scp transfer
const COPY_TIMEOUT: Duration = Duration::from_secs(600);

/// Client diagnostics that mean the connection itself failed
const CONNECTION_FAILURE_PATTERNS: &[&str] = &[
    "connection refused",
    "connection timed out",
    "operation timed out",
    "could not resolve hostname",
    "permission denied",
    "host key verification failed",
    "no route to host",
    "network is unreachable",
    "connection closed by",
    "connection reset by",
    "kex_exchange_identification",
    "control socket connect",
    "too many authentication failures",
];

/// Classify an ssh exit: 255 plus a client diagnostic is a connection failure
pub fn connection_failure(raw: &RawOutput) -> Option<String> {
    if raw.timed_out || raw.status.code != Some(255) {
        return None;
    }
    let stderr = raw.stderr_lossy();
    let lower = stderr.to_lowercase();
    if !CONNECTION_FAILURE_PATTERNS.iter().any(|p| lower.contains(p)) {
        return None;
    }
    stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(|l| l.trim().to_string())
}

fn secs_ceil(ms: u64) -> u64 {
    ms.div_ceil(1000).max(1)
}

/// ssh options shared by every invocation for `options` (no port flag)
fn common_options(options: &SshOptions, creds: &Credentials) -> Vec<String> {
    let connect = &options.default_connect_options;
    let mut args = vec![
        "-o".to_string(),
        format!("ConnectTimeout={}", secs_ceil(connect.ready_timeout_ms)),
        "-o".to_string(),
        format!("ServerAliveInterval={}", secs_ceil(connect.keepalive_interval_ms)),
        "-o".to_string(),
        "LogLevel=ERROR".to_string(),
    ];
    if let Some(strict) = &options.strict_host_key_checking {
        args.push("-o".to_string());
        args.push(format!("StrictHostKeyChecking={}", strict));
    }
    if let Some(known_hosts) = &options.known_hosts_file {
        args.push("-o".to_string());
        args.push(format!("UserKnownHostsFile={}", known_hosts.display()));
    }
    args.extend(creds.ssh_args());
    args.extend(options.extra_args.iter().cloned());
    args
}

/// An OpenSSH control master owned by the pool
#[derive(Debug)]
pub struct MasterConnection {
    ssh: PathBuf,
    destination: String,
    port: u16,
    control_path: PathBuf,
}

impl MasterConnection {
    /// Start a backgrounded master and wait for it to authenticate
    pub async fn open(
        ssh: &Path,
        options: &SshOptions,
        control_path: PathBuf,
        persist_secs: u64,
    ) -> Result<Self> {
        let creds = Credentials::materialize(options)?;
        let mut command = Command::new(ssh);
        command
            .args(["-M", "-N", "-f"])
            .arg("-o")
            .arg(format!("ControlPath={}", control_path.display()))
            .arg("-o")
            .arg(format!("ControlPersist={}s", persist_secs.max(1)))
            .arg("-p")
            .arg(options.port.to_string())
            .args(common_options(options, &creds))
            .arg(options.destination());
        creds.apply_env(&mut command);

        // The backgrounded master keeps its stdio; never hand it our pipes
        let host = options.host.clone();
        let to_conn_err =
            |e: std::io::Error| Error::connection_with(host.clone(), "failed to start ssh master", e);
        let mut stderr_file = tempfile::tempfile().map_err(to_conn_err)?;
        let stderr_handle = stderr_file.try_clone().map_err(to_conn_err)?;

        let mut cmd = command.prepare();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr_handle))
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|e| {
            Error::connection_with(options.host.clone(), "failed to spawn ssh", e)
        })?;

        let ready = options.default_connect_options.ready_timeout();
        let outcome = timeout::supervise(child.status(), Some(ready)).await;
        let status = match outcome {
            Outcome::Completed(status) => status.map_err(to_conn_err)?,
            Outcome::TimedOut => {
                let _ = child.kill();
                return Err(Error::connection(
                    options.host.clone(),
                    format!("ssh master not ready within {:?}", ready),
                ));
            }
        };

        if !status.success() {
            let mut diagnostic = String::new();
            let _ = stderr_file.seek(SeekFrom::Start(0));
            let _ = stderr_file.read_to_string(&mut diagnostic);
            let reason = diagnostic
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .map(|l| l.trim().to_string())
                .unwrap_or_else(|| format!("ssh exited with {:?}", status.code()));
            return Err(Error::connection(options.host.clone(), reason));
        }

        info!(
            "ssh master to {}:{} ready at {}",
            options.destination(),
            options.port,
            control_path.display()
        );
        Ok(Self {
            ssh: ssh.to_path_buf(),
            destination: options.destination(),
            port: options.port,
            control_path,
        })
    }

    /// The control socket path
    pub fn control_path(&self) -> &Path {
        &self.control_path
    }

    async fn control(&self, operation: &str) -> Result<RawOutput> {
        let mut command = Command::new(&self.ssh);
        command
            .arg("-O")
            .arg(operation)
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-p")
            .arg(self.port.to_string())
            .arg(&self.destination);
        process::run(
            ProcessSpec::new(command).with_timeout(Some(CONTROL_TIMEOUT)),
            StdinSource::None,
        )
        .await
    }
}

#[async_trait]
impl PooledConnection for MasterConnection {
    async fn probe(&self) -> bool {
        matches!(self.control("check").await, Ok(raw) if raw.status.success() && !raw.timed_out)
    }

    async fn close(&self) {
        match self.control("exit").await {
            Ok(raw) if raw.status.success() => {
                debug!("ssh master at {} closed", self.control_path.display())
            }
            Ok(raw) => debug!(
                "ssh master at {} did not exit cleanly: {}",
                self.control_path.display(),
                raw.stderr_lossy().trim()
            ),
            Err(e) => warn!("failed to stop ssh master at {}: {}", self.control_path.display(), e),
        }
        let _ = std::fs::remove_file(&self.control_path);
    }
}

/// A ready-to-use ssh invocation context for one host
///
/// Holds the pooled connection lease (if any) and the materialized
/// credentials until dropped.
#[derive(Debug)]
pub struct SshSession {
    ssh: PathBuf,
    scp: PathBuf,
    options: Vec<String>,
    port: u16,
    destination: String,
    host: String,
    sftp: bool,
    creds: Credentials,
    lease: Option<ConnectionLease<MasterConnection>>,
}

impl SshSession {
    /// `ssh [opts] user@host <remote>`
    pub fn command(&self, remote: &str) -> Command {
        let mut command = self.ssh_base();
        command.arg(&self.destination).arg(remote);
        command
    }

    /// `ssh -N -L 127.0.0.1:<local>:<remote_host>:<remote_port> user@host`
    pub fn forward_command(&self, local_port: u16, remote_host: &str, remote_port: u16) -> Command {
        let mut command = self.ssh_base();
        command
            .arg("-N")
            .arg("-o")
            .arg("ExitOnForwardFailure=yes")
            .arg("-L")
            .arg(format!("127.0.0.1:{}:{}:{}", local_port, remote_host, remote_port))
            .arg(&self.destination);
        command
    }

    /// `scp [-s] -r -q [opts] <from> <to>`; use [`remote_path`](Self::remote_path) for the remote side
    pub fn scp_command(&self, from: &str, to: &str) -> Command {
        let mut command = Command::new(&self.scp);
        if self.sftp {
            command.arg("-s");
        }
        command
            .args(["-r", "-q", "-P"])
            .arg(self.port.to_string())
            .args(&self.options)
            .arg(from)
            .arg(to);
        self.creds.apply_env(&mut command);
        command
    }

    /// `user@host:<path>` for scp
    pub fn remote_path(&self, path: &str) -> String {
        format!("{}:{}", self.destination, path)
    }

    /// The remote host, for error reporting
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Pool connection id, when pooled
    pub fn connection_id(&self) -> Option<u64> {
        self.lease.as_ref().map(|l| l.id())
    }

    fn ssh_base(&self) -> Command {
        let mut command = Command::new(&self.ssh);
        command
            .arg("-p")
            .arg(self.port.to_string())
            .args(&self.options);
        self.creds.apply_env(&mut command);
        command
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MuxMaster {
    destination: String,
    port: u16,
    control_path: String,
}

/// SSH client driver shared by the SSH and remote Docker adapters
#[derive(Debug)]
pub struct SshTransport {
    ssh: PathBuf,
    scp: PathBuf,
    pool: ConnectionPool<MasterConnection>,
    control_dir: Mutex<Option<TempDir>>,
    mux_masters: Mutex<HashSet<MuxMaster>>,
}

impl SshTransport {
    /// Create a transport using the configured client binaries
    pub fn new(tools: &ToolPaths) -> Self {
        Self {
            ssh: tools.ssh.clone(),
            scp: tools.scp.clone(),
            pool: ConnectionPool::new(),
            control_dir: Mutex::new(None),
            mux_masters: Mutex::new(HashSet::new()),
        }
    }

    /// The connection pool
    pub fn pool(&self) -> &ConnectionPool<MasterConnection> {
        &self.pool
    }

    /// Pool summary
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    fn control_dir(&self) -> Result<PathBuf> {
        let mut dir = self
            .control_dir
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(dir) = dir.as_ref() {
            return Ok(dir.path().to_path_buf());
        }
        let created = tempfile::Builder::new()
            .prefix("uexec-ssh-")
            .tempdir()
            .map_err(|e| Error::adapter_with(AdapterKind::Ssh, "create-control-dir", e))?;
        let path = created.path().to_path_buf();
        *dir = Some(created);
        Ok(path)
    }

    /// Prepare a session for `options`, leasing a pooled connection when enabled
    pub async fn session(&self, options: &SshOptions) -> Result<SshSession> {
        let creds = Credentials::materialize(options)?;
        let mut ssh_options = Vec::new();
        let mut lease = None;

        if options.connection_pool.enabled {
            let fp = fingerprint(options);
            let key = ConnectionKey {
                host: options.host.clone(),
                port: options.port,
                username: options.username.clone(),
                fingerprint: fp.clone(),
            };
            let socket = self.control_dir()?.join(format!(
                "{}-{}.sock",
                &fp[..8.min(fp.len())],
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            ));
            let persist = options.multiplexing.control_persist_secs;
            let ready = options.default_connect_options.ready_timeout();
            let leased = self
                .pool
                .acquire(key, &options.connection_pool, ready, || {
                    MasterConnection::open(&self.ssh, options, socket, persist)
                })
                .await?;
            ssh_options.push("-o".to_string());
            ssh_options.push(format!(
                "ControlPath={}",
                leased.connection().control_path().display()
            ));
            ssh_options.push("-o".to_string());
            ssh_options.push("ControlMaster=no".to_string());
            lease = Some(leased);
        } else if options.multiplexing.enabled {
            let control_path = match &options.multiplexing.control_path {
                Some(path) => path.clone(),
                None => self
                    .control_dir()?
                    .join("mux-%C")
                    .to_string_lossy()
                    .into_owned(),
            };
            ssh_options.extend([
                "-o".to_string(),
                "ControlMaster=auto".to_string(),
                "-o".to_string(),
                format!("ControlPath={}", control_path),
                "-o".to_string(),
                format!("ControlPersist={}s", options.multiplexing.control_persist_secs.max(1)),
            ]);
            self.mux_masters
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(MuxMaster {
                    destination: options.destination(),
                    port: options.port,
                    control_path,
                });
        }

        ssh_options.extend(common_options(options, &creds));
        Ok(SshSession {
            ssh: self.ssh.clone(),
            scp: self.scp.clone(),
            options: ssh_options,
            port: options.port,
            destination: options.destination(),
            host: options.host.clone(),
            sftp: options.sftp.enabled,
            creds,
            lease,
        })
    }

    /// Run `wrap` on the host described by `options`
    ///
    /// Exit 255 with an ssh client diagnostic becomes a connection error.
    /// sudo's prompt is stripped from captured stderr.
    ///
    /// Connecting counts against `io.timeout`; a bound that elapses while
    /// connecting is reported as a timed-out run.
    pub async fn run(&self, options: &SshOptions, wrap: &SudoWrap, mut io: ExecIo) -> Result<RawOutput> {
        let started_at = Utc::now();
        let start = Instant::now();
        let session = match timeout::supervise(self.session(options), io.timeout).await {
            Outcome::Completed(session) => session?,
            Outcome::TimedOut => {
                debug!("connecting to {} exceeded {:?}", options.destination(), io.timeout);
                return Ok(RawOutput::expired(started_at, start.elapsed()));
            }
        };
        io.timeout = io
            .timeout
            .map(|bound| bound.saturating_sub(start.elapsed()));
        let (mut spec, stdin) = io.into_spec(session.command(&wrap.command));
        spec.stdin_prefix = wrap.stdin_prefix.clone();
        spec.prompt = wrap.prompt.clone();
        spec.prompt_timeout = wrap.prompt_timeout;

        let mut raw = process::run(spec, stdin).await?;
        drop(session);
        if let Some(reason) = connection_failure(&raw) {
            return Err(Error::connection(options.host.clone(), reason));
        }
        if wrap.prompt.is_some() {
            raw.stderr = wrap.clean_stderr(raw.stderr_lossy()).into_bytes();
        }
        Ok(raw)
    }

    /// Copy a local path to the host with scp
    pub async fn upload(&self, options: &SshOptions, local: &str, remote: &str) -> Result<()> {
        let session = self.session(options).await?;
        let command = session.scp_command(local, &session.remote_path(remote));
        self.scp(options, command).await
    }

    /// Copy a path on the host to a local path with scp
    pub async fn download(&self, options: &SshOptions, remote: &str, local: &str) -> Result<()> {
        let session = self.session(options).await?;
        let command = session.scp_command(&session.remote_path(remote), local);
        self.scp(options, command).await
    }

    async fn scp(&self, options: &SshOptions, command: Command) -> Result<()> {
        let spec = ProcessSpec::new(command).with_timeout(Some(COPY_TIMEOUT));
        let raw = process::run(spec, StdinSource::None).await?;
        if let Some(reason) = connection_failure(&raw) {
            return Err(Error::connection(options.host.clone(), reason));
        }
        if raw.timed_out {
            return Err(Error::adapter(
                AdapterKind::Ssh,
                "copy-files",
                format!("scp did not finish within {:?}", COPY_TIMEOUT),
            ));
        }
        if !raw.status.success() {
            return Err(Error::adapter(AdapterKind::Ssh, "copy-files", raw.stderr_lossy().trim()));
        }
        Ok(())
    }

    /// Whether the ssh client can be executed
    pub async fn client_available(&self) -> bool {
        let mut command = Command::new(&self.ssh);
        command.arg("-V");
        matches!(
            process::run(ProcessSpec::new(command).with_timeout(Some(CONTROL_TIMEOUT)), StdinSource::None).await,
            Ok(raw) if raw.status.success()
        )
    }

    /// Close pooled connections and multiplexed masters
    pub async fn shutdown(&self) {
        self.pool.close_all().await;

        let masters: Vec<MuxMaster> = self
            .mux_masters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain()
            .collect();
        for master in masters {
            let mut command = Command::new(&self.ssh);
            command
                .args(["-O", "exit", "-o"])
                .arg(format!("ControlPath={}", master.control_path))
                .arg("-p")
                .arg(master.port.to_string())
                .arg(&master.destination);
            let spec = ProcessSpec::new(command).with_timeout(Some(CONTROL_TIMEOUT));
            if let Err(e) = process::run(spec, StdinSource::None).await {
                warn!("failed to stop multiplexed master for {}: {}", master.destination, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{MultiplexingOptions, PoolOptions};
    use crate::process::ExitStatus;

    fn raw(code: i32, stderr: &str) -> RawOutput {
        RawOutput {
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
            status: ExitStatus {
                code: Some(code),
                signal: None,
            },
            timed_out: false,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            duration: Duration::ZERO,
        }
    }

    #[test]
    fn test_connection_failure_classification() {
        let refused = raw(255, "ssh: connect to host db port 22: Connection refused\n");
        assert_eq!(
            connection_failure(&refused).as_deref(),
            Some("ssh: connect to host db port 22: Connection refused")
        );
        assert!(connection_failure(&raw(255, "remote script failed\n")).is_none());
        assert!(connection_failure(&raw(1, "Permission denied\n")).is_none());
    }

    #[smol_potat::test]
    async fn test_unpooled_session_command() {
        let transport = SshTransport::new(&ToolPaths::default());
        let options = SshOptions::new("db.internal", "deploy")
            .with_port(2222)
            .with_pool(PoolOptions::disabled());
        let session = transport.session(&options).await.unwrap();
        let command = session.command("uptime");
        let rendered = command.to_shell_string();
        assert!(rendered.starts_with("ssh -p 2222 "));
        assert!(rendered.contains("BatchMode=yes"));
        assert!(rendered.ends_with("deploy@db.internal uptime"));
        assert!(!rendered.contains("ControlMaster"));
        assert!(session.connection_id().is_none());
    }

    #[smol_potat::test]
    async fn test_multiplexed_session_uses_control_master_auto() {
        let transport = SshTransport::new(&ToolPaths::default());
        let options = SshOptions::new("db.internal", "deploy")
            .with_pool(PoolOptions::disabled())
            .with_multiplexing(MultiplexingOptions {
                enabled: true,
                control_path: Some("/tmp/cm-%r@%h:%p".to_string()),
                control_persist_secs: 30,
            });
        let session = transport.session(&options).await.unwrap();
        let rendered = session.command("true").to_shell_string();
        assert!(rendered.contains("ControlMaster=auto"));
        assert!(rendered.contains("ControlPersist=30s"));
        assert!(rendered.contains("ControlPath=/tmp/cm-%r@%h:%p"));
    }

    #[smol_potat::test]
    async fn test_scp_command_forces_sftp() {
        let transport = SshTransport::new(&ToolPaths::default());
        let options = SshOptions::new("h", "u").with_pool(PoolOptions::disabled());
        let session = transport.session(&options).await.unwrap();
        let rendered = session
            .scp_command("./app.tar", &session.remote_path("/tmp/app.tar"))
            .to_shell_string();
        assert!(rendered.starts_with("scp -s -r -q -P 22 "));
        assert!(rendered.ends_with("./app.tar u@h:/tmp/app.tar"));
    }
}
