//! Spawning a local process under the timeout supervisor
//!
//! Every backend reduces to one local process: the user's program, or the
//! `ssh`, `docker` or `kubectl` client carrying it. [`run`] owns the
//! spawn, the stdio pumps and the time bound for all of them.

use crate::command::Command;
use crate::error::{Error, Result};
use crate::request::{OutputMode, StdinSource};
use crate::stream::{self, PromptWatch, StdinPrefix};
use crate::timeout::{self, Outcome};
use async_process::Stdio;
use chrono::{DateTime, Utc};
use futures_lite::future;
use smol::Timer;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// How long output pipes may stay open after the process exited
///
/// Background grandchildren (a persisted ssh control master, `cmd &`) can
/// hold the pipes indefinitely.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Process exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code if the process exited normally
    pub code: Option<i32>,
    /// Signal that terminated the process (Unix only)
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// Returns true if the process exited successfully (code 0)
    pub fn success(&self) -> bool {
        self.code == Some(0) && self.signal.is_none()
    }

    /// Returns true if the process was terminated by a signal
    pub fn terminated_by_signal(&self) -> bool {
        self.signal.is_some()
    }

    /// Exit code with signals folded in as `128 + signo`
    pub fn normalized_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => 0,
        }
    }

    /// Signal name such as `SIGKILL`
    pub fn signal_name(&self) -> Option<String> {
        let signal = self.signal?;
        #[cfg(unix)]
        {
            use nix::sys::signal::Signal;
            Some(
                Signal::try_from(signal)
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_else(|_| format!("SIG{}", signal)),
            )
        }
        #[cfg(not(unix))]
        {
            Some(format!("SIG{}", signal))
        }
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            #[cfg(unix)]
            signal: {
                use std::os::unix::process::ExitStatusExt;
                status.signal()
            },
            #[cfg(not(unix))]
            signal: None,
        }
    }
}

/// Everything needed to spawn and supervise one process
#[derive(Debug)]
pub struct ProcessSpec {
    /// The invocation
    pub command: Command,
    /// Bytes written before the caller's stdin (sudo password)
    pub stdin_prefix: Option<Vec<u8>>,
    /// Wait for this on stderr before writing `stdin_prefix`
    pub prompt: Option<String>,
    /// Bound on the wait for `prompt`
    pub prompt_timeout: Duration,
    /// stdout disposition
    pub stdout: OutputMode,
    /// stderr disposition
    pub stderr: OutputMode,
    /// Time bound
    pub timeout: Option<Duration>,
}

impl ProcessSpec {
    /// Pipe everything, no bound
    pub fn new(command: Command) -> Self {
        Self {
            command,
            stdin_prefix: None,
            prompt: None,
            prompt_timeout: Duration::ZERO,
            stdout: OutputMode::Pipe,
            stderr: OutputMode::Pipe,
            timeout: None,
        }
    }

    /// Set the time bound
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the output dispositions
    pub fn with_output(mut self, stdout: OutputMode, stderr: OutputMode) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }
}

/// Caller-facing stdio and time bound of one execution
#[derive(Debug, Default)]
pub struct ExecIo {
    /// Caller input
    pub stdin: StdinSource,
    /// stdout disposition
    pub stdout: OutputMode,
    /// stderr disposition
    pub stderr: OutputMode,
    /// Time bound
    pub timeout: Option<Duration>,
}

impl ExecIo {
    /// Captured output, no input, bounded by `timeout`
    pub fn bounded(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    /// Apply these settings to `command`
    pub fn into_spec(self, command: Command) -> (ProcessSpec, StdinSource) {
        let spec = ProcessSpec::new(command)
            .with_output(self.stdout, self.stderr)
            .with_timeout(self.timeout);
        (spec, self.stdin)
    }
}

/// What came back from the process
#[derive(Debug, Clone)]
pub struct RawOutput {
    /// Captured stdout
    pub stdout: Vec<u8>,
    /// Captured stderr
    pub stderr: Vec<u8>,
    /// Exit status; after a timeout this is the status of the killed process
    pub status: ExitStatus,
    /// Whether the time bound elapsed
    pub timed_out: bool,
    /// Spawn time
    pub started_at: DateTime<Utc>,
    /// Completion time
    pub finished_at: DateTime<Utc>,
    /// Wall-clock duration
    pub duration: Duration,
}

impl RawOutput {
    /// stdout decoded lossily
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// stderr decoded lossily
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// A bound that elapsed before any process produced output
    pub fn expired(started_at: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            status: ExitStatus {
                code: None,
                signal: None,
            },
            timed_out: true,
            started_at,
            finished_at: Utc::now(),
            duration,
        }
    }
}

/// Kills the child's process group when [`run`] is dropped before it finishes
struct GroupGuard {
    pid: Option<u32>,
}

impl GroupGuard {
    fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pid.take() {
            trace!("run abandoned, killing process group {}", pid);
            timeout::kill_process_group(pid);
        }
    }
}

fn output_stdio(mode: OutputMode) -> Stdio {
    match mode {
        OutputMode::Pipe => Stdio::piped(),
        OutputMode::Inherit => Stdio::inherit(),
    }
}

/// Spawn `spec.command`, feed it `stdin`, capture its output and enforce the bound
///
/// On timeout the process group is killed, whatever output arrived is kept
/// and `timed_out` is set. Failing to spawn is an error.
pub async fn run(spec: ProcessSpec, stdin: StdinSource) -> Result<RawOutput> {
    let program = spec.command.get_program().to_string_lossy().into_owned();
    let needs_stdin = spec.stdin_prefix.is_some() || !stdin.is_none();

    let mut cmd = spec.command.prepare();
    cmd.stdin(if needs_stdin { Stdio::piped() } else { Stdio::null() });
    cmd.stdout(output_stdio(spec.stdout));
    cmd.stderr(output_stdio(spec.stderr));
    cmd.kill_on_drop(true);

    trace!("spawning {}", spec.command.to_shell_string());
    let started_at = Utc::now();
    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|e| Error::spawn_failed(&program, e))?;
    let pid = child.id();
    let mut group = GroupGuard { pid: Some(pid) };

    let stdin_pipe = child.stdin.take();
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();

    let (watch, gate) = match (&spec.prompt, &spec.stdin_prefix) {
        (Some(prompt), Some(_)) => {
            let (watch, rx) = PromptWatch::new(prompt.clone());
            (Some(watch), Some(rx))
        }
        _ => (None, None),
    };
    let prefix = spec.stdin_prefix.map(|bytes| StdinPrefix {
        bytes,
        gate,
        gate_timeout: spec.prompt_timeout,
    });

    // Closed when the process has exited (or been killed)
    let (exited_tx, exited_rx) = async_channel::bounded::<()>(1);
    let bound = spec.timeout;

    let waiter = async {
        let first = timeout::supervise(child.status(), bound).await;
        let result = match first {
            Outcome::Completed(status) => status.map(|s| (ExitStatus::from(s), false)),
            Outcome::TimedOut => {
                debug!("{} (pid {}) exceeded {:?}, killing", program, pid, bound);
                timeout::kill_process_tree(&mut child);
                child.status().await.map(|s| (ExitStatus::from(s), true))
            }
        };
        drop(exited_tx);
        result
    };

    let exited = exited_rx.clone();
    let feeder = future::or(stream::feed_stdin(stdin_pipe, prefix, stdin), async move {
        let _ = exited.recv().await;
        Ok(())
    });

    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();
    let exited = exited_rx.clone();
    let stdout_reader = future::or(
        stream::capture(stdout_pipe, &mut stdout_buf, None),
        async move {
            let _ = exited.recv().await;
            Timer::after(DRAIN_GRACE).await;
            Ok(())
        },
    );
    let exited = exited_rx;
    let stderr_reader = future::or(
        stream::capture(stderr_pipe, &mut stderr_buf, watch),
        async move {
            let _ = exited.recv().await;
            Timer::after(DRAIN_GRACE).await;
            Ok(())
        },
    );

    let (status, fed, out, err) = futures::join!(waiter, feeder, stdout_reader, stderr_reader);
    group.disarm();
    let (status, timed_out) = status?;
    if let Err(e) = fed {
        debug!("stdin of {} closed early: {}", program, e);
    }
    out?;
    err?;

    let duration = start.elapsed();
    trace!(
        "{} exited with {:?} after {:?} (timed_out={})",
        program, status, duration, timed_out
    );
    Ok(RawOutput {
        stdout: stdout_buf,
        stderr: stderr_buf,
        status,
        timed_out,
        started_at,
        finished_at: Utc::now(),
        duration,
    })
}
