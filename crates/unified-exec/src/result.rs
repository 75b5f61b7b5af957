//! The normalized result every adapter returns

use crate::error::{Error, Result};
use crate::options::AdapterKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of one execution, independent of the backend it ran on
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// Captured stdout, lossily decoded as UTF-8
    pub stdout: String,
    /// Captured stderr, lossily decoded as UTF-8
    pub stderr: String,
    /// Raw stdout bytes
    #[serde(skip)]
    pub stdout_bytes: Vec<u8>,
    /// Exit code (124 for a standardized timeout, -1 for a captured transport error)
    pub exit_code: i32,
    /// Name of the terminating signal, if any (e.g. `SIGKILL`)
    pub signal: Option<String>,
    /// `exit_code == 0`, no signal and no cause
    pub ok: bool,
    /// The literal command that was resolved and run
    pub command: String,
    /// The backend that ran it
    pub adapter: AdapterKind,
    /// Wall-clock duration
    pub duration: Duration,
    /// When the execution started
    pub started_at: DateTime<Utc>,
    /// When the execution finished
    pub finished_at: DateTime<Utc>,
    /// The error captured under a non-throwing policy
    #[serde(skip)]
    pub cause: Option<Arc<Error>>,
}

impl ExecutionResult {
    /// Trimmed stdout
    pub fn text(&self) -> &str {
        self.stdout.trim()
    }

    /// stdout parsed as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(self.stdout.trim())?)
    }

    /// stdout split on line boundaries, without terminators
    pub fn lines(&self) -> Vec<&str> {
        self.stdout.lines().collect()
    }

    /// Raw stdout bytes
    pub fn buffer(&self) -> &[u8] {
        &self.stdout_bytes
    }

    /// Whether the command was stopped by its time bound
    pub fn timed_out(&self) -> bool {
        self.exit_code == crate::timeout::TIMEOUT_EXIT_CODE
            && self.stderr.contains(crate::timeout::TIMEOUT_MARKER)
    }

    /// Turn a failed result into the matching command error
    pub fn throw_if_failed(self) -> Result<Self> {
        if self.ok {
            return Ok(self);
        }
        Err(self.into_error())
    }

    /// The command error for this result, chosen by adapter
    pub(crate) fn into_error(self) -> Error {
        let result = Box::new(self);
        match result.adapter {
            AdapterKind::Docker | AdapterKind::RemoteDocker => Error::Docker { result },
            AdapterKind::Kubernetes => Error::Kubernetes { result },
            AdapterKind::Local | AdapterKind::Ssh => Error::Command { result },
        }
    }
}
