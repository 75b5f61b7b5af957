//! Error types for command execution

use crate::options::AdapterKind;
use crate::result::ExecutionResult;
use thiserror::Error;

/// Boxed low-level cause carried by transport errors
pub type BoxedCause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Unified error type for command execution
#[derive(Error, Debug)]
pub enum Error {
    /// The request is structurally invalid for the chosen adapter
    #[error("invalid request for {adapter} adapter: {reason}")]
    Execution {
        /// The adapter that rejected the request
        adapter: AdapterKind,
        /// What is wrong with the request
        reason: String,
    },

    /// Engine or adapter configuration is invalid
    #[error("configuration error: {reason}")]
    Configuration {
        /// What is wrong with the configuration
        reason: String,
    },

    /// The transport could not be established
    #[error("connection to {host} failed: {reason}")]
    Connection {
        /// The host, daemon or cluster that could not be reached
        host: String,
        /// Human readable reason, usually the client's diagnostic
        reason: String,
        /// The originating low-level error, if any
        #[source]
        source: Option<BoxedCause>,
    },

    /// The command exceeded its time bound
    #[error("command timed out after {timeout_ms}ms: {command}")]
    Timeout {
        /// The literal command that was running
        command: String,
        /// The bound that was exceeded
        timeout_ms: u64,
    },

    /// An adapter-internal operation failed
    #[error("{adapter} adapter failed during {operation}: {reason}")]
    Adapter {
        /// The adapter that failed
        adapter: AdapterKind,
        /// The operation in progress (e.g. `connect`, `create-container`)
        operation: String,
        /// Human readable reason
        reason: String,
        /// The originating error, if any
        #[source]
        source: Option<BoxedCause>,
    },

    /// A command exited non-zero (or by signal) under a throwing policy
    #[error("command `{}` failed with exit code {}", .result.command, .result.exit_code)]
    Command {
        /// The full captured result
        result: Box<ExecutionResult>,
    },

    /// A command run through the Docker CLI failed under a throwing policy
    #[error("docker command `{}` failed with exit code {}: {}", .result.command, .result.exit_code, .result.stderr.trim())]
    Docker {
        /// The full captured result
        result: Box<ExecutionResult>,
    },

    /// A command run through kubectl failed under a throwing policy
    #[error("kubernetes command `{}` failed with exit code {}: {}", .result.command, .result.exit_code, .result.stderr.trim())]
    Kubernetes {
        /// The full captured result
        result: Box<ExecutionResult>,
    },

    /// Failed to spawn a process
    #[error("failed to spawn `{program}`: {source}")]
    SpawnFailed {
        /// The program that could not be started
        program: String,
        /// The underlying I/O error
        source: std::io::Error,
    },

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Nix error (Unix signal handling)
    #[cfg(unix)]
    #[error(transparent)]
    Nix(#[from] nix::Error),

    /// Output could not be parsed as JSON
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Coarse classification of [`Error`] values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// See [`Error::Execution`]
    Execution,
    /// See [`Error::Configuration`]
    Configuration,
    /// See [`Error::Connection`]
    Connection,
    /// See [`Error::Timeout`]
    Timeout,
    /// See [`Error::Adapter`]
    Adapter,
    /// Any of [`Error::Command`], [`Error::Docker`], [`Error::Kubernetes`]
    Command,
    /// Spawn, I/O, signal or parse failures
    Io,
}

impl Error {
    /// Create a request validation error
    pub fn execution(adapter: AdapterKind, reason: impl Into<String>) -> Self {
        Self::Execution {
            adapter,
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a connection error without an underlying cause
    pub fn connection(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Connection {
            host: host.into(),
            reason: reason.into(),
            source: None,
        }
    }

    /// Create a connection error wrapping a low-level cause
    pub fn connection_with<E>(host: impl Into<String>, reason: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Connection {
            host: host.into(),
            reason: reason.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an adapter error
    pub fn adapter(
        adapter: AdapterKind,
        operation: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Adapter {
            adapter,
            operation: operation.into(),
            reason: reason.into(),
            source: None,
        }
    }

    /// Wrap an error raised during an adapter-internal operation
    pub fn adapter_with<E>(adapter: AdapterKind, operation: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Adapter {
            adapter,
            operation: operation.into(),
            reason: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a spawn failed error
    pub fn spawn_failed(program: impl Into<String>, source: std::io::Error) -> Self {
        Self::SpawnFailed {
            program: program.into(),
            source,
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Execution { .. } => ErrorKind::Execution,
            Error::Configuration { .. } => ErrorKind::Configuration,
            Error::Connection { .. } => ErrorKind::Connection,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Adapter { .. } => ErrorKind::Adapter,
            Error::Command { .. } | Error::Docker { .. } | Error::Kubernetes { .. } => {
                ErrorKind::Command
            }
            Error::SpawnFailed { .. } | Error::Io(_) | Error::Json(_) => ErrorKind::Io,
            #[cfg(unix)]
            Error::Nix(_) => ErrorKind::Io,
        }
    }

    /// The captured result, for command failures
    pub fn result(&self) -> Option<&ExecutionResult> {
        match self {
            Error::Command { result } | Error::Docker { result } | Error::Kubernetes { result } => {
                Some(result)
            }
            _ => None,
        }
    }

    /// Whether the request itself was rejected; such errors are never captured by `nothrow`
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Execution { .. } | Error::Configuration { .. })
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
