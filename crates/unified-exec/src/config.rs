//! Engine-wide configuration

use crate::error::{Error, Result};
use crate::options::AdapterKind;
use crate::policy::FailurePolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Paths of the client binaries the adapters drive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    /// `ssh` client
    pub ssh: PathBuf,
    /// `scp` client
    pub scp: PathBuf,
    /// Local `docker` CLI
    pub docker: PathBuf,
    /// `docker` CLI name on remote hosts
    pub remote_docker: String,
    /// `kubectl` CLI
    pub kubectl: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            ssh: PathBuf::from("ssh"),
            scp: PathBuf::from("scp"),
            docker: PathBuf::from("docker"),
            remote_docker: "docker".to_string(),
            kubectl: PathBuf::from("kubectl"),
        }
    }
}

impl ToolPaths {
    /// Resolve every tool relative to `dir` (used to point at stub binaries)
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            ssh: dir.join("ssh"),
            scp: dir.join("scp"),
            docker: dir.join("docker"),
            remote_docker: "docker".to_string(),
            kubectl: dir.join("kubectl"),
        }
    }
}

/// Configuration shared by the engine and every adapter it owns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Adapter used when a request carries no `adapter_options`
    pub default_adapter: AdapterKind,
    /// Timeout applied when a request sets none; `None` means unbounded
    pub default_timeout_ms: Option<u64>,
    /// Whether non-zero exits raise an error when the request does not say
    pub throw_on_non_zero_exit: bool,
    /// Always report timeouts as exit code 124 instead of raising
    pub standardize_timeouts: bool,
    /// Shell used for `shell = true` requests
    pub shell: String,
    /// Client binaries
    pub tools: ToolPaths,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_adapter: AdapterKind::Local,
            default_timeout_ms: None,
            throw_on_non_zero_exit: true,
            standardize_timeouts: false,
            shell: "/bin/sh".to_string(),
            tools: ToolPaths::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(content)
            .map_err(|e| Error::configuration(format!("invalid engine configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.shell.trim().is_empty() {
            return Err(Error::configuration("shell must not be empty"));
        }
        if self.default_timeout_ms == Some(0) {
            return Err(Error::configuration("default_timeout_ms must be greater than zero"));
        }
        Ok(())
    }

    /// Set the default adapter
    pub fn with_default_adapter(mut self, kind: AdapterKind) -> Self {
        self.default_adapter = kind;
        self
    }

    /// Set the default timeout
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Set whether non-zero exits raise by default
    pub fn with_throw_on_non_zero_exit(mut self, throw: bool) -> Self {
        self.throw_on_non_zero_exit = throw;
        self
    }

    /// Set whether timeouts are always reported as exit code 124
    pub fn with_standardized_timeouts(mut self, standardize: bool) -> Self {
        self.standardize_timeouts = standardize;
        self
    }

    /// Replace the tool paths
    pub fn with_tools(mut self, tools: ToolPaths) -> Self {
        self.tools = tools;
        self
    }

    /// The failure policy derived from this configuration
    pub fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy {
            throw_on_non_zero_exit: self.throw_on_non_zero_exit,
            standardize_timeouts: self.standardize_timeouts,
        }
    }

    /// Effective timeout for a request
    pub fn effective_timeout(&self, requested_ms: Option<u64>) -> Option<Duration> {
        requested_ms
            .or(self.default_timeout_ms)
            .map(Duration::from_millis)
    }
}
