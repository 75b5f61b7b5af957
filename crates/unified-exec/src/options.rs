//! Backend selection and backend-specific connection options
//!
//! [`AdapterOptions`] is the tagged variant carried by every request. Each
//! variant's fields are serde-friendly so requests can be built from JSON or
//! YAML documents as well as in code.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Tag identifying one of the five backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdapterKind {
    /// Local process
    Local,
    /// Remote host over SSH
    Ssh,
    /// Container on the local Docker daemon
    Docker,
    /// Pod in a Kubernetes cluster
    Kubernetes,
    /// Container reached through SSH then Docker
    RemoteDocker,
}

impl AdapterKind {
    /// The string tag used in configuration and results
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterKind::Local => "local",
            AdapterKind::Ssh => "ssh",
            AdapterKind::Docker => "docker",
            AdapterKind::Kubernetes => "kubernetes",
            AdapterKind::RemoteDocker => "remote-docker",
        }
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdapterKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(AdapterKind::Local),
            "ssh" => Ok(AdapterKind::Ssh),
            "docker" => Ok(AdapterKind::Docker),
            "kubernetes" | "k8s" => Ok(AdapterKind::Kubernetes),
            "remote-docker" => Ok(AdapterKind::RemoteDocker),
            other => Err(Error::configuration(format!("unknown adapter type '{}'", other))),
        }
    }
}

/// Backend selection plus backend-specific fields
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AdapterOptions {
    /// Run as a local process
    Local,
    /// Run on a remote host over SSH
    Ssh(SshOptions),
    /// Run in a container on the local Docker daemon
    Docker(DockerOptions),
    /// Run in a Kubernetes pod
    Kubernetes(KubernetesOptions),
    /// Run in a container on a remote Docker host reached over SSH
    RemoteDocker(RemoteDockerOptions),
}

impl AdapterOptions {
    /// The backend this variant selects
    pub fn kind(&self) -> AdapterKind {
        match self {
            AdapterOptions::Local => AdapterKind::Local,
            AdapterOptions::Ssh(_) => AdapterKind::Ssh,
            AdapterOptions::Docker(_) => AdapterKind::Docker,
            AdapterOptions::Kubernetes(_) => AdapterKind::Kubernetes,
            AdapterOptions::RemoteDocker(_) => AdapterKind::RemoteDocker,
        }
    }
}

/// A string that never shows up in `Debug` output or logs
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the secret value
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Whether the secret is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([REDACTED])")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// In-memory private key material
#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyMaterial {
    /// PEM / OpenSSH text
    Text(String),
    /// Raw key bytes
    Bytes(Vec<u8>),
}

impl KeyMaterial {
    /// The key as bytes
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            KeyMaterial::Text(text) => text.as_bytes(),
            KeyMaterial::Bytes(bytes) => bytes,
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial([REDACTED])")
    }
}

fn default_true() -> bool {
    true
}

fn default_ssh_port() -> u16 {
    22
}

/// SSH connection options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshOptions {
    /// Target host (hostname or IP)
    pub host: String,
    /// Login user
    pub username: String,
    /// SSH port
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// In-memory private key
    #[serde(default)]
    pub private_key: Option<KeyMaterial>,
    /// Passphrase for `private_key` or `identity_file`
    #[serde(default)]
    pub passphrase: Option<Secret>,
    /// Password authentication
    #[serde(default)]
    pub password: Option<Secret>,
    /// Path to an identity file on disk
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// Connection pool settings
    #[serde(default)]
    pub connection_pool: PoolOptions,
    /// Control-socket multiplexing settings
    #[serde(default)]
    pub multiplexing: MultiplexingOptions,
    /// Privilege escalation settings
    #[serde(default)]
    pub sudo: SudoOptions,
    /// File transfer settings
    #[serde(default)]
    pub sftp: SftpOptions,
    /// Connect and keep-alive timings
    #[serde(default)]
    pub default_connect_options: ConnectOptions,
    /// Value for `StrictHostKeyChecking` (e.g. `accept-new`, `no`)
    #[serde(default)]
    pub strict_host_key_checking: Option<String>,
    /// Value for `UserKnownHostsFile`
    #[serde(default)]
    pub known_hosts_file: Option<PathBuf>,
    /// Additional raw ssh arguments
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl SshOptions {
    /// Create options for `username@host` with defaults for everything else
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            port: default_ssh_port(),
            private_key: None,
            passphrase: None,
            password: None,
            identity_file: None,
            connection_pool: PoolOptions::default(),
            multiplexing: MultiplexingOptions::default(),
            sudo: SudoOptions::default(),
            sftp: SftpOptions::default(),
            default_connect_options: ConnectOptions::default(),
            strict_host_key_checking: None,
            known_hosts_file: None,
            extra_args: Vec::new(),
        }
    }

    /// Set the SSH port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Use an in-memory private key
    pub fn with_private_key(mut self, key: KeyMaterial) -> Self {
        self.private_key = Some(key);
        self
    }

    /// Use an identity file on disk
    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// Set the key passphrase
    pub fn with_passphrase(mut self, passphrase: impl Into<Secret>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    /// Use password authentication
    pub fn with_password(mut self, password: impl Into<Secret>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Replace the pool settings
    pub fn with_pool(mut self, pool: PoolOptions) -> Self {
        self.connection_pool = pool;
        self
    }

    /// Replace the multiplexing settings
    pub fn with_multiplexing(mut self, multiplexing: MultiplexingOptions) -> Self {
        self.multiplexing = multiplexing;
        self
    }

    /// Replace the sudo settings
    pub fn with_sudo(mut self, sudo: SudoOptions) -> Self {
        self.sudo = sudo;
        self
    }

    /// Add a raw ssh argument
    pub fn with_extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// `user@host` destination string
    pub fn destination(&self) -> String {
        if self.username.is_empty() {
            self.host.clone()
        } else {
            format!("{}@{}", self.username, self.host)
        }
    }

    /// Validate the fields required to open a connection
    pub fn validate(&self, adapter: AdapterKind) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::execution(adapter, "ssh host is required"));
        }
        if self.username.trim().is_empty() {
            return Err(Error::execution(adapter, "ssh username is required"));
        }
        if self.port == 0 {
            return Err(Error::execution(adapter, "ssh port must be non-zero"));
        }
        if self.connection_pool.enabled && self.connection_pool.max_connections == 0 {
            return Err(Error::execution(
                adapter,
                "connection_pool.max_connections must be at least 1",
            ));
        }
        Ok(())
    }
}

/// SSH connection pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Reuse connections between executions
    pub enabled: bool,
    /// Maximum underlying connections per identity key
    pub max_connections: usize,
    /// How long an unreferenced connection stays idle before eviction
    pub idle_timeout_ms: u64,
    /// Probe idle and ready connections periodically
    pub keep_alive: bool,
    /// Interval between keep-alive probes
    pub keep_alive_interval_ms: u64,
}

impl PoolOptions {
    /// Idle timeout as a duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Keep-alive interval as a duration
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms.max(1))
    }

    /// Pool settings with pooling turned off
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_connections: 10,
            idle_timeout_ms: 60_000,
            keep_alive: true,
            keep_alive_interval_ms: 30_000,
        }
    }
}

/// SSH control-socket multiplexing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiplexingOptions {
    /// Share one authenticated transport between sessions
    pub enabled: bool,
    /// Control socket path; ssh `%h`/`%p`/`%r` tokens are allowed
    pub control_path: Option<String>,
    /// Seconds the master survives after the last session detaches
    pub control_persist_secs: u64,
}

impl Default for MultiplexingOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            control_path: None,
            control_persist_secs: 600,
        }
    }
}

/// How the sudo password reaches sudo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SudoMethod {
    /// `sudo -S`, password written to stdin
    #[default]
    Stdin,
    /// Generated helper script referenced by `SUDO_ASKPASS`
    Askpass,
    /// Helper script without the secret, password delivered in memory
    SecureAskpass,
}

/// Privilege escalation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SudoOptions {
    /// Wrap commands with sudo
    pub enabled: bool,
    /// Password, if sudo needs one
    pub password: Option<Secret>,
    /// Password delivery method
    pub method: SudoMethod,
    /// Prompt to wait for before sending the password (`stdin` method)
    pub prompt: Option<String>,
    /// How long to wait for `prompt` before giving up on it
    pub prompt_timeout_ms: u64,
}

impl SudoOptions {
    /// Sudo enabled with the given method and password
    pub fn with_password(method: SudoMethod, password: impl Into<Secret>) -> Self {
        Self {
            enabled: true,
            password: Some(password.into()),
            method,
            ..Self::default()
        }
    }

    /// Sudo enabled without credentials (passwordless sudoers)
    pub fn passwordless() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }
}

impl Default for SudoOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            password: None,
            method: SudoMethod::Stdin,
            prompt: None,
            prompt_timeout_ms: 3_000,
        }
    }
}

/// File transfer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SftpOptions {
    /// Force the SFTP protocol for copies
    pub enabled: bool,
    /// Maximum concurrent transfers in a batch
    pub concurrency: usize,
}

impl Default for SftpOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: 5,
        }
    }
}

/// Connect and keep-alive timings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// How long to wait for the connection to become ready
    pub ready_timeout_ms: u64,
    /// Server keep-alive interval (`ServerAliveInterval`)
    pub keepalive_interval_ms: u64,
}

impl ConnectOptions {
    /// Ready timeout as a duration
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            ready_timeout_ms: 20_000,
            keepalive_interval_ms: 10_000,
        }
    }
}

/// Docker execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DockerRunMode {
    /// `docker exec` into an existing container
    #[default]
    Exec,
    /// `docker run` a fresh container from an image
    Run,
}

/// Docker adapter options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerOptions {
    /// Existing container name or id (exec mode)
    pub container: Option<String>,
    /// Image to materialize (run mode)
    pub image: Option<String>,
    /// Exec into `container` or run `image`
    pub run_mode: DockerRunMode,
    /// Remove run-mode containers once the command finishes
    pub auto_remove: bool,
    /// User to run as inside the container
    pub user: Option<String>,
    /// Working directory inside the container
    pub workdir: Option<String>,
    /// Allocate a TTY
    pub tty: bool,
    /// Raw flags passed to `docker exec` / `docker run`
    pub exec_flags: Vec<String>,
    /// Volume specs for run mode (`host:container[:mode]`)
    pub volumes: Vec<String>,
}

/// A resolved Docker target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerTarget {
    /// Exec into an existing container
    Exec {
        /// Container name or id
        container: String,
    },
    /// Run a new container from an image
    Run {
        /// Image reference
        image: String,
        /// Remove the container when the command finishes
        auto_remove: bool,
    },
}

impl DockerOptions {
    /// Exec into an existing container
    pub fn exec(container: impl Into<String>) -> Self {
        Self {
            container: Some(container.into()),
            ..Self::default()
        }
    }

    /// Run a new container from `image`
    pub fn run(image: impl Into<String>) -> Self {
        Self {
            image: Some(image.into()),
            run_mode: DockerRunMode::Run,
            auto_remove: true,
            ..Self::default()
        }
    }

    /// Set the user
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the working directory
    pub fn with_workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    /// Enable or disable TTY allocation
    pub fn with_tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    /// Keep or remove run-mode containers
    pub fn with_auto_remove(mut self, auto_remove: bool) -> Self {
        self.auto_remove = auto_remove;
        self
    }

    /// Resolve `container` XOR `image` into a target
    pub fn target(&self) -> Result<DockerTarget> {
        let container = self.container.as_deref().filter(|c| !c.is_empty());
        let image = self.image.as_deref().filter(|i| !i.is_empty());
        match (self.run_mode, container, image) {
            (DockerRunMode::Exec, Some(container), None) => Ok(DockerTarget::Exec {
                container: container.to_string(),
            }),
            (DockerRunMode::Run, None, Some(image)) => Ok(DockerTarget::Run {
                image: image.to_string(),
                auto_remove: self.auto_remove,
            }),
            (_, Some(_), Some(_)) => Err(Error::execution(
                AdapterKind::Docker,
                "container and image are mutually exclusive",
            )),
            (DockerRunMode::Exec, None, _) => Err(Error::execution(
                AdapterKind::Docker,
                "exec mode requires a container name or id",
            )),
            (DockerRunMode::Run, _, None) => Err(Error::execution(
                AdapterKind::Docker,
                "run mode requires an image",
            )),
        }
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

/// The kubeconfig context and file a kubectl invocation targets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KubeCluster {
    /// kubeconfig context
    pub context: Option<String>,
    /// kubeconfig path
    pub kubeconfig: Option<PathBuf>,
}

impl KubeCluster {
    /// Target a named context
    pub fn context(context: impl Into<String>) -> Self {
        Self {
            context: Some(context.into()),
            kubeconfig: None,
        }
    }

    /// Set the kubeconfig path
    pub fn with_kubeconfig(mut self, kubeconfig: impl Into<PathBuf>) -> Self {
        self.kubeconfig = Some(kubeconfig.into());
        self
    }

    /// This cluster with unset fields taken from `fallback`
    pub fn or(&self, fallback: &KubeCluster) -> KubeCluster {
        KubeCluster {
            context: self.context.clone().or_else(|| fallback.context.clone()),
            kubeconfig: self.kubeconfig.clone().or_else(|| fallback.kubeconfig.clone()),
        }
    }
}

/// Kubernetes adapter options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesOptions {
    /// Literal pod name
    #[serde(default)]
    pub pod: Option<String>,
    /// Label selector (`app=web` or `-l app=web`)
    #[serde(default)]
    pub selector: Option<String>,
    /// Namespace
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Container within the pod
    #[serde(default)]
    pub container: Option<String>,
    /// Allocate a TTY
    #[serde(default)]
    pub tty: bool,
    /// Keep stdin open even when the request has no stdin
    #[serde(default)]
    pub stdin: bool,
    /// Raw flags passed to `kubectl exec` (e.g. `--pod-running-timeout=5m`)
    #[serde(default)]
    pub exec_flags: Vec<String>,
    /// kubeconfig context
    #[serde(default)]
    pub context: Option<String>,
    /// kubeconfig path
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,
}

impl Default for KubernetesOptions {
    fn default() -> Self {
        Self {
            pod: None,
            selector: None,
            namespace: default_namespace(),
            container: None,
            tty: false,
            stdin: false,
            exec_flags: Vec::new(),
            context: None,
            kubeconfig: None,
        }
    }
}

impl KubernetesOptions {
    /// Target a pod by name
    pub fn pod(pod: impl Into<String>) -> Self {
        Self {
            pod: Some(pod.into()),
            ..Self::default()
        }
    }

    /// Target the first pod matching a label selector
    pub fn selector(selector: impl Into<String>) -> Self {
        Self {
            selector: Some(selector.into()),
            ..Self::default()
        }
    }

    /// Set the namespace
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the container
    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    /// Add a raw exec flag
    pub fn with_exec_flag(mut self, flag: impl Into<String>) -> Self {
        self.exec_flags.push(flag.into());
        self
    }

    /// The context and kubeconfig these options name
    pub fn cluster(&self) -> KubeCluster {
        KubeCluster {
            context: self.context.clone(),
            kubeconfig: self.kubeconfig.clone(),
        }
    }

    /// Reject options that name neither a pod nor a selector
    pub fn validate(&self) -> Result<()> {
        let has_pod = self.pod.as_deref().is_some_and(|p| !p.trim().is_empty());
        let has_selector = self
            .selector
            .as_deref()
            .is_some_and(|s| !normalize_selector(s).is_empty());
        if !has_pod && !has_selector {
            return Err(Error::execution(
                AdapterKind::Kubernetes,
                "either pod or selector is required",
            ));
        }
        if self.namespace.trim().is_empty() {
            return Err(Error::execution(AdapterKind::Kubernetes, "namespace must not be empty"));
        }
        Ok(())
    }
}

/// Strip an optional leading `-l` from a selector string
pub fn normalize_selector(selector: &str) -> &str {
    let trimmed = selector.trim();
    trimmed
        .strip_prefix("-l")
        .or_else(|| trimmed.strip_prefix("--selector="))
        .or_else(|| trimmed.strip_prefix("--selector"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

/// Container settings for the remote Docker adapter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteContainerOptions {
    /// Container name or id on the remote host
    pub container: String,
    /// User to run as
    pub user: Option<String>,
    /// Working directory
    pub workdir: Option<String>,
    /// Allocate a TTY
    pub tty: bool,
    /// Raw flags passed to `docker exec`
    pub exec_flags: Vec<String>,
}

/// Auto-create settings for the remote Docker adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoCreateOptions {
    /// Create the container when it does not exist
    pub enabled: bool,
    /// Image used for the keep-alive container
    pub image: String,
    /// Remove the container on dispose
    #[serde(default = "default_true")]
    pub auto_remove: bool,
    /// Volume specs (`host:container[:mode]`)
    pub volumes: Vec<String>,
}

impl Default for AutoCreateOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            image: "alpine:latest".to_string(),
            auto_remove: true,
            volumes: Vec::new(),
        }
    }
}

/// Remote Docker adapter options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteDockerOptions {
    /// How to reach the Docker host
    pub ssh: SshOptions,
    /// Which container to run in
    pub docker: RemoteContainerOptions,
    /// Create the container on first use
    #[serde(default)]
    pub auto_create: AutoCreateOptions,
}

impl RemoteDockerOptions {
    /// Target `container` on the host described by `ssh`
    pub fn new(ssh: SshOptions, container: impl Into<String>) -> Self {
        Self {
            ssh,
            docker: RemoteContainerOptions {
                container: container.into(),
                ..RemoteContainerOptions::default()
            },
            auto_create: AutoCreateOptions::default(),
        }
    }

    /// Create the container from `image` when it does not exist
    pub fn with_auto_create(mut self, image: impl Into<String>, auto_remove: bool) -> Self {
        self.auto_create = AutoCreateOptions {
            enabled: true,
            image: image.into(),
            auto_remove,
            volumes: self.auto_create.volumes,
        };
        self
    }

    /// Validate required fields
    pub fn validate(&self) -> Result<()> {
        self.ssh.validate(AdapterKind::RemoteDocker)?;
        if self.docker.container.trim().is_empty() {
            return Err(Error::execution(
                AdapterKind::RemoteDocker,
                "docker.container is required",
            ));
        }
        if self.auto_create.enabled && self.auto_create.image.trim().is_empty() {
            return Err(Error::execution(
                AdapterKind::RemoteDocker,
                "auto_create.image is required when auto_create is enabled",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_kind_round_trips_through_str() {
        for kind in [
            AdapterKind::Local,
            AdapterKind::Ssh,
            AdapterKind::Docker,
            AdapterKind::Kubernetes,
            AdapterKind::RemoteDocker,
        ] {
            assert_eq!(kind.as_str().parse::<AdapterKind>().unwrap(), kind);
        }
        let err = "podman".parse::<AdapterKind>().unwrap_err();
        assert!(err.to_string().contains("unknown adapter type 'podman'"));
    }

    #[test]
    fn test_tagged_options_deserialize() {
        let json = r#"{"type":"kubernetes","selector":"app=test","namespace":"ns"}"#;
        let options: AdapterOptions = serde_json::from_str(json).unwrap();
        let AdapterOptions::Kubernetes(k8s) = options else {
            panic!("expected kubernetes options");
        };
        assert_eq!(k8s.selector.as_deref(), Some("app=test"));
        assert_eq!(k8s.namespace, "ns");

        let local: AdapterOptions = serde_json::from_str(r#"{"type":"local"}"#).unwrap();
        assert_eq!(local.kind(), AdapterKind::Local);
    }

    #[test]
    fn test_ssh_defaults() {
        let json = r#"{"type":"ssh","host":"example.com","username":"deploy"}"#;
        let AdapterOptions::Ssh(ssh) = serde_json::from_str(json).unwrap() else {
            panic!("expected ssh options");
        };
        assert_eq!(ssh.port, 22);
        assert!(ssh.connection_pool.enabled);
        assert_eq!(ssh.connection_pool.max_connections, 10);
        assert_eq!(ssh.sudo.method, SudoMethod::Stdin);
        assert_eq!(ssh.destination(), "deploy@example.com");
    }

    #[test]
    fn test_secrets_are_redacted() {
        let options = SshOptions::new("h", "u").with_password("hunter2");
        let debug = format!("{:?}", options);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_docker_target_resolution() {
        assert_eq!(
            DockerOptions::exec("web").target().unwrap(),
            DockerTarget::Exec { container: "web".to_string() }
        );
        assert_eq!(
            DockerOptions::run("alpine").target().unwrap(),
            DockerTarget::Run { image: "alpine".to_string(), auto_remove: true }
        );
        assert!(DockerOptions::default().target().unwrap_err().is_validation());

        let mut both = DockerOptions::exec("web");
        both.image = Some("alpine".to_string());
        assert!(both.target().is_err());
    }

    #[test]
    fn test_kubernetes_requires_pod_or_selector() {
        assert!(KubernetesOptions::default().validate().is_err());
        assert!(KubernetesOptions::selector("-l ").validate().is_err());
        assert!(KubernetesOptions::pod("web-0").validate().is_ok());
        assert!(KubernetesOptions::selector("-l app=web").validate().is_ok());
    }

    #[test]
    fn test_normalize_selector() {
        assert_eq!(normalize_selector("-l app=test"), "app=test");
        assert_eq!(normalize_selector("app=test"), "app=test");
        assert_eq!(normalize_selector("--selector=tier=db"), "tier=db");
    }

    #[test]
    fn test_cluster_fallback() {
        let adapter_default = KubeCluster::context("prod").with_kubeconfig("/etc/kube/config");
        let merged = KubeCluster::context("staging").or(&adapter_default);
        assert_eq!(merged.context.as_deref(), Some("staging"));
        assert_eq!(merged.kubeconfig, Some(PathBuf::from("/etc/kube/config")));
        assert_eq!(KubeCluster::default().or(&adapter_default), adapter_default);
    }

    #[test]
    fn test_askpass_without_password_is_valid() {
        let mut options = SshOptions::new("h", "u");
        for method in [SudoMethod::Askpass, SudoMethod::SecureAskpass] {
            options.sudo = SudoOptions {
                enabled: true,
                method,
                ..SudoOptions::default()
            };
            assert!(options.validate(AdapterKind::Ssh).is_ok());
        }
    }
}
