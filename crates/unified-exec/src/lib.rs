//! Runtime-agnostic command execution across backends
//!
//! One request/result contract for running shell commands on the local
//! machine, on SSH hosts, in Docker containers (local or on an SSH host) and
//! in Kubernetes pods. Every backend is driven through its command line
//! client (`ssh`, `docker`, `kubectl`), spawned with `async-process`, so the
//! crate works under any executor.
//!
//! ```no_run
//! use unified_exec::{EngineConfig, ExecutionEngine, ExecutionRequest};
//!
//! # fn main() -> unified_exec::Result<()> {
//! smol::block_on(async {
//!     let engine = ExecutionEngine::new(EngineConfig::default())?;
//!     let result = engine.execute(ExecutionRequest::new("echo hello")).await?;
//!     assert_eq!(result.text(), "hello");
//!     engine.dispose().await;
//!     Ok(())
//! })
//! # }
//! ```

pub mod adapters;
pub mod builder;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod log_stream;
pub mod options;
pub mod policy;
pub mod port_forward;
pub mod process;
pub mod request;
pub mod resources;
pub mod result;
pub mod ssh;
mod stream;
pub mod sudo;
pub mod timeout;

pub use adapters::{
    Adapter, CopyDirection, CopyOptions, DockerAdapter, KubernetesAdapter, LocalAdapter,
    RemoteDockerAdapter, SshAdapter,
};
pub use command::{Command, shell_escape};
pub use config::{EngineConfig, ToolPaths};
pub use engine::ExecutionEngine;
pub use error::{Error, ErrorKind, Result};
pub use log_stream::{LogOptions, LogStream};
pub use options::{
    AdapterKind, AdapterOptions, AutoCreateOptions, ConnectOptions, DockerOptions, DockerRunMode,
    KeyMaterial, KubeCluster, KubernetesOptions, MultiplexingOptions, PoolOptions, RemoteContainerOptions,
    RemoteDockerOptions, Secret, SftpOptions, SshOptions, SudoMethod, SudoOptions,
};
pub use policy::FailurePolicy;
pub use port_forward::{PortForward, PortForwardOptions};
pub use process::ExitStatus;
pub use request::{ExecutionRequest, OutputMode, StdinSource};
pub use resources::{ContainerState, EphemeralContainer, ResourceRegistry, Teardown};
pub use result::ExecutionResult;
pub use ssh::PoolStats;
pub use timeout::TIMEOUT_EXIT_CODE;
