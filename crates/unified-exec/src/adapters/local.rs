//! Local process adapter

use super::{Adapter, missing_options, result_context};
use crate::builder;
use crate::command::Command;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::options::{AdapterKind, AdapterOptions};
use crate::process::{self, ExecIo};
use crate::request::ExecutionRequest;
use crate::result::ExecutionResult;
use async_trait::async_trait;
use std::path::Path;
use tracing::debug;

/// Runs commands as child processes of this one
#[derive(Debug, Clone)]
pub struct LocalAdapter {
    config: EngineConfig,
}

impl LocalAdapter {
    /// Create a local adapter
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn prepare(&self, request: &ExecutionRequest) -> Result<Command> {
        let argv = builder::command_argv(request, &self.config.shell);
        let mut command = Command::from_argv(argv)
            .ok_or_else(|| Error::execution(AdapterKind::Local, "command must not be empty"))?;
        command.envs(&request.env);
        if let Some(cwd) = &request.cwd {
            command.current_dir(cwd);
        }
        Ok(command)
    }
}

#[async_trait]
impl Adapter for LocalAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Local
    }

    async fn is_available(&self) -> bool {
        let shell = Path::new(&self.config.shell);
        !shell.is_absolute() || shell.exists()
    }

    async fn execute(&self, mut request: ExecutionRequest) -> Result<ExecutionResult> {
        match request.adapter_options.take() {
            None | Some(AdapterOptions::Local) => {}
            Some(other) => return Err(missing_options(AdapterKind::Local, Some(&other))),
        }
        builder::validate_command(AdapterKind::Local, &request)?;

        let ctx = result_context(&self.config, AdapterKind::Local, &request);
        let command = self.prepare(&request)?;
        debug!("local: {}", ctx.command());

        let io = ExecIo {
            stdin: std::mem::take(&mut request.stdin),
            stdout: request.stdout,
            stderr: request.stderr,
            timeout: ctx.remaining(),
        };
        let (spec, stdin) = io.into_spec(command);
        ctx.conclude(process::run(spec, stdin).await)
    }

    async fn dispose(&self) {}
}
