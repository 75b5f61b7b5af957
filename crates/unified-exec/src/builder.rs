//! Per-backend command construction
//!
//! Everything here is pure string and argv manipulation. The adapters feed
//! the resulting vectors to [`crate::process::run`], locally or over SSH.

use crate::command::{join_shell, shell_escape};
use crate::error::{Error, Result};
use crate::options::{AdapterKind, KubeCluster, KubernetesOptions};
use crate::request::ExecutionRequest;
use std::collections::BTreeMap;

/// Check that every environment key is a valid shell identifier
pub fn validate_env(adapter: AdapterKind, env: &BTreeMap<String, String>) -> Result<()> {
    for key in env.keys() {
        let mut chars = key.chars();
        let valid_head = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        if !valid_head || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::execution(
                adapter,
                format!("invalid environment variable name '{}'", key),
            ));
        }
    }
    Ok(())
}

/// Reject requests without a command
pub fn validate_command(adapter: AdapterKind, request: &ExecutionRequest) -> Result<()> {
    if request.command.trim().is_empty() {
        return Err(Error::execution(adapter, "command must not be empty"));
    }
    validate_env(adapter, &request.env)
}

/// The user's command, without environment or working directory handling
///
/// `shell = true` becomes `<shell> -c <command>`; otherwise the argv is used
/// as is.
pub fn command_argv(request: &ExecutionRequest, shell: &str) -> Vec<String> {
    if request.shell {
        vec![
            shell.to_string(),
            "-c".to_string(),
            request.display_command(),
        ]
    } else {
        request.argv()
    }
}

/// A shell script that exports the environment, changes directory and runs the command
pub fn shell_script(request: &ExecutionRequest) -> String {
    let mut script = String::new();
    for (key, value) in &request.env {
        script.push_str(&format!("export {}={}; ", key, shell_escape(value)));
    }
    if let Some(cwd) = &request.cwd {
        script.push_str(&format!("cd {} && ", shell_escape(cwd)));
    }
    if request.shell {
        script.push_str(&request.display_command());
    } else {
        script.push_str(&join_shell(request.argv()));
    }
    script
}

/// The user's command with environment and working directory inlined
///
/// Used where the transport cannot carry them (kubectl exec, ssh).
pub fn inline_argv(request: &ExecutionRequest, shell: &str) -> Vec<String> {
    if request.shell || !request.env.is_empty() || request.cwd.is_some() {
        vec![shell.to_string(), "-c".to_string(), shell_script(request)]
    } else {
        request.argv()
    }
}

/// The command string sent over SSH
pub fn remote_command(request: &ExecutionRequest, shell: &str) -> String {
    join_shell(inline_argv(request, shell))
}

/// Flags shared by `docker exec` and `docker run`
#[derive(Debug, Clone, Default)]
pub struct DockerFlags<'a> {
    /// Keep stdin open (`-i`)
    pub interactive: bool,
    /// Allocate a TTY (`-t`)
    pub tty: bool,
    /// `-u`
    pub user: Option<&'a str>,
    /// `-w`
    pub workdir: Option<&'a str>,
    /// `-e KEY=VALUE`
    pub env: Option<&'a BTreeMap<String, String>>,
    /// Passthrough flags
    pub extra: &'a [String],
}

impl DockerFlags<'_> {
    fn push_into(&self, argv: &mut Vec<String>) {
        if self.interactive {
            argv.push("-i".to_string());
        }
        if self.tty {
            argv.push("-t".to_string());
        }
        if let Some(user) = self.user {
            argv.push("-u".to_string());
            argv.push(user.to_string());
        }
        if let Some(workdir) = self.workdir {
            argv.push("-w".to_string());
            argv.push(workdir.to_string());
        }
        if let Some(env) = self.env {
            for (key, value) in env {
                argv.push("-e".to_string());
                argv.push(format!("{}={}", key, value));
            }
        }
        argv.extend(self.extra.iter().cloned());
    }
}

/// `docker exec [flags] <container> <command...>`
pub fn docker_exec_argv(
    docker: &str,
    container: &str,
    flags: &DockerFlags<'_>,
    command: Vec<String>,
) -> Vec<String> {
    let mut argv = vec![docker.to_string(), "exec".to_string()];
    flags.push_into(&mut argv);
    argv.push(container.to_string());
    argv.extend(command);
    argv
}

/// Container settings specific to `docker run`
#[derive(Debug, Clone, Default)]
pub struct RunSpec<'a> {
    /// `--name`
    pub name: Option<&'a str>,
    /// `--rm`
    pub auto_remove: bool,
    /// `-d`
    pub detach: bool,
    /// `-v` specs
    pub volumes: &'a [String],
}

/// `docker run [--rm] [-d] [--name n] [-v ..] [flags] <image> <command...>`
pub fn docker_run_argv(
    docker: &str,
    image: &str,
    spec: &RunSpec<'_>,
    flags: &DockerFlags<'_>,
    command: Vec<String>,
) -> Vec<String> {
    let mut argv = vec![docker.to_string(), "run".to_string()];
    if spec.auto_remove {
        argv.push("--rm".to_string());
    }
    if spec.detach {
        argv.push("-d".to_string());
    }
    if let Some(name) = spec.name {
        argv.push("--name".to_string());
        argv.push(name.to_string());
    }
    for volume in spec.volumes {
        argv.push("-v".to_string());
        argv.push(volume.clone());
    }
    flags.push_into(&mut argv);
    argv.push(image.to_string());
    argv.extend(command);
    argv
}

/// `--context` / `--kubeconfig` flags placed before the kubectl subcommand
pub fn kubectl_global_args(cluster: &KubeCluster) -> Vec<String> {
    let mut argv = Vec::new();
    if let Some(context) = &cluster.context {
        argv.push(format!("--context={}", context));
    }
    if let Some(kubeconfig) = &cluster.kubeconfig {
        argv.push(format!("--kubeconfig={}", kubeconfig.display()));
    }
    argv
}

/// `kubectl exec -n <ns> [-c <container>] [-i] [-t] [flags] <pod> -- <command...>`
pub fn kubectl_exec_argv(
    kubectl: &str,
    options: &KubernetesOptions,
    cluster: &KubeCluster,
    pod: &str,
    interactive: bool,
    command: Vec<String>,
) -> Vec<String> {
    let mut argv = vec![kubectl.to_string()];
    argv.extend(kubectl_global_args(cluster));
    argv.push("exec".to_string());
    argv.push("-n".to_string());
    argv.push(options.namespace.clone());
    if let Some(container) = &options.container {
        argv.push("-c".to_string());
        argv.push(container.clone());
    }
    if interactive || options.stdin {
        argv.push("-i".to_string());
    }
    if options.tty {
        argv.push("-t".to_string());
    }
    argv.extend(options.exec_flags.iter().cloned());
    argv.push(pod.to_string());
    argv.push("--".to_string());
    argv.extend(command);
    argv
}
