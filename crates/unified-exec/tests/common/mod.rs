//! Common test utilities
//!
//! Backends are exercised through stub `docker`, `kubectl`, `ssh`, `scp` and
//! `sudo` scripts written into a temp dir. Each stub appends its argv to
//! `calls.log` and keeps its state (containers, pods, delays) under `state/`. The
//! ssh stub runs the remote command locally with the stub dir first on
//! `PATH`, so remote docker and sudo invocations reach the stubs too.

#![allow(dead_code)]

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use unified_exec::{EngineConfig, SshOptions, ToolPaths};

/// Password the sudo stub accepts
pub const SUDO_PASSWORD: &str = "s3cret";

/// Host the ssh stub refuses to resolve
pub const UNREACHABLE_HOST: &str = "unreachable.invalid";

/// Local port the kubectl stub reports when asked for a random one
pub const STUB_FORWARD_PORT: u16 = 45678;

const DOCKER_STUB: &str = r#"#!/bin/sh
DIR="$(cd "$(dirname "$0")" && pwd)"
echo "docker $*" >> "$DIR/calls.log"
STATE="$DIR/state/containers"
mkdir -p "$STATE"
cmd="$1"; shift
case "$cmd" in
  version) echo "24.0.7"; exit 0 ;;
  inspect)
    for last; do :; done
    if [ -e "$STATE/$last" ]; then echo true; exit 0; fi
    echo "Error: No such object: $last" >&2; exit 1 ;;
  run)
    [ -f "$DIR/state/delay/docker-run" ] && sleep "$(cat "$DIR/state/delay/docker-run")"
    name=""; detach=0
    while [ $# -gt 0 ]; do
      case "$1" in
        -d) detach=1; shift ;;
        --name) name="$2"; shift 2 ;;
        -e) export "$2"; shift 2 ;;
        -w) cd "$2" || exit 126; shift 2 ;;
        -v|-u) shift 2 ;;
        -*) shift ;;
        *) break ;;
      esac
    done
    shift
    [ -n "$name" ] && touch "$STATE/$name"
    if [ "$detach" = 1 ]; then echo "${name:-0123456789ab}"; exit 0; fi
    exec "$@" ;;
  exec)
    while [ $# -gt 0 ]; do
      case "$1" in
        -e) export "$2"; shift 2 ;;
        -w) cd "$2" || exit 126; shift 2 ;;
        -u) shift 2 ;;
        -*) shift ;;
        *) break ;;
      esac
    done
    container="$1"; shift
    if [ ! -e "$STATE/$container" ]; then
      echo "Error response from daemon: No such container: $container" >&2; exit 1
    fi
    exec "$@" ;;
  rm|stop)
    for last; do :; done
    [ "$cmd" = rm ] && rm -f "$STATE/$last"
    echo "$last"; exit 0 ;;
  logs) printf 'line one\nline two\n'; exit 0 ;;
  cp) exit 0 ;;
  *) echo "docker stub: unknown command $cmd" >&2; exit 1 ;;
esac
"#;

const KUBECTL_STUB: &str = r#"#!/bin/sh
DIR="$(cd "$(dirname "$0")" && pwd)"
echo "kubectl $*" >> "$DIR/calls.log"
while [ $# -gt 0 ]; do
  case "$1" in
    --context=*|--kubeconfig=*) shift ;;
    *) break ;;
  esac
done
cmd="$1"; shift
case "$cmd" in
  config) echo "stub-context"; exit 0 ;;
  get)
    [ -f "$DIR/state/delay/kubectl-get" ] && sleep "$(cat "$DIR/state/delay/kubectl-get")"
    kind="$1"; shift
    ns=default; sel=""; name=""
    while [ $# -gt 0 ]; do
      case "$1" in
        -n) ns="$2"; shift 2 ;;
        -l) sel="$2"; shift 2 ;;
        -o) shift 2 ;;
        -*) shift ;;
        *) name="$1"; shift ;;
      esac
    done
    if [ "$kind" = pods ]; then
      f="$DIR/state/pods/$ns/$sel"
      [ -f "$f" ] && printf '%s' "$(cat "$f")"
      exit 0
    fi
    if [ -e "$DIR/state/ready/$ns/$name" ]; then printf True; else printf False; fi
    exit 0 ;;
  exec)
    pod=""
    while [ $# -gt 0 ]; do
      case "$1" in
        -n|-c) shift 2 ;;
        --) shift; break ;;
        -*) shift ;;
        *) pod="$1"; shift ;;
      esac
    done
    case "$pod" in
      missing*) echo "Error from server (NotFound): pods \"$pod\" not found" >&2; exit 1 ;;
    esac
    exec "$@" ;;
  logs) printf 'k8s one\nk8s two\n'; exit 0 ;;
  port-forward)
    for last; do :; done
    lp="${last%%:*}"
    [ -z "$lp" ] && lp=45678
    echo "Forwarding from 127.0.0.1:$lp -> ${last##*:}"
    exec sleep 30 ;;
  cp) exit 0 ;;
  *) echo "kubectl stub: unknown command $cmd" >&2; exit 1 ;;
esac
"#;

const SSH_STUB: &str = r#"#!/bin/sh
DIR="$(cd "$(dirname "$0")" && pwd)"
PATH="$DIR:$PATH"; export PATH
echo "ssh $*" >> "$DIR/calls.log"
for a in "$@"; do
  case "$a" in
    *@unreachable.invalid)
      echo "ssh: Could not resolve hostname unreachable.invalid: Name or service not known" >&2
      exit 255 ;;
  esac
done
if [ "$1" = -M ] && [ -f "$DIR/state/delay/ssh-master" ]; then
  sleep "$(cat "$DIR/state/delay/ssh-master")"
fi
for a in "$@"; do
  case "$a" in
    -V) echo "OpenSSH_9.6p1 stub" >&2; exit 0 ;;
    -O|-N) exit 0 ;;
  esac
done
for last; do :; done
exec /bin/sh -c "$last"
"#;

const SCP_STUB: &str = r#"#!/bin/sh
DIR="$(cd "$(dirname "$0")" && pwd)"
echo "scp $*" >> "$DIR/calls.log"
exit 0
"#;

const SUDO_STUB: &str = r#"#!/bin/sh
DIR="$(cd "$(dirname "$0")" && pwd)"
echo "sudo $*" >> "$DIR/calls.log"
read_password=0
while [ $# -gt 0 ]; do
  case "$1" in
    -S) read_password=1; shift ;;
    -p) printf '%s' "$2" >&2; shift 2 ;;
    -n|-k) shift ;;
    *) break ;;
  esac
done
if [ "$read_password" = 1 ]; then
  IFS= read -r password
  if [ "$password" != "$(cat "$DIR/sudo_password")" ]; then
    echo "Sorry, try again." >&2
    exit 1
  fi
fi
exec "$@"
"#;

/// A temp dir of stub client binaries
pub struct Stubs {
    dir: TempDir,
}

impl Stubs {
    /// Write every stub
    pub fn new() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("unified-exec-stubs-")
            .tempdir()
            .context("Failed to create stub dir")?;
        for (name, script) in [
            ("docker", DOCKER_STUB),
            ("kubectl", KUBECTL_STUB),
            ("ssh", SSH_STUB),
            ("scp", SCP_STUB),
            ("sudo", SUDO_STUB),
        ] {
            write_executable(&dir.path().join(name), script)?;
        }
        std::fs::write(dir.path().join("sudo_password"), SUDO_PASSWORD)?;
        std::fs::create_dir_all(dir.path().join("state/containers"))?;
        Ok(Self { dir })
    }

    /// The stub dir
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Tool paths pointing at the stubs
    pub fn tools(&self) -> ToolPaths {
        ToolPaths::in_dir(self.path())
    }

    /// Engine configuration using the stubs
    pub fn config(&self) -> EngineConfig {
        EngineConfig::default().with_tools(self.tools())
    }

    /// SSH options for a host the stub accepts
    pub fn ssh_options(&self) -> SshOptions {
        SshOptions::new("build.example", "deploy")
    }

    /// Every recorded invocation, in order
    pub fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.path().join("calls.log"))
            .map(|log| log.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Recorded invocations starting with `prefix`
    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.starts_with(prefix))
            .collect()
    }

    /// Make the docker stub report `name` as an existing container
    pub fn add_container(&self, name: &str) -> Result<()> {
        std::fs::write(self.container_marker(name), "")?;
        Ok(())
    }

    /// Whether the docker stub currently has `name`
    pub fn has_container(&self, name: &str) -> bool {
        self.container_marker(name).exists()
    }

    fn container_marker(&self, name: &str) -> PathBuf {
        self.path().join("state/containers").join(name)
    }

    /// Pods the kubectl stub returns for `selector` in `namespace`
    pub fn add_pods(&self, namespace: &str, selector: &str, pods: &[&str]) -> Result<()> {
        let dir = self.path().join("state/pods").join(namespace);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(selector), pods.join(" "))?;
        Ok(())
    }

    /// Make a stub step sleep before answering
    ///
    /// Steps: `docker-run`, `kubectl-get`, `ssh-master`.
    pub fn delay(&self, step: &str, secs: u32) -> Result<()> {
        let dir = self.path().join("state/delay");
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(step), secs.to_string())?;
        Ok(())
    }

    /// Remove a delay set with [`Stubs::delay`]
    pub fn clear_delay(&self, step: &str) {
        let _ = std::fs::remove_file(self.path().join("state/delay").join(step));
    }

    /// Mark `pod` as Ready in the kubectl stub
    pub fn mark_ready(&self, namespace: &str, pod: &str) -> Result<()> {
        let dir = self.path().join("state/ready").join(namespace);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(pod), "")?;
        Ok(())
    }
}

fn write_executable(path: &Path, script: &str) -> Result<()> {
    std::fs::write(path, script).with_context(|| format!("Failed to write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}
