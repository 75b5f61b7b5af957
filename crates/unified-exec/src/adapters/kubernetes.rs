//! Kubernetes adapter: `kubectl exec` into a pod

use super::{Adapter, CopyDirection, CopyOptions, result_context, split_remote, take_options};
use crate::builder;
use crate::command::Command;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::log_stream::{LogOptions, LogStream, StreamSetup};
use crate::options::{AdapterKind, KubeCluster, KubernetesOptions, normalize_selector};
use crate::policy::ResultContext;
use crate::port_forward::{self, PortForward, PortForwardOptions};
use crate::process::{self, ExecIo, RawOutput};
use crate::request::ExecutionRequest;
use crate::resources::ResourceRegistry;
use crate::result::ExecutionResult;
use crate::timeout::{self, Outcome};
use async_process::Stdio;
use async_trait::async_trait;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);
const COPY_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_NAMESPACE: &str = "default";

/// Runs commands in pods through `kubectl`
#[derive(Debug)]
pub struct KubernetesAdapter {
    config: EngineConfig,
    cluster: KubeCluster,
    resources: ResourceRegistry,
}

impl KubernetesAdapter {
    /// Create a Kubernetes adapter
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            config: config.clone(),
            cluster: KubeCluster::default(),
            resources: ResourceRegistry::new(),
        }
    }

    /// Default context and kubeconfig for every kubectl invocation
    ///
    /// Per-call options override either field.
    pub fn with_cluster(mut self, cluster: KubeCluster) -> Self {
        self.cluster = cluster;
        self
    }

    /// Forwards and streams owned by this adapter
    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    fn kubectl(&self, cluster: &KubeCluster) -> Vec<String> {
        let mut argv = vec![self.config.tools.kubectl.to_string_lossy().into_owned()];
        argv.extend(builder::kubectl_global_args(&cluster.or(&self.cluster)));
        argv
    }

    async fn control(&self, argv: Vec<String>, operation: &str) -> Result<RawOutput> {
        let command = Command::from_argv(argv)
            .ok_or_else(|| Error::execution(AdapterKind::Kubernetes, "empty kubectl invocation"))?;
        let (spec, stdin) = ExecIo::bounded(Some(CONTROL_TIMEOUT)).into_spec(command);
        let raw = process::run(spec, stdin).await?;
        if raw.timed_out {
            return Err(Error::adapter(
                AdapterKind::Kubernetes,
                operation,
                format!("kubectl did not answer within {:?}", CONTROL_TIMEOUT),
            ));
        }
        Ok(raw)
    }

    /// First pod matching `selector` in `namespace`
    pub async fn get_pod_from_selector(&self, selector: &str, namespace: &str) -> Result<Option<String>> {
        self.find_pod(&KubeCluster::default(), selector, namespace).await
    }

    async fn find_pod(
        &self,
        cluster: &KubeCluster,
        selector: &str,
        namespace: &str,
    ) -> Result<Option<String>> {
        let mut argv = self.kubectl(cluster);
        argv.extend([
            "get".to_string(),
            "pods".to_string(),
            "-n".to_string(),
            namespace.to_string(),
            "-l".to_string(),
            normalize_selector(selector).to_string(),
            "-o".to_string(),
            "jsonpath={.items[*].metadata.name}".to_string(),
        ]);
        let raw = self.control(argv, "get-pods").await?;
        if !raw.status.success() {
            return Err(Error::adapter(
                AdapterKind::Kubernetes,
                "get-pods",
                raw.stderr_lossy().trim(),
            ));
        }
        Ok(raw
            .stdout_lossy()
            .split_whitespace()
            .next()
            .map(str::to_string))
    }

    /// Whether `pod`'s Ready condition is true; false when it cannot be read
    pub async fn is_pod_ready(&self, pod: &str, namespace: &str) -> bool {
        let mut argv = self.kubectl(&KubeCluster::default());
        argv.extend([
            "get".to_string(),
            "pod".to_string(),
            pod.to_string(),
            "-n".to_string(),
            namespace.to_string(),
            "-o".to_string(),
            "jsonpath={.status.conditions[?(@.type==\"Ready\")].status}".to_string(),
        ]);
        match self.control(argv, "pod-ready").await {
            Ok(raw) if raw.status.success() => raw.stdout_lossy().trim() == "True",
            _ => false,
        }
    }

    async fn resolve_pod(&self, options: &KubernetesOptions) -> Result<String> {
        if let Some(pod) = options.pod.as_deref().filter(|p| !p.is_empty()) {
            return Ok(pod.to_string());
        }
        let selector = options.selector.as_deref().unwrap_or_default();
        let found = self
            .find_pod(&options.cluster(), selector, &options.namespace)
            .await?;
        match found {
            Some(pod) => {
                debug!("selector {} resolved to pod {}", selector, pod);
                Ok(pod)
            }
            None => Err(Error::adapter(
                AdapterKind::Kubernetes,
                "resolve-pod",
                format!(
                    "no pod matches selector '{}' in namespace '{}'",
                    normalize_selector(selector),
                    options.namespace
                ),
            )),
        }
    }

    /// Forward a local port to `target` (`pod-name`, `svc/name`, ...)
    ///
    /// With `local_port` 0, kubectl picks the port; the handle reports it.
    pub async fn port_forward(
        &self,
        target: &str,
        local_port: u16,
        remote_port: u16,
        options: PortForwardOptions,
    ) -> Result<Arc<PortForward>> {
        let to_err = |e: std::io::Error| Error::adapter_with(AdapterKind::Kubernetes, "port-forward", e);
        let ports = if local_port == 0 {
            format!(":{}", remote_port)
        } else {
            format!("{}:{}", local_port, remote_port)
        };
        let mut argv = self.kubectl(&options.cluster);
        argv.extend([
            "port-forward".to_string(),
            "-n".to_string(),
            options
                .namespace
                .clone()
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            target.to_string(),
            ports,
        ]);
        let command = Command::from_argv(argv)
            .ok_or_else(|| Error::execution(AdapterKind::Kubernetes, "empty kubectl invocation"))?;

        let mut stderr_file = tempfile::tempfile().map_err(to_err)?;
        let stderr_handle = stderr_file.try_clone().map_err(to_err)?;
        let mut cmd = command.prepare();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(stderr_handle))
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(to_err)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::adapter(AdapterKind::Kubernetes, "port-forward", "no stdout pipe"))?;

        let forward = Arc::new(PortForward::new(target, local_port, remote_port));
        let outcome =
            timeout::supervise(port_forward::await_forwarding(stdout), Some(options.ready_timeout)).await;
        match outcome {
            Outcome::Completed(Some(port)) => {
                forward.attach(child, None);
                forward.mark_open(port);
                self.resources.track_forward(forward.clone());
                info!("port-forward to {} listening on 127.0.0.1:{}", target, port);
                Ok(forward)
            }
            Outcome::Completed(None) | Outcome::TimedOut => {
                let _ = child.kill();
                let mut diagnostic = String::new();
                let _ = stderr_file.seek(SeekFrom::Start(0));
                let _ = stderr_file.read_to_string(&mut diagnostic);
                let reason = match diagnostic.trim() {
                    "" => format!("no forwarding confirmed within {:?}", options.ready_timeout),
                    text => text.to_string(),
                };
                Err(Error::adapter(AdapterKind::Kubernetes, "port-forward", reason))
            }
        }
    }

    /// Follow a pod's logs line by line
    pub fn stream_logs<F>(&self, pod: &str, on_line: F, options: LogOptions) -> Result<LogStream>
    where
        F: FnMut(String) + Send + 'static,
    {
        let namespace = options.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE);
        let mut argv = self.kubectl(&options.cluster);
        argv.extend(["logs".to_string(), "-n".to_string(), namespace.to_string()]);
        if let Some(container) = &options.container {
            argv.push("-c".to_string());
            argv.push(container.clone());
        }
        if options.follow {
            argv.push("--follow".to_string());
        }
        if let Some(tail) = options.tail {
            argv.push(format!("--tail={}", tail));
        }
        if options.timestamps {
            argv.push("--timestamps".to_string());
        }
        argv.push(pod.to_string());

        let command = Command::from_argv(argv)
            .ok_or_else(|| Error::execution(AdapterKind::Kubernetes, "empty kubectl invocation"))?;
        let stream = LogStream::spawn(
            AdapterKind::Kubernetes,
            command,
            StreamSetup::default(),
            format!("k8s://{}/{}", namespace, pod),
            on_line,
        )?;
        self.resources.track_stream(stream.clone());
        Ok(stream)
    }

    /// `kubectl cp`; the pod side is written `<pod>:<path>`
    pub async fn copy_files(&self, source: &str, dest: &str, options: CopyOptions) -> Result<()> {
        let remote = match options.direction {
            CopyDirection::Upload => dest,
            CopyDirection::Download => source,
        };
        if split_remote(remote).is_none() {
            return Err(Error::execution(
                AdapterKind::Kubernetes,
                format!("expected <pod>:<path>, got '{}'", remote),
            ));
        }
        let mut argv = self.kubectl(&options.cluster);
        argv.extend([
            "cp".to_string(),
            "-n".to_string(),
            options
                .namespace
                .clone()
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
        ]);
        if let Some(container) = &options.container {
            argv.push("-c".to_string());
            argv.push(container.clone());
        }
        argv.push(source.to_string());
        argv.push(dest.to_string());

        let command = Command::from_argv(argv)
            .ok_or_else(|| Error::execution(AdapterKind::Kubernetes, "empty kubectl invocation"))?;
        let (spec, stdin) = ExecIo::bounded(Some(COPY_TIMEOUT)).into_spec(command);
        let raw = process::run(spec, stdin).await?;
        if !raw.status.success() || raw.timed_out {
            return Err(Error::adapter(
                AdapterKind::Kubernetes,
                "copy-files",
                raw.stderr_lossy().trim(),
            ));
        }
        debug!("copied {} -> {}", source, dest);
        Ok(())
    }

    async fn run_request(
        &self,
        ctx: &ResultContext,
        options: &KubernetesOptions,
        request: &mut ExecutionRequest,
    ) -> Result<RawOutput> {
        let pod = ctx.within(self.resolve_pod(options)).await?;
        let command = builder::inline_argv(request, &self.config.shell);
        let stdin = std::mem::take(&mut request.stdin);
        let argv = builder::kubectl_exec_argv(
            &self.config.tools.kubectl.to_string_lossy(),
            options,
            &options.cluster().or(&self.cluster),
            &pod,
            !stdin.is_none(),
            command,
        );
        let command = Command::from_argv(argv)
            .ok_or_else(|| Error::execution(AdapterKind::Kubernetes, "empty kubectl invocation"))?;
        let io = ExecIo {
            stdin,
            stdout: request.stdout,
            stderr: request.stderr,
            timeout: ctx.remaining(),
        };
        let (spec, stdin) = io.into_spec(command);
        process::run(spec, stdin).await
    }
}

#[async_trait]
impl Adapter for KubernetesAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Kubernetes
    }

    async fn is_available(&self) -> bool {
        let mut argv = self.kubectl(&KubeCluster::default());
        argv.extend(["config".to_string(), "current-context".to_string()]);
        matches!(self.control(argv, "availability").await, Ok(raw) if raw.status.success())
    }

    async fn execute(&self, mut request: ExecutionRequest) -> Result<ExecutionResult> {
        let options: KubernetesOptions = take_options!(request, Kubernetes, AdapterKind::Kubernetes)?;
        options.validate()?;
        builder::validate_command(AdapterKind::Kubernetes, &request)?;

        let ctx = result_context(&self.config, AdapterKind::Kubernetes, &request);
        debug!("kubernetes {}: {}", options.namespace, ctx.command());
        let outcome = self.run_request(&ctx, &options, &mut request).await;
        ctx.conclude(outcome)
    }

    async fn dispose(&self) {
        self.resources.stop_streams();
    }
}
