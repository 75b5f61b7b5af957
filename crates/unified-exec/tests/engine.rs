//! Engine-level tests: routing, configuration and behavior shared by every adapter

mod common;

use common::Stubs;
use std::time::Duration;
use unified_exec::{
    AdapterKind, AdapterOptions, DockerOptions, EngineConfig, ErrorKind, ExecutionEngine,
    ExecutionRequest, KubernetesOptions, RemoteDockerOptions, TIMEOUT_EXIT_CODE,
};

/// Adapter options for every backend, all pointing at the stubs
fn every_backend(stubs: &Stubs) -> Vec<(AdapterKind, Option<AdapterOptions>)> {
    vec![
        (AdapterKind::Local, None),
        (AdapterKind::Ssh, Some(AdapterOptions::Ssh(stubs.ssh_options()))),
        (
            AdapterKind::Docker,
            Some(AdapterOptions::Docker(DockerOptions::exec("web"))),
        ),
        (
            AdapterKind::Kubernetes,
            Some(AdapterOptions::Kubernetes(KubernetesOptions::pod("web-0"))),
        ),
        (
            AdapterKind::RemoteDocker,
            Some(AdapterOptions::RemoteDocker(RemoteDockerOptions::new(
                stubs.ssh_options(),
                "web",
            ))),
        ),
    ]
}

fn request(command: &str, options: Option<AdapterOptions>) -> ExecutionRequest {
    let request = ExecutionRequest::new(command);
    match options {
        Some(options) => request.with_adapter(options),
        None => request,
    }
}

#[smol_potat::test]
async fn test_echo_on_every_backend() {
    let stubs = Stubs::new().unwrap();
    stubs.add_container("web").unwrap();
    let engine = ExecutionEngine::new(stubs.config()).unwrap();

    for (kind, options) in every_backend(&stubs) {
        let result = engine.execute(request("echo hello", options)).await.unwrap();
        assert!(result.ok, "{kind}");
        assert_eq!(result.text(), "hello", "{kind}");
        assert_eq!(result.adapter, kind);
    }
    engine.dispose().await;
}

#[smol_potat::test]
async fn test_timeout_on_every_backend() {
    let stubs = Stubs::new().unwrap();
    stubs.add_container("web").unwrap();
    let engine = ExecutionEngine::new(stubs.config()).unwrap();

    for (kind, options) in every_backend(&stubs) {
        let result = engine
            .execute(request("sleep 5", options).timeout_ms(300).nothrow(true))
            .await
            .unwrap();
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE, "{kind}");
        let annotation = format!("[{}] command timed out after 300ms", kind);
        assert!(result.stderr.contains(&annotation), "{kind}: {}", result.stderr);
    }
    engine.dispose().await;
}

#[smol_potat::test]
async fn test_non_zero_exit_classification() {
    let stubs = Stubs::new().unwrap();
    stubs.add_container("web").unwrap();
    let engine = ExecutionEngine::new(stubs.config()).unwrap();

    for (kind, options) in every_backend(&stubs) {
        let err = engine
            .execute(request("exit 4", options.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Command, "{kind}");
        assert_eq!(err.result().unwrap().exit_code, 4, "{kind}");

        let result = engine
            .execute(request("exit 4", options).nothrow(true))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 4, "{kind}");
        assert!(!result.ok);
    }
    engine.dispose().await;
}

#[smol_potat::test]
async fn test_default_timeout_applies() {
    let config = EngineConfig::default().with_default_timeout(Duration::from_millis(200));
    let engine = ExecutionEngine::new(config).unwrap();

    let err = engine
        .execute(ExecutionRequest::new("sleep 5"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    let result = engine
        .execute(ExecutionRequest::new("sleep 0.5").timeout(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(result.ok);
}

#[smol_potat::test]
async fn test_engine_policy_and_override() {
    let config = EngineConfig::default().with_throw_on_non_zero_exit(false);
    let engine = ExecutionEngine::new(config).unwrap();

    let result = engine.execute(ExecutionRequest::new("exit 1")).await.unwrap();
    assert_eq!(result.exit_code, 1);

    let err = engine
        .execute(ExecutionRequest::new("exit 1").nothrow(false))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Command);
}

#[smol_potat::test]
async fn test_non_local_default_without_options() {
    let config = EngineConfig::default().with_default_adapter(AdapterKind::Docker);
    let engine = ExecutionEngine::new(config).unwrap();

    let err = engine
        .execute(ExecutionRequest::new("true").nothrow(true))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execution);
}

#[smol_potat::test]
async fn test_from_yaml() {
    let stubs = Stubs::new().unwrap();
    stubs.add_container("web").unwrap();
    let yaml = format!(
        r#"
default_adapter: docker
default_timeout_ms: 5000
throw_on_non_zero_exit: false
tools:
  docker: {}
"#,
        stubs.path().join("docker").display()
    );
    let engine = ExecutionEngine::from_yaml_str(&yaml).unwrap();
    assert_eq!(engine.config().default_adapter, AdapterKind::Docker);
    assert_eq!(engine.config().default_timeout_ms, Some(5000));

    let result = engine
        .execute(
            ExecutionRequest::new("exit 3")
                .with_adapter(AdapterOptions::Docker(DockerOptions::exec("web"))),
        )
        .await
        .unwrap();
    assert_eq!(result.exit_code, 3);
}

#[smol_potat::test]
async fn test_invalid_yaml_is_a_configuration_error() {
    let err = ExecutionEngine::from_yaml_str("default_adapter: podman\n").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let err = ExecutionEngine::from_yaml_str("default_timeout_ms: 0\n").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[smol_potat::test]
async fn test_availability_with_stubs() {
    let stubs = Stubs::new().unwrap();
    let engine = ExecutionEngine::new(stubs.config()).unwrap();

    for kind in [
        AdapterKind::Local,
        AdapterKind::Ssh,
        AdapterKind::Docker,
        AdapterKind::Kubernetes,
        AdapterKind::RemoteDocker,
    ] {
        assert!(engine.is_available(kind).await, "{kind}");
    }
}

#[smol_potat::test]
async fn test_ssh_and_remote_docker_share_pool() {
    let stubs = Stubs::new().unwrap();
    stubs.add_container("web").unwrap();
    let engine = ExecutionEngine::new(stubs.config()).unwrap();

    engine
        .execute(request("true", Some(AdapterOptions::Ssh(stubs.ssh_options()))))
        .await
        .unwrap();
    engine
        .execute(request(
            "true",
            Some(AdapterOptions::RemoteDocker(RemoteDockerOptions::new(
                stubs.ssh_options(),
                "web",
            ))),
        ))
        .await
        .unwrap();

    assert_eq!(stubs.calls_starting_with("ssh -M -N -f").len(), 1);
    assert_eq!(engine.pool_stats().connections, 1);
    engine.dispose().await;
    assert_eq!(engine.pool_stats().connections, 0);
}

#[smol_potat::test]
async fn test_dispose_is_idempotent() {
    let stubs = Stubs::new().unwrap();
    let engine = ExecutionEngine::new(stubs.config()).unwrap();
    let options = RemoteDockerOptions::new(stubs.ssh_options(), "scratch")
        .with_auto_create("alpine:3.19", true);

    engine
        .execute(request("true", Some(AdapterOptions::RemoteDocker(options))))
        .await
        .unwrap();
    engine.dispose().await;
    engine.dispose().await;

    assert_eq!(stubs.calls_starting_with("docker rm").len(), 1);
    assert!(!stubs.has_container("scratch"));
}
