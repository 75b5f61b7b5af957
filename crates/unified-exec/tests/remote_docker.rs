//! Integration tests for the remote Docker adapter
//!
//! docker invocations travel through the ssh stub, which runs them against
//! the docker stub on this machine.

mod common;

use common::Stubs;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use unified_exec::{
    Adapter, AdapterOptions, ContainerState, CopyDirection, Error, ExecutionRequest, LogOptions,
    RemoteDockerAdapter, RemoteDockerOptions, SudoOptions, TIMEOUT_EXIT_CODE,
};

fn in_container(options: &RemoteDockerOptions, command: &str) -> ExecutionRequest {
    ExecutionRequest::new(command).with_adapter(AdapterOptions::RemoteDocker(options.clone()))
}

#[smol_potat::test]
async fn test_exec_in_existing_container() {
    let stubs = Stubs::new().unwrap();
    stubs.add_container("builder").unwrap();
    let adapter = RemoteDockerAdapter::new(&stubs.config());
    let options = RemoteDockerOptions::new(stubs.ssh_options(), "builder");

    let result = adapter
        .execute(in_container(&options, "echo hello"))
        .await
        .unwrap();

    assert!(result.ok);
    assert_eq!(result.text(), "hello");
    assert_eq!(
        stubs.calls_starting_with("docker"),
        vec!["docker exec builder /bin/sh -c echo hello"]
    );
    adapter.dispose().await;
}

#[smol_potat::test]
async fn test_auto_create_runs_container_once() {
    let stubs = Stubs::new().unwrap();
    let adapter = RemoteDockerAdapter::new(&stubs.config());
    let options =
        RemoteDockerOptions::new(stubs.ssh_options(), "builder").with_auto_create("alpine:3.19", true);

    let first = adapter
        .execute(in_container(&options, "echo first"))
        .await
        .unwrap();
    let second = adapter
        .execute(in_container(&options, "echo second"))
        .await
        .unwrap();

    assert_eq!(first.text(), "first");
    assert_eq!(second.text(), "second");
    assert_eq!(
        stubs.calls_starting_with("docker run"),
        vec!["docker run -d --name builder alpine:3.19 tail -f /dev/null"]
    );
    assert_eq!(stubs.calls_starting_with("docker inspect").len(), 1);
    assert_eq!(stubs.calls_starting_with("docker exec").len(), 2);
    adapter.dispose().await;
}

#[smol_potat::test]
async fn test_concurrent_first_use_creates_once() {
    let stubs = Stubs::new().unwrap();
    let adapter = RemoteDockerAdapter::new(&stubs.config());
    let options =
        RemoteDockerOptions::new(stubs.ssh_options(), "builder").with_auto_create("alpine:3.19", true);

    let (a, b) = futures::join!(
        adapter.execute(in_container(&options, "echo a")),
        adapter.execute(in_container(&options, "echo b")),
    );

    assert_eq!(a.unwrap().text(), "a");
    assert_eq!(b.unwrap().text(), "b");
    assert_eq!(stubs.calls_starting_with("docker run").len(), 1);
    adapter.dispose().await;
}

#[smol_potat::test]
async fn test_auto_created_container_removed_on_dispose() {
    let stubs = Stubs::new().unwrap();
    let adapter = RemoteDockerAdapter::new(&stubs.config());
    let options =
        RemoteDockerOptions::new(stubs.ssh_options(), "builder").with_auto_create("alpine:3.19", true);

    adapter
        .execute(in_container(&options, "true"))
        .await
        .unwrap();
    assert!(stubs.has_container("builder"));
    assert_eq!(
        adapter
            .resources()
            .container_state("builder", "deploy@build.example:22"),
        ContainerState::Running
    );

    adapter.dispose().await;
    adapter.dispose().await;

    assert_eq!(
        stubs.calls_starting_with("docker rm"),
        vec!["docker rm -f builder"]
    );
    assert!(!stubs.has_container("builder"));
    assert_eq!(
        adapter
            .resources()
            .container_state("builder", "deploy@build.example:22"),
        ContainerState::Removed
    );
}

#[smol_potat::test]
async fn test_kept_container_is_stopped_on_dispose() {
    let stubs = Stubs::new().unwrap();
    let adapter = RemoteDockerAdapter::new(&stubs.config());
    let options = RemoteDockerOptions::new(stubs.ssh_options(), "builder")
        .with_auto_create("alpine:3.19", false);

    adapter
        .execute(in_container(&options, "true"))
        .await
        .unwrap();
    adapter.dispose().await;

    assert_eq!(
        stubs.calls_starting_with("docker stop"),
        vec!["docker stop builder"]
    );
    assert!(stubs.calls_starting_with("docker rm").is_empty());
    assert!(stubs.has_container("builder"));
}

#[smol_potat::test]
async fn test_existing_container_is_not_created_or_removed() {
    let stubs = Stubs::new().unwrap();
    stubs.add_container("builder").unwrap();
    let adapter = RemoteDockerAdapter::new(&stubs.config());
    let options =
        RemoteDockerOptions::new(stubs.ssh_options(), "builder").with_auto_create("alpine:3.19", true);

    adapter
        .execute(in_container(&options, "true"))
        .await
        .unwrap();
    adapter.dispose().await;

    assert!(stubs.calls_starting_with("docker run").is_empty());
    assert!(stubs.calls_starting_with("docker rm").is_empty());
    assert!(stubs.has_container("builder"));
}

#[smol_potat::test]
async fn test_missing_container_without_auto_create() {
    let stubs = Stubs::new().unwrap();
    let adapter = RemoteDockerAdapter::new(&stubs.config());
    let options = RemoteDockerOptions::new(stubs.ssh_options(), "ghost");

    let result = adapter
        .execute(in_container(&options, "true").nothrow(true))
        .await
        .unwrap();
    assert!(result.stderr.contains("container 'ghost' not found"));

    let err = adapter
        .execute(in_container(&options, "true"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Docker { .. }));
    adapter.dispose().await;
}

#[smol_potat::test]
async fn test_env_and_cwd() {
    let stubs = Stubs::new().unwrap();
    stubs.add_container("builder").unwrap();
    let adapter = RemoteDockerAdapter::new(&stubs.config());
    let options = RemoteDockerOptions::new(stubs.ssh_options(), "builder");

    let request = in_container(&options, "echo \"$TARGET\"; pwd")
        .env("TARGET", "x86_64 linux")
        .cwd("/");
    let result = adapter.execute(request).await.unwrap();

    assert_eq!(result.lines(), vec!["x86_64 linux", "/"]);
    adapter.dispose().await;
}

#[smol_potat::test]
async fn test_sudo_wraps_docker_invocation() {
    let stubs = Stubs::new().unwrap();
    stubs.add_container("builder").unwrap();
    let adapter = RemoteDockerAdapter::new(&stubs.config());
    let ssh = stubs.ssh_options().with_sudo(SudoOptions::passwordless());
    let options = RemoteDockerOptions::new(ssh, "builder");

    let result = adapter
        .execute(in_container(&options, "echo elevated"))
        .await
        .unwrap();

    assert_eq!(result.text(), "elevated");
    let sudo = stubs.calls_starting_with("sudo");
    assert_eq!(sudo.len(), 1);
    assert!(sudo[0].starts_with("sudo -n sh -c docker exec builder"));
    adapter.dispose().await;
}

#[smol_potat::test]
async fn test_timeout() {
    let stubs = Stubs::new().unwrap();
    stubs.add_container("builder").unwrap();
    let adapter = RemoteDockerAdapter::new(&stubs.config());
    let options = RemoteDockerOptions::new(stubs.ssh_options(), "builder");

    let result = adapter
        .execute(in_container(&options, "sleep 5").timeout_ms(300).nothrow(true))
        .await
        .unwrap();

    assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
    assert!(result.stderr.contains("[remote-docker] command timed out after 300ms"));
    adapter.dispose().await;
}

#[smol_potat::test]
async fn test_slow_auto_create_counts_against_timeout() {
    let stubs = Stubs::new().unwrap();
    stubs.delay("docker-run", 3).unwrap();
    let adapter = RemoteDockerAdapter::new(&stubs.config());
    let options =
        RemoteDockerOptions::new(stubs.ssh_options(), "builder").with_auto_create("alpine:3.19", true);

    let started = Instant::now();
    let result = adapter
        .execute(in_container(&options, "true").timeout_ms(500).nothrow(true))
        .await
        .unwrap();

    assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
    assert!(result.stderr.contains("[remote-docker] command timed out after 500ms"));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(stubs.calls_starting_with("docker exec").is_empty());

    // The interrupted creation stays on the teardown list
    assert_eq!(
        adapter
            .resources()
            .container_state("builder", "deploy@build.example:22"),
        ContainerState::Running
    );
    adapter.dispose().await;
    assert_eq!(
        stubs.calls_starting_with("docker rm"),
        vec!["docker rm -f builder"]
    );
}

#[smol_potat::test]
async fn test_copy_files_stages_on_host() {
    let stubs = Stubs::new().unwrap();
    stubs.add_container("builder").unwrap();
    let adapter = RemoteDockerAdapter::new(&stubs.config());
    let options = RemoteDockerOptions::new(stubs.ssh_options(), "builder");

    adapter
        .copy_files(&options, "./app.conf", "/etc/app.conf", CopyDirection::Upload)
        .await
        .unwrap();

    let scp = stubs.calls_starting_with("scp");
    assert_eq!(scp.len(), 1);
    assert!(scp[0].contains("./app.conf deploy@build.example:/tmp/unified-exec-"));
    let cp = stubs.calls_starting_with("docker cp");
    assert_eq!(cp.len(), 1);
    assert!(cp[0].starts_with("docker cp /tmp/unified-exec-"));
    assert!(cp[0].ends_with(" builder:/etc/app.conf"));
    adapter.dispose().await;
}

#[smol_potat::test]
async fn test_stream_logs() {
    let stubs = Stubs::new().unwrap();
    let adapter = RemoteDockerAdapter::new(&stubs.config());
    let options = RemoteDockerOptions::new(stubs.ssh_options(), "builder");
    let lines = Arc::new(Mutex::new(Vec::new()));

    let sink = lines.clone();
    let stream = adapter
        .stream_logs(
            &options,
            move |line| sink.lock().unwrap().push(line),
            LogOptions::snapshot(),
        )
        .await
        .unwrap();
    stream.wait().await;

    assert_eq!(*lines.lock().unwrap(), vec!["line one", "line two"]);
    assert_eq!(stream.source(), "docker://deploy@build.example:22/builder");
    adapter.dispose().await;
}

#[smol_potat::test]
async fn test_invalid_options_rejected() {
    let stubs = Stubs::new().unwrap();
    let adapter = RemoteDockerAdapter::new(&stubs.config());
    let options = RemoteDockerOptions::new(stubs.ssh_options(), "");

    let err = adapter
        .execute(in_container(&options, "true").nothrow(true))
        .await
        .unwrap_err();

    assert!(err.is_validation());
    assert!(stubs.calls().is_empty());
}
