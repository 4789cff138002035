//! End-to-end provisioning against a real entry-point script.
#![cfg(unix)]

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use local_cloud_core::params;
use local_cloud_provider::{
    CloudClient, InstanceStatus, LocalCloudClient, ProviderConfig, ProvisionRequest, ScriptRunner,
};
use tempfile::TempDir;

/// A worker that appends every command it receives to `<staging>/commands.log`.
const AGENT_SCRIPT: &str = "#!/bin/sh\necho \"$@\" >> ../commands.log\n";

fn write_template(root: &Path) -> PathBuf {
    let source = root.join("agentA");
    std::fs::create_dir_all(source.join("bin")).unwrap();
    std::fs::create_dir_all(source.join("conf")).unwrap();
    std::fs::create_dir_all(source.join("work")).unwrap();
    std::fs::write(source.join("work").join("checkout.lock"), "").unwrap();
    std::fs::write(
        source.join("conf").join("buildAgent.dist.properties"),
        "# distributed defaults\nname=\nownPort=9090\n",
    )
    .unwrap();

    let script = source.join("bin").join("agent.sh");
    std::fs::write(&script, AGENT_SCRIPT).unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    source
}

fn client(root: &Path, declarations: &str) -> LocalCloudClient {
    let config = ProviderConfig {
        staging_root: root.join("staging"),
        status_wait_timeout_ms: 2_000,
        restart_settle_ms: 100,
        cleanup_grace_ms: 50,
    };
    LocalCloudClient::from_declarations(declarations, config, Arc::new(ScriptRunner::new()))
}

async fn wait_for_commands(staging_dir: &Path, expected: usize) -> Vec<String> {
    let log = staging_dir.join("commands.log");
    for _ in 0..200 {
        if let Ok(text) = std::fs::read_to_string(&log) {
            let lines: Vec<String> = text.lines().map(str::to_string).collect();
            if lines.len() >= expected {
                return lines;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("worker did not receive {expected} commands");
}

fn worker_params(template_id: &str, instance_id: &str) -> HashMap<String, String> {
    HashMap::from([
        (params::TEMPLATE_ID_PARAM.to_string(), template_id.to_string()),
        (params::INSTANCE_ID_PARAM.to_string(), instance_id.to_string()),
    ])
}

#[tokio::test]
async fn reusable_worker_full_lifecycle() {
    let dir = TempDir::new().unwrap();
    let source = write_template(dir.path());
    let client = client(
        dir.path(),
        &format!(
            "build1@{}\n@@build1:reuse\n@@build1:prop:env.POOL=fast",
            source.display()
        ),
    );
    let template = client.templates()[0].clone();

    let request = ProvisionRequest::new("img-build1-1", "http://localhost:8111")
        .with_auth_token("token-1");
    let instance = client
        .start_new_instance(template.id(), request)
        .await
        .unwrap();
    assert_eq!(instance.status(), InstanceStatus::Starting);
    assert!(instance.error_info().is_none());

    // Staged files and rewritten configuration
    let staging = instance.staging_dir().to_path_buf();
    assert!(staging.join("bin").join("agent.sh").is_file());
    assert!(!staging.join("work").exists());
    let config = std::fs::read_to_string(staging.join("conf").join("buildAgent.properties")).unwrap();
    assert!(config.starts_with("# distributed defaults\n"));
    assert!(config.contains("name=img-build1-1\n"));
    assert!(config.contains("ownPort=9090\n"));
    assert!(config.contains("authorizationToken=token-1\n"));
    assert!(config.contains("env.POOL=fast\n"));
    assert!(config.contains("workDir=../work\n"));
    assert!(config.contains(&format!("cloud.local.image.id={}\n", template.id())));
    assert!(config.contains(&format!("cloud.local.instance.id={}\n", instance.id())));

    assert_eq!(wait_for_commands(&staging, 1).await, ["start"]);

    // The worker registers
    let params = worker_params(template.id().as_str(), instance.id().as_str());
    assert_eq!(
        client.on_worker_registration(&params, true),
        Some(InstanceStatus::Running)
    );

    // Restart: stop, then start again
    client
        .restart_instance(template.id(), instance.id())
        .await
        .unwrap();
    assert_eq!(
        wait_for_commands(&staging, 3).await,
        ["start", "stop force", "start"]
    );
    client.on_worker_registration(&params, true);

    // Terminate while the worker unregisters concurrently
    let terminating = {
        let instance = instance.clone();
        tokio::spawn(async move { instance.terminate().await })
    };
    let mut rx = instance.subscribe();
    rx.wait_for(|s| *s == InstanceStatus::Stopping).await.unwrap();
    client.on_worker_registration(&params, false);
    terminating.await.unwrap();

    assert_eq!(instance.status(), InstanceStatus::Stopped);
    assert!(!staging.exists());

    // Stopped reusable instance is handed out again
    let again = client
        .start_new_instance(
            template.id(),
            ProvisionRequest::new("img-build1-1", "http://localhost:8111"),
        )
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&instance, &again));
    assert_eq!(wait_for_commands(&staging, 1).await, ["start"]);

    client.dispose().await;
    assert!(template.instances().is_empty());
}

#[tokio::test]
async fn one_shot_worker_is_torn_down_after_exit() {
    let dir = TempDir::new().unwrap();
    let source = write_template(dir.path());
    let client = client(dir.path(), &format!("once@{}", source.display()));
    let template = client.templates()[0].clone();

    let instance = client
        .start_new_instance(
            template.id(),
            ProvisionRequest::new("img-once-1", "http://localhost:8111"),
        )
        .await
        .unwrap();
    let staging = instance.staging_dir().to_path_buf();
    wait_for_commands(&staging, 1).await;

    let params = worker_params(template.id().as_str(), instance.id().as_str());
    assert_eq!(
        client.generate_agent_name(&params).as_deref(),
        Some("img-once-1")
    );
    client.on_worker_registration(&params, true);
    client.on_worker_registration(&params, false);

    for _ in 0..100 {
        if template.find_instance_by_id(instance.id()).is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(template.find_instance_by_id(instance.id()).is_none());
    assert!(!staging.exists());

    let next = client
        .start_new_instance(
            template.id(),
            ProvisionRequest::new("img-once-2", "http://localhost:8111"),
        )
        .await
        .unwrap();
    assert_ne!(next.id(), instance.id());

    client.dispose().await;
}

#[tokio::test]
async fn non_executable_entry_point_errors_instance() {
    let dir = TempDir::new().unwrap();
    let source = write_template(dir.path());
    std::fs::set_permissions(
        source.join("bin").join("agent.sh"),
        std::fs::Permissions::from_mode(0o644),
    )
    .unwrap();
    let client = client(dir.path(), &format!("broken@{}", source.display()));
    let template = client.templates()[0].clone();

    let instance = client
        .start_new_instance(
            template.id(),
            ProvisionRequest::new("img-broken-1", "http://localhost:8111"),
        )
        .await
        .unwrap();

    assert_eq!(instance.status(), InstanceStatus::Error);
    let error = instance.error_info().unwrap();
    assert!(error.message.contains("failed to launch"));

    // Errored instance still releases its directory
    client
        .terminate_instance(template.id(), instance.id())
        .await
        .unwrap();
    assert!(!instance.staging_dir().exists());

    client.dispose().await;
}
