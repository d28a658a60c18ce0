//! Drive `GcloudGateway` against a scripted stand-in for the `gcloud` binary

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use futures::StreamExt;
use gcpvm_gateway::{
    CloudErrorCode, CloudGateway, GcloudGateway, LogSource, PowerState, VmAction,
};
use tempfile::TempDir;

const FAKE_GCLOUD: &str = r#"#!/bin/sh
case "$1 $2 $3" in
  "compute instances list")
    cat <<'EOF'
[
  {"name": "worker-2", "zone": "projects/demo/zones/us-east1-b", "status": "TERMINATED"},
  {"name": "api-1", "zone": "projects/demo/zones/us-central1-a", "status": "RUNNING",
   "networkInterfaces": [{"networkIP": "10.0.0.7", "accessConfigs": []}]}
]
EOF
    ;;
  "compute instances start")
    exit 0
    ;;
  "compute instances get-serial-port-output")
    echo "boot: starting"
    echo "boot: ready"
    ;;
  "logging read resource.type=cloud_run_revision AND resource.labels.service_name=api AND resource.labels.location=us-central1")
    echo "2024-01-01T00:00:00Z INFO hello"
    echo "ERROR: (gcloud.logging.read) PERMISSION_DENIED: denied" >&2
    exit 1
    ;;
  *)
    echo "ERROR: (gcloud) The resource 'projects/demo/zones/x/instances/missing' was not found" >&2
    exit 1
    ;;
esac
"#;

fn fake_gcloud(dir: &TempDir) -> PathBuf {
    write_script(dir, FAKE_GCLOUD)
}

fn write_script(dir: &TempDir, script: &str) -> PathBuf {
    let path = dir.path().join("gcloud");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[tokio::test]
async fn test_list_vms_parses_and_sorts() {
    let dir = TempDir::new().unwrap();
    let gateway = GcloudGateway::new(fake_gcloud(&dir));

    let vms = gateway.list_vms("demo").await.unwrap();
    assert_eq!(vms.len(), 2);
    assert_eq!(vms[0].name, "api-1");
    assert_eq!(vms[0].zone, "us-central1-a");
    assert_eq!(vms[0].state, PowerState::Running);
    assert_eq!(vms[0].internal_ip.as_deref(), Some("10.0.0.7"));
    assert_eq!(vms[0].external_ip, None);
    assert_eq!(vms[1].name, "worker-2");
    assert_eq!(vms[1].state, PowerState::Terminated);
}

#[tokio::test]
async fn test_vm_action_and_not_found() {
    let dir = TempDir::new().unwrap();
    let gateway = GcloudGateway::new(fake_gcloud(&dir));

    gateway
        .vm_action("demo", "worker-2", "us-east1-b", VmAction::Start)
        .await
        .unwrap();

    let err = gateway
        .vm_status("demo", "missing", "us-east1-b")
        .await
        .unwrap_err();
    assert_eq!(err.code, CloudErrorCode::NotFound);
}

#[tokio::test]
async fn test_log_streams() {
    let dir = TempDir::new().unwrap();
    let gateway = GcloudGateway::new(fake_gcloud(&dir));

    let vm_logs: Vec<_> = gateway
        .fetch_logs(
            "demo",
            LogSource::Vm {
                name: "api-1".to_string(),
                zone: "us-central1-a".to_string(),
            },
        )
        .await
        .unwrap()
        .collect()
        .await;
    let lines: Vec<String> = vm_logs.into_iter().map(Result::unwrap).collect();
    assert_eq!(lines, vec!["boot: starting", "boot: ready"]);

    // Lines already produced are delivered before the failure
    let service_logs: Vec<_> = gateway
        .fetch_logs(
            "demo",
            LogSource::Service {
                name: "api".to_string(),
                region: "us-central1".to_string(),
            },
        )
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(service_logs.len(), 2);
    assert_eq!(
        service_logs[0].as_deref().unwrap(),
        "2024-01-01T00:00:00Z INFO hello"
    );
    assert_eq!(
        service_logs[1].as_ref().unwrap_err().code,
        CloudErrorCode::PermissionDenied
    );
}

#[tokio::test]
async fn test_serial_output_with_invalid_utf8() {
    let dir = TempDir::new().unwrap();
    let script = "#!/bin/sh\nprintf 'boot ok\\n\\377\\376 garbage\\r\\nafter\\n'\n";
    let gateway = GcloudGateway::new(write_script(&dir, script));

    let items: Vec<_> = gateway
        .fetch_logs(
            "demo",
            LogSource::Vm {
                name: "api-1".to_string(),
                zone: "us-central1-a".to_string(),
            },
        )
        .await
        .unwrap()
        .collect()
        .await;

    let lines: Vec<String> = items.into_iter().map(Result::unwrap).collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "boot ok");
    assert_eq!(lines[1], "\u{FFFD}\u{FFFD} garbage");
    assert_eq!(lines[2], "after");
}

#[tokio::test]
async fn test_missing_binary() {
    let gateway = GcloudGateway::new("/nonexistent/gcloud-for-tests");
    let err = gateway.list_vms("demo").await.unwrap_err();
    assert_eq!(err.code, CloudErrorCode::ToolUnavailable);
}
