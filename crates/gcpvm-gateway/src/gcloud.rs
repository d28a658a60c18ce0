//! `gcloud` CLI implementation of the gateway

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{CloudApiError, CloudErrorCode};
use crate::gateway::{CloudGateway, LogStream};
use crate::model::{
    CloudRunRevision, CloudRunService, DeployRequest, LogSource, PowerState, VmAction, VmStatus,
};

/// Label carrying the region of a Cloud Run service
const LOCATION_LABEL: &str = "cloud.googleapis.com/location";

/// Number of Cloud Logging entries fetched per request
const SERVICE_LOG_LIMIT: u32 = 100;

/// Gateway that runs the `gcloud` CLI
#[derive(Debug, Clone)]
pub struct GcloudGateway {
    binary: PathBuf,
}

impl GcloudGateway {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn command(&self, args: &[String]) -> Command {
        debug!(command = %format!("{} {}", self.binary.display(), args.join(" ")), "Running gcloud");
        let mut cmd = Command::new(&self.binary);
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    /// Run to completion and return stdout
    async fn run(&self, args: Vec<String>) -> Result<String, CloudApiError> {
        let output = self
            .command(&args)
            .output()
            .await
            .map_err(|e| CloudApiError::from_spawn(&self.binary.display().to_string(), e))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let err = CloudApiError::from_stderr(&stderr);
            debug!(code = %err.code, status = ?output.status.code(), "gcloud failed");
            Err(err)
        }
    }

    async fn run_json<T: DeserializeOwned>(&self, args: Vec<String>) -> Result<T, CloudApiError> {
        let stdout = self.run(args).await?;
        parse_json(&stdout)
    }

    /// Spawn a command whose stdout is consumed line by line
    fn spawn_lines(&self, args: Vec<String>) -> Result<LogStream, CloudApiError> {
        let mut child = self
            .command(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CloudApiError::from_spawn(&self.binary.display().to_string(), e))?;

        let stdout = child.stdout.take().ok_or_else(|| {
            CloudApiError::new(CloudErrorCode::Unknown, "gcloud stdout was not captured")
        })?;
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut text = String::new();
                let _ = stderr.read_to_string(&mut text).await;
                text
            })
        });

        let state = LineReader {
            reader: BufReader::new(stdout),
            buf: Vec::new(),
            child,
            stderr_task,
            finished: false,
        };

        Ok(stream::unfold(state, LineReader::next).boxed())
    }
}

impl Default for GcloudGateway {
    fn default() -> Self {
        Self::new(crate::DEFAULT_GCLOUD)
    }
}

/// State of a streaming `gcloud` invocation
struct LineReader {
    reader: BufReader<ChildStdout>,
    buf: Vec<u8>,
    child: Child,
    stderr_task: Option<JoinHandle<String>>,
    finished: bool,
}

impl LineReader {
    async fn next(mut self) -> Option<(Result<String, CloudApiError>, Self)> {
        if self.finished {
            return None;
        }

        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf).await {
            Ok(n) if n > 0 => {
                // Serial consoles emit arbitrary bytes; keep the line readable
                let line = String::from_utf8_lossy(&self.buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                Some((Ok(line), self))
            }
            Ok(_) => {
                self.finished = true;
                let status = self.child.wait().await;
                let stderr = match self.stderr_task.take() {
                    Some(task) => task.await.unwrap_or_default(),
                    None => String::new(),
                };
                match status {
                    Ok(status) if status.success() => None,
                    Ok(_) => Some((Err(CloudApiError::from_stderr(&stderr)), self)),
                    Err(e) => Some((
                        Err(CloudApiError::new(CloudErrorCode::Unknown, e.to_string())),
                        self,
                    )),
                }
            }
            Err(e) => {
                self.finished = true;
                warn!(error = %e, "Failed to read gcloud output");
                let _ = self.child.start_kill();
                Some((
                    Err(CloudApiError::new(CloudErrorCode::Unknown, e.to_string())),
                    self,
                ))
            }
        }
    }
}

fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

fn parse_json<T: DeserializeOwned>(stdout: &str) -> Result<T, CloudApiError> {
    // Empty output from a list command means an empty list
    let text = if stdout.trim().is_empty() { "[]" } else { stdout };
    serde_json::from_str(text).map_err(|e| {
        CloudApiError::new(
            CloudErrorCode::InvalidResponse,
            format!("Failed to parse gcloud output: {}", e),
        )
    })
}

/// Last path segment of a resource URL
fn last_segment(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

// Raw gcloud JSON shapes, limited to the fields we read

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInstance {
    name: String,
    #[serde(default)]
    zone: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    machine_type: Option<String>,
    #[serde(default)]
    network_interfaces: Vec<RawNetworkInterface>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawNetworkInterface {
    #[serde(default, rename = "networkIP")]
    network_ip: Option<String>,
    #[serde(default)]
    access_configs: Vec<RawAccessConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAccessConfig {
    #[serde(default, rename = "natIP")]
    nat_ip: Option<String>,
}

impl From<RawInstance> for VmStatus {
    fn from(raw: RawInstance) -> Self {
        let nic = raw.network_interfaces.first();
        VmStatus {
            zone: last_segment(&raw.zone).to_string(),
            state: PowerState::from_api(&raw.status),
            machine_type: raw.machine_type.as_deref().map(|m| last_segment(m).to_string()),
            internal_ip: nic.and_then(|n| n.network_ip.clone()),
            external_ip: nic
                .and_then(|n| n.access_configs.iter().find_map(|a| a.nat_ip.clone())),
            name: raw.name,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMetadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    labels: std::collections::HashMap<String, String>,
    #[serde(default)]
    creation_timestamp: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCondition {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTraffic {
    #[serde(default)]
    revision_name: Option<String>,
    #[serde(default)]
    percent: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStatus {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    conditions: Vec<RawCondition>,
    #[serde(default)]
    latest_ready_revision_name: Option<String>,
    #[serde(default)]
    traffic: Vec<RawTraffic>,
}

impl RawStatus {
    /// `Ready` condition, falling back to the first condition listed
    fn is_ready(&self) -> bool {
        self.conditions
            .iter()
            .find(|c| c.kind == "Ready")
            .or_else(|| self.conditions.first())
            .map(|c| c.status == "True")
            .unwrap_or(false)
    }
}

#[derive(Debug, Deserialize)]
struct RawResource {
    #[serde(default)]
    metadata: RawMetadata,
    #[serde(default)]
    status: RawStatus,
}

impl RawResource {
    fn into_service(self, fallback_region: Option<&str>) -> CloudRunService {
        let region = self
            .metadata
            .labels
            .get(LOCATION_LABEL)
            .cloned()
            .or_else(|| fallback_region.map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        CloudRunService {
            ready: self.status.is_ready(),
            name: self.metadata.name,
            region,
            url: self.status.url,
            latest_ready_revision: self.status.latest_ready_revision_name,
        }
    }

    fn into_revision(self) -> CloudRunRevision {
        CloudRunRevision {
            ready: self.status.is_ready(),
            name: self.metadata.name,
            created_at: self.metadata.creation_timestamp,
            traffic_percent: None,
        }
    }
}

#[async_trait]
impl CloudGateway for GcloudGateway {
    async fn list_vms(&self, project: &str) -> Result<Vec<VmStatus>, CloudApiError> {
        let raw: Vec<RawInstance> = self
            .run_json(args([
                "compute",
                "instances",
                "list",
                "--project",
                project,
                "--format=json",
            ]))
            .await?;

        let mut vms: Vec<VmStatus> = raw.into_iter().map(VmStatus::from).collect();
        vms.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(vms)
    }

    async fn vm_status(
        &self,
        project: &str,
        vm: &str,
        zone: &str,
    ) -> Result<VmStatus, CloudApiError> {
        let raw: RawInstance = self
            .run_json(args([
                "compute",
                "instances",
                "describe",
                vm,
                "--project",
                project,
                "--zone",
                zone,
                "--format=json",
            ]))
            .await?;
        Ok(raw.into())
    }

    async fn vm_action(
        &self,
        project: &str,
        vm: &str,
        zone: &str,
        action: VmAction,
    ) -> Result<(), CloudApiError> {
        self.run(args([
            "compute",
            "instances",
            action.verb(),
            vm,
            "--project",
            project,
            "--zone",
            zone,
            "--quiet",
        ]))
        .await
        .map(|_| ())
    }

    async fn describe_vm(
        &self,
        project: &str,
        vm: &str,
        zone: &str,
    ) -> Result<serde_json::Value, CloudApiError> {
        self.run_json(args([
            "compute",
            "instances",
            "describe",
            vm,
            "--project",
            project,
            "--zone",
            zone,
            "--format=json",
        ]))
        .await
    }

    async fn fetch_logs(
        &self,
        project: &str,
        source: LogSource,
    ) -> Result<LogStream, CloudApiError> {
        let command = match &source {
            LogSource::Vm { name, zone } => args([
                "compute",
                "instances",
                "get-serial-port-output",
                name.as_str(),
                "--project",
                project,
                "--zone",
                zone.as_str(),
            ]),
            LogSource::Service { name, region } => vec![
                "logging".to_string(),
                "read".to_string(),
                format!(
                    "resource.type=cloud_run_revision AND resource.labels.service_name={} AND resource.labels.location={}",
                    name, region
                ),
                format!("--project={}", project),
                format!("--limit={}", SERVICE_LOG_LIMIT),
                "--format=value(timestamp,severity,textPayload)".to_string(),
            ],
        };
        self.spawn_lines(command)
    }

    async fn list_cloud_run_services(
        &self,
        project: &str,
    ) -> Result<Vec<CloudRunService>, CloudApiError> {
        let raw: Vec<RawResource> = self
            .run_json(args([
                "run",
                "services",
                "list",
                "--project",
                project,
                "--format=json",
            ]))
            .await?;

        let mut services: Vec<CloudRunService> =
            raw.into_iter().map(|r| r.into_service(None)).collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(services)
    }

    async fn describe_service(
        &self,
        project: &str,
        service: &str,
        region: &str,
    ) -> Result<serde_json::Value, CloudApiError> {
        self.run_json(args([
            "run",
            "services",
            "describe",
            service,
            "--project",
            project,
            "--region",
            region,
            "--format=json",
        ]))
        .await
    }

    async fn list_revisions(
        &self,
        project: &str,
        service: &str,
        region: &str,
    ) -> Result<Vec<CloudRunRevision>, CloudApiError> {
        let raw: Vec<RawResource> = self
            .run_json(args([
                "run",
                "revisions",
                "list",
                "--service",
                service,
                "--project",
                project,
                "--region",
                region,
                "--format=json",
            ]))
            .await?;
        let mut revisions: Vec<CloudRunRevision> =
            raw.into_iter().map(RawResource::into_revision).collect();

        // Traffic split lives on the service resource
        let described: RawResource = self
            .run_json(args([
                "run",
                "services",
                "describe",
                service,
                "--project",
                project,
                "--region",
                region,
                "--format=json",
            ]))
            .await?;
        apply_traffic(&mut revisions, &described.status.traffic);

        revisions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(revisions)
    }

    async fn deploy_revision(
        &self,
        project: &str,
        request: DeployRequest,
    ) -> Result<(), CloudApiError> {
        self.run(args([
            "run",
            "deploy",
            request.service.as_str(),
            "--image",
            request.image.as_str(),
            "--project",
            project,
            "--region",
            request.region.as_str(),
            "--quiet",
        ]))
        .await
        .map(|_| ())
    }

    async fn rollback(
        &self,
        project: &str,
        service: &str,
        region: &str,
        revision: &str,
    ) -> Result<(), CloudApiError> {
        self.run(vec![
            "run".to_string(),
            "services".to_string(),
            "update-traffic".to_string(),
            service.to_string(),
            format!("--to-revisions={}=100", revision),
            "--project".to_string(),
            project.to_string(),
            "--region".to_string(),
            region.to_string(),
            "--quiet".to_string(),
        ])
        .await
        .map(|_| ())
    }
}

fn apply_traffic(revisions: &mut [CloudRunRevision], traffic: &[RawTraffic]) {
    for revision in revisions.iter_mut() {
        let percent: u32 = traffic
            .iter()
            .filter(|t| t.revision_name.as_deref() == Some(revision.name.as_str()))
            .filter_map(|t| t.percent)
            .sum();
        if percent > 0 {
            revision.traffic_percent = Some(percent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSTANCES: &str = r#"[
        {
            "name": "web-1",
            "zone": "https://www.googleapis.com/compute/v1/projects/demo/zones/us-central1-a",
            "status": "RUNNING",
            "machineType": "https://www.googleapis.com/compute/v1/projects/demo/zones/us-central1-a/machineTypes/e2-medium",
            "networkInterfaces": [
                { "networkIP": "10.128.0.2", "accessConfigs": [{ "natIP": "34.1.2.3" }] }
            ]
        },
        {
            "name": "batch-1",
            "zone": "https://www.googleapis.com/compute/v1/projects/demo/zones/europe-west1-b",
            "status": "STOPPING"
        }
    ]"#;

    const SERVICES: &str = r#"[
        {
            "metadata": {
                "name": "api",
                "labels": { "cloud.googleapis.com/location": "us-central1" }
            },
            "status": {
                "url": "https://api-xyz-uc.a.run.app",
                "latestReadyRevisionName": "api-00002-abc",
                "conditions": [
                    { "type": "ConfigurationsReady", "status": "True" },
                    { "type": "Ready", "status": "False" }
                ]
            }
        }
    ]"#;

    #[test]
    fn test_parse_instances() {
        let raw: Vec<RawInstance> = parse_json(INSTANCES).unwrap();
        let vms: Vec<VmStatus> = raw.into_iter().map(VmStatus::from).collect();

        assert_eq!(vms[0].name, "web-1");
        assert_eq!(vms[0].zone, "us-central1-a");
        assert_eq!(vms[0].state, PowerState::Running);
        assert_eq!(vms[0].machine_type.as_deref(), Some("e2-medium"));
        assert_eq!(vms[0].internal_ip.as_deref(), Some("10.128.0.2"));
        assert_eq!(vms[0].external_ip.as_deref(), Some("34.1.2.3"));

        assert_eq!(vms[1].zone, "europe-west1-b");
        assert_eq!(vms[1].state, PowerState::Unknown);
        assert_eq!(vms[1].internal_ip, None);
    }

    #[test]
    fn test_parse_services_uses_ready_condition() {
        let raw: Vec<RawResource> = parse_json(SERVICES).unwrap();
        let service = raw.into_iter().next().unwrap().into_service(None);

        assert_eq!(service.name, "api");
        assert_eq!(service.region, "us-central1");
        assert!(!service.ready);
        assert_eq!(service.latest_ready_revision.as_deref(), Some("api-00002-abc"));
    }

    #[test]
    fn test_empty_output_is_empty_list() {
        let raw: Vec<RawInstance> = parse_json("  \n").unwrap();
        assert!(raw.is_empty());
    }

    #[test]
    fn test_garbage_is_invalid_response() {
        let err = parse_json::<Vec<RawInstance>>("Listed 0 items.").unwrap_err();
        assert_eq!(err.code, CloudErrorCode::InvalidResponse);
    }

    #[test]
    fn test_apply_traffic() {
        let mut revisions = vec![
            CloudRunRevision {
                name: "api-00002".to_string(),
                ready: true,
                created_at: None,
                traffic_percent: None,
            },
            CloudRunRevision {
                name: "api-00001".to_string(),
                ready: true,
                created_at: None,
                traffic_percent: None,
            },
        ];
        let traffic = vec![
            RawTraffic {
                revision_name: Some("api-00002".to_string()),
                percent: Some(90),
            },
            RawTraffic {
                revision_name: Some("api-00001".to_string()),
                percent: Some(10),
            },
        ];

        apply_traffic(&mut revisions, &traffic);
        assert_eq!(revisions[0].traffic_percent, Some(90));
        assert_eq!(revisions[1].traffic_percent, Some(10));
    }
}
