//! The cloud operations trait consumed by the session and tunnel layers

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::CloudApiError;
use crate::model::{
    CloudRunRevision, CloudRunService, DeployRequest, LogSource, VmAction, VmStatus,
};

/// Lazily produced log lines
///
/// Dropping the stream stops the underlying reader.
pub type LogStream = BoxStream<'static, Result<String, CloudApiError>>;

/// Abstract boundary for every cloud provider operation
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait CloudGateway: Send + Sync {
    /// All VMs of a project with their current state
    async fn list_vms(&self, project: &str) -> Result<Vec<VmStatus>, CloudApiError>;

    /// Current state of a single VM
    async fn vm_status(
        &self,
        project: &str,
        vm: &str,
        zone: &str,
    ) -> Result<VmStatus, CloudApiError>;

    /// Start, stop or reset a VM and wait for the operation to finish
    async fn vm_action(
        &self,
        project: &str,
        vm: &str,
        zone: &str,
        action: VmAction,
    ) -> Result<(), CloudApiError>;

    /// Full instance resource as returned by the API
    async fn describe_vm(
        &self,
        project: &str,
        vm: &str,
        zone: &str,
    ) -> Result<serde_json::Value, CloudApiError>;

    /// Stream log lines of a VM or Cloud Run service
    async fn fetch_logs(
        &self,
        project: &str,
        source: LogSource,
    ) -> Result<LogStream, CloudApiError>;

    async fn list_cloud_run_services(
        &self,
        project: &str,
    ) -> Result<Vec<CloudRunService>, CloudApiError>;

    /// Full service resource as returned by the API
    async fn describe_service(
        &self,
        project: &str,
        service: &str,
        region: &str,
    ) -> Result<serde_json::Value, CloudApiError>;

    /// Revisions of a service, newest first
    async fn list_revisions(
        &self,
        project: &str,
        service: &str,
        region: &str,
    ) -> Result<Vec<CloudRunRevision>, CloudApiError>;

    /// Deploy an image as a new revision receiving all traffic
    async fn deploy_revision(
        &self,
        project: &str,
        request: DeployRequest,
    ) -> Result<(), CloudApiError>;

    /// Route all traffic of a service back to `revision`
    async fn rollback(
        &self,
        project: &str,
        service: &str,
        region: &str,
        revision: &str,
    ) -> Result<(), CloudApiError>;
}
