//! Cloud operations gateway
//!
//! Everything the rest of the workspace needs from Google Cloud goes through
//! the [`CloudGateway`] and [`RemoteShell`] traits. The production
//! implementations shell out to the `gcloud` CLI and rely on its ambient
//! authentication; credentials are never read here.

pub mod error;
pub mod exec;
pub mod gateway;
pub mod gcloud;
pub mod model;

pub use error::{CloudApiError, CloudErrorCode};
pub use exec::{
    CommandOutput, ExecError, GcloudShell, RemoteCommandError, RemoteInvocation, RemoteKind,
    RemoteShell,
};
pub use gateway::{CloudGateway, LogStream};
pub use gcloud::GcloudGateway;
pub use model::{
    zone_to_region, CloudRunRevision, CloudRunService, DeployRequest, LogSource, PowerState,
    VmAction, VmStatus,
};

#[cfg(any(test, feature = "mock"))]
pub use exec::MockRemoteShell;
#[cfg(any(test, feature = "mock"))]
pub use gateway::MockCloudGateway;

/// Default `gcloud` executable, overridable through `GCPVM_GCLOUD`
pub const DEFAULT_GCLOUD: &str = "gcloud";
