//! Types exchanged with the gateway

use serde::{Deserialize, Serialize};
use std::fmt;

/// VM power state as reported by Compute Engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PowerState {
    Running,
    Stopped,
    Terminated,
    Unknown,
}

impl PowerState {
    /// Map a raw Compute Engine status string
    ///
    /// Transitional states (`STAGING`, `STOPPING`, `SUSPENDED`, ...) are not
    /// actionable from the menus and collapse into `Unknown`.
    pub fn from_api(status: &str) -> Self {
        match status.trim().to_ascii_uppercase().as_str() {
            "RUNNING" => PowerState::Running,
            "STOPPED" => PowerState::Stopped,
            "TERMINATED" => PowerState::Terminated,
            _ => PowerState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PowerState::Running => "RUNNING",
            PowerState::Stopped => "STOPPED",
            PowerState::Terminated => "TERMINATED",
            PowerState::Unknown => "UNKNOWN",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, PowerState::Running)
    }

    pub fn is_down(&self) -> bool {
        matches!(self, PowerState::Stopped | PowerState::Terminated)
    }

    /// Whether `action` makes sense in this state
    pub fn allows(&self, action: VmAction) -> bool {
        match action {
            VmAction::Start => self.is_down(),
            VmAction::Stop | VmAction::Reset => self.is_running(),
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live VM state, fetched on demand and never persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmStatus {
    pub name: String,
    pub zone: String,
    pub state: PowerState,
    pub machine_type: Option<String>,
    pub internal_ip: Option<String>,
    pub external_ip: Option<String>,
}

impl VmStatus {
    pub fn new(name: impl Into<String>, zone: impl Into<String>, state: PowerState) -> Self {
        Self {
            name: name.into(),
            zone: zone.into(),
            state,
            machine_type: None,
            internal_ip: None,
            external_ip: None,
        }
    }

    pub fn region(&self) -> &str {
        zone_to_region(&self.zone)
    }
}

/// Power operations on a VM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmAction {
    Start,
    Stop,
    Reset,
}

impl VmAction {
    /// The `gcloud compute instances` verb
    pub fn verb(&self) -> &'static str {
        match self {
            VmAction::Start => "start",
            VmAction::Stop => "stop",
            VmAction::Reset => "reset",
        }
    }
}

impl fmt::Display for VmAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

/// A Cloud Run service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudRunService {
    pub name: String,
    pub region: String,
    pub url: Option<String>,
    pub ready: bool,
    pub latest_ready_revision: Option<String>,
}

/// A Cloud Run revision of one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudRunRevision {
    pub name: String,
    pub ready: bool,
    pub created_at: Option<String>,
    /// Share of traffic currently routed to this revision
    pub traffic_percent: Option<u32>,
}

/// Deploy a container image as a new revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployRequest {
    pub service: String,
    pub region: String,
    pub image: String,
}

/// Where to read logs from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSource {
    /// Serial port output of a VM
    Vm { name: String, zone: String },
    /// Cloud Logging entries of a Cloud Run service
    Service { name: String, region: String },
}

impl LogSource {
    pub fn name(&self) -> &str {
        match self {
            LogSource::Vm { name, .. } | LogSource::Service { name, .. } => name,
        }
    }
}

/// Region of a zone: `us-central1-a` -> `us-central1`
///
/// Strings without a zone suffix are returned unchanged.
pub fn zone_to_region(zone: &str) -> &str {
    match zone.rsplit_once('-') {
        Some((region, suffix))
            if suffix.len() == 1 && suffix.chars().all(|c| c.is_ascii_lowercase()) =>
        {
            region
        }
        _ => zone,
    }
}
