use std::fmt;

use uuid::Uuid;

/// Lifecycle state of a tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    Idle,
    Establishing,
    Active,
    Closing,
    Closed,
    /// Terminal failure with its cause
    Error(String),
}

impl TunnelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelState::Idle => "idle",
            TunnelState::Establishing => "establishing",
            TunnelState::Active => "active",
            TunnelState::Closing => "closing",
            TunnelState::Closed => "closed",
            TunnelState::Error(_) => "error",
        }
    }

    /// `Closed` or `Error`: the process is gone and the port released
    pub fn is_finished(&self) -> bool {
        matches!(self, TunnelState::Closed | TunnelState::Error(_))
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelState::Error(cause) => write!(f, "error: {}", cause),
            other => f.write_str(other.as_str()),
        }
    }
}

/// The VM a tunnel points at
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelTarget {
    pub project: String,
    pub vm: String,
    pub zone: String,
}

impl TunnelTarget {
    pub fn new(project: impl Into<String>, vm: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            vm: vm.into(),
            zone: zone.into(),
        }
    }
}

impl fmt::Display for TunnelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.project, self.vm, self.zone)
    }
}

/// Point-in-time view of a managed tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInfo {
    pub id: Uuid,
    pub target: TunnelTarget,
    pub remote_port: u16,
    pub local_port: u16,
    pub state: TunnelState,
}
