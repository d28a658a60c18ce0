use std::fmt;

use gcpvm_gateway::{CloudRunService, LogSource};
use gcpvm_tunnel::TunnelTarget;

/// What a project was picked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Vms,
    CloudRun,
}

/// The VM a menu operates on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRef {
    pub name: String,
    pub zone: String,
}

impl fmt::Display for VmRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.zone)
    }
}

/// Long-running foreground work, ended by completion or interrupt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activity {
    PortForward {
        target: TunnelTarget,
        remote_port: u16,
        local_port: u16,
    },
    Logs {
        project: String,
        source: LogSource,
    },
}

/// Screens of the menu state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    MainMenu,
    ProjectMenu {
        purpose: Purpose,
    },
    VmList {
        project: String,
    },
    VmActionMenu {
        project: String,
        vm: VmRef,
    },
    CloudRunList {
        project: String,
    },
    CloudRunActionMenu {
        project: String,
        service: CloudRunService,
    },
    ProjectAdmin,
    TunnelList,
    Running {
        activity: Activity,
        resume: Box<SessionState>,
    },
}

impl SessionState {
    pub fn running(activity: Activity, resume: SessionState) -> Self {
        SessionState::Running {
            activity,
            resume: Box::new(resume),
        }
    }
}
