use std::time::Duration;

use gcpvm_tunnel::TunnelConfig;

/// Default bound on gateway reads
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Runtime settings of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Upper bound for each live-state read (listings, status, describe),
    /// including the status check made before a tunnel is opened
    pub timeout: Duration,
    /// Show extra diagnostics in the menus
    pub debug: bool,
    pub tunnel: TunnelConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            debug: false,
            tunnel: TunnelConfig::default(),
        }
    }
}
