//! Abstraction over the process carrying a tunnel

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::TunnelError;
use crate::state::TunnelTarget;

/// Everything needed to start one tunnel process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub id: Uuid,
    pub target: TunnelTarget,
    pub remote_port: u16,
    pub local_port: u16,
}

/// Starts tunnel processes
#[async_trait]
pub trait TunnelLauncher: Send + Sync {
    async fn launch(&self, spec: &TunnelSpec) -> Result<Box<dyn TunnelProcess>, TunnelError>;
}

/// A running tunnel process
///
/// `wait_ready` and `wait_exit` must be cancel safe: the supervisor drops
/// them when a close is requested and then calls `terminate`.
#[async_trait]
pub trait TunnelProcess: Send {
    /// Resolve once the process accepts connections on the local port
    ///
    /// Returns the failure cause when the process exits first.
    async fn wait_ready(&mut self) -> Result<(), String>;

    /// Resolve when the process has exited, with its exit code if any
    async fn wait_exit(&mut self) -> std::io::Result<Option<i32>>;

    /// Ask the process to stop
    fn terminate(&mut self) -> std::io::Result<()>;

    /// Stop the process immediately
    fn kill(&mut self) -> std::io::Result<()>;
}
