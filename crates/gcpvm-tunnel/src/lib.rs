//! IAP tunnel lifecycle management
//!
//! Each tunnel forwards a local port to a port on a VM through
//! `gcloud compute start-iap-tunnel`. Tunnels run as independent supervised
//! tasks moving through:
//!
//! ```text
//! Idle -> Establishing -> Active -> Closing -> Closed
//!              |             |
//!              +-> Error <---+
//! ```
//!
//! The only state shared between tunnels is the [`PortRegistry`], which keeps
//! two tunnels of this process from claiming the same local port.

pub mod error;
pub mod iap;
pub mod manager;
pub mod port;
pub mod process;
pub mod state;

pub use error::TunnelError;
pub use iap::IapTunnelLauncher;
pub use manager::{TunnelConfig, TunnelHandle, TunnelManager};
pub use port::{PortLease, PortRegistry};
pub use process::{TunnelLauncher, TunnelProcess, TunnelSpec};
pub use state::{TunnelInfo, TunnelState, TunnelTarget};
