//! Tunnel error types

use gcpvm_gateway::{CloudApiError, PowerState};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("VM '{vm}' is {state}; tunnels can only be opened to a RUNNING VM")]
    Precondition { vm: String, state: PowerState },

    #[error("Local port {port} is already used by another tunnel")]
    PortInUse { port: u16 },

    #[error("Invalid port {0}: expected 1-65535")]
    InvalidPort(u16),

    #[error("Tunnel could not be established: {cause}")]
    Establish { cause: String },

    #[error("Tunnel process exited unexpectedly ({status})")]
    Died { status: String },

    #[error("Tunnel was closed before it became active")]
    Cancelled,

    #[error("No tunnel with id {0}")]
    NotFound(Uuid),

    #[error(transparent)]
    Cloud(#[from] CloudApiError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
