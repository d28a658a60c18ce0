//! Local port bookkeeping shared by all tunnels of the process

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;
use uuid::Uuid;

use crate::error::TunnelError;

/// Local ports currently held by tunnels
#[derive(Debug, Clone, Default)]
pub struct PortRegistry {
    held: Arc<Mutex<HashMap<u16, Uuid>>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `port` for `owner`
    ///
    /// The port stays reserved until the returned lease is dropped.
    pub fn reserve(&self, port: u16, owner: Uuid) -> Result<PortLease, TunnelError> {
        if port == 0 {
            return Err(TunnelError::InvalidPort(port));
        }

        let mut held = self.lock();
        if held.contains_key(&port) {
            return Err(TunnelError::PortInUse { port });
        }
        held.insert(port, owner);
        debug!(port, tunnel_id = %owner, "Reserved local port");

        Ok(PortLease {
            port,
            owner,
            registry: self.clone(),
        })
    }

    pub fn is_held(&self, port: u16) -> bool {
        self.lock().contains_key(&port)
    }

    pub fn held_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.lock().keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    fn release(&self, port: u16, owner: Uuid) {
        let mut held = self.lock();
        if held.get(&port) == Some(&owner) {
            held.remove(&port);
            debug!(port, tunnel_id = %owner, "Released local port");
        }
    }

    // A panic while holding the lock cannot leave the map half-updated
    fn lock(&self) -> MutexGuard<'_, HashMap<u16, Uuid>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reservation of one local port, released on drop
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    owner: Uuid,
    registry: PortRegistry,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.registry.release(self.port, self.owner);
    }
}
