//! Tunnel manager
//!
//! Owns the set of tunnels opened during a session. Every tunnel is driven by
//! its own supervising task; the manager only keeps the task handle, a
//! cancellation token and a state receiver per tunnel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use gcpvm_gateway::{CloudApiError, CloudErrorCode, CloudGateway};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::TunnelError;
use crate::port::{PortLease, PortRegistry};
use crate::process::{TunnelLauncher, TunnelProcess, TunnelSpec};
use crate::state::{TunnelInfo, TunnelState, TunnelTarget};

/// Timeouts applied by the supervising task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelConfig {
    /// How long a process may take to report readiness
    pub establish_timeout: Duration,
    /// How long a terminated process gets before it is force-killed
    pub close_grace: Duration,
    /// Bound on the VM status check made before a tunnel is started
    pub status_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            establish_timeout: Duration::from_secs(30),
            close_grace: Duration::from_secs(5),
            status_timeout: Duration::from_secs(30),
        }
    }
}

/// Observer of one tunnel
#[derive(Debug, Clone)]
pub struct TunnelHandle {
    id: Uuid,
    target: TunnelTarget,
    remote_port: u16,
    local_port: u16,
    state: watch::Receiver<TunnelState>,
}

impl TunnelHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn target(&self) -> &TunnelTarget {
        &self.target
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn state(&self) -> TunnelState {
        self.state.borrow().clone()
    }

    pub fn info(&self) -> TunnelInfo {
        TunnelInfo {
            id: self.id,
            target: self.target.clone(),
            remote_port: self.remote_port,
            local_port: self.local_port,
            state: self.state(),
        }
    }

    /// Wait until the tunnel leaves `Idle`/`Establishing`
    ///
    /// Meant to be awaited right after opening; a tunnel that already went
    /// through `Active` and then failed reports its failure as an
    /// establishment error.
    pub async fn wait_ready(&self) -> Result<(), TunnelError> {
        let mut rx = self.state.clone();
        let settled = rx
            .wait_for(|s| !matches!(s, TunnelState::Idle | TunnelState::Establishing))
            .await
            .map(|s| s.clone())
            .unwrap_or(TunnelState::Closed);

        match settled {
            TunnelState::Active => Ok(()),
            TunnelState::Error(cause) => Err(TunnelError::Establish { cause }),
            _ => Err(TunnelError::Cancelled),
        }
    }

    /// Wait until the tunnel is `Closed` or failed
    pub async fn wait_finished(&self) -> TunnelState {
        let mut rx = self.state.clone();
        rx.wait_for(TunnelState::is_finished)
            .await
            .map(|s| s.clone())
            .unwrap_or(TunnelState::Closed)
    }
}

struct TunnelEntry {
    handle: TunnelHandle,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), TunnelError>>,
}

/// Opens, tracks and closes tunnels
pub struct TunnelManager {
    gateway: Arc<dyn CloudGateway>,
    launcher: Arc<dyn TunnelLauncher>,
    ports: PortRegistry,
    config: TunnelConfig,
    tunnels: HashMap<Uuid, TunnelEntry>,
}

impl TunnelManager {
    pub fn new(gateway: Arc<dyn CloudGateway>, launcher: Arc<dyn TunnelLauncher>) -> Self {
        Self::with_config(gateway, launcher, TunnelConfig::default())
    }

    pub fn with_config(
        gateway: Arc<dyn CloudGateway>,
        launcher: Arc<dyn TunnelLauncher>,
        config: TunnelConfig,
    ) -> Self {
        Self {
            gateway,
            launcher,
            ports: PortRegistry::new(),
            config,
            tunnels: HashMap::new(),
        }
    }

    pub fn ports(&self) -> &PortRegistry {
        &self.ports
    }

    pub fn config(&self) -> TunnelConfig {
        self.config
    }

    /// Start a tunnel without waiting for it to become active
    ///
    /// Dropping the returned future before it resolves leaves nothing behind:
    /// the only await happens before any port is reserved.
    ///
    /// Preconditions are checked before anything is started: both ports must
    /// be non-zero, the VM must be RUNNING and the local port must be free.
    pub async fn open(
        &mut self,
        target: TunnelTarget,
        remote_port: u16,
        local_port: u16,
    ) -> Result<TunnelHandle, TunnelError> {
        for port in [remote_port, local_port] {
            if port == 0 {
                return Err(TunnelError::InvalidPort(port));
            }
        }

        let status = tokio::time::timeout(
            self.config.status_timeout,
            self.gateway
                .vm_status(&target.project, &target.vm, &target.zone),
        )
        .await
        .map_err(|_| {
            CloudApiError::new(
                CloudErrorCode::Network,
                format!(
                    "Timed out after {}s while checking the status of VM '{}'",
                    self.config.status_timeout.as_secs(),
                    target.vm
                ),
            )
        })??;
        if !status.state.is_running() {
            return Err(TunnelError::Precondition {
                vm: target.vm.clone(),
                state: status.state,
            });
        }

        let id = Uuid::new_v4();
        let lease = self.ports.reserve(local_port, id)?;

        let (state_tx, state_rx) = watch::channel(TunnelState::Idle);
        let handle = TunnelHandle {
            id,
            target: target.clone(),
            remote_port,
            local_port,
            state: state_rx,
        };
        let spec = TunnelSpec {
            id,
            target,
            remote_port,
            local_port,
        };
        let cancel = CancellationToken::new();

        info!(
            tunnel_id = %id,
            vm = %spec.target.vm,
            remote_port,
            local_port,
            "Opening tunnel"
        );

        let task = tokio::spawn(supervise(
            spec,
            self.launcher.clone(),
            lease,
            state_tx,
            cancel.clone(),
            self.config,
        ));

        self.tunnels.insert(
            id,
            TunnelEntry {
                handle: handle.clone(),
                cancel,
                task,
            },
        );
        Ok(handle)
    }

    /// Start a tunnel and wait until it is active
    ///
    /// On failure the tunnel is fully torn down before returning.
    pub async fn open_tunnel(
        &mut self,
        target: TunnelTarget,
        remote_port: u16,
        local_port: u16,
    ) -> Result<TunnelHandle, TunnelError> {
        let handle = self.open(target, remote_port, local_port).await?;
        if handle.wait_ready().await.is_ok() {
            return Ok(handle);
        }

        match self.tunnels.remove(&handle.id) {
            Some(entry) => match entry.task.await {
                Ok(Ok(())) => Err(TunnelError::Cancelled),
                Ok(Err(e)) => Err(e),
                Err(join) => Err(TunnelError::Establish {
                    cause: join.to_string(),
                }),
            },
            None => Err(TunnelError::Cancelled),
        }
    }

    /// Close a tunnel and wait until its process is gone and its port free
    pub async fn close_tunnel(&mut self, id: Uuid) -> Result<TunnelState, TunnelError> {
        let entry = self.tunnels.remove(&id).ok_or(TunnelError::NotFound(id))?;
        Ok(finish(entry).await)
    }

    /// Close every tunnel; returns how many were closed
    pub async fn shutdown(&mut self) -> usize {
        let entries: Vec<TunnelEntry> = self.tunnels.drain().map(|(_, e)| e).collect();
        let count = entries.len();
        if count > 0 {
            info!(count, "Closing all tunnels");
        }

        for entry in &entries {
            entry.cancel.cancel();
        }
        for entry in entries {
            finish(entry).await;
        }
        count
    }

    /// Snapshot of all tracked tunnels, ordered by local port
    pub fn list(&self) -> Vec<TunnelInfo> {
        let mut infos: Vec<TunnelInfo> = self.tunnels.values().map(|e| e.handle.info()).collect();
        infos.sort_by_key(|i| i.local_port);
        infos
    }

    pub fn get(&self, id: Uuid) -> Option<TunnelHandle> {
        self.tunnels.get(&id).map(|e| e.handle.clone())
    }

    /// Forget tunnels that already reached `Closed` or `Error`
    pub fn reap(&mut self) -> Vec<TunnelInfo> {
        let finished: Vec<Uuid> = self
            .tunnels
            .iter()
            .filter(|(_, e)| e.handle.state().is_finished())
            .map(|(id, _)| *id)
            .collect();

        let mut reaped: Vec<TunnelInfo> = finished
            .into_iter()
            .filter_map(|id| self.tunnels.remove(&id))
            .map(|e| e.handle.info())
            .collect();
        reaped.sort_by_key(|i| i.local_port);
        reaped
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}

impl Drop for TunnelManager {
    fn drop(&mut self) {
        // Processes are spawned with kill_on_drop; cancelling lets the tasks
        // release their ports if the runtime is still alive.
        for entry in self.tunnels.values() {
            entry.cancel.cancel();
        }
    }
}

async fn finish(entry: TunnelEntry) -> TunnelState {
    let id = entry.handle.id;
    entry.cancel.cancel();
    if let Err(e) = entry.task.await {
        error!(tunnel_id = %id, error = %e, "Tunnel task failed");
    }
    let state = entry.handle.state();
    debug!(tunnel_id = %id, state = %state, "Tunnel finished");
    state
}

enum Established {
    Ready,
    Cancelled,
    Failed(TunnelError),
}

/// Drive one tunnel from `Establishing` to `Closed` or `Error`
async fn supervise(
    spec: TunnelSpec,
    launcher: Arc<dyn TunnelLauncher>,
    lease: PortLease,
    state: watch::Sender<TunnelState>,
    cancel: CancellationToken,
    config: TunnelConfig,
) -> Result<(), TunnelError> {
    let id = spec.id;
    state.send_replace(TunnelState::Establishing);

    let launched = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        launched = launcher.launch(&spec) => Some(launched),
    };
    let mut process = match launched {
        Some(Ok(process)) => process,
        Some(Err(e)) => {
            let e = match e {
                TunnelError::Establish { .. } => e,
                other => TunnelError::Establish {
                    cause: other.to_string(),
                },
            };
            warn!(tunnel_id = %id, error = %e, "Tunnel failed to start");
            drop(lease);
            state.send_replace(TunnelState::Error(error_cause(&e)));
            return Err(e);
        }
        None => {
            state.send_replace(TunnelState::Closing);
            drop(lease);
            state.send_replace(TunnelState::Closed);
            return Ok(());
        }
    };

    let established = tokio::select! {
        biased;
        _ = cancel.cancelled() => Established::Cancelled,
        ready = tokio::time::timeout(config.establish_timeout, process.wait_ready()) => match ready {
            Ok(Ok(())) => Established::Ready,
            Ok(Err(cause)) => Established::Failed(TunnelError::Establish { cause }),
            Err(_) => Established::Failed(TunnelError::Establish {
                cause: format!(
                    "not ready after {}s",
                    config.establish_timeout.as_secs_f32()
                ),
            }),
        },
    };

    let result = match established {
        Established::Ready => {
            state.send_replace(TunnelState::Active);
            info!(tunnel_id = %id, local_port = spec.local_port, "Tunnel active");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => Ok(()),
                exit = process.wait_exit() => {
                    let status = match exit {
                        Ok(Some(code)) => format!("exit code {}", code),
                        Ok(None) => "terminated by signal".to_string(),
                        Err(e) => e.to_string(),
                    };
                    Err(TunnelError::Died { status })
                }
            }
        }
        Established::Cancelled => Ok(()),
        Established::Failed(e) => Err(e),
    };

    match &result {
        Ok(()) => {
            state.send_replace(TunnelState::Closing);
            info!(tunnel_id = %id, "Closing tunnel");
        }
        Err(e) => warn!(tunnel_id = %id, error = %e, "Tunnel failed"),
    }

    stop_process(id, &mut process, config.close_grace).await;
    drop(lease);

    match &result {
        Ok(()) => state.send_replace(TunnelState::Closed),
        Err(e) => state.send_replace(TunnelState::Error(error_cause(e))),
    };
    result
}

/// Terminate, then force-kill once the grace period runs out
///
/// Runs even when the process already exited.
async fn stop_process(id: Uuid, process: &mut Box<dyn TunnelProcess>, grace: Duration) {
    if let Err(e) = process.terminate() {
        debug!(tunnel_id = %id, error = %e, "Terminate failed");
    }

    if tokio::time::timeout(grace, process.wait_exit()).await.is_ok() {
        return;
    }

    warn!(
        tunnel_id = %id,
        grace_secs = grace.as_secs_f32(),
        "Tunnel process did not exit in time, killing it"
    );
    if let Err(e) = process.kill() {
        warn!(tunnel_id = %id, error = %e, "Failed to kill tunnel process");
        return;
    }
    if tokio::time::timeout(grace, process.wait_exit()).await.is_err() {
        warn!(tunnel_id = %id, "Tunnel process still running after kill");
    }
}

fn error_cause(e: &TunnelError) -> String {
    match e {
        TunnelError::Establish { cause } => cause.clone(),
        other => other.to_string(),
    }
}
