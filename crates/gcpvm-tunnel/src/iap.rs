//! `gcloud compute start-iap-tunnel` launcher

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::TunnelError;
use crate::process::{TunnelLauncher, TunnelProcess, TunnelSpec};

/// gcloud prints this on stderr once the local listener is bound
const READY_MARKER: &str = "Listening on port";

/// stderr lines kept to explain an establishment failure
const RECENT_LINES: usize = 5;

/// Launches tunnels through the `gcloud` CLI
#[derive(Debug, Clone)]
pub struct IapTunnelLauncher {
    binary: PathBuf,
}

impl IapTunnelLauncher {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Arguments passed to `gcloud`
    pub fn args(spec: &TunnelSpec) -> Vec<String> {
        vec![
            "compute".to_string(),
            "start-iap-tunnel".to_string(),
            spec.target.vm.clone(),
            spec.remote_port.to_string(),
            format!("--local-host-port=localhost:{}", spec.local_port),
            format!("--zone={}", spec.target.zone),
            format!("--project={}", spec.target.project),
        ]
    }
}

impl Default for IapTunnelLauncher {
    fn default() -> Self {
        Self::new(gcpvm_gateway::DEFAULT_GCLOUD)
    }
}

#[async_trait]
impl TunnelLauncher for IapTunnelLauncher {
    async fn launch(&self, spec: &TunnelSpec) -> Result<Box<dyn TunnelProcess>, TunnelError> {
        let args = Self::args(spec);
        debug!(tunnel_id = %spec.id, command = %format!("{} {}", self.binary.display(), args.join(" ")), "Starting IAP tunnel");

        let mut cmd = Command::new(&self.binary);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Keep terminal signals (Ctrl+C) away from the tunnel; the manager
        // decides when it stops.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| TunnelError::Establish {
            cause: format!("failed to start '{}': {}", self.binary.display(), e),
        })?;
        let stderr = child.stderr.take().map(|s| BufReader::new(s).lines());

        info!(tunnel_id = %spec.id, pid = ?child.id(), local_port = spec.local_port, "IAP tunnel process started");

        Ok(Box::new(IapTunnelProcess {
            id: spec.id,
            child,
            stderr,
            recent: VecDeque::with_capacity(RECENT_LINES),
        }))
    }
}

struct IapTunnelProcess {
    id: Uuid,
    child: Child,
    stderr: Option<Lines<BufReader<ChildStderr>>>,
    recent: VecDeque<String>,
}

impl IapTunnelProcess {
    fn remember(&mut self, line: String) {
        if self.recent.len() == RECENT_LINES {
            self.recent.pop_front();
        }
        self.recent.push_back(line);
    }

    fn failure_cause(&self) -> String {
        if self.recent.is_empty() {
            "tunnel process exited before it was ready".to_string()
        } else {
            self.recent.iter().cloned().collect::<Vec<_>>().join(" ")
        }
    }
}

#[async_trait]
impl TunnelProcess for IapTunnelProcess {
    async fn wait_ready(&mut self) -> Result<(), String> {
        loop {
            let Some(lines) = self.stderr.as_mut() else {
                return Err(self.failure_cause());
            };

            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!(tunnel_id = %self.id, "gcloud: {}", line);
                    if line.contains(READY_MARKER) {
                        // Keep draining so gcloud never blocks on a full pipe
                        if let Some(mut rest) = self.stderr.take() {
                            let id = self.id;
                            tokio::spawn(async move {
                                while let Ok(Some(line)) = rest.next_line().await {
                                    debug!(tunnel_id = %id, "gcloud: {}", line);
                                }
                            });
                        }
                        return Ok(());
                    }
                    let line = line.trim().to_string();
                    if !line.is_empty() {
                        self.remember(line);
                    }
                }
                Ok(None) => {
                    self.stderr = None;
                    return Err(self.failure_cause());
                }
                Err(e) => {
                    self.stderr = None;
                    return Err(format!("failed to read tunnel output: {}", e));
                }
            }
        }
    }

    async fn wait_exit(&mut self) -> std::io::Result<Option<i32>> {
        let status = self.child.wait().await?;
        debug!(tunnel_id = %self.id, ?status, "IAP tunnel process exited");
        Ok(status.code())
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> std::io::Result<()> {
        let Some(pid) = self.child.id() else {
            // Already reaped
            return Ok(());
        };
        // Negative pid: signal the whole process group started for the tunnel
        let rc = unsafe { libc::kill(-(pid as i32), libc::SIGTERM) };
        if rc == 0 {
            Ok(())
        } else {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                Ok(())
            } else {
                Err(err)
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> std::io::Result<()> {
        self.kill()
    }

    fn kill(&mut self) -> std::io::Result<()> {
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            // Exited in the meantime
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e),
        }
    }
}
