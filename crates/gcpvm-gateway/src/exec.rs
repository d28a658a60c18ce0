//! Remote command execution over `gcloud compute ssh`/`scp`
//!
//! Interactive sessions inherit the terminal; everything else is captured so
//! that the caller can show stdout, stderr and the exit code.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// What to do on the remote VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteKind {
    /// Interactive login shell
    Shell,
    /// Run one command and return
    Command(String),
    /// Copy a local file to the VM
    Upload { local: PathBuf, remote: String },
    /// Copy a file from the VM to the local machine
    Download { remote: String, local: PathBuf },
}

/// A remote operation on one VM, tunnelled through IAP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteInvocation {
    pub project: String,
    pub vm: String,
    pub zone: String,
    pub kind: RemoteKind,
}

impl RemoteInvocation {
    pub fn new(
        project: impl Into<String>,
        vm: impl Into<String>,
        zone: impl Into<String>,
        kind: RemoteKind,
    ) -> Self {
        Self {
            project: project.into(),
            vm: vm.into(),
            zone: zone.into(),
            kind,
        }
    }

    /// Arguments passed to `gcloud`
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["compute".to_string()];
        match &self.kind {
            RemoteKind::Shell => {
                args.push("ssh".to_string());
                args.push(self.vm.clone());
            }
            RemoteKind::Command(command) => {
                args.push("ssh".to_string());
                args.push(self.vm.clone());
                args.push(format!("--command={}", command));
            }
            RemoteKind::Upload { local, remote } => {
                args.push("scp".to_string());
                args.push(local.display().to_string());
                args.push(format!("{}:{}", self.vm, remote));
            }
            RemoteKind::Download { remote, local } => {
                args.push("scp".to_string());
                args.push(format!("{}:{}", self.vm, remote));
                args.push(local.display().to_string());
            }
        }
        args.extend([
            format!("--project={}", self.project),
            format!("--zone={}", self.zone),
            "--tunnel-through-iap".to_string(),
        ]);
        args
    }
}

/// Captured result of a finished remote operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A remote command that exited non-zero
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Remote command failed with exit code {exit_code}")]
pub struct RemoteCommandError {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl From<CommandOutput> for RemoteCommandError {
    fn from(output: CommandOutput) -> Self {
        Self {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Remote(#[from] RemoteCommandError),

    #[error("Failed to run '{tool}': {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },
}

/// Runs operations on remote VMs
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run to completion with captured output
    ///
    /// A non-zero exit is reported as [`ExecError::Remote`].
    async fn run_captured(&self, invocation: &RemoteInvocation) -> Result<CommandOutput, ExecError>;

    /// Run attached to the current terminal and return the exit code
    async fn run_interactive(&self, invocation: &RemoteInvocation) -> Result<i32, ExecError>;
}

/// [`RemoteShell`] backed by the `gcloud` CLI
#[derive(Debug, Clone)]
pub struct GcloudShell {
    binary: PathBuf,
}

impl GcloudShell {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, invocation: &RemoteInvocation) -> Command {
        let args = invocation.args();
        debug!(command = %format!("{} {}", self.binary.display(), args.join(" ")), "Running remote operation");
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        cmd
    }

    fn spawn_error(&self, source: std::io::Error) -> ExecError {
        ExecError::Spawn {
            tool: self.binary.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl RemoteShell for GcloudShell {
    async fn run_captured(&self, invocation: &RemoteInvocation) -> Result<CommandOutput, ExecError> {
        let output = self
            .command(invocation)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        let result = CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        info!(vm = %invocation.vm, exit_code = result.exit_code, "Remote operation finished");

        if result.success() {
            Ok(result)
        } else {
            Err(RemoteCommandError::from(result).into())
        }
    }

    async fn run_interactive(&self, invocation: &RemoteInvocation) -> Result<i32, ExecError> {
        let status = self
            .command(invocation)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| self.spawn_error(e))?;

        let code = status.code().unwrap_or(-1);
        info!(vm = %invocation.vm, exit_code = code, "Interactive session ended");
        Ok(code)
    }
}
