//! Session controller
//!
//! One screen per [`SessionState`]. Each step renders its screen, reads one
//! action and returns the next state; `None` ends the session. Gateway reads
//! are bounded by [`SessionConfig::timeout`] and failures end up as banners,
//! never as session errors.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use colored::Colorize;
use futures::StreamExt;
use gcpvm_gateway::{
    CloudApiError, CloudGateway, CloudRunRevision, CloudRunService, DeployRequest, ExecError,
    LogSource, PowerState, RemoteInvocation, RemoteKind, RemoteShell, VmAction as PowerAction,
};
use gcpvm_registry::{Registry, VmDescriptor};
use gcpvm_tunnel::{
    TunnelConfig, TunnelError, TunnelHandle, TunnelLauncher, TunnelManager, TunnelState, TunnelTarget,
};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::actions::{
    ForwardMode, MainAction, Menu, MenuItem, ProjectAdminAction, ServiceAction, TunnelAction,
    VmAction,
};
use crate::config::SessionConfig;
use crate::console::{column, environment_tag, power_state, power_state_column, Console};
use crate::interrupt::Interrupt;
use crate::prompt::{Prompt, PromptError};
use crate::state::{Activity, Purpose, SessionState, VmRef};

const TITLE: &str = concat!("GCP VM MANAGER v", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Prompt(#[from] PromptError),
}

type Step = Result<Option<SessionState>, SessionError>;

/// Outcome of opening a tunnel from the menus
enum Establish {
    Active(TunnelHandle),
    Interrupted,
    Failed,
}

pub struct Session<P, I> {
    registry: Registry,
    gateway: Arc<dyn CloudGateway>,
    shell: Arc<dyn RemoteShell>,
    tunnels: TunnelManager,
    prompt: P,
    interrupt: I,
    console: Console,
    config: SessionConfig,
}

impl<P: Prompt, I: Interrupt> Session<P, I> {
    pub fn new(
        registry: Registry,
        gateway: Arc<dyn CloudGateway>,
        shell: Arc<dyn RemoteShell>,
        launcher: Arc<dyn TunnelLauncher>,
        prompt: P,
        interrupt: I,
        config: SessionConfig,
    ) -> Self {
        let tunnel = TunnelConfig {
            status_timeout: config.timeout,
            ..config.tunnel
        };
        let tunnels = TunnelManager::with_config(gateway.clone(), launcher, tunnel);
        Self {
            registry,
            gateway,
            shell,
            tunnels,
            prompt,
            interrupt,
            console: Console::stdout(),
            config,
        }
    }

    pub fn with_console(mut self, console: Console) -> Self {
        self.console = console;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn tunnels(&self) -> &TunnelManager {
        &self.tunnels
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    /// Run the menu loop until the user exits
    ///
    /// All tunnels are closed before this returns, whatever the outcome.
    pub async fn run(&mut self) -> Result<(), SessionError> {
        let mut state = SessionState::MainMenu;
        let result = loop {
            debug!(?state, "Session step");
            match self.step(state).await {
                Ok(Some(next)) => state = next,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        let closed = self.tunnels.shutdown().await;
        if closed > 0 {
            self.console.info(&format!("Closed {} tunnel(s)", closed));
        }
        info!("Session ended");
        result
    }

    /// Render one screen and return the next state
    pub async fn step(&mut self, state: SessionState) -> Step {
        match state {
            SessionState::MainMenu => self.main_menu().await,
            SessionState::ProjectMenu { purpose } => self.project_menu(purpose).await,
            SessionState::VmList { project } => self.vm_list(project).await,
            SessionState::VmActionMenu { project, vm } => self.vm_action_menu(project, vm).await,
            SessionState::CloudRunList { project } => self.cloud_run_list(project).await,
            SessionState::CloudRunActionMenu { project, service } => {
                self.cloud_run_action_menu(project, service).await
            }
            SessionState::ProjectAdmin => self.project_admin().await,
            SessionState::TunnelList => self.tunnel_list().await,
            SessionState::Running { activity, resume } => {
                self.run_activity(activity).await?;
                Ok(Some(*resume))
            }
        }
    }

    // ---- helpers -------------------------------------------------------

    async fn select_item<'m, A: Clone>(
        &mut self,
        title: &str,
        menu: &'m Menu<A>,
    ) -> Result<Option<&'m MenuItem<A>>, SessionError> {
        let choice = self.prompt.select(title, &menu.labels()).await?;
        Ok(choice.and_then(|index| menu.get(index)))
    }

    /// Bounded gateway read; failures are rendered and yield `None`
    async fn fetch<T, F>(&mut self, what: &str, call: F) -> Option<T>
    where
        F: Future<Output = Result<T, CloudApiError>>,
    {
        match tokio::time::timeout(self.config.timeout, call).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!(code = %e.code, "Failed to {}: {}", what, e.message);
                self.console.cloud_error(what, &e);
                None
            }
            Err(_) => {
                warn!(timeout_secs = self.config.timeout.as_secs(), "Timed out trying to {}", what);
                self.console.error(&format!(
                    "Timed out after {}s while trying to {}",
                    self.config.timeout.as_secs(),
                    what
                ));
                None
            }
        }
    }

    /// Unbounded gateway operation (power actions, deploys)
    async fn perform<F>(&mut self, what: &str, call: F) -> bool
    where
        F: Future<Output = Result<(), CloudApiError>>,
    {
        match call.await {
            Ok(()) => true,
            Err(e) => {
                warn!(code = %e.code, "Failed to {}: {}", what, e.message);
                self.console.cloud_error(what, &e);
                false
            }
        }
    }

    async fn pause(&mut self) -> Result<(), SessionError> {
        self.prompt.pause().await?;
        Ok(())
    }

    /// Ask for a port until a valid one (1-65535) is entered
    async fn ask_port(&mut self, label: &str, default: Option<&str>) -> Result<u16, SessionError> {
        loop {
            let text = self.prompt.input(label, default).await?;
            match text.trim().parse::<u16>() {
                Ok(port) if port > 0 => return Ok(port),
                _ => self.console.error(&format!(
                    "'{}' is not a valid port. Enter a port number between 1 and 65535",
                    text
                )),
            }
        }
    }

    fn show_json(&mut self, value: &serde_json::Value) {
        match serde_json::to_string_pretty(value) {
            Ok(text) => self.console.block(&text),
            Err(e) => self.console.error(&format!("Failed to render details: {}", e)),
        }
    }

    fn tunnel_error(&mut self, err: &TunnelError) {
        match err {
            TunnelError::Cloud(e) => self.console.cloud_error("check the VM status", e),
            other => self.console.error(&other.to_string()),
        }
    }

    fn project_heading(&mut self, project: &str) {
        self.console.header(TITLE);
        self.console
            .section(&format!("Project: {} {}", project, environment_tag(project)));
    }

    // ---- screens -------------------------------------------------------

    async fn main_menu(&mut self) -> Step {
        self.console.header(TITLE);
        self.console.section("Main Menu");

        let menu = MainAction::menu(self.tunnels.len());
        let action = self
            .select_item("Select an option", &menu)
            .await?
            .map(|item| item.action)
            .unwrap_or(MainAction::Exit);

        Ok(match action {
            MainAction::ManageVms => Some(SessionState::ProjectMenu {
                purpose: Purpose::Vms,
            }),
            MainAction::CloudRun => Some(SessionState::ProjectMenu {
                purpose: Purpose::CloudRun,
            }),
            MainAction::ManageProjects => Some(SessionState::ProjectAdmin),
            MainAction::Tunnels => Some(SessionState::TunnelList),
            MainAction::Exit => None,
        })
    }

    async fn project_menu(&mut self, purpose: Purpose) -> Step {
        self.console.header(TITLE);
        self.console.section("Select a project");

        let projects = self.registry.list_projects();
        if projects.is_empty() {
            self.console
                .warning("No projects configured. Add one under Manage Projects first.");
            self.pause().await?;
            return Ok(Some(SessionState::MainMenu));
        }

        let mut menu = Menu::new();
        for project in &projects {
            menu.push(
                format!("{} {}", project, environment_tag(project)),
                Some(project.clone()),
                true,
            );
        }
        menu.push("Back to main menu", None, true);

        let selected = self
            .select_item("Project", &menu)
            .await?
            .and_then(|item| item.action.clone());

        Ok(Some(match (selected, purpose) {
            (Some(project), Purpose::Vms) => SessionState::VmList { project },
            (Some(project), Purpose::CloudRun) => SessionState::CloudRunList { project },
            (None, _) => SessionState::MainMenu,
        }))
    }

    async fn vm_list(&mut self, project: String) -> Step {
        let back = SessionState::ProjectMenu {
            purpose: Purpose::Vms,
        };
        self.project_heading(&project);
        self.console.info("Loading VM statuses...");

        let gateway = self.gateway.clone();
        let Some(vms) = self.fetch("list VMs", gateway.list_vms(&project)).await else {
            self.pause().await?;
            return Ok(Some(back));
        };

        if vms.is_empty() {
            self.console.warning("No VMs found in this project");
            self.pause().await?;
            return Ok(Some(back));
        }

        let discovered: Vec<VmDescriptor> = vms
            .iter()
            .map(|vm| VmDescriptor::new(vm.name.as_str(), vm.zone.as_str()))
            .collect();
        match self.registry.merge_discovered(&project, &discovered) {
            Ok(0) => {}
            Ok(added) => {
                if self.config.debug {
                    self.console
                        .info(&format!("Recorded {} new VM(s) in the configuration", added));
                }
            }
            Err(e) => {
                warn!(project = %project, error = %e, "Failed to record discovered VMs");
                self.console
                    .warning(&format!("Could not record discovered VMs: {}", e));
            }
        }

        self.console.line(
            format!(
                "{} {} {} {} {} {}",
                column("#", 3),
                column("Name", 32),
                column("Region", 15),
                column("Zone", 18),
                column("Status", 11),
                "Description"
            )
            .bold()
            .to_string(),
        );
        self.console.line("-".repeat(100));

        let mut menu = Menu::new();
        for (i, vm) in vms.iter().enumerate() {
            let description = self
                .registry
                .project(&project)
                .and_then(|p| p.find_vm(&vm.name, &vm.zone))
                .and_then(|d| d.description.clone())
                .unwrap_or_default();
            self.console.line(format!(
                "{} {} {} {} {} {}",
                column(&(i + 1).to_string(), 3),
                column(&vm.name, 32),
                column(vm.region(), 15),
                column(&vm.zone, 18),
                power_state_column(vm.state, 11),
                description
            ));

            menu.push(
                format!("{} ({})", vm.name, vm.zone),
                Some(VmRef {
                    name: vm.name.clone(),
                    zone: vm.zone.clone(),
                }),
                true,
            );
        }
        menu.push("Back to project selection", None, true);
        self.console.blank();

        let selected = self
            .select_item("Select a VM", &menu)
            .await?
            .and_then(|item| item.action.clone());

        Ok(Some(match selected {
            Some(vm) => SessionState::VmActionMenu { project, vm },
            None => back,
        }))
    }

    async fn vm_action_menu(&mut self, project: String, vm: VmRef) -> Step {
        let here = SessionState::VmActionMenu {
            project: project.clone(),
            vm: vm.clone(),
        };

        self.project_heading(&project);
        self.console
            .line(format!("VM: {}", vm).green().bold().to_string());

        let gateway = self.gateway.clone();
        let state = match self
            .fetch("get the VM status", gateway.vm_status(&project, &vm.name, &vm.zone))
            .await
        {
            Some(status) => {
                self.console
                    .line(format!("Status: {}", power_state(status.state)));
                if let Some(machine_type) = &status.machine_type {
                    self.console.line(format!("Machine type: {}", machine_type));
                }
                if let Some(ip) = &status.internal_ip {
                    self.console.line(format!("Internal IP: {}", ip));
                }
                if let Some(ip) = &status.external_ip {
                    self.console.line(format!("External IP: {}", ip));
                }
                status.state
            }
            None => {
                self.console
                    .line(format!("Status: {}", power_state(PowerState::Unknown)));
                PowerState::Unknown
            }
        };
        self.console.blank();

        let menu = VmAction::menu(state);
        let Some(item) = self.select_item("Select an action", &menu).await? else {
            return Ok(Some(SessionState::VmList { project }));
        };
        if !item.enabled {
            self.console.error(&format!(
                "'{}' is not available while the VM is {}",
                item.label, state
            ));
            self.pause().await?;
            return Ok(Some(here));
        }

        match item.action {
            VmAction::Ssh => self.ssh(&project, &vm).await?,
            VmAction::Power(action) => self.power(&project, &vm, action).await?,
            VmAction::Details => {
                if let Some(details) = self
                    .fetch("describe the VM", gateway.describe_vm(&project, &vm.name, &vm.zone))
                    .await
                {
                    self.show_json(&details);
                }
                self.pause().await?;
            }
            VmAction::Logs => {
                let activity = Activity::Logs {
                    project: project.clone(),
                    source: LogSource::Vm {
                        name: vm.name.clone(),
                        zone: vm.zone.clone(),
                    },
                };
                return Ok(Some(SessionState::running(activity, here)));
            }
            VmAction::Upload => self.upload(&project, &vm).await?,
            VmAction::Download => self.download(&project, &vm).await?,
            VmAction::RunCommand => self.run_command(&project, &vm).await?,
            VmAction::PortForward => return self.port_forward(&project, &vm, here).await,
            VmAction::Back => return Ok(Some(SessionState::VmList { project })),
        }

        Ok(Some(here))
    }

    async fn ssh(&mut self, project: &str, vm: &VmRef) -> Result<(), SessionError> {
        let invocation = RemoteInvocation::new(project, vm.name.as_str(), vm.zone.as_str(), RemoteKind::Shell);
        self.console
            .info(&format!("Connecting to {} through IAP...", vm.name));
        if self.config.debug {
            self.console
                .line(format!("[debug] gcloud {}", invocation.args().join(" ")).dimmed().to_string());
        }

        let shell = self.shell.clone();
        match shell.run_interactive(&invocation).await {
            Ok(0) => Ok(()),
            Ok(code) => {
                self.console
                    .warning(&format!("SSH session ended with exit code {}", code));
                self.pause().await
            }
            Err(e) => {
                self.console.error(&e.to_string());
                self.pause().await
            }
        }
    }

    async fn power(
        &mut self,
        project: &str,
        vm: &VmRef,
        action: PowerAction,
    ) -> Result<(), SessionError> {
        self.console
            .info(&format!("Running '{}' on {}...", action, vm.name));

        let gateway = self.gateway.clone();
        let what = format!("{} the VM", action);
        if self
            .perform(&what, gateway.vm_action(project, &vm.name, &vm.zone, action))
            .await
        {
            info!(project = %project, vm = %vm.name, %action, "VM power action completed");
            self.console
                .success(&format!("VM {}: {} completed", vm.name, action));
        }
        self.pause().await
    }

    async fn upload(&mut self, project: &str, vm: &VmRef) -> Result<(), SessionError> {
        let local = self.prompt.input("Local file path", None).await?;
        if local.is_empty() {
            self.console.error("No local path given");
            return self.pause().await;
        }
        if !Path::new(&local).exists() {
            self.console
                .error(&format!("Local file not found: {}", local));
            return self.pause().await;
        }
        let remote = self.prompt.input("Remote path", Some("~/")).await?;

        let kind = RemoteKind::Upload {
            local: PathBuf::from(local),
            remote,
        };
        self.run_remote(RemoteInvocation::new(project, vm.name.as_str(), vm.zone.as_str(), kind))
            .await
    }

    async fn download(&mut self, project: &str, vm: &VmRef) -> Result<(), SessionError> {
        let remote = self.prompt.input("Remote file path", None).await?;
        if remote.is_empty() {
            self.console.error("No remote path given");
            return self.pause().await;
        }
        let local = self.prompt.input("Local path", Some("./")).await?;

        let kind = RemoteKind::Download {
            remote,
            local: PathBuf::from(local),
        };
        self.run_remote(RemoteInvocation::new(project, vm.name.as_str(), vm.zone.as_str(), kind))
            .await
    }

    async fn run_command(&mut self, project: &str, vm: &VmRef) -> Result<(), SessionError> {
        let command = self.prompt.input("Command to run", None).await?;
        if command.is_empty() {
            self.console.error("No command given");
            return self.pause().await;
        }
        let kind = RemoteKind::Command(command);
        self.run_remote(RemoteInvocation::new(project, vm.name.as_str(), vm.zone.as_str(), kind))
            .await
    }

    /// Run a captured remote operation and show its output as-is
    async fn run_remote(&mut self, invocation: RemoteInvocation) -> Result<(), SessionError> {
        if self.config.debug {
            self.console
                .line(format!("[debug] gcloud {}", invocation.args().join(" ")).dimmed().to_string());
        }

        let shell = self.shell.clone();
        match shell.run_captured(&invocation).await {
            Ok(output) => {
                if !output.stdout.trim().is_empty() {
                    self.console.section("Output:");
                    self.console.block(&output.stdout);
                }
                if !output.stderr.trim().is_empty() {
                    self.console.section("Errors:");
                    self.console.block(&output.stderr);
                }
                self.console.success("Completed");
            }
            Err(ExecError::Remote(e)) => {
                self.console
                    .error(&format!("Remote operation failed with exit code {}", e.exit_code));
                if !e.stdout.trim().is_empty() {
                    self.console.section("Output:");
                    self.console.block(&e.stdout);
                }
                if !e.stderr.trim().is_empty() {
                    self.console.section("Errors:");
                    self.console.block(&e.stderr);
                }
            }
            Err(e) => self.console.error(&e.to_string()),
        }
        self.pause().await
    }

    async fn port_forward(&mut self, project: &str, vm: &VmRef, here: SessionState) -> Step {
        let remote_port = self.ask_port("Remote port on the VM", None).await?;
        let default_local = remote_port.to_string();
        let local_port = self
            .ask_port("Local port", Some(default_local.as_str()))
            .await?;

        let modes = ForwardMode::menu();
        let Some(mode) = self.select_item("Tunnel mode", &modes).await? else {
            return Ok(Some(here));
        };
        let target = TunnelTarget::new(project, vm.name.as_str(), vm.zone.as_str());

        match mode.action {
            ForwardMode::Foreground => {
                let activity = Activity::PortForward {
                    target,
                    remote_port,
                    local_port,
                };
                Ok(Some(SessionState::running(activity, here)))
            }
            ForwardMode::Background => {
                let outcome = self.establish(target, remote_port, local_port).await;
                if let Establish::Active(_) = outcome {
                    self.console
                        .info("The tunnel keeps running; close it under Active Tunnels");
                }
                self.pause().await?;
                Ok(Some(here))
            }
        }
    }

    async fn cloud_run_list(&mut self, project: String) -> Step {
        let back = SessionState::ProjectMenu {
            purpose: Purpose::CloudRun,
        };
        self.project_heading(&project);
        self.console.info("Loading Cloud Run services...");

        let gateway = self.gateway.clone();
        let Some(services) = self
            .fetch("list Cloud Run services", gateway.list_cloud_run_services(&project))
            .await
        else {
            self.pause().await?;
            return Ok(Some(back));
        };

        if services.is_empty() {
            self.console.warning("No Cloud Run services found in this project");
            self.pause().await?;
            return Ok(Some(back));
        }

        self.console.line(
            format!(
                "{} {} {} {} {}",
                column("#", 3),
                column("Service", 32),
                column("Region", 18),
                column("Ready", 6),
                "URL"
            )
            .bold()
            .to_string(),
        );
        self.console.line("-".repeat(100));

        let mut menu = Menu::new();
        for (i, service) in services.iter().enumerate() {
            let ready = if service.ready {
                column("yes", 6).green()
            } else {
                column("no", 6).red()
            };
            self.console.line(format!(
                "{} {} {} {} {}",
                column(&(i + 1).to_string(), 3),
                column(&service.name, 32),
                column(&service.region, 18),
                ready,
                service.url.as_deref().unwrap_or("-")
            ));
            menu.push(
                format!("{} ({})", service.name, service.region),
                Some(service.clone()),
                true,
            );
        }
        menu.push("Back to project selection", None, true);
        self.console.blank();

        let selected = self
            .select_item("Select a service", &menu)
            .await?
            .and_then(|item| item.action.clone());

        Ok(Some(match selected {
            Some(service) => SessionState::CloudRunActionMenu { project, service },
            None => back,
        }))
    }

    async fn cloud_run_action_menu(&mut self, project: String, service: CloudRunService) -> Step {
        let here = SessionState::CloudRunActionMenu {
            project: project.clone(),
            service: service.clone(),
        };

        self.project_heading(&project);
        self.console.line(
            format!("Service: {} ({})", service.name, service.region)
                .green()
                .bold()
                .to_string(),
        );
        if let Some(url) = &service.url {
            self.console.line(format!("URL: {}", url));
        }
        if let Some(revision) = &service.latest_ready_revision {
            self.console.line(format!("Latest ready revision: {}", revision));
        }
        self.console.blank();

        let menu = ServiceAction::menu();
        let Some(item) = self.select_item("Select an action", &menu).await? else {
            return Ok(Some(SessionState::CloudRunList { project }));
        };

        let gateway = self.gateway.clone();
        match item.action {
            ServiceAction::Details => {
                if let Some(details) = self
                    .fetch(
                        "describe the service",
                        gateway.describe_service(&project, &service.name, &service.region),
                    )
                    .await
                {
                    self.show_json(&details);
                }
                self.pause().await?;
            }
            ServiceAction::Logs => {
                let activity = Activity::Logs {
                    project: project.clone(),
                    source: LogSource::Service {
                        name: service.name.clone(),
                        region: service.region.clone(),
                    },
                };
                return Ok(Some(SessionState::running(activity, here)));
            }
            ServiceAction::Revisions => {
                self.show_revisions(&project, &service).await;
                self.pause().await?;
            }
            ServiceAction::Deploy => self.deploy(&project, &service).await?,
            ServiceAction::Rollback => self.rollback(&project, &service).await?,
            ServiceAction::Back => return Ok(Some(SessionState::CloudRunList { project })),
        }

        Ok(Some(here))
    }

    async fn show_revisions(
        &mut self,
        project: &str,
        service: &CloudRunService,
    ) -> Option<Vec<CloudRunRevision>> {
        let gateway = self.gateway.clone();
        let revisions = self
            .fetch(
                "list revisions",
                gateway.list_revisions(project, &service.name, &service.region),
            )
            .await?;

        if revisions.is_empty() {
            self.console.warning("No revisions found");
            return Some(revisions);
        }

        self.console.line(
            format!(
                "{} {} {} {}",
                column("Revision", 36),
                column("Ready", 6),
                column("Traffic", 8),
                "Created"
            )
            .bold()
            .to_string(),
        );
        for revision in &revisions {
            let traffic = revision
                .traffic_percent
                .map(|p| format!("{}%", p))
                .unwrap_or_else(|| "-".to_string());
            self.console.line(format!(
                "{} {} {} {}",
                column(&revision.name, 36),
                column(if revision.ready { "yes" } else { "no" }, 6),
                column(&traffic, 8),
                revision.created_at.as_deref().unwrap_or("-")
            ));
        }
        Some(revisions)
    }

    async fn deploy(&mut self, project: &str, service: &CloudRunService) -> Result<(), SessionError> {
        let image = self
            .prompt
            .input("Container image (e.g. us-docker.pkg.dev/project/repo/app:tag)", None)
            .await?;
        if image.is_empty() {
            self.console.error("No image given");
            return self.pause().await;
        }

        let question = format!("Deploy {} to {} in {}?", image, service.name, service.region);
        if !self.prompt.confirm(&question, false).await? {
            self.console.info("Deployment cancelled");
            return self.pause().await;
        }

        self.console.info("Deploying, this can take a few minutes...");
        let request = DeployRequest {
            service: service.name.clone(),
            region: service.region.clone(),
            image,
        };
        let gateway = self.gateway.clone();
        if self
            .perform("deploy the image", gateway.deploy_revision(project, request))
            .await
        {
            info!(project = %project, service = %service.name, "Deployed new revision");
            self.console
                .success(&format!("Deployed a new revision of {}", service.name));
        }
        self.pause().await
    }

    async fn rollback(&mut self, project: &str, service: &CloudRunService) -> Result<(), SessionError> {
        let Some(revisions) = self.show_revisions(project, service).await else {
            return self.pause().await;
        };
        if revisions.is_empty() {
            return self.pause().await;
        }

        let mut menu = Menu::new();
        for revision in &revisions {
            menu.push(revision.name.clone(), Some(revision.name.clone()), revision.ready);
        }
        menu.push("Cancel", None, true);

        let Some(item) = self.select_item("Route all traffic to", &menu).await? else {
            return Ok(());
        };
        if !item.enabled {
            self.console
                .error(&format!("Revision {} is not ready", item.label));
            return self.pause().await;
        }
        let Some(revision) = item.action.clone() else {
            return Ok(());
        };

        let question = format!("Route 100% of {} traffic to {}?", service.name, revision);
        if !self.prompt.confirm(&question, false).await? {
            self.console.info("Rollback cancelled");
            return self.pause().await;
        }

        let gateway = self.gateway.clone();
        if self
            .perform(
                "roll back",
                gateway.rollback(project, &service.name, &service.region, &revision),
            )
            .await
        {
            info!(project = %project, service = %service.name, revision = %revision, "Rolled back traffic");
            self.console
                .success(&format!("All traffic of {} now goes to {}", service.name, revision));
        }
        self.pause().await
    }

    async fn project_admin(&mut self) -> Step {
        self.console.header(TITLE);
        self.console.section("Manage Projects");

        let menu = ProjectAdminAction::menu();
        let action = self
            .select_item("Select an option", &menu)
            .await?
            .map(|item| item.action)
            .unwrap_or(ProjectAdminAction::Back);

        match action {
            ProjectAdminAction::List => {
                let projects = self.registry.list_projects();
                if projects.is_empty() {
                    self.console.warning("No projects configured");
                }
                for project in &projects {
                    let vms = self
                        .registry
                        .project(project)
                        .map(|p| p.vms.len())
                        .unwrap_or(0);
                    self.console.line(format!(
                        "  {} {} ({} VM(s) known)",
                        project,
                        environment_tag(project),
                        vms
                    ));
                }
                self.pause().await?;
            }
            ProjectAdminAction::Add => {
                let id = self.prompt.input("Project id", None).await?;
                match self.registry.add_project(&id) {
                    Ok(()) => self
                        .console
                        .success(&format!("Project '{}' added", id.trim())),
                    Err(e) => self.console.error(&e.to_string()),
                }
                self.pause().await?;
            }
            ProjectAdminAction::Remove => self.remove_project().await?,
            ProjectAdminAction::Back => return Ok(Some(SessionState::MainMenu)),
        }

        Ok(Some(SessionState::ProjectAdmin))
    }

    async fn remove_project(&mut self) -> Result<(), SessionError> {
        let projects = self.registry.list_projects();
        if projects.is_empty() {
            self.console.warning("No projects configured");
            return self.pause().await;
        }

        let mut menu = Menu::new();
        for project in &projects {
            menu.push(
                format!("{} {}", project, environment_tag(project)),
                Some(project.clone()),
                true,
            );
        }
        menu.push("Cancel", None, true);

        let Some(project) = self
            .select_item("Project to remove", &menu)
            .await?
            .and_then(|item| item.action.clone())
        else {
            return Ok(());
        };

        let question = format!("Are you sure you want to remove {}?", project);
        if !self.prompt.confirm(&question, false).await? {
            self.console.info("Nothing removed");
            return self.pause().await;
        }

        match self.registry.remove_project(&project) {
            Ok(()) => self
                .console
                .success(&format!("Project '{}' removed", project)),
            Err(e) => self.console.error(&e.to_string()),
        }
        self.pause().await
    }

    async fn tunnel_list(&mut self) -> Step {
        self.console.header(TITLE);
        self.console.section("Active Tunnels");

        for finished in self.tunnels.reap() {
            if let TunnelState::Error(cause) = &finished.state {
                self.console.warning(&format!(
                    "Tunnel localhost:{} -> {} failed: {}",
                    finished.local_port, finished.target, cause
                ));
            }
        }

        let tunnels = self.tunnels.list();
        if tunnels.is_empty() {
            self.console.info("No active tunnels");
            self.pause().await?;
            return Ok(Some(SessionState::MainMenu));
        }

        let mut menu = Menu::new();
        for tunnel in &tunnels {
            let label = format!(
                "localhost:{} -> {}:{} ({}) [{}]",
                tunnel.local_port,
                tunnel.target.vm,
                tunnel.remote_port,
                tunnel.target.project,
                tunnel.state
            );
            self.console.line(format!("  {}", label));
            menu.push(format!("Close {}", label), TunnelAction::Close(tunnel.id), true);
        }
        menu.push("Close all tunnels", TunnelAction::CloseAll, true);
        menu.push("Back to main menu", TunnelAction::Back, true);
        self.console.blank();

        let action = self
            .select_item("Select an action", &menu)
            .await?
            .map(|item| item.action)
            .unwrap_or(TunnelAction::Back);

        match action {
            TunnelAction::Close(id) => {
                self.close_tunnel(id).await;
                self.pause().await?;
            }
            TunnelAction::CloseAll => {
                let closed = self.tunnels.shutdown().await;
                self.console
                    .success(&format!("Closed {} tunnel(s)", closed));
                self.pause().await?;
            }
            TunnelAction::Back => return Ok(Some(SessionState::MainMenu)),
        }

        Ok(Some(SessionState::TunnelList))
    }

    async fn close_tunnel(&mut self, id: Uuid) {
        match self.tunnels.close_tunnel(id).await {
            Ok(TunnelState::Closed) => self.console.success("Tunnel closed"),
            Ok(TunnelState::Error(cause)) => self
                .console
                .warning(&format!("Tunnel had already failed: {}", cause)),
            Ok(other) => self
                .console
                .warning(&format!("Tunnel ended in state {}", other)),
            Err(e) => self.console.error(&e.to_string()),
        }
    }

    // ---- long-running activities --------------------------------------

    async fn run_activity(&mut self, activity: Activity) -> Result<(), SessionError> {
        match activity {
            Activity::PortForward {
                target,
                remote_port,
                local_port,
            } => self.foreground_tunnel(target, remote_port, local_port).await,
            Activity::Logs { project, source } => self.stream_logs(&project, source).await,
        }
    }

    /// Open a tunnel and wait until it is active
    ///
    /// An interrupt at any point, including the VM status check, closes the
    /// tunnel and returns once its process is gone.
    async fn establish(
        &mut self,
        target: TunnelTarget,
        remote_port: u16,
        local_port: u16,
    ) -> Establish {
        let vm = target.vm.clone();
        self.console.info(&format!(
            "Establishing tunnel localhost:{} -> {}:{}...",
            local_port, vm, remote_port
        ));

        let opened = tokio::select! {
            biased;
            _ = self.interrupt.wait() => None,
            opened = self.tunnels.open(target, remote_port, local_port) => Some(opened),
        };
        let handle = match opened {
            None => {
                self.console.warning("Interrupted before the tunnel was started");
                return Establish::Interrupted;
            }
            Some(Err(e)) => {
                self.tunnel_error(&e);
                return Establish::Failed;
            }
            Some(Ok(handle)) => handle,
        };
        let id = handle.id();

        let ready = tokio::select! {
            biased;
            _ = self.interrupt.wait() => None,
            ready = handle.wait_ready() => Some(ready),
        };
        match ready {
            None => {
                self.console.warning("Interrupted, closing tunnel...");
                self.close_tunnel(id).await;
                Establish::Interrupted
            }
            Some(Err(_)) => {
                // The entry holds the precise failure
                match self.tunnels.close_tunnel(id).await {
                    Ok(TunnelState::Error(cause)) => self
                        .console
                        .error(&format!("Tunnel could not be established: {}", cause)),
                    Ok(state) => self
                        .console
                        .error(&format!("Tunnel could not be established ({})", state)),
                    Err(e) => self.console.error(&e.to_string()),
                }
                Establish::Failed
            }
            Some(Ok(())) => {
                self.console.success(&format!(
                    "Tunnel active: localhost:{} -> {}:{}",
                    local_port, vm, remote_port
                ));
                Establish::Active(handle)
            }
        }
    }

    async fn foreground_tunnel(
        &mut self,
        target: TunnelTarget,
        remote_port: u16,
        local_port: u16,
    ) -> Result<(), SessionError> {
        let handle = match self.establish(target, remote_port, local_port).await {
            Establish::Active(handle) => handle,
            Establish::Interrupted => return Ok(()),
            Establish::Failed => return self.pause().await,
        };
        let id = handle.id();
        self.console.info("Press Ctrl+C to close the tunnel");

        let finished = tokio::select! {
            biased;
            _ = self.interrupt.wait() => None,
            state = handle.wait_finished() => Some(state),
        };
        match finished {
            None => {
                self.console.warning("Interrupted, closing tunnel...");
                self.close_tunnel(id).await;
                Ok(())
            }
            Some(state) => {
                if let Err(e) = self.tunnels.close_tunnel(id).await {
                    debug!(tunnel_id = %id, error = %e, "Tunnel already removed");
                }
                self.console.error(&format!("Tunnel stopped ({})", state));
                self.pause().await
            }
        }
    }

    async fn stream_logs(&mut self, project: &str, source: LogSource) -> Result<(), SessionError> {
        let gateway = self.gateway.clone();
        let Some(mut lines) = self
            .fetch("fetch logs", gateway.fetch_logs(project, source.clone()))
            .await
        else {
            return self.pause().await;
        };

        self.console
            .section(&format!("Logs for {} (Ctrl+C to stop)", source.name()));

        let mut count = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.interrupt.wait() => None,
                line = lines.next() => Some(line),
            };
            match next {
                None => {
                    self.console.warning("Log streaming interrupted");
                    break;
                }
                Some(None) => {
                    self.console
                        .info(&format!("End of logs ({} line(s))", count));
                    break;
                }
                Some(Some(Ok(line))) => {
                    count += 1;
                    self.console.line(line);
                }
                Some(Some(Err(e))) => {
                    self.console.cloud_error("read logs", &e);
                    break;
                }
            }
        }
        drop(lines);
        self.pause().await
    }
}

impl<P, I> Session<P, I> {
    /// Number of known projects, for the startup summary
    pub fn project_count(&self) -> usize {
        self.registry.list_projects().len()
    }
}
