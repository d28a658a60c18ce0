//! Scripted end-to-end sessions
//!
//! Every test drives a full `Session::run` with a prompt that replays a
//! fixed list of answers, an in-memory tunnel launcher and a mocked gateway.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use gcpvm_gateway::{
    CloudApiError, CloudErrorCode, CloudGateway, CloudRunRevision, CloudRunService,
    DeployRequest, LogSource, LogStream, MockCloudGateway, MockRemoteShell, PowerState, VmAction,
    VmStatus,
};
use gcpvm_registry::{ConfigStore, Configuration, Registry};
use gcpvm_session::{Console, NotifyInterrupt, Prompt, PromptError, Session, SessionConfig};
use gcpvm_tunnel::{TunnelError, TunnelLauncher, TunnelProcess, TunnelSpec};
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone)]
enum Step {
    /// Pick the first item containing this text
    Choose(&'static str),
    /// Type this text; empty accepts the default
    Input(&'static str),
    Confirm(bool),
}

struct ScriptedPrompt {
    steps: VecDeque<Step>,
}

impl ScriptedPrompt {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: steps.into(),
        }
    }
}

#[async_trait]
impl Prompt for ScriptedPrompt {
    async fn select(&mut self, title: &str, items: &[String]) -> Result<Option<usize>, PromptError> {
        match self.steps.pop_front() {
            Some(Step::Choose(label)) => {
                let index = items
                    .iter()
                    .position(|item| item.contains(label))
                    .unwrap_or_else(|| panic!("'{}' not offered in '{}': {:?}", label, title, items));
                Ok(Some(index))
            }
            Some(other) => panic!("expected a selection for '{}', script has {:?}", title, other),
            None => Err(PromptError::Closed),
        }
    }

    async fn input(&mut self, label: &str, default: Option<&str>) -> Result<String, PromptError> {
        match self.steps.pop_front() {
            Some(Step::Input("")) => Ok(default.unwrap_or_default().to_string()),
            Some(Step::Input(text)) => Ok(text.to_string()),
            Some(other) => panic!("expected input for '{}', script has {:?}", label, other),
            None => Err(PromptError::Closed),
        }
    }

    async fn confirm(&mut self, label: &str, _default: bool) -> Result<bool, PromptError> {
        match self.steps.pop_front() {
            Some(Step::Confirm(answer)) => Ok(answer),
            Some(other) => panic!("expected a confirmation for '{}', script has {:?}", label, other),
            None => Err(PromptError::Closed),
        }
    }

    async fn pause(&mut self) -> Result<(), PromptError> {
        Ok(())
    }
}

/// Launcher whose processes become ready at once and exit when terminated
#[derive(Default)]
struct FakeLauncher {
    terminations: Arc<AtomicUsize>,
    /// Processes never report readiness
    never_ready: bool,
    /// Triggered as soon as a process reports readiness
    interrupt_on_ready: Option<NotifyInterrupt>,
}

impl FakeLauncher {
    fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TunnelLauncher for FakeLauncher {
    async fn launch(&self, _spec: &TunnelSpec) -> Result<Box<dyn TunnelProcess>, TunnelError> {
        let (exit_tx, exit_rx) = watch::channel(false);
        Ok(Box::new(FakeProcess {
            exit_tx,
            exit_rx,
            terminations: self.terminations.clone(),
            never_ready: self.never_ready,
            interrupt_on_ready: self.interrupt_on_ready.clone(),
        }))
    }
}

struct FakeProcess {
    exit_tx: watch::Sender<bool>,
    exit_rx: watch::Receiver<bool>,
    terminations: Arc<AtomicUsize>,
    never_ready: bool,
    interrupt_on_ready: Option<NotifyInterrupt>,
}

#[async_trait]
impl TunnelProcess for FakeProcess {
    async fn wait_ready(&mut self) -> Result<(), String> {
        if self.never_ready {
            std::future::pending::<()>().await;
        }
        if let Some(interrupt) = &self.interrupt_on_ready {
            interrupt.trigger();
        }
        Ok(())
    }

    async fn wait_exit(&mut self) -> std::io::Result<Option<i32>> {
        let _ = self.exit_rx.wait_for(|exited| *exited).await;
        Ok(Some(0))
    }

    fn terminate(&mut self) -> std::io::Result<()> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        self.exit_tx.send_replace(true);
        Ok(())
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.exit_tx.send_replace(true);
        Ok(())
    }
}

/// Hand-written gateway for calls that must hang
///
/// Serves a single RUNNING VM `web-1`. `slow_list` makes the VM listing hang;
/// `hang_status_call` makes the n-th status query (1-based) hang.
#[derive(Default)]
struct StallingGateway {
    slow_list: bool,
    hang_status_call: Option<usize>,
    status_calls: AtomicUsize,
}

#[async_trait]
impl CloudGateway for StallingGateway {
    async fn list_vms(&self, _project: &str) -> Result<Vec<VmStatus>, CloudApiError> {
        if self.slow_list {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(vec![VmStatus::new("web-1", "us-central1-a", PowerState::Running)])
    }

    async fn vm_status(&self, _: &str, vm: &str, zone: &str) -> Result<VmStatus, CloudApiError> {
        let call = self.status_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.hang_status_call == Some(call) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(VmStatus::new(vm, zone, PowerState::Running))
    }

    async fn vm_action(&self, _: &str, _: &str, _: &str, _: VmAction) -> Result<(), CloudApiError> {
        unimplemented!()
    }

    async fn describe_vm(
        &self,
        _: &str,
        _: &str,
        _: &str,
    ) -> Result<serde_json::Value, CloudApiError> {
        unimplemented!()
    }

    async fn fetch_logs(&self, _: &str, _: LogSource) -> Result<LogStream, CloudApiError> {
        unimplemented!()
    }

    async fn list_cloud_run_services(&self, _: &str) -> Result<Vec<CloudRunService>, CloudApiError> {
        unimplemented!()
    }

    async fn describe_service(
        &self,
        _: &str,
        _: &str,
        _: &str,
    ) -> Result<serde_json::Value, CloudApiError> {
        unimplemented!()
    }

    async fn list_revisions(
        &self,
        _: &str,
        _: &str,
        _: &str,
    ) -> Result<Vec<CloudRunRevision>, CloudApiError> {
        unimplemented!()
    }

    async fn deploy_revision(&self, _: &str, _: DeployRequest) -> Result<(), CloudApiError> {
        unimplemented!()
    }

    async fn rollback(&self, _: &str, _: &str, _: &str, _: &str) -> Result<(), CloudApiError> {
        unimplemented!()
    }
}

fn registry(dir: &TempDir, projects: &[&str]) -> Registry {
    let store = ConfigStore::new(dir.path().join("config.json"));
    let mut registry = Registry::with_configuration(store, Configuration::default());
    for project in projects {
        registry.add_project(project).unwrap();
    }
    registry
}

fn single_vm_gateway(state: PowerState) -> MockCloudGateway {
    let mut gateway = MockCloudGateway::new();
    gateway
        .expect_list_vms()
        .returning(move |_| Ok(vec![VmStatus::new("web-1", "us-central1-a", state)]));
    gateway
        .expect_vm_status()
        .returning(move |_, vm, zone| Ok(VmStatus::new(vm, zone, state)));
    gateway
}

fn trigger_after(interrupt: &NotifyInterrupt, delay: Duration) {
    let interrupt = interrupt.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        interrupt.trigger();
    });
}

fn session(
    registry: Registry,
    gateway: Arc<dyn CloudGateway>,
    launcher: Arc<FakeLauncher>,
    interrupt: NotifyInterrupt,
    steps: Vec<Step>,
) -> Session<ScriptedPrompt, NotifyInterrupt> {
    Session::new(
        registry,
        gateway,
        Arc::new(MockRemoteShell::new()),
        launcher,
        ScriptedPrompt::new(steps),
        interrupt,
        SessionConfig::default(),
    )
    .with_console(Console::capture())
}

/// Menu path from the main menu to the action menu of `web-1`
fn to_vm_menu() -> Vec<Step> {
    vec![
        Step::Choose("Manage Virtual Machines"),
        Step::Choose("acme-dev"),
        Step::Choose("web-1"),
    ]
}

/// Menu path from the action menu of `web-1` back out of the session
fn leave_vm_menu() -> Vec<Step> {
    vec![
        Step::Choose("Back to VM selection"),
        Step::Choose("Back to project selection"),
        Step::Choose("Back to main menu"),
        Step::Choose("Exit"),
    ]
}

#[tokio::test]
async fn test_add_and_remove_project_through_menus() {
    let dir = TempDir::new().unwrap();
    let steps = vec![
        Step::Choose("Manage Projects"),
        Step::Choose("Add project"),
        Step::Input("acme-staging"),
        Step::Choose("Add project"),
        Step::Input("acme-staging"),
        Step::Choose("Remove project"),
        Step::Choose("acme-staging"),
        Step::Confirm(true),
        Step::Choose("Back to main menu"),
        Step::Choose("Exit"),
    ];
    let mut session = session(
        registry(&dir, &[]),
        Arc::new(MockCloudGateway::new()),
        Arc::new(FakeLauncher::default()),
        NotifyInterrupt::new(),
        steps,
    );

    session.run().await.unwrap();

    assert!(session.console().contains("Project 'acme-staging' added"));
    assert!(session.console().contains("already exists"));
    assert!(session.console().contains("Project 'acme-staging' removed"));
    assert!(session.registry().list_projects().is_empty());

    let saved = std::fs::read_to_string(dir.path().join("config.json")).unwrap();
    let saved: serde_json::Value = serde_json::from_str(&saved).unwrap();
    assert!(saved["projects"].as_object().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_slow_gateway_times_out_and_returns_to_menu() {
    let dir = TempDir::new().unwrap();
    let steps = vec![
        Step::Choose("Manage Virtual Machines"),
        Step::Choose("acme-dev"),
        Step::Choose("Back to main menu"),
        Step::Choose("Exit"),
    ];
    let mut session = session(
        registry(&dir, &["acme-dev"]),
        Arc::new(StallingGateway {
            slow_list: true,
            ..StallingGateway::default()
        }),
        Arc::new(FakeLauncher::default()),
        NotifyInterrupt::new(),
        steps,
    );

    session.run().await.unwrap();

    assert!(session
        .console()
        .contains("Timed out after 30s while trying to list VMs"));
}

#[tokio::test]
async fn test_foreground_tunnel_closed_on_interrupt() {
    let dir = TempDir::new().unwrap();
    let interrupt = NotifyInterrupt::new();
    let launcher = Arc::new(FakeLauncher {
        interrupt_on_ready: Some(interrupt.clone()),
        ..FakeLauncher::default()
    });

    let mut steps = to_vm_menu();
    steps.extend([
        Step::Choose("Port forward"),
        Step::Input("99999"),
        Step::Input("8080"),
        Step::Input(""),
        Step::Choose("Foreground"),
    ]);
    steps.extend(leave_vm_menu());

    let mut session = session(
        registry(&dir, &["acme-dev"]),
        Arc::new(single_vm_gateway(PowerState::Running)),
        launcher.clone(),
        interrupt,
        steps,
    );

    session.run().await.unwrap();

    assert!(session.console().contains("not a valid port"));
    assert!(session.console().contains("Tunnel closed"));
    assert_eq!(launcher.terminations(), 1);
    assert!(!session.tunnels().ports().is_held(8080));
    assert!(session.tunnels().is_empty());

    let project = session.registry().project("acme-dev").unwrap();
    assert!(project.find_vm("web-1", "us-central1-a").is_some());
}

#[tokio::test]
async fn test_power_actions_follow_vm_state() {
    let dir = TempDir::new().unwrap();
    let mut gateway = single_vm_gateway(PowerState::Stopped);
    gateway
        .expect_vm_action()
        .withf(|project, vm, zone, action| {
            project == "acme-dev"
                && vm == "web-1"
                && zone == "us-central1-a"
                && *action == VmAction::Start
        })
        .times(1)
        .returning(|_, _, _, _| Ok(()));

    let mut steps = to_vm_menu();
    steps.extend([Step::Choose("Reset VM"), Step::Choose("Start VM")]);
    steps.extend(leave_vm_menu());

    let mut session = session(
        registry(&dir, &["acme-dev"]),
        Arc::new(gateway),
        Arc::new(FakeLauncher::default()),
        NotifyInterrupt::new(),
        steps,
    );

    session.run().await.unwrap();

    assert!(session
        .console()
        .contains("'Reset VM' is not available while the VM is STOPPED"));
    assert!(session.console().contains("VM web-1: start completed"));
}

#[tokio::test]
async fn test_background_tunnel_listed_and_closed_on_exit() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(FakeLauncher::default());

    let mut steps = to_vm_menu();
    steps.extend([
        Step::Choose("Port forward"),
        Step::Input("5432"),
        Step::Input(""),
        Step::Choose("Background"),
        Step::Choose("Back to VM selection"),
        Step::Choose("Back to project selection"),
        Step::Choose("Back to main menu"),
        Step::Choose("Active Tunnels (1)"),
        Step::Choose("Back to main menu"),
        Step::Choose("Exit"),
    ]);

    let mut session = session(
        registry(&dir, &["acme-dev"]),
        Arc::new(single_vm_gateway(PowerState::Running)),
        launcher.clone(),
        NotifyInterrupt::new(),
        steps,
    );

    session.run().await.unwrap();

    assert!(session
        .console()
        .contains("Tunnel active: localhost:5432 -> web-1:5432"));
    assert!(session.console().contains("Closed 1 tunnel(s)"));
    assert_eq!(launcher.terminations(), 1);
    assert!(session.tunnels().is_empty());
}

#[tokio::test]
async fn test_closed_input_ends_session_with_error() {
    let dir = TempDir::new().unwrap();
    let mut session = session(
        registry(&dir, &[]),
        Arc::new(MockCloudGateway::new()),
        Arc::new(FakeLauncher::default()),
        NotifyInterrupt::new(),
        Vec::new(),
    );

    let result = session.run().await;
    assert!(matches!(result, Err(gcpvm_session::SessionError::Prompt(PromptError::Closed))));
}

#[tokio::test(start_paused = true)]
async fn test_background_tunnel_interrupted_while_establishing() {
    let dir = TempDir::new().unwrap();
    let interrupt = NotifyInterrupt::new();
    let launcher = Arc::new(FakeLauncher {
        never_ready: true,
        ..FakeLauncher::default()
    });

    let mut steps = to_vm_menu();
    steps.extend([
        Step::Choose("Port forward"),
        Step::Input("5432"),
        Step::Input(""),
        Step::Choose("Background"),
    ]);
    steps.extend(leave_vm_menu());

    let mut session = session(
        registry(&dir, &["acme-dev"]),
        Arc::new(single_vm_gateway(PowerState::Running)),
        launcher.clone(),
        interrupt.clone(),
        steps,
    );

    let started = Instant::now();
    trigger_after(&interrupt, Duration::from_millis(100));
    session.run().await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(30));
    assert!(session.console().contains("Interrupted, closing tunnel"));
    assert!(session.console().contains("Tunnel closed"));
    assert!(!session.console().contains("Tunnel active"));
    assert_eq!(launcher.terminations(), 1);
    assert!(!session.tunnels().ports().is_held(5432));
    assert!(session.tunnels().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_hung_status_check_interrupted_before_launch() {
    let dir = TempDir::new().unwrap();
    let interrupt = NotifyInterrupt::new();
    let launcher = Arc::new(FakeLauncher::default());
    // First status query opens the action menu, the second guards the tunnel
    let gateway = StallingGateway {
        hang_status_call: Some(2),
        ..StallingGateway::default()
    };

    let mut steps = to_vm_menu();
    steps.extend([
        Step::Choose("Port forward"),
        Step::Input("8080"),
        Step::Input(""),
        Step::Choose("Foreground"),
    ]);
    steps.extend(leave_vm_menu());

    let mut session = session(
        registry(&dir, &["acme-dev"]),
        Arc::new(gateway),
        launcher.clone(),
        interrupt.clone(),
        steps,
    );

    let started = Instant::now();
    trigger_after(&interrupt, Duration::from_secs(1));
    session.run().await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(30));
    assert!(session
        .console()
        .contains("Interrupted before the tunnel was started"));
    assert_eq!(launcher.terminations(), 0);
    assert!(!session.tunnels().ports().is_held(8080));
    assert!(session.tunnels().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_hung_status_check_bounded_by_session_timeout() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(FakeLauncher::default());
    let gateway = StallingGateway {
        hang_status_call: Some(2),
        ..StallingGateway::default()
    };

    let mut steps = to_vm_menu();
    steps.extend([
        Step::Choose("Port forward"),
        Step::Input("8080"),
        Step::Input(""),
        Step::Choose("Foreground"),
    ]);
    steps.extend(leave_vm_menu());

    let mut session = session(
        registry(&dir, &["acme-dev"]),
        Arc::new(gateway),
        launcher.clone(),
        NotifyInterrupt::new(),
        steps,
    );
    assert_eq!(
        session.tunnels().config().status_timeout,
        SessionConfig::default().timeout
    );

    let started = Instant::now();
    session.run().await.unwrap();

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(30));
    assert!(elapsed < Duration::from_secs(60));
    assert!(session
        .console()
        .contains("Failed to check the VM status: Timed out after 30s"));
    assert_eq!(launcher.terminations(), 0);
    assert!(session.tunnels().is_empty());
}

/// Gateway serving `web-1` whose serial port output is `logs`
fn logs_gateway<F>(logs: F) -> MockCloudGateway
where
    F: Fn() -> LogStream + Send + 'static,
{
    let mut gateway = single_vm_gateway(PowerState::Running);
    gateway
        .expect_fetch_logs()
        .withf(|project, source| {
            project == "acme-dev"
                && *source
                    == LogSource::Vm {
                        name: "web-1".to_string(),
                        zone: "us-central1-a".to_string(),
                    }
        })
        .times(1)
        .returning(move |_, _| Ok(logs()));
    gateway
}

fn view_logs_steps() -> Vec<Step> {
    let mut steps = to_vm_menu();
    steps.push(Step::Choose("View serial port logs"));
    steps.extend(leave_vm_menu());
    steps
}

#[tokio::test]
async fn test_serial_logs_streamed_to_end() {
    let dir = TempDir::new().unwrap();
    let gateway = logs_gateway(|| {
        stream::iter(vec![Ok("boot ok".to_string()), Ok("ready".to_string())]).boxed()
    });

    let mut session = session(
        registry(&dir, &["acme-dev"]),
        Arc::new(gateway),
        Arc::new(FakeLauncher::default()),
        NotifyInterrupt::new(),
        view_logs_steps(),
    );

    session.run().await.unwrap();

    assert!(session.console().contains("Logs for web-1"));
    assert!(session.console().contains("boot ok"));
    assert!(session.console().contains("ready"));
    assert!(session.console().contains("End of logs (2 line(s))"));
}

#[tokio::test]
async fn test_serial_logs_stop_on_read_error() {
    let dir = TempDir::new().unwrap();
    let gateway = logs_gateway(|| {
        stream::iter(vec![
            Ok("boot ok".to_string()),
            Err(CloudApiError::new(CloudErrorCode::PermissionDenied, "denied")),
            Ok("never shown".to_string()),
        ])
        .boxed()
    });

    let mut session = session(
        registry(&dir, &["acme-dev"]),
        Arc::new(gateway),
        Arc::new(FakeLauncher::default()),
        NotifyInterrupt::new(),
        view_logs_steps(),
    );

    session.run().await.unwrap();

    assert!(session.console().contains("boot ok"));
    assert!(session.console().contains("Failed to read logs: denied"));
    assert!(!session.console().contains("never shown"));
    assert!(!session.console().contains("End of logs"));
}

#[tokio::test(start_paused = true)]
async fn test_serial_logs_interrupted() {
    let dir = TempDir::new().unwrap();
    let interrupt = NotifyInterrupt::new();
    let gateway = logs_gateway(|| {
        stream::iter(vec![Ok("first".to_string())])
            .chain(stream::pending())
            .boxed()
    });

    let mut session = session(
        registry(&dir, &["acme-dev"]),
        Arc::new(gateway),
        Arc::new(FakeLauncher::default()),
        interrupt.clone(),
        view_logs_steps(),
    );

    trigger_after(&interrupt, Duration::from_secs(1));
    session.run().await.unwrap();

    assert!(session.console().contains("first"));
    assert!(session.console().contains("Log streaming interrupted"));
    assert!(!session.console().contains("End of logs"));
}
