//! Menu entries and the actions they map to

use gcpvm_gateway::{PowerState, VmAction as PowerAction};
use uuid::Uuid;

/// One selectable entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuItem<A> {
    pub label: String,
    pub action: A,
    pub enabled: bool,
}

/// Ordered menu entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Menu<A> {
    items: Vec<MenuItem<A>>,
}

impl<A: Clone> Menu<A> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn item(mut self, label: impl Into<String>, action: A) -> Self {
        self.push(label, action, true);
        self
    }

    pub fn item_if(mut self, enabled: bool, label: impl Into<String>, action: A) -> Self {
        self.push(label, action, enabled);
        self
    }

    pub fn push(&mut self, label: impl Into<String>, action: A, enabled: bool) {
        self.items.push(MenuItem {
            label: label.into(),
            action,
            enabled,
        });
    }

    /// Labels as shown to the user
    pub fn labels(&self) -> Vec<String> {
        self.items
            .iter()
            .map(|item| {
                if item.enabled {
                    item.label.clone()
                } else {
                    format!("[disabled] {}", item.label)
                }
            })
            .collect()
    }

    pub fn get(&self, index: usize) -> Option<&MenuItem<A>> {
        self.items.get(index)
    }

}

impl<A: Clone> Default for Menu<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MainAction {
    ManageVms,
    CloudRun,
    ManageProjects,
    Tunnels,
    Exit,
}

impl MainAction {
    pub fn menu(active_tunnels: usize) -> Menu<Self> {
        Menu::new()
            .item("Manage Virtual Machines", MainAction::ManageVms)
            .item("Cloud Run Services", MainAction::CloudRun)
            .item("Manage Projects", MainAction::ManageProjects)
            .item(format!("Active Tunnels ({})", active_tunnels), MainAction::Tunnels)
            .item("Exit", MainAction::Exit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmAction {
    Ssh,
    Power(PowerAction),
    Details,
    Logs,
    Upload,
    Download,
    RunCommand,
    PortForward,
    Back,
}

impl VmAction {
    /// Entries for a VM in `state`; power actions that do not apply are
    /// listed but disabled
    pub fn menu(state: PowerState) -> Menu<Self> {
        let primary = if state.is_down() {
            PowerAction::Start
        } else {
            PowerAction::Stop
        };

        Menu::new()
            .item("SSH into VM", VmAction::Ssh)
            .item_if(
                state.allows(primary),
                power_label(primary),
                VmAction::Power(primary),
            )
            .item_if(
                state.allows(PowerAction::Reset),
                power_label(PowerAction::Reset),
                VmAction::Power(PowerAction::Reset),
            )
            .item("View VM details", VmAction::Details)
            .item("View serial port logs", VmAction::Logs)
            .item("Upload file to VM", VmAction::Upload)
            .item("Download file from VM", VmAction::Download)
            .item("Run command on VM", VmAction::RunCommand)
            .item("Port forward (IAP tunnel)", VmAction::PortForward)
            .item("Back to VM selection", VmAction::Back)
    }
}

fn power_label(action: PowerAction) -> &'static str {
    match action {
        PowerAction::Start => "Start VM",
        PowerAction::Stop => "Stop VM",
        PowerAction::Reset => "Reset VM",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Details,
    Logs,
    Revisions,
    Deploy,
    Rollback,
    Back,
}

impl ServiceAction {
    pub fn menu() -> Menu<Self> {
        Menu::new()
            .item("View service details", ServiceAction::Details)
            .item("View service logs", ServiceAction::Logs)
            .item("List revisions", ServiceAction::Revisions)
            .item("Deploy new image", ServiceAction::Deploy)
            .item("Roll back to a revision", ServiceAction::Rollback)
            .item("Back to service selection", ServiceAction::Back)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectAdminAction {
    List,
    Add,
    Remove,
    Back,
}

impl ProjectAdminAction {
    pub fn menu() -> Menu<Self> {
        Menu::new()
            .item("List projects", ProjectAdminAction::List)
            .item("Add project", ProjectAdminAction::Add)
            .item("Remove project", ProjectAdminAction::Remove)
            .item("Back to main menu", ProjectAdminAction::Back)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelAction {
    Close(Uuid),
    CloseAll,
    Back,
}

/// Port-forward mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    /// Block the menu until interrupted
    Foreground,
    /// Keep running while the menus are used
    Background,
}

impl ForwardMode {
    pub fn menu() -> Menu<Self> {
        Menu::new()
            .item("Foreground (Ctrl+C to stop)", ForwardMode::Foreground)
            .item("Background (manage under Active Tunnels)", ForwardMode::Background)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled(menu: &Menu<VmAction>, action: VmAction) -> Option<bool> {
        (0..)
            .map_while(|i| menu.get(i))
            .find(|item| item.action == action)
            .map(|item| item.enabled)
    }

    #[test]
    fn test_running_vm_menu() {
        let menu = VmAction::menu(PowerState::Running);
        assert_eq!(enabled(&menu, VmAction::Power(PowerAction::Stop)), Some(true));
        assert_eq!(enabled(&menu, VmAction::Power(PowerAction::Reset)), Some(true));
        assert_eq!(enabled(&menu, VmAction::Power(PowerAction::Start)), None);
    }

    #[test]
    fn test_stopped_vm_menu() {
        let menu = VmAction::menu(PowerState::Terminated);
        assert_eq!(enabled(&menu, VmAction::Power(PowerAction::Start)), Some(true));
        assert_eq!(enabled(&menu, VmAction::Power(PowerAction::Reset)), Some(false));
        assert!(menu.labels().contains(&"[disabled] Reset VM".to_string()));
    }

    #[test]
    fn test_unknown_state_disables_power() {
        let menu = VmAction::menu(PowerState::Unknown);
        assert_eq!(enabled(&menu, VmAction::Power(PowerAction::Stop)), Some(false));
        assert_eq!(enabled(&menu, VmAction::Power(PowerAction::Reset)), Some(false));
    }

    #[test]
    fn test_main_menu_shows_tunnel_count() {
        let menu = MainAction::menu(2);
        assert!(menu.get(5).is_none());
        let labels = menu.labels();
        assert!(labels.contains(&"Active Tunnels (2)".to_string()));
        assert_eq!(labels.last().map(String::as_str), Some("Exit"));
    }
}
