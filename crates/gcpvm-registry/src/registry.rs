//! In-memory project registry kept in sync with the configuration file
//!
//! Every mutation is applied to a copy of the configuration, saved, and only
//! then committed, so memory and disk agree after each successful call and a
//! failed save leaves the registry untouched. External edits to the file while
//! the registry is open are not picked up.

use thiserror::Error;
use tracing::info;

use crate::config::{Configuration, Project, VmDescriptor};
use crate::store::{ConfigError, ConfigStore};

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Project '{0}' already exists")]
    DuplicateProject(String),

    #[error("VM '{name}' ({zone}) already exists in project '{project}'")]
    DuplicateVm {
        project: String,
        name: String,
        zone: String,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("Invalid project id '{0}': must be non-empty and contain no whitespace")]
    InvalidProjectId(String),
}

/// Configured projects and their VMs
#[derive(Debug)]
pub struct Registry {
    store: ConfigStore,
    config: Configuration,
}

impl Registry {
    /// Load the registry from its store
    pub fn open(store: ConfigStore) -> Result<Self, RegistryError> {
        let config = store.load()?;
        Ok(Self { store, config })
    }

    /// Wrap an already loaded configuration
    pub fn with_configuration(store: ConfigStore, config: Configuration) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    /// Project ids in display order
    pub fn list_projects(&self) -> Vec<String> {
        self.config.projects.keys().cloned().collect()
    }

    pub fn project(&self, id: &str) -> Option<&Project> {
        self.config.projects.get(id)
    }

    /// Add an empty project
    pub fn add_project(&mut self, id: &str) -> Result<(), RegistryError> {
        let id = id.trim();
        Self::validate_project_id(id)?;
        if self.config.projects.contains_key(id) {
            return Err(RegistryError::DuplicateProject(id.to_string()));
        }

        let mut next = self.config.clone();
        next.projects.insert(id.to_string(), Project::default());
        self.commit(next)?;

        info!(project = %id, "Project added");
        Ok(())
    }

    /// Remove a project and all of its VM descriptors
    pub fn remove_project(&mut self, id: &str) -> Result<(), RegistryError> {
        if !self.config.projects.contains_key(id) {
            return Err(RegistryError::NotFound(format!("Project '{}'", id)));
        }

        let mut next = self.config.clone();
        next.projects.remove(id);
        self.commit(next)?;

        info!(project = %id, "Project removed");
        Ok(())
    }

    /// Remember a VM under a project
    pub fn add_vm(&mut self, project: &str, vm: VmDescriptor) -> Result<(), RegistryError> {
        let existing = self.require_project(project)?;
        if existing.find_vm(&vm.name, &vm.zone).is_some() {
            return Err(RegistryError::DuplicateVm {
                project: project.to_string(),
                name: vm.name,
                zone: vm.zone,
            });
        }

        let mut next = self.config.clone();
        if let Some(entry) = next.projects.get_mut(project) {
            entry.vms.push(vm);
        }
        self.commit(next)
    }

    /// Forget a VM by name
    pub fn remove_vm(&mut self, project: &str, name: &str) -> Result<(), RegistryError> {
        let existing = self.require_project(project)?;
        if !existing.vms.iter().any(|vm| vm.name == name) {
            return Err(RegistryError::NotFound(format!(
                "VM '{}' in project '{}'",
                name, project
            )));
        }

        let mut next = self.config.clone();
        if let Some(entry) = next.projects.get_mut(project) {
            entry.vms.retain(|vm| vm.name != name);
        }
        self.commit(next)
    }

    /// Add VMs reported by the cloud that the configuration does not know yet
    ///
    /// Returns how many descriptors were added. Nothing is written when the
    /// configuration already lists every discovered VM.
    pub fn merge_discovered(
        &mut self,
        project: &str,
        discovered: &[VmDescriptor],
    ) -> Result<usize, RegistryError> {
        let existing = self.require_project(project)?;
        let new_vms: Vec<VmDescriptor> = discovered
            .iter()
            .filter(|vm| existing.find_vm(&vm.name, &vm.zone).is_none())
            .cloned()
            .collect();

        if new_vms.is_empty() {
            return Ok(0);
        }

        let added = new_vms.len();
        let mut next = self.config.clone();
        if let Some(entry) = next.projects.get_mut(project) {
            entry.vms.extend(new_vms);
        }
        self.commit(next)?;

        info!(project = %project, added, "Recorded discovered VMs");
        Ok(added)
    }

    fn require_project(&self, id: &str) -> Result<&Project, RegistryError> {
        self.config
            .projects
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(format!("Project '{}'", id)))
    }

    fn validate_project_id(id: &str) -> Result<(), RegistryError> {
        if id.is_empty() || id.chars().any(char::is_whitespace) {
            return Err(RegistryError::InvalidProjectId(id.to_string()));
        }
        Ok(())
    }

    fn commit(&mut self, next: Configuration) -> Result<(), RegistryError> {
        self.store.save(&next)?;
        self.config = next;
        Ok(())
    }
}
