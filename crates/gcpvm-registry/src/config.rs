//! Configuration file model
//!
//! ```json
//! {
//!   "projects": {
//!     "demo": {
//!       "vms": [{ "name": "web-1", "zone": "us-central1-a", "description": "frontend" }]
//!     }
//!   }
//! }
//! ```
//!
//! Keys this model does not know about are kept in `extra` so a load/save
//! cycle never drops anything written by other tools or older versions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Top-level configuration: project id -> project
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub projects: BTreeMap<String, Project>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A configured Google Cloud project
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Project {
    /// Known VMs, in the order they were added
    #[serde(default)]
    pub vms: Vec<VmDescriptor>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A VM as remembered in the configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmDescriptor {
    pub name: String,
    pub zone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl VmDescriptor {
    pub fn new(name: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            zone: zone.into(),
            description: None,
            extra: Map::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Two descriptors refer to the same VM when name and zone match
    pub fn same_vm(&self, name: &str, zone: &str) -> bool {
        self.name == name && self.zone == zone
    }
}

impl Configuration {
    /// Project ids in display order
    pub fn project_ids(&self) -> Vec<&str> {
        self.projects.keys().map(String::as_str).collect()
    }
}

impl Project {
    pub fn find_vm(&self, name: &str, zone: &str) -> Option<&VmDescriptor> {
        self.vms.iter().find(|vm| vm.same_vm(name, zone))
    }
}
