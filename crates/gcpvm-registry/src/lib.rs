//! Project/VM registry
//!
//! Holds the configured projects and their VM descriptors in memory and keeps
//! them in sync with a JSON configuration file (by default `~/.gcpvm/config.json`).

pub mod config;
pub mod registry;
pub mod store;

pub use config::{Configuration, Project, VmDescriptor};
pub use registry::{Registry, RegistryError};
pub use store::{ConfigError, ConfigStore};
