//! Virtualization provider capability
//!
//! Providers are external collaborators. The control plane only needs a small
//! capability set to create, inspect and destroy appliance VMs.

use async_trait::async_trait;
use cfme_common::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Provider kind with a default cluster argument
pub const KIND_RHEVM: &str = "rhevm";

/// Provider kind with a datastore allow-list
pub const KIND_VIRTUALCENTER: &str = "virtualcenter";

/// Arguments for a template deployment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployArgs {
    pub vm_name: String,
    pub cluster: Option<String>,
    pub allowed_datastores: Option<Vec<String>>,
}

/// Operations a provider must support to host appliances
#[async_trait]
pub trait Provider: Send + Sync {
    /// Deploy `template` as a new VM
    async fn deploy_template(&self, template: &str, args: &DeployArgs) -> Result<()>;

    async fn delete_vm(&self, vm_name: &str) -> Result<()>;

    /// Current IP of the VM, `None` while it has not reported one
    async fn get_ip_address(&self, vm_name: &str) -> Result<Option<String>>;

    async fn is_vm_running(&self, vm_name: &str) -> Result<bool>;

    async fn does_vm_exist(&self, vm_name: &str) -> Result<bool>;

    /// Power on and wait until running
    async fn start_vm(&self, vm_name: &str) -> Result<()> {
        Err(Error::Provider(format!("cannot start {}: not supported by this provider", vm_name)))
    }

    /// Power off and wait until stopped
    async fn stop_vm(&self, vm_name: &str) -> Result<()> {
        Err(Error::Provider(format!("cannot stop {}: not supported by this provider", vm_name)))
    }
}

/// Provider instances by catalog key
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(key.into(), provider);
    }

    pub fn with(mut self, key: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.register(key, provider);
        self
    }

    pub fn get(&self, key: &str) -> Result<Arc<dyn Provider>> {
        self.providers
            .get(key)
            .cloned()
            .ok_or_else(|| Error::ConfigLookup(format!("no provider registered for {}", key)))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}
