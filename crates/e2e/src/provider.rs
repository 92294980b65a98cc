//! Simulated virtualization provider

use crate::lab::LabState;
use async_trait::async_trait;
use cfme_appliance::{DeployArgs, Provider};
use cfme_common::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Provider deploying lab templates as lab hosts
pub struct LabProvider {
    state: Arc<Mutex<LabState>>,
}

impl LabProvider {
    pub fn new(state: Arc<Mutex<LabState>>) -> Self {
        Self { state }
    }

    fn address_of(state: &LabState, vm_name: &str) -> Result<String> {
        state
            .vms
            .get(vm_name)
            .cloned()
            .ok_or_else(|| Error::Provider(format!("VM {} does not exist", vm_name)))
    }

    fn set_power(&self, vm_name: &str, powered: bool) -> Result<()> {
        let mut state = self.state.lock();
        let address = Self::address_of(&state, vm_name)?;
        let host = state.host_mut(&address)?;
        host.powered = powered;
        if !powered {
            host.evm_running = false;
        }
        Ok(())
    }
}

#[async_trait]
impl Provider for LabProvider {
    async fn deploy_template(&self, template: &str, args: &DeployArgs) -> Result<()> {
        let mut state = self.state.lock();
        let version = state
            .templates
            .get(template)
            .cloned()
            .ok_or_else(|| Error::Provider(format!("template {} not found", template)))?;
        if state.vms.contains_key(&args.vm_name) {
            return Err(Error::Provider(format!("VM {} already exists", args.vm_name)));
        }
        let address = state.allocate_address();
        debug!(template, vm = %args.vm_name, %address, "deploying lab template");
        state.add_host(&address, &version);
        state.vms.insert(args.vm_name.clone(), address);
        state.deployments.push((template.to_string(), args.clone()));
        Ok(())
    }

    async fn delete_vm(&self, vm_name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let address = Self::address_of(&state, vm_name)?;
        state.vms.remove(vm_name);
        state.hosts.remove(&address);
        state.databases.remove(&address);
        Ok(())
    }

    async fn get_ip_address(&self, vm_name: &str) -> Result<Option<String>> {
        let state = self.state.lock();
        Ok(state
            .vms
            .get(vm_name)
            .filter(|address| state.hosts.get(*address).is_some_and(|h| h.powered))
            .cloned())
    }

    async fn is_vm_running(&self, vm_name: &str) -> Result<bool> {
        let state = self.state.lock();
        let address = Self::address_of(&state, vm_name)?;
        Ok(state.host(&address)?.powered)
    }

    async fn does_vm_exist(&self, vm_name: &str) -> Result<bool> {
        Ok(self.state.lock().vms.contains_key(vm_name))
    }

    async fn start_vm(&self, vm_name: &str) -> Result<()> {
        self.set_power(vm_name, true)
    }

    async fn stop_vm(&self, vm_name: &str) -> Result<()> {
        self.set_power(vm_name, false)
    }
}
