//! Provider-aware appliance
//!
//! Wraps an [`IPAppliance`] whose address is resolved lazily from the
//! provider hosting the VM, and adds VM lifecycle control.

use crate::connector::Connector;
use crate::ipappliance::IPAppliance;
use crate::plan::{self, CustomConfigure};
use crate::provider::Provider;
use cfme_common::wait::wait_for;
use cfme_common::{Context, Result, VersionTag};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::info;

/// Server name of a freshly deployed appliance
pub const DEFAULT_NAME: &str = "EVM";

const IP_TIMEOUT: Duration = Duration::from_secs(30);
const IP_DELAY: Duration = Duration::from_secs(5);

/// Appliance running as a VM on a provider
pub struct Appliance {
    provider_key: String,
    provider: Arc<dyn Provider>,
    vm_name: String,
    ctx: Arc<Context>,
    connector: Arc<dyn Connector>,
    name: Mutex<String>,
    address: OnceCell<String>,
    ipapp: OnceCell<IPAppliance>,
}

impl Appliance {
    pub fn new(
        provider_key: impl Into<String>,
        provider: Arc<dyn Provider>,
        vm_name: impl Into<String>,
        ctx: Arc<Context>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            provider_key: provider_key.into(),
            provider,
            vm_name: vm_name.into(),
            ctx,
            connector,
            name: Mutex::new(DEFAULT_NAME.to_string()),
            address: OnceCell::new(),
            ipapp: OnceCell::new(),
        }
    }

    /// Provider-side identifier of the VM
    pub fn vm_name(&self) -> &str {
        &self.vm_name
    }

    pub fn provider_key(&self) -> &str {
        &self.provider_key
    }

    /// Server name as last set through this object
    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    /// IP address reported by the provider, polled until it appears
    pub async fn address(&self) -> Result<&str> {
        let address = self
            .address
            .get_or_try_init(|| {
                let condition = format!("ip address of {}", self.vm_name);
                async move {
                    wait_for(&condition, IP_TIMEOUT, IP_DELAY, || {
                        self.provider.get_ip_address(&self.vm_name)
                    })
                    .await
                }
            })
            .await?;
        Ok(address.as_str())
    }

    /// Facade over the resolved address
    pub async fn ipapp(&self) -> Result<&IPAppliance> {
        let address = self.address().await?.to_string();
        self.ipapp
            .get_or_try_init(|| async move {
                Ok(IPAppliance::new(address, self.ctx.clone(), self.connector.clone()))
            })
            .await
    }

    pub async fn version(&self) -> Result<VersionTag> {
        self.ipapp().await?.version().await
    }

    /// Configure with the version's default plan, or with `custom` options
    pub async fn configure(&self, custom: Option<&CustomConfigure>) -> Result<()> {
        info!("Configuring appliance VM {}", self.vm_name);
        let ipapp = self.ipapp().await?;
        let current = self.name();
        if let Some(renamed) = plan::configure(ipapp, custom, &current).await? {
            *self.name.lock() = renamed;
        }
        Ok(())
    }

    /// Write a new server name into the vmdb configuration.
    ///
    /// The database must be up; the name takes effect after evm restarts.
    pub async fn rename(&self, new_name: &str) -> Result<()> {
        self.ipapp().await?.rename_server(new_name).await?;
        *self.name.lock() = new_name.to_string();
        Ok(())
    }

    /// Reset the automate model to its shipped state
    pub async fn reset_automate_model(&self) -> Result<()> {
        let ipapp = self.ipapp().await?;
        ipapp
            .ssh()
            .await?
            .run_rake("evm:automate:reset")
            .await?
            .check(ipapp.address(), "reset_automate_model")?;
        Ok(())
    }

    /// Delete the VM on the provider
    pub async fn destroy(&self) -> Result<()> {
        info!("Destroying appliance VM {}", self.vm_name);
        self.provider.delete_vm(&self.vm_name).await
    }

    pub async fn is_running(&self) -> Result<bool> {
        self.provider.is_vm_running(&self.vm_name).await
    }

    pub async fn does_vm_exist(&self) -> Result<bool> {
        self.provider.does_vm_exist(&self.vm_name).await
    }

    pub async fn start(&self) -> Result<()> {
        info!("Starting appliance VM {}", self.vm_name);
        self.provider.start_vm(&self.vm_name).await
    }

    pub async fn stop(&self) -> Result<()> {
        info!("Stopping appliance VM {}", self.vm_name);
        self.provider.stop_vm(&self.vm_name).await
    }
}

impl std::fmt::Debug for Appliance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Appliance")
            .field("provider", &self.provider_key)
            .field("vm_name", &self.vm_name)
            .field("name", &*self.name.lock())
            .field("address", &self.address.get())
            .finish()
    }
}
