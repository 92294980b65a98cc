//! CFME appliance control plane
//!
//! - [`IPAppliance`]: facade over the SSH, database and web UI of one appliance
//! - [`Appliance`]: an appliance VM on a provider
//! - [`ApplianceSet`]: a primary with secondaries attached to its database
//! - [`Provisioner`]: deploys appliances from catalog templates

pub mod appliance;
pub mod config_store;
pub mod connector;
pub mod ipappliance;
pub mod plan;
pub mod provider;
pub mod provisioner;
pub mod scripts;
pub mod set;

#[cfg(test)]
pub(crate) mod testing;

pub use appliance::{Appliance, DEFAULT_NAME};
pub use connector::{Connector, NetworkConnector};
pub use ipappliance::{ExternalDbOptions, IPAppliance, InternalDbOptions, RhelUpdate};
pub use plan::{configure, AppliancePlan, CustomConfigure, Step};
pub use provider::{DeployArgs, Provider, ProviderRegistry};
pub use provisioner::{generate_vm_name, ProvisionRequest, Provisioner};
pub use set::{provision_appliance_set, ApplianceSet, ApplianceSetSpec, MemberSpec};
