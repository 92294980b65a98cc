//! CFME appliance lab
//!
//! An in-memory stand-in for a virtualization provider, a fleet of
//! appliances and their postgres instances. It plugs into the control plane
//! through the `Connector` and `Provider` seams, so provisioning, database
//! enablement, configuration writes and readiness waits run unmodified
//! against it.
//!
//! ```text
//! Provisioner ──► LabProvider ──┐
//!                               ├──► LabState (hosts, databases, VMs)
//! IPAppliance ──► LabConnector ─┤
//!                  ├─ LabShell ─┤   interprets appliance commands
//!                  ├─ LabVmdb ──┤   miq_servers / configurations
//!                  └─ LabProbe ─┘   web UI status
//! ```

pub mod lab;
pub mod provider;
pub mod shell;
pub mod vmdb;

pub use lab::{Database, Host, Lab, LabConnector, LabState, ServerRow, DEFAULT_VMDB, LAB_PROVIDER};
pub use provider::LabProvider;
pub use shell::LabShell;
pub use vmdb::{LabProbe, LabVmdb};

/// Install a test subscriber honouring `RUST_LOG`; repeated calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
