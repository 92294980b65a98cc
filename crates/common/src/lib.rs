//! CFME Common Library
//!
//! Connection primitives, shared types and process-wide registries for the
//! appliance control plane.

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod http;
pub mod ports;
pub mod signals;
pub mod ssh;
pub mod types;
pub mod version;
pub mod wait;

// Re-export commonly used types
pub use config::{Catalog, CredentialStore, ProviderConfig};
pub use context::Context;
pub use db::{Db, TableDescriptor, TableInfo, Vmdb};
pub use error::{Error, Result};
pub use http::{HttpProber, WebProbe};
pub use ports::{PortRegistry, Service};
pub use signals::{SignalBus, SignalHandle, SERVER_CONFIG_CHANGED, SERVER_DETAILS_CHANGED};
pub use ssh::{CommandOutput, Shell, SshClient, SshConfig, TransferOptions};
pub use types::*;
pub use version::VersionTag;

/// Control plane version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
