//! Process-scoped state shared by every appliance facade

use crate::config::{Catalog, CredentialStore};
use crate::ports::PortRegistry;
use crate::signals::SignalBus;
use crate::types::Credentials;
use crate::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default directory of bundled support files (merkyl, patches)
pub const DEFAULT_DATA_DIR: &str = "data";

/// Catalog, credentials, port registry and signal bus for one process.
///
/// Built once at startup and handed to facades as `Arc<Context>`.
#[derive(Debug)]
pub struct Context {
    pub catalog: Catalog,
    pub credentials: CredentialStore,
    pub signals: Arc<SignalBus>,
    pub ports: PortRegistry,
    data_dir: PathBuf,
}

impl Context {
    pub fn new(catalog: Catalog, credentials: CredentialStore) -> Arc<Self> {
        Self::with_data_dir(catalog, credentials, DEFAULT_DATA_DIR)
    }

    pub fn with_data_dir(
        catalog: Catalog,
        credentials: CredentialStore,
        data_dir: impl Into<PathBuf>,
    ) -> Arc<Self> {
        let signals = Arc::new(SignalBus::new());
        Arc::new(Self {
            catalog,
            credentials,
            ports: PortRegistry::new(signals.clone()),
            signals,
            data_dir: data_dir.into(),
        })
    }

    pub fn ssh_credentials(&self) -> Result<Credentials> {
        self.credentials.ssh().cloned()
    }

    pub fn db_credentials(&self) -> Result<Credentials> {
        self.credentials.database().cloned()
    }

    /// Path of a bundled support file
    pub fn data_path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.data_dir.join(relative)
    }
}
