//! Lab state and the connector handing out simulated clients

use crate::provider::LabProvider;
use crate::shell::LabShell;
use crate::vmdb::{LabProbe, LabVmdb};
use async_trait::async_trait;
use cfme_appliance::{Connector, DeployArgs, IPAppliance, ProviderRegistry, Provisioner};
use cfme_common::config::{ProviderConfig, ProvisioningConfig};
use cfme_common::{
    Catalog, Context, CredentialStore, Credentials, DbTarget, Error, Result, Shell, Vmdb, WebProbe,
    DEFAULT_SSH_PORT,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;

/// Provider key the lab registers itself under
pub const LAB_PROVIDER: &str = "lab";

/// vmdb settings of a freshly registered server
pub const DEFAULT_VMDB: &str = "server:\n  name: EVM\n  zone: default\nsession:\n  timeout: 3600\n";

const MERKYL_FILES: [&str; 5] = [
    "__init__.py",
    "merkyl.tpl",
    "bottle.py.dontflake",
    "allowed.files",
    "merkyl",
];

/// Row of `miq_servers`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRow {
    pub guid: String,
    pub name: String,
    pub version: String,
}

/// A postgres instance on some host
#[derive(Debug, Clone, Default)]
pub struct Database {
    pub online: bool,
    pub migrated: bool,
    pub servers: Vec<ServerRow>,
    /// `(server guid, config name)` -> YAML text
    pub settings: BTreeMap<(String, String), String>,
}

impl Database {
    pub fn usable(&self) -> bool {
        self.online && self.migrated
    }

    /// Add the server row and its default settings unless already present
    pub fn register(&mut self, guid: &str, version: &str) {
        if self.servers.iter().any(|s| s.guid == guid) {
            return;
        }
        self.servers.push(ServerRow {
            guid: guid.to_string(),
            name: "EVM".to_string(),
            version: version.to_string(),
        });
        self.settings
            .insert((guid.to_string(), "vmdb".to_string()), DEFAULT_VMDB.to_string());
    }

    /// Copy `server.name` from the vmdb settings into the server row
    pub fn sync_server_name(&mut self, guid: &str) {
        let name = self
            .settings
            .get(&(guid.to_string(), "vmdb".to_string()))
            .and_then(|raw| serde_yaml::from_str::<serde_yaml::Value>(raw).ok())
            .and_then(|v| v.get("server")?.get("name")?.as_str().map(str::to_string));
        if let (Some(name), Some(row)) = (name, self.servers.iter_mut().find(|s| s.guid == guid)) {
            row.name = name;
        }
    }
}

/// One simulated appliance
#[derive(Debug, Clone)]
pub struct Host {
    pub address: String,
    pub version: String,
    pub guid: String,
    pub region: u32,
    pub powered: bool,
    pub ssh_port: u16,
    pub has_cli: bool,
    pub evm_running: bool,
    pub db_address: Option<String>,
    pub files: BTreeMap<String, Vec<u8>>,
    pub boot: Instant,
    pub uptime_base: Duration,
    pub commands: Vec<String>,
    /// Command prefixes forced to exit 1
    pub failing: Vec<String>,
    /// Ports of every shell opened to this host
    pub connections: Vec<u16>,
}

impl Host {
    fn new(address: &str, version: &str) -> Self {
        let mut files = BTreeMap::new();
        files.insert(
            "/var/www/miq/vmdb/certs/v2_key".to_string(),
            format!("v2-key-of-{}", address).into_bytes(),
        );
        Self {
            address: address.to_string(),
            version: version.to_string(),
            guid: format!("guid-{}", address.replace('.', "-")),
            region: 0,
            powered: true,
            ssh_port: DEFAULT_SSH_PORT,
            has_cli: true,
            evm_running: false,
            db_address: None,
            files,
            boot: Instant::now(),
            uptime_base: Duration::from_secs(3600),
            commands: Vec::new(),
            failing: Vec::new(),
            connections: Vec::new(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.uptime_base + self.boot.elapsed()
    }

    pub fn reachable(&self, port: u16) -> bool {
        self.powered && port == self.ssh_port
    }
}

/// Everything the lab simulates
#[derive(Debug, Default)]
pub struct LabState {
    pub hosts: BTreeMap<String, Host>,
    /// Databases by the address of the host running them
    pub databases: BTreeMap<String, Database>,
    /// Template -> appliance version
    pub templates: BTreeMap<String, String>,
    /// VM name -> host address
    pub vms: BTreeMap<String, String>,
    pub deployments: Vec<(String, DeployArgs)>,
    next_ip: u32,
}

impl LabState {
    pub fn host(&self, address: &str) -> Result<&Host> {
        self.hosts.get(address).ok_or_else(|| unreachable(address))
    }

    pub fn host_mut(&mut self, address: &str) -> Result<&mut Host> {
        self.hosts.get_mut(address).ok_or_else(|| unreachable(address))
    }

    pub fn add_host(&mut self, address: &str, version: &str) {
        self.hosts
            .insert(address.to_string(), Host::new(address, version));
    }

    pub fn allocate_address(&mut self) -> String {
        self.next_ip += 1;
        format!("10.0.0.{}", self.next_ip)
    }

    /// Whether evm on `address` has a usable database behind it
    pub fn db_usable_for(&self, address: &str) -> bool {
        self.hosts
            .get(address)
            .and_then(|h| h.db_address.as_ref())
            .and_then(|db| self.databases.get(db))
            .is_some_and(Database::usable)
    }

    /// Start evm on `address` and refresh its server row
    pub fn start_evm(&mut self, address: &str) -> bool {
        if !self.db_usable_for(address) {
            return false;
        }
        let Some(host) = self.hosts.get_mut(address) else {
            return false;
        };
        host.evm_running = true;
        let guid = host.guid.clone();
        if let Some(db) = host.db_address.as_ref().and_then(|a| self.databases.get_mut(a)) {
            db.sync_server_name(&guid);
        }
        true
    }

    /// Web UI answers with the dashboard
    pub fn web_ready(&self, address: &str) -> bool {
        self.hosts
            .get(address)
            .is_some_and(|h| h.powered && h.evm_running)
            && self.db_usable_for(address)
    }
}

pub(crate) fn unreachable(address: &str) -> Error {
    Error::Connectivity {
        target: address.to_string(),
        reason: "no route to host".to_string(),
    }
}

/// In-memory lab of appliances, databases and one provider.
///
/// Call [`Lab::context`] after registering templates; the catalog is built
/// from the lab at that point.
pub struct Lab {
    state: Arc<Mutex<LabState>>,
    data_dir: TempDir,
}

impl Lab {
    pub fn new() -> Result<Self> {
        let data_dir = tempfile::tempdir()?;
        let merkyl = data_dir.path().join("bundles/merkyl");
        std::fs::create_dir_all(&merkyl)?;
        for file in MERKYL_FILES {
            std::fs::write(merkyl.join(file), format!("# {}\n", file))?;
        }
        Ok(Self {
            state: Arc::new(Mutex::new(LabState::default())),
            data_dir,
        })
    }

    /// Register a provider template deploying `version`
    pub fn add_template(&self, template: &str, version: &str) {
        self.state
            .lock()
            .templates
            .insert(template.to_string(), version.to_string());
    }

    /// Add a running, unconfigured appliance outside the provider
    pub fn add_host(&self, address: &str, version: &str) {
        self.state.lock().add_host(address, version);
    }

    pub fn catalog(&self) -> Catalog {
        let state = self.state.lock();
        let mut management_systems = BTreeMap::new();
        management_systems.insert(
            LAB_PROVIDER.to_string(),
            ProviderConfig {
                kind: "rhevm".to_string(),
                default_cluster: Some("lab-cluster".to_string()),
                ..Default::default()
            },
        );
        Catalog {
            appliance_provisioning: ProvisioningConfig {
                versions: state
                    .templates
                    .iter()
                    .map(|(template, version)| (version.clone(), template.clone()))
                    .collect(),
                default_provider: Some(LAB_PROVIDER.to_string()),
            },
            management_systems,
            clock_servers: vec!["clock.lab".to_string()],
            ..Default::default()
        }
    }

    pub fn credentials() -> CredentialStore {
        CredentialStore::default()
            .with("ssh", Credentials::new("root", "smartvm"))
            .with("database", Credentials::new("root", "smartvm"))
    }

    pub fn context(&self) -> Arc<Context> {
        Context::with_data_dir(self.catalog(), Self::credentials(), self.data_dir.path())
    }

    pub fn connector(&self) -> Arc<LabConnector> {
        Arc::new(LabConnector {
            state: self.state.clone(),
        })
    }

    pub fn provider(&self) -> Arc<LabProvider> {
        Arc::new(LabProvider::new(self.state.clone()))
    }

    pub fn provisioner(&self, ctx: Arc<Context>) -> Provisioner {
        let providers = ProviderRegistry::new().with(LAB_PROVIDER, self.provider());
        Provisioner::new(ctx, providers, self.connector())
    }

    pub fn ipapp(&self, ctx: &Arc<Context>, address: &str) -> IPAppliance {
        IPAppliance::new(address, ctx.clone(), self.connector())
    }

    /// Inspect or mutate the raw lab state
    pub fn with_state<T>(&self, f: impl FnOnce(&mut LabState) -> T) -> T {
        f(&mut self.state.lock())
    }

    pub fn host(&self, address: &str) -> Option<Host> {
        self.state.lock().hosts.get(address).cloned()
    }

    pub fn database(&self, address: &str) -> Option<Database> {
        self.state.lock().databases.get(address).cloned()
    }

    pub fn commands(&self, address: &str) -> Vec<String> {
        self.host(address).map(|h| h.commands).unwrap_or_default()
    }

    /// Make commands starting with `prefix` fail on `address`
    pub fn fail_commands(&self, address: &str, prefix: &str) {
        if let Some(host) = self.state.lock().hosts.get_mut(address) {
            host.failing.push(prefix.to_string());
        }
    }

    pub fn set_ssh_port(&self, address: &str, port: u16) {
        if let Some(host) = self.state.lock().hosts.get_mut(address) {
            host.ssh_port = port;
        }
    }

    pub fn stop_evm(&self, address: &str) {
        if let Some(host) = self.state.lock().hosts.get_mut(address) {
            host.evm_running = false;
        }
    }

    pub fn set_db_online(&self, address: &str, online: bool) {
        if let Some(db) = self.state.lock().databases.get_mut(address) {
            db.online = online;
        }
    }
}

/// Connector resolving every address inside the lab
pub struct LabConnector {
    state: Arc<Mutex<LabState>>,
}

#[async_trait]
impl Connector for LabConnector {
    async fn shell(&self, host: &str, port: u16, _credentials: &Credentials) -> Result<Arc<dyn Shell>> {
        let mut state = self.state.lock();
        let entry = state.host_mut(host)?;
        if !entry.reachable(port) {
            return Err(Error::Connectivity {
                target: format!("{}:{}", host, port),
                reason: "connection refused".to_string(),
            });
        }
        entry.connections.push(port);
        Ok(Arc::new(LabShell::new(self.state.clone(), host)))
    }

    fn vmdb(&self, target: DbTarget) -> Arc<dyn Vmdb> {
        Arc::new(LabVmdb::new(self.state.clone(), &target.address))
    }

    fn web(&self, url: &str) -> Result<Arc<dyn WebProbe>> {
        let host = url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/');
        Ok(Arc::new(LabProbe::new(self.state.clone(), host)))
    }

    async fn port_open(&self, host: &str, port: u16) -> bool {
        self.state
            .lock()
            .hosts
            .get(host)
            .is_some_and(|h| h.reachable(port))
    }
}
