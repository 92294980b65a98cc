//! Scripted collaborators for unit tests

use crate::connector::Connector;
use crate::provider::{DeployArgs, Provider};
use async_trait::async_trait;
use cfme_common::{
    CommandOutput, Credentials, DbTarget, Error, Result, Shell, TableInfo, TransferOptions, Vmdb,
    WebProbe, WebStatus,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shell answering commands by prefix; unknown commands succeed silently
pub struct ScriptedShell {
    hostname: String,
    responses: Mutex<Vec<(String, CommandOutput)>>,
    commands: Mutex<Vec<String>>,
    uploads: Mutex<Vec<(PathBuf, String)>>,
}

impl ScriptedShell {
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            responses: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
        }
    }

    /// Answer commands starting with `prefix`; later answers win
    pub fn respond(&self, prefix: &str, rc: u32, output: &str) {
        self.responses
            .lock()
            .push((prefix.to_string(), CommandOutput::new(rc, output)));
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub fn uploads(&self) -> Vec<(PathBuf, String)> {
        self.uploads.lock().clone()
    }
}

#[async_trait]
impl Shell for ScriptedShell {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    async fn run_command_with_timeout(&self, command: &str, _timeout: Duration) -> Result<CommandOutput> {
        self.commands.lock().push(command.to_string());
        let responses = self.responses.lock();
        Ok(responses
            .iter()
            .rev()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_else(|| CommandOutput::new(0, "")))
    }

    async fn put_file_with(&self, local: &Path, remote: &str, _options: &TransferOptions) -> Result<()> {
        self.uploads.lock().push((local.to_path_buf(), remote.to_string()));
        Ok(())
    }

    async fn get_file_with(&self, _remote: &str, local: &Path, _options: &TransferOptions) -> Result<()> {
        std::fs::write(local, b"")?;
        Ok(())
    }
}

/// Database answering configuration lookups from a shared map
pub struct StaticDb {
    address: String,
    settings: Arc<Mutex<HashMap<String, String>>>,
}

#[async_trait]
impl Vmdb for StaticDb {
    fn address(&self) -> &str {
        &self.address
    }

    async fn table_names(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn table(&self, name: &str) -> Result<TableInfo> {
        Err(Error::NoSuchTable(name.to_string()))
    }

    async fn fetch_column(&self, _sql: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn server_settings(&self, _guid: &str, name: &str) -> Result<Option<String>> {
        Ok(self.settings.lock().get(name).cloned())
    }
}

/// Web probe replaying a script; the last status repeats
#[derive(Default)]
pub struct ScriptedProbe {
    statuses: Mutex<Vec<WebStatus>>,
    cursor: AtomicUsize,
}

#[async_trait]
impl WebProbe for ScriptedProbe {
    async fn probe(&self) -> WebStatus {
        let statuses = self.statuses.lock();
        let at = self.cursor.fetch_add(1, Ordering::SeqCst);
        statuses
            .get(at)
            .or_else(|| statuses.last())
            .copied()
            .unwrap_or(WebStatus::Down)
    }
}

/// Connector handing out one scripted shell for every host
pub struct ScriptedConnector {
    shell: Arc<ScriptedShell>,
    web: Arc<ScriptedProbe>,
    settings: Arc<Mutex<HashMap<String, String>>>,
    shell_ports: Mutex<Vec<u16>>,
    ports_open: AtomicBool,
}

impl ScriptedConnector {
    pub fn new(shell: Arc<ScriptedShell>) -> Self {
        Self {
            shell,
            web: Arc::new(ScriptedProbe::default()),
            settings: Arc::new(Mutex::new(HashMap::new())),
            shell_ports: Mutex::new(Vec::new()),
            ports_open: AtomicBool::new(true),
        }
    }

    pub fn web_script(&self, statuses: &[WebStatus]) {
        *self.web.statuses.lock() = statuses.to_vec();
        self.web.cursor.store(0, Ordering::SeqCst);
    }

    pub fn set_setting(&self, name: &str, yaml: &str) {
        self.settings.lock().insert(name.to_string(), yaml.to_string());
    }

    pub fn set_ports_open(&self, open: bool) {
        self.ports_open.store(open, Ordering::SeqCst);
    }

    /// Ports of every shell opened so far
    pub fn shell_ports(&self) -> Vec<u16> {
        self.shell_ports.lock().clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn shell(&self, _host: &str, port: u16, _credentials: &Credentials) -> Result<Arc<dyn Shell>> {
        self.shell_ports.lock().push(port);
        Ok(self.shell.clone())
    }

    fn vmdb(&self, target: DbTarget) -> Arc<dyn Vmdb> {
        Arc::new(StaticDb {
            address: target.address,
            settings: self.settings.clone(),
        })
    }

    fn web(&self, _url: &str) -> Result<Arc<dyn WebProbe>> {
        Ok(self.web.clone())
    }

    async fn port_open(&self, _host: &str, _port: u16) -> bool {
        self.ports_open.load(Ordering::SeqCst)
    }
}

/// Provider keeping VMs in memory; new VMs report `ip_prefix.N`
pub struct MemoryProvider {
    ip_prefix: String,
    vms: Mutex<BTreeMap<String, (String, DeployArgs, bool)>>,
    deployments: Mutex<Vec<DeployArgs>>,
}

impl MemoryProvider {
    pub fn new(ip_prefix: &str) -> Self {
        Self {
            ip_prefix: ip_prefix.to_string(),
            vms: Mutex::new(BTreeMap::new()),
            deployments: Mutex::new(Vec::new()),
        }
    }

    pub fn add_vm(&self, name: &str) {
        let ip = format!("{}.{}", self.ip_prefix, self.vms.lock().len() + 1);
        self.vms
            .lock()
            .insert(name.to_string(), (ip, DeployArgs::default(), true));
    }

    pub fn deployments(&self) -> Vec<DeployArgs> {
        self.deployments.lock().clone()
    }

    pub fn vm_names(&self) -> Vec<String> {
        self.vms.lock().keys().cloned().collect()
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    async fn deploy_template(&self, _template: &str, args: &DeployArgs) -> Result<()> {
        self.deployments.lock().push(args.clone());
        let mut vms = self.vms.lock();
        let ip = format!("{}.{}", self.ip_prefix, vms.len() + 1);
        vms.insert(args.vm_name.clone(), (ip, args.clone(), true));
        Ok(())
    }

    async fn delete_vm(&self, vm_name: &str) -> Result<()> {
        self.vms.lock().remove(vm_name);
        Ok(())
    }

    async fn get_ip_address(&self, vm_name: &str) -> Result<Option<String>> {
        Ok(self.vms.lock().get(vm_name).map(|(ip, _, _)| ip.clone()))
    }

    async fn is_vm_running(&self, vm_name: &str) -> Result<bool> {
        Ok(self.vms.lock().get(vm_name).is_some_and(|(_, _, running)| *running))
    }

    async fn does_vm_exist(&self, vm_name: &str) -> Result<bool> {
        Ok(self.vms.lock().contains_key(vm_name))
    }

    async fn start_vm(&self, vm_name: &str) -> Result<()> {
        match self.vms.lock().get_mut(vm_name) {
            Some(vm) => {
                vm.2 = true;
                Ok(())
            }
            None => Err(Error::Provider(format!("no vm {}", vm_name))),
        }
    }

    async fn stop_vm(&self, vm_name: &str) -> Result<()> {
        match self.vms.lock().get_mut(vm_name) {
            Some(vm) => {
                vm.2 = false;
                Ok(())
            }
            None => Err(Error::Provider(format!("no vm {}", vm_name))),
        }
    }
}
