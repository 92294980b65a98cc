//! Appliance facade addressed by IP
//!
//! [`IPAppliance`] unifies the SSH, database and web UI interfaces of one
//! appliance and carries its bring-up operations. Clients are cached and
//! rebuilt after `server_config_changed` (written configuration or changed
//! ports). The database accessor is additionally keyed by the current
//! database address.

use crate::config_store;
use crate::connector::Connector;
use crate::scripts::{self, ExternalDbScript, PG_DATA};
use cfme_common::http::PROBE_TIMEOUT;
use cfme_common::wait::{wait_for, wait_until};
use cfme_common::{
    AppliancePhase, Catalog, CommandOutput, Context, DbTarget, Error, Result, Shell, SignalHandle,
    VersionTag, Vmdb, WebProbe, WebStatus, SERVER_CONFIG_CHANGED, SERVER_DETAILS_CHANGED,
    VMDB_DATABASE, VMDB_ROOT,
};
use parking_lot::Mutex;
use rand::distributions::{Alphanumeric, DistString};
use rand::seq::SliceRandom;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, instrument, trace, warn};

/// Default budget of [`IPAppliance::wait_for_web_ui`]
pub const WEB_UI_TIMEOUT: Duration = Duration::from_secs(900);
const WEB_UI_DELAY: Duration = Duration::from_secs(10);

/// Number of probes behind one [`IPAppliance::is_web_running`] verdict
pub const WEB_CHECKS: u32 = 3;
const WEB_CHECK_SPACING: Duration = Duration::from_secs(3);

/// Default budget of [`IPAppliance::wait_for_db`]
pub const DB_TIMEOUT: Duration = Duration::from_secs(180);
const DB_DELAY: Duration = Duration::from_secs(20);

/// Default budget of [`IPAppliance::wait_for_ssh`]
pub const SSH_TIMEOUT: Duration = Duration::from_secs(600);
const SSH_DELAY: Duration = Duration::from_secs(5);

const REBOOT_TIMEOUT: Duration = Duration::from_secs(600);
const REBOOT_DELAY: Duration = Duration::from_secs(10);

/// Default budget of [`IPAppliance::wait_for_server_name`]
pub const SERVER_NAME_TIMEOUT: Duration = Duration::from_secs(120);
const SERVER_NAME_DELAY: Duration = Duration::from_secs(5);

const YUM_TIMEOUT: Duration = Duration::from_secs(3600);

/// Environment variable overriding the RHEL update repositories
pub const UPDATES_URLS_ENV: &str = "updates_urls";

const DB_ONLINE_PROBE: &str = r#"psql -U postgres -t  -c "select now()" postgres"#;
const DB_HAS_DATABASE_PROBE: &str = r#"psql -U postgres -t  -c "SELECT datname FROM pg_database WHERE datname LIKE 'vmdb_%';" postgres | grep -q vmdb_production"#;
const DB_HAS_TABLES_PROBE: &str = r#"psql -U postgres -t  -c "SELECT * FROM information_schema.tables WHERE table_schema = 'public';" vmdb_production | grep -q vmdb_production"#;

/// Options of [`IPAppliance::enable_internal_db_with`]
#[derive(Debug, Clone, Default)]
pub struct InternalDbOptions {
    pub region: u32,
    /// Fetch the encryption key from this appliance instead of generating one
    pub key_address: Option<String>,
    pub db_password: Option<String>,
    pub ssh_password: Option<String>,
}

/// Options of [`IPAppliance::enable_external_db_with`]
#[derive(Debug, Clone)]
pub struct ExternalDbOptions {
    pub db_address: String,
    pub region: u32,
    pub db_name: Option<String>,
    pub db_username: Option<String>,
    pub db_password: Option<String>,
}

impl ExternalDbOptions {
    pub fn new(db_address: impl Into<String>, region: u32) -> Self {
        Self {
            db_address: db_address.into(),
            region,
            db_name: None,
            db_username: None,
            db_password: None,
        }
    }
}

/// Options of [`IPAppliance::update_rhel`]
#[derive(Debug, Clone)]
pub struct RhelUpdate {
    /// Repository URLs; empty means environment or catalog defaults
    pub urls: Vec<String>,
    pub reboot: bool,
    pub skip_broken: bool,
}

impl Default for RhelUpdate {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            reboot: true,
            skip_broken: false,
        }
    }
}

/// Repositories used by `update_rhel` when the caller names none.
///
/// A non-empty `env_urls` is the only source. Otherwise the catalog's RHEL
/// URL is used, plus the RHSCL URL on 5.3 appliances.
pub fn resolve_update_urls(catalog: &Catalog, version: &VersionTag, env_urls: Option<&str>) -> Vec<String> {
    if let Some(env) = env_urls.filter(|e| !e.trim().is_empty()) {
        return env.split_whitespace().map(str::to_string).collect();
    }
    let mut urls = Vec::new();
    if let Some(url) = &catalog.basic_info.rhel_updates_url {
        urls.push(url.clone());
    }
    if version.in_series("5.3") {
        if let Some(url) = &catalog.basic_info.rhscl_updates_url {
            urls.push(url.clone());
        }
    }
    urls
}

#[derive(Default)]
struct ClientCache {
    ssh: Option<Arc<dyn Shell>>,
    db: Option<Arc<dyn Vmdb>>,
    db_shell: Option<Arc<dyn Shell>>,
    web: Option<Arc<dyn WebProbe>>,
}

impl ClientCache {
    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Appliance facade
pub struct IPAppliance {
    address: String,
    ctx: Arc<Context>,
    connector: Arc<dyn Connector>,
    clients: Arc<Mutex<ClientCache>>,
    subscription: SignalHandle,
    db_address: Mutex<Option<String>>,
    phase: Mutex<AppliancePhase>,
    version: OnceCell<VersionTag>,
    guid: OnceCell<String>,
}

impl IPAppliance {
    pub fn new(address: impl Into<String>, ctx: Arc<Context>, connector: Arc<dyn Connector>) -> Self {
        let address = address.into();
        let clients = Arc::new(Mutex::new(ClientCache::default()));

        let weak = Arc::downgrade(&clients);
        let owner = address.clone();
        let subscription = ctx.signals.register(SERVER_CONFIG_CHANGED, move || {
            if let Some(clients) = weak.upgrade() {
                clients.lock().clear();
                trace!(address = %owner, "cached clients invalidated");
            }
            Ok(())
        });

        Self {
            address,
            ctx,
            connector,
            clients,
            subscription,
            db_address: Mutex::new(None),
            phase: Mutex::new(AppliancePhase::default()),
            version: OnceCell::new(),
            guid: OnceCell::new(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Base URL of the web UI
    pub fn url(&self) -> String {
        format!("https://{}/", self.address)
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn phase(&self) -> AppliancePhase {
        *self.phase.lock()
    }

    fn advance(&self, phase: AppliancePhase) {
        let mut current = self.phase.lock();
        if *current < phase {
            debug!(address = %self.address, "phase {} -> {}", *current, phase);
            *current = phase;
        }
    }

    fn set_phase(&self, phase: AppliancePhase) {
        let mut current = self.phase.lock();
        debug!(address = %self.address, "phase {} -> {}", *current, phase);
        *current = phase;
    }

    fn demote(&self, phase: AppliancePhase) {
        let mut current = self.phase.lock();
        if *current > phase {
            debug!(address = %self.address, "phase {} -> {}", *current, phase);
            *current = phase;
        }
    }

    pub(crate) fn mark_configured(&self) {
        self.set_phase(AppliancePhase::Configured);
    }

    // Clients

    /// Cached shell on this appliance
    pub async fn ssh(&self) -> Result<Arc<dyn Shell>> {
        let cached = self.clients.lock().ssh.clone();
        if let Some(shell) = cached {
            return Ok(shell);
        }
        let credentials = self.ctx.ssh_credentials()?;
        let shell = self
            .connector
            .shell(&self.address, self.ctx.ports.ssh(), &credentials)
            .await?;
        self.clients.lock().ssh = Some(shell.clone());
        Ok(shell)
    }

    /// Shell on the database host
    pub async fn db_shell(&self) -> Result<Arc<dyn Shell>> {
        let db_address = self.db_address().await?;
        if db_address == self.address {
            return self.ssh().await;
        }
        let cached = self.clients.lock().db_shell.clone();
        if let Some(shell) = cached.filter(|s| s.hostname() == db_address) {
            return Ok(shell);
        }
        let credentials = self.ctx.ssh_credentials()?;
        let shell = self
            .connector
            .shell(&db_address, self.ctx.ports.ssh(), &credentials)
            .await?;
        self.clients.lock().db_shell = Some(shell.clone());
        Ok(shell)
    }

    /// Cached database accessor for the current database address
    pub async fn db(&self) -> Result<Arc<dyn Vmdb>> {
        let db_address = self.db_address().await?;
        let cached = self.clients.lock().db.clone();
        if let Some(db) = cached.filter(|db| db.address() == db_address) {
            return Ok(db);
        }
        let target = DbTarget::new(&db_address, self.ctx.ports.db(), self.ctx.db_credentials()?);
        let db = self.connector.vmdb(target);
        self.clients.lock().db = Some(db.clone());
        Ok(db)
    }

    fn web(&self) -> Result<Arc<dyn WebProbe>> {
        let cached = self.clients.lock().web.clone();
        if let Some(web) = cached {
            return Ok(web);
        }
        let web = self.connector.web(&self.url())?;
        self.clients.lock().web = Some(web.clone());
        Ok(web)
    }

    /// Drop every cached client
    pub fn invalidate_clients(&self) {
        self.clients.lock().clear();
    }

    /// Appliance version, read once over SSH
    pub async fn version(&self) -> Result<VersionTag> {
        self.version
            .get_or_try_init(|| async { self.ssh().await?.get_version().await })
            .await
            .cloned()
    }

    // Reachability

    pub async fn is_ssh_running(&self) -> bool {
        self.connector.port_open(&self.address, self.ctx.ports.ssh()).await
    }

    /// Wait until the SSH port accepts connections
    #[instrument(skip_all, fields(address = %self.address))]
    pub async fn wait_for_ssh(&self, timeout: Duration) -> Result<()> {
        let this = self;
        wait_until("ssh", timeout, SSH_DELAY, true, move || async move {
            Ok(this.is_ssh_running().await)
        })
        .await?;
        self.advance(AppliancePhase::Reachable);
        Ok(())
    }

    /// Triple-checked web UI state.
    ///
    /// Three probes three seconds apart: all up is `true`, none up is
    /// `false`, anything in between is `unsure_default`.
    pub async fn is_web_running(&self, unsure_default: bool) -> Result<bool> {
        let web = self.web()?;
        let mut up = 0;
        for attempt in 0..WEB_CHECKS {
            if attempt > 0 {
                tokio::time::sleep(WEB_CHECK_SPACING).await;
            }
            let status = tokio::time::timeout(PROBE_TIMEOUT, web.probe())
                .await
                .unwrap_or(WebStatus::Down);
            trace!(address = %self.address, attempt, %status, "web probe");
            if status == WebStatus::Up {
                up += 1;
            }
        }
        Ok(match up {
            0 => false,
            n if n == WEB_CHECKS => true,
            _ => unsure_default,
        })
    }

    /// Poll the web UI every ten seconds until it is (or is not) running
    #[instrument(skip_all, fields(address = %self.address))]
    pub async fn wait_for_web_ui(&self, timeout: Duration, running: bool) -> Result<()> {
        info!("Waiting for web UI to {}", if running { "appear" } else { "disappear" });
        let this = self;
        // An unsure verdict never satisfies the wait in either direction
        wait_until("web_ui", timeout, WEB_UI_DELAY, running, move || async move {
            this.is_web_running(!running).await
        })
        .await?;
        if running {
            self.advance(AppliancePhase::WebReady);
        }
        Ok(())
    }

    // Database

    /// Current database address, discovered from the appliance on first use
    pub async fn db_address(&self) -> Result<String> {
        let known = self.db_address.lock().clone();
        if let Some(address) = known {
            return Ok(address);
        }
        let discovered = self.discover_db_address().await?;
        *self.db_address.lock() = Some(discovered.clone());
        Ok(discovered)
    }

    fn set_db_address(&self, address: &str) {
        *self.db_address.lock() = Some(address.to_string());
        let mut clients = self.clients.lock();
        clients.db = None;
        clients.db_shell = None;
    }

    /// Read the database host from the appliance's database config.
    ///
    /// Local addresses map to the appliance address; an unreadable config
    /// falls back to it as well.
    pub async fn discover_db_address(&self) -> Result<String> {
        let config = match self
            .get_yaml_file(&format!("{}/config/vmdb.yml.db", VMDB_ROOT))
            .await
        {
            Ok(config) => config,
            Err(e @ Error::Connectivity { .. }) => return Err(e),
            Err(e) => {
                error!("Unable to pull database address from {}: {}", self.address, e);
                return Ok(self.address.clone());
            }
        };
        let Some(host) = config_store::lookup(&config, &["server", "host"]).and_then(|h| h.as_str())
        else {
            error!("Database config on {} has no server.host", self.address);
            return Ok(self.address.clone());
        };
        let host = host.trim().to_string();
        let local_addresses = self.ssh().await?.run_command("ip address show").await?;
        if local_addresses.output.contains(&host) || host.starts_with("127") || host.contains("localhost") {
            Ok(self.address.clone())
        } else {
            Ok(host)
        }
    }

    /// Whether a database target is known
    pub fn is_db_enabled(&self) -> bool {
        self.db_address.lock().is_some()
    }

    pub async fn is_db_internal(&self) -> Result<bool> {
        Ok(self.db_address().await? == self.address)
    }

    async fn db_probe(&self, command: &str) -> Result<bool> {
        Ok(self.db_shell().await?.run_command(command).await?.success())
    }

    pub async fn db_online(&self) -> Result<bool> {
        self.db_probe(DB_ONLINE_PROBE).await
    }

    pub async fn db_has_database(&self) -> Result<bool> {
        self.db_probe(DB_HAS_DATABASE_PROBE).await
    }

    pub async fn db_has_tables(&self) -> Result<bool> {
        self.db_probe(DB_HAS_TABLES_PROBE).await
    }

    /// Database online, created and migrated; stops at the first failing probe
    pub async fn is_db_ready(&self) -> Result<bool> {
        Ok(self.db_online().await? && self.db_has_database().await? && self.db_has_tables().await?)
    }

    /// Poll [`IPAppliance::is_db_ready`] every twenty seconds
    #[instrument(skip_all, fields(address = %self.address))]
    pub async fn wait_for_db(&self, timeout: Duration) -> Result<()> {
        let this = self;
        wait_until("db", timeout, DB_DELAY, true, move || async move {
            this.is_db_ready().await
        })
        .await?;
        self.advance(AppliancePhase::DbReady);
        Ok(())
    }

    pub async fn has_cli(&self) -> Result<bool> {
        Ok(self
            .ssh()
            .await?
            .run_command("ls -l /bin/appliance_console_cli")
            .await?
            .success())
    }

    /// Upload a ruby script to a random scratch path, run it and remove it
    async fn run_ruby_script(&self, shell: &dyn Shell, script: &str) -> Result<CommandOutput> {
        let mut local = tempfile::NamedTempFile::new()?;
        local.write_all(script.as_bytes())?;
        local.flush()?;
        let remote = format!("/tmp/{}", Alphanumeric.sample_string(&mut rand::thread_rng(), 8));
        shell.put_file(local.path(), &remote).await?;
        let result = shell.run_command(&format!("ruby {}", remote)).await?;
        let _ = shell.run_command(&format!("rm {}", remote)).await?;
        Ok(result)
    }

    /// Enable the internal database in `region` with a fresh encryption key
    pub async fn enable_internal_db(&self, region: u32) -> Result<()> {
        self.enable_internal_db_with(InternalDbOptions {
            region,
            ..Default::default()
        })
        .await
    }

    /// Point the appliance at its own database and enable it.
    ///
    /// The caller waits for the database with [`IPAppliance::wait_for_db`].
    #[instrument(skip_all, fields(address = %self.address, region = options.region))]
    pub async fn enable_internal_db_with(&self, options: InternalDbOptions) -> Result<()> {
        info!("Enabling internal DB (region {}) on {}", options.region, self.address);
        self.set_db_address(&self.address);

        let shell = self.ssh().await?;
        let db_password = match options.db_password {
            Some(password) => password,
            None => self.ctx.db_credentials()?.password,
        };
        let ssh_password = match options.ssh_password {
            Some(password) => password,
            None => self.ctx.ssh_credentials()?.password,
        };

        let result = if self.has_cli().await? {
            shell
                .run_command(&scripts::cli_internal_db(
                    options.region,
                    options.key_address.as_deref(),
                    &db_password,
                    &ssh_password,
                ))
                .await?
        } else {
            self.run_ruby_script(shell.as_ref(), &scripts::enable_db(options.region, None))
                .await?
        };
        result.check(&self.address, "enable_internal_db")?;
        self.set_phase(AppliancePhase::DbEnabled);
        Ok(())
    }

    /// Attach to the database on `db_address`
    pub async fn enable_external_db(&self, db_address: &str, region: u32) -> Result<()> {
        self.enable_external_db_with(ExternalDbOptions::new(db_address, region))
            .await
    }

    /// Attach to an external database.
    ///
    /// With the appliance CLI the encryption key is first copied over from the
    /// database host, which must accept the appliance's SSH credentials.
    #[instrument(skip_all, fields(address = %self.address, db = %options.db_address))]
    pub async fn enable_external_db_with(&self, options: ExternalDbOptions) -> Result<()> {
        info!(
            "Enabling external DB (db_address {}, region {}) on {}",
            options.db_address, options.region, self.address
        );
        self.set_db_address(&options.db_address);

        let credentials = self.ctx.db_credentials()?;
        let db = ExternalDbScript {
            host: &options.db_address,
            database: options.db_name.as_deref().unwrap_or(VMDB_DATABASE),
            username: options.db_username.as_deref().unwrap_or(&credentials.username),
            password: options.db_password.as_deref().unwrap_or(&credentials.password),
        };

        let shell = self.ssh().await?;
        let result = if self.has_cli().await? {
            self.copy_v2_key(&options.db_address).await?;
            shell.run_command(&scripts::cli_external_db(options.region, &db)).await?
        } else {
            self.run_ruby_script(shell.as_ref(), &scripts::enable_db(options.region, Some(&db)))
                .await?
        };
        if !result.success() {
            error!("Error enabling external DB on {}", self.address);
        }
        result.check(&self.address, "enable_external_db")?;
        self.set_phase(AppliancePhase::DbEnabled);
        Ok(())
    }

    async fn copy_v2_key(&self, db_address: &str) -> Result<()> {
        let credentials = self.ctx.ssh_credentials()?;
        let master = self
            .connector
            .shell(db_address, self.ctx.ports.ssh(), &credentials)
            .await?;
        let key = tempfile::NamedTempFile::new()?;
        let remote = scripts::v2_key_path();
        master.get_file(&remote, key.path()).await?;
        self.ssh().await?.put_file(key.path(), &remote).await
    }

    // Services

    async fn run_step(&self, step: &str, command: &str) -> Result<CommandOutput> {
        self.ssh().await?.run_command(command).await?.check(&self.address, step)
    }

    /// Restart `evmserverd`; `rude` kills the ruby workers first
    #[instrument(skip_all, fields(address = %self.address))]
    pub async fn restart_evm_service(&self, rude: bool) -> Result<()> {
        info!("Restarting evm service");
        let command = if rude {
            "killall -9 ruby; service evmserverd start"
        } else {
            "service evmserverd restart"
        };
        self.run_step("restart_evm_service", command).await?;
        self.demote(AppliancePhase::DbReady);
        self.ctx.signals.fire(SERVER_DETAILS_CHANGED);
        Ok(())
    }

    pub async fn stop_evm_service(&self) -> Result<()> {
        info!("Stopping evm service on {}", self.address);
        self.run_step("stop_evm_service", "service evmserverd stop").await?;
        self.demote(AppliancePhase::DbReady);
        Ok(())
    }

    pub async fn start_evm_service(&self) -> Result<()> {
        info!("Starting evm service on {}", self.address);
        self.run_step("start_evm_service", "service evmserverd start").await?;
        Ok(())
    }

    /// Reboot and wait until uptime resets
    #[instrument(skip_all, fields(address = %self.address))]
    pub async fn reboot(&self, wait_for_web_ui: bool) -> Result<()> {
        info!("Rebooting appliance");
        let old_uptime = self.ssh().await?.uptime().await?;
        // The session usually dies with the machine
        if let Err(e) = self.ssh().await?.run_command("reboot").await {
            debug!("reboot command ended with {}", e);
        }

        let this = self;
        wait_for("appliance to reboot", REBOOT_TIMEOUT, REBOOT_DELAY, move || async move {
            let uptime = match this.ssh().await {
                Ok(shell) => shell.uptime().await,
                Err(e) => Err(e),
            };
            Ok(match uptime {
                Ok(uptime) => (uptime < old_uptime).then_some(()),
                Err(e) => {
                    trace!("still rebooting: {}", e);
                    None
                }
            })
        })
        .await?;
        self.demote(AppliancePhase::DbEnabled);

        if wait_for_web_ui {
            self.wait_for_web_ui(WEB_UI_TIMEOUT, true).await?;
        }
        Ok(())
    }

    // Bring-up steps

    /// Sync the clock against a random configured NTP server
    #[instrument(skip_all, fields(address = %self.address))]
    pub async fn fix_ntp_clock(&self) -> Result<()> {
        info!("Fixing appliance clock");
        let server = self
            .ctx
            .catalog
            .clock_servers
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| Error::ConfigLookup("No clock servers configured".into()))?;
        self.run_step("fix_ntp_clock", &format!("ntpdate {}", server)).await?;
        Ok(())
    }

    /// Precompile static assets and restart; nothing to do on 5.2
    #[instrument(skip_all, fields(address = %self.address))]
    pub async fn precompile_assets(&self) -> Result<()> {
        if self.version().await?.in_series("5.2") {
            return Ok(());
        }
        info!("Precompiling assets");
        self.ssh()
            .await?
            .run_rake("assets:precompile")
            .await?
            .check(&self.address, "precompile_assets")?;
        self.restart_evm_service(false).await
    }

    /// Clone automate domain `source` into a writable `dest`; no-op before 5.3
    #[instrument(skip_all, fields(address = %self.address))]
    pub async fn clone_domain(&self, source: &str, dest: &str) -> Result<()> {
        if self.version().await?.is_older_than("5.3") {
            return Ok(());
        }
        info!("Cloning automate domain {} to {}", source, dest);
        self.wait_for_db(DB_TIMEOUT).await?;

        let shell = self.ssh().await?;
        shell
            .run_command(&format!("mkdir -p /tmp/{}", source))
            .await?
            .check(&self.address, "clone_domain: mkdir")?;

        let export = format!(
            "evm:automate:export DOMAIN={src} EXPORT_DIR=/tmp/{src} PREVIEW=false OVERWRITE=true",
            src = source
        );
        info!("Exporting domain ({})", export);
        shell
            .run_rake(&export)
            .await?
            .check(&self.address, "clone_domain: export")?;

        shell
            .run_command(&format!(
                "sed -i 's/system: true/system: false/g' /tmp/{src}/{src}/__domain__.yaml",
                src = source
            ))
            .await?
            .check(&self.address, "clone_domain: make writable")?;

        let import = format!(
            "evm:automate:import DOMAIN={src} IMPORT_DIR=/tmp/{src} PREVIEW=false \
             OVERWRITE=true IMPORT_AS={dst} ENABLED=true",
            src = source,
            dst = dest
        );
        info!("Importing domain ({})", import);
        shell
            .run_rake(&import)
            .await?
            .check(&self.address, "clone_domain: import")?;
        Ok(())
    }

    /// Install the merkyl log relay and open its port
    #[instrument(skip_all, fields(address = %self.address))]
    pub async fn deploy_merkyl(&self, start: bool) -> Result<()> {
        info!("Deploying merkyl");
        let shell = self.ssh().await?;
        let bundle = self.ctx.data_path("bundles/merkyl");

        self.run_step("deploy_merkyl: mkdir", "mkdir -p /root/merkyl").await?;
        for (src, dest) in [
            ("__init__.py", "__init__.py"),
            ("merkyl.tpl", "merkyl.tpl"),
            ("bottle.py.dontflake", "bottle.py"),
            ("allowed.files", "allowed.files"),
        ] {
            debug!("Sending {} to appliance", src);
            shell
                .put_file(&bundle.join(src), &format!("/root/merkyl/{}", dest))
                .await?;
        }
        shell.put_file(&bundle.join("merkyl"), "/etc/init.d/merkyl").await?;
        self.run_step("deploy_merkyl: chmod", "chmod 775 /etc/init.d/merkyl").await?;
        self.run_step(
            "deploy_merkyl: iptables",
            "/bin/bash -c 'if ! [[ $(iptables -L -n | grep \"state NEW tcp dpt:8192\") ]]; then \
             iptables -I INPUT 6 -m state --state NEW -m tcp -p tcp --dport 8192 -j ACCEPT; fi'",
        )
        .await?;

        if start {
            self.run_step("deploy_merkyl: start", "service merkyl restart").await?;
            self.run_step("deploy_merkyl: enable", "chkconfig merkyl on").await?;
        }
        Ok(())
    }

    /// Add update repositories, run `yum update` and optionally reboot
    #[instrument(skip_all, fields(address = %self.address))]
    pub async fn update_rhel(&self, update: RhelUpdate) -> Result<()> {
        info!("Updating appliance");
        let urls = if update.urls.is_empty() {
            let env = std::env::var(UPDATES_URLS_ENV).ok();
            resolve_update_urls(&self.ctx.catalog, &self.version().await?, env.as_deref())
        } else {
            update.urls
        };

        let shell = self.ssh().await?;
        for url in &urls {
            let repo_id = Alphanumeric
                .sample_string(&mut rand::thread_rng(), 8)
                .to_lowercase();
            shell
                .run_command(&scripts::yum_repo(&repo_id, url))
                .await?
                .check(&self.address, "update_rhel: write repo file")?;
        }

        info!("Running rhel updates on appliance");
        let skip = if update.skip_broken { " --skip-broken" } else { "" };
        shell
            .run_command_with_timeout(&format!("yum update -y --nogpgcheck{}", skip), YUM_TIMEOUT)
            .await?
            .check(&self.address, "update_rhel")?;

        if update.reboot {
            self.reboot(false).await?;
        }
        Ok(())
    }

    /// Patch the UI's ajax wait code; no-op from 5.3 on.
    ///
    /// Returns whether the patched file was put back.
    #[instrument(skip_all, fields(address = %self.address))]
    pub async fn patch_ajax_wait(&self, undo: bool) -> Result<bool> {
        if !self.version().await?.is_older_than("5.3") {
            return Ok(false);
        }
        info!("Patching ajax wait code");
        let patch_file = self.ctx.data_path("patches/ajax_wait.diff");
        if !patch_file.exists() {
            warn!("{} not found, not patching", patch_file.display());
            return Ok(false);
        }
        let workdir = tempfile::tempdir()?;
        let remote = format!("{}/public/javascripts/application.js", VMDB_ROOT);
        let local = workdir.path().join("application.js");

        let shell = self.ssh().await?;
        shell.get_file(&remote, &local).await?;

        let mut patch = tokio::process::Command::new("patch");
        patch.current_dir(workdir.path()).arg("-p4").arg("-N");
        if undo {
            patch.arg("-R");
        }
        let status = patch
            .args(["-l", "-r-", "-i"])
            .arg(&patch_file)
            .status()
            .await?;

        if status.success() {
            shell.put_file(&local, &remote).await?;
            Ok(true)
        } else {
            warn!("Patch failed, not changing appliance");
            Ok(false)
        }
    }

    /// Accept password logins to postgres from anywhere; no-op before 5.3
    #[instrument(skip_all, fields(address = %self.address))]
    pub async fn loosen_pgssl(&self, with_ssl: bool) -> Result<()> {
        if self.version().await?.is_older_than("5.3") {
            return Ok(());
        }
        info!("Loosening postgres permissions");
        let credentials = self.ctx.db_credentials()?;
        self.run_step(
            "loosen_pgssl: set password",
            &format!(
                "psql -d {} -c \"alter user {} with password '{}'\"",
                VMDB_DATABASE, credentials.username, credentials.password
            ),
        )
        .await?;
        self.run_step(
            "loosen_pgssl: back up pg_hba.conf",
            &format!("mv {data}/pg_hba.conf {data}/pg_hba.conf.sav", data = PG_DATA),
        )
        .await?;
        self.run_step("loosen_pgssl: write pg_hba.conf", &scripts::pg_hba(with_ssl))
            .await?;
        self.run_step(
            "loosen_pgssl: chown pg_hba.conf",
            &format!("chown postgres:postgres {}/pg_hba.conf", PG_DATA),
        )
        .await?;
        self.run_step("loosen_pgssl", "service postgresql92-postgresql restart")
            .await?;
        Ok(())
    }

    // Maintenance

    pub async fn backup_database(&self) -> Result<()> {
        info!("Backing up database on {}", self.address);
        self.ssh()
            .await?
            .run_rake("evm:db:backup:local -- --local-file /tmp/evm_db.backup --dbname vmdb_production")
            .await?
            .check(&self.address, "backup_database")?;
        Ok(())
    }

    /// Restore the local backup with evm stopped
    pub async fn restore_database(&self) -> Result<()> {
        info!("Restoring database on {}", self.address);
        self.stop_evm_service().await?;
        self.ssh()
            .await?
            .run_rake("evm:db:restore:local -- --local-file /tmp/evm_db.backup")
            .await?
            .check(&self.address, "restore_database")?;
        self.start_evm_service().await
    }

    /// Scrub host identity so the VM can be saved as a template
    pub async fn seal_for_templatizing(&self) -> Result<()> {
        info!("Sealing {} for templatizing", self.address);
        let shell = self.ssh().await?;
        self.run_step("seal: host keys", "rm -rf /etc/ssh/ssh_host_*").await?;
        if shell
            .run_command("grep '^HOSTNAME' /etc/sysconfig/network")
            .await?
            .success()
        {
            self.run_step(
                "seal: hostname",
                "sed -i -r -e 's/^HOSTNAME=.*$/HOSTNAME=localhost.localdomain/' /etc/sysconfig/network",
            )
            .await?;
        } else {
            self.run_step(
                "seal: hostname",
                "echo HOSTNAME=localhost.localdomain >> /etc/sysconfig/network",
            )
            .await?;
        }
        self.run_step("seal: HWADDR", "sed -i -r -e '/^HWADDR/d' /etc/sysconfig/network-scripts/ifcfg-eth0")
            .await?;
        self.run_step("seal: UUID", "sed -i -r -e '/^UUID/d' /etc/sysconfig/network-scripts/ifcfg-eth0")
            .await?;
        self.run_step("seal: udev rules", "rm -f /etc/udev/rules.d/70-*").await?;
        // SELinux labels; absent restorecon is not fatal
        shell.run_command("restorecon -R /etc/sysconfig/network-scripts").await?;
        shell.run_command("restorecon /etc/sysconfig/network").await?;
        Ok(())
    }

    /// Walk SSH, database and evm in order and describe the first failure
    #[instrument(skip_all, fields(address = %self.address))]
    pub async fn diagnose_evm_failure(&self) -> Result<Option<String>> {
        info!("Diagnosing EVM failures, this can take a while");

        if !self.is_ssh_running().await {
            return Ok(Some("SSH is not running on the appliance".into()));
        }

        info!("Checking appliance database");
        if !self.db_online().await? {
            let restart = self
                .db_shell()
                .await?
                .run_command("service postgresql92-postgresql restart")
                .await?;
            return Ok(Some(if restart.success() {
                "postgres was not running for unknown reasons".into()
            } else {
                format!("postgres failed to start:\n{}", restart.output)
            }));
        }
        if !self.db_has_database().await? {
            return Ok(Some(format!("{} database does not exist", VMDB_DATABASE)));
        }
        if !self.db_has_tables().await? {
            return Ok(Some(format!("{} has no tables", VMDB_DATABASE)));
        }

        info!("Checking appliance evmserverd service");
        match self.restart_evm_service(false).await {
            Ok(()) => Ok(None),
            Err(Error::ShellStep { output_tail, .. }) => {
                Ok(Some(format!("evmserverd failed to start:\n{}", output_tail)))
            }
            Err(e) => Err(e),
        }
    }

    // Identity and configuration

    /// Server GUID, read once
    pub async fn guid(&self) -> Result<String> {
        self.guid
            .get_or_try_init(|| async {
                let result = self
                    .run_step("read GUID", &format!("cat {}/GUID", VMDB_ROOT))
                    .await?;
                Ok::<_, Error>(result.output.trim().to_string())
            })
            .await
            .cloned()
    }

    /// Region number from the REGION marker file
    pub async fn region(&self) -> Result<u32> {
        let result = self
            .run_step("read REGION", &format!("cat {}/REGION", VMDB_ROOT))
            .await?;
        result
            .output
            .trim()
            .parse()
            .map_err(|_| Error::shell_step(&self.address, "parse REGION", &result.output))
    }

    /// Read and parse a YAML file on the appliance
    pub async fn get_yaml_file(&self, path: &str) -> Result<serde_yaml::Value> {
        let result = self
            .ssh()
            .await?
            .run_command(&format!("cat {}", path))
            .await?
            .check(&self.address, &format!("read {}", path))?;
        Ok(serde_yaml::from_str(&result.output)?)
    }

    /// Configuration document `name` of this server
    pub async fn get_yaml(&self, name: &str) -> Result<serde_yaml::Value> {
        let db = self.db().await?;
        let guid = self.guid().await?;
        config_store::get_yaml(db.as_ref(), &guid, name).await
    }

    /// Write configuration document `name` through the application loader
    #[instrument(skip_all, fields(address = %self.address, name))]
    pub async fn set_yaml(&self, name: &str, data: &serde_yaml::Value) -> Result<()> {
        let shell = self.ssh().await?;
        config_store::set_yaml(shell.as_ref(), &self.ctx.signals, name, data).await
    }

    /// Set the UI session timeout, writing only when it differs.
    ///
    /// Returns whether the configuration was written.
    pub async fn set_session_timeout(&self, seconds: u64) -> Result<bool> {
        let mut vmdb = self.get_yaml("vmdb").await?;
        let current = config_store::lookup(&vmdb, &["session", "timeout"]).and_then(|t| t.as_u64());
        if current == Some(seconds) {
            return Ok(false);
        }
        config_store::assign(&mut vmdb, &["session", "timeout"], seconds.into())?;
        self.set_yaml("vmdb", &vmdb).await?;
        Ok(true)
    }

    /// Write `server.name` into the vmdb configuration.
    ///
    /// Takes effect once evm is restarted.
    #[instrument(skip_all, fields(address = %self.address, new_name))]
    pub async fn rename_server(&self, new_name: &str) -> Result<()> {
        info!("Renaming server to {}", new_name);
        let mut vmdb = self.get_yaml("vmdb").await?;
        config_store::assign(&mut vmdb, &["server", "name"], new_name.into())?;
        self.set_yaml("vmdb", &vmdb).await?;
        self.ctx.signals.fire(SERVER_DETAILS_CHANGED);
        Ok(())
    }

    /// `server.name` from the vmdb configuration
    pub async fn server_name(&self) -> Result<Option<String>> {
        let vmdb = self.get_yaml("vmdb").await?;
        Ok(config_store::lookup(&vmdb, &["server", "name"])
            .and_then(|n| n.as_str())
            .map(str::to_string))
    }

    /// Poll the vmdb configuration until the server carries `name`
    pub async fn wait_for_server_name(&self, name: &str, timeout: Duration) -> Result<()> {
        let this = self;
        wait_until("server_name", timeout, SERVER_NAME_DELAY, true, move || async move {
            Ok(this.server_name().await?.as_deref() == Some(name))
        })
        .await
    }
}

impl Drop for IPAppliance {
    fn drop(&mut self) {
        self.ctx.signals.unregister(self.subscription);
    }
}

impl PartialEq for IPAppliance {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl std::fmt::Debug for IPAppliance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IPAppliance")
            .field("address", &self.address)
            .field("db_address", &*self.db_address.lock())
            .field("phase", &*self.phase.lock())
            .finish()
    }
}
