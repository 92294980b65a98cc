//! Simulated appliance shell
//!
//! Interprets the commands the control plane issues against the lab state.
//! Anything not modelled succeeds with empty output.

use crate::lab::{unreachable, Database, LabState};
use async_trait::async_trait;
use cfme_common::{CommandOutput, Error, Result, Shell, TransferOptions, VMDB_ROOT};
use parking_lot::Mutex;
use regex::Regex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Shell on one lab host
pub struct LabShell {
    state: Arc<Mutex<LabState>>,
    address: String,
}

impl LabShell {
    pub fn new(state: Arc<Mutex<LabState>>, address: &str) -> Self {
        Self {
            state,
            address: address.to_string(),
        }
    }
}

#[async_trait]
impl Shell for LabShell {
    fn hostname(&self) -> &str {
        &self.address
    }

    async fn run_command_with_timeout(&self, command: &str, _timeout: Duration) -> Result<CommandOutput> {
        let mut state = self.state.lock();
        let host = state.host_mut(&self.address)?;
        if !host.powered {
            return Err(unreachable(&self.address));
        }
        host.commands.push(command.to_string());
        trace!(address = %self.address, command, "lab command");
        if host.failing.iter().any(|p| command.starts_with(p.as_str())) {
            return Ok(CommandOutput::new(1, format!("{}: simulated failure", command)));
        }
        Ok(execute(&mut state, &self.address, command))
    }

    async fn put_file_with(&self, local: &Path, remote: &str, _options: &TransferOptions) -> Result<()> {
        let content = std::fs::read(local)?;
        let mut state = self.state.lock();
        state.host_mut(&self.address)?.files.insert(remote.to_string(), content);
        Ok(())
    }

    async fn get_file_with(&self, remote: &str, local: &Path, _options: &TransferOptions) -> Result<()> {
        let content = {
            let state = self.state.lock();
            state.host(&self.address)?.files.get(remote).cloned()
        };
        match content {
            Some(content) => Ok(std::fs::write(local, content)?),
            None => Err(Error::shell_step(
                &self.address,
                format!("get {}", remote),
                "No such file or directory",
            )),
        }
    }
}

fn ok(output: impl Into<String>) -> CommandOutput {
    CommandOutput::new(0, output)
}

fn fail(output: impl Into<String>) -> CommandOutput {
    CommandOutput::new(1, output)
}

fn status(success: bool) -> CommandOutput {
    CommandOutput::new(if success { 0 } else { 1 }, "")
}

fn capture(pattern: &str, text: &str) -> Option<String> {
    Regex::new(pattern)
        .ok()?
        .captures(text)?
        .get(1)
        .map(|m| m.as_str().to_string())
}

fn text_file(state: &LabState, address: &str, path: &str) -> Option<String> {
    state
        .hosts
        .get(address)?
        .files
        .get(path)
        .map(|c| String::from_utf8_lossy(c).into_owned())
}

/// Run one command against the lab
fn execute(state: &mut LabState, address: &str, command: &str) -> CommandOutput {
    let Some(host) = state.hosts.get(address) else {
        return fail("no such host");
    };

    if command == format!("cat {}/VERSION", VMDB_ROOT) {
        return ok(format!("{}\n", host.version));
    }
    if command == format!("cat {}/GUID", VMDB_ROOT) {
        return ok(format!("{}\n", host.guid));
    }
    if command == format!("cat {}/REGION", VMDB_ROOT) {
        return ok(format!("{}\n", host.region));
    }
    if command == format!("cat {}/config/vmdb.yml.db", VMDB_ROOT) {
        return match &host.db_address {
            Some(db) => {
                let db_host = if db == address { "localhost" } else { db.as_str() };
                ok(format!(
                    "---\nserver:\n  host: {}\n  database: vmdb_production\n",
                    db_host
                ))
            }
            None => fail("cat: vmdb.yml.db: No such file or directory"),
        };
    }
    if command == "cat /proc/uptime" {
        return ok(format!("{:.2} 1000.00\n", host.uptime().as_secs_f64()));
    }
    if command == "ip address show" {
        return ok(format!("inet {}/24 scope global eth0\n", address));
    }
    if command == "ls -l /bin/appliance_console_cli" {
        return status(host.has_cli);
    }

    if command.starts_with("appliance_console_cli") {
        let region = capture(r"--region (\d+)", command)
            .and_then(|r| r.parse().ok())
            .unwrap_or(0);
        return if command.contains("--internal") {
            enable_internal(state, address, region)
        } else {
            match capture(r"--hostname (\S+)", command) {
                Some(db_host) => enable_external(state, address, &db_host, region),
                None => fail("appliance_console_cli: missing --hostname"),
            }
        };
    }

    if let Some(script_path) = command.strip_prefix("ruby ") {
        let Some(script) = text_file(state, address, script_path.trim()) else {
            return fail(format!("ruby: No such file or directory -- {}", script_path));
        };
        let region = capture(r":region => (\d+)", &script)
            .and_then(|r| r.parse().ok())
            .unwrap_or(0);
        if script.contains("InternalDatabaseConfiguration") {
            return enable_internal(state, address, region);
        }
        return match capture(r":host => '([^']+)'", &script) {
            Some(db_host) => enable_external(state, address, &db_host, region),
            None => fail("unsupported ruby script"),
        };
    }

    if command.contains("bin/rails runner") {
        return load_config(state, address, command);
    }
    if command.contains("bin/rake") {
        return ok("");
    }

    if command == "service evmserverd restart"
        || command == "service evmserverd start"
        || command == "killall -9 ruby; service evmserverd start"
    {
        return if state.start_evm(address) {
            ok("Starting evmserverd: [  OK  ]")
        } else {
            fail("Starting evmserverd: [FAILED] database unavailable")
        };
    }
    if command == "service evmserverd stop" {
        if let Some(host) = state.hosts.get_mut(address) {
            host.evm_running = false;
        }
        return ok("Stopping evmserverd: [  OK  ]");
    }
    if command == "service postgresql92-postgresql restart" {
        if let Some(db) = state.databases.get_mut(address) {
            db.online = true;
        }
        return ok("Starting postgresql92-postgresql service: [  OK  ]");
    }

    if command.starts_with("psql") {
        let db = state.databases.get(address).filter(|db| db.online);
        if command.contains("information_schema.tables") {
            return status(db.is_some_and(|db| db.migrated));
        }
        if command.contains("select now()") || command.contains("pg_database") {
            return status(db.is_some());
        }
        return ok("ALTER ROLE");
    }

    if command == "reboot" {
        if let Some(host) = state.hosts.get_mut(address) {
            host.boot = Instant::now();
            host.uptime_base = Duration::ZERO;
            host.evm_running = false;
        }
        state.start_evm(address);
        return ok("");
    }

    if let Some((path, body)) = heredoc(command) {
        return match state.hosts.get_mut(address) {
            Some(host) => {
                host.files.insert(path, body.into_bytes());
                ok("")
            }
            None => fail("no such host"),
        };
    }
    if let Some(path) = command.strip_prefix("cat ") {
        return match text_file(state, address, path.trim()) {
            Some(content) => ok(content),
            None => fail(format!("cat: {}: No such file or directory", path)),
        };
    }

    ok("")
}

/// `cat > PATH <<TAG ... TAG` as `(PATH, body)`
fn heredoc(command: &str) -> Option<(String, String)> {
    let (header, rest) = command.split_once('\n')?;
    let (path, tag) = header.strip_prefix("cat > ")?.split_once(" <<")?;
    let tag = tag.trim();
    let mut body = String::new();
    for line in rest.lines() {
        if line.trim() == tag {
            return Some((path.trim().to_string(), body));
        }
        body.push_str(line);
        body.push('\n');
    }
    None
}

fn enable_internal(state: &mut LabState, address: &str, region: u32) -> CommandOutput {
    let Some(host) = state.hosts.get_mut(address) else {
        return fail("no such host");
    };
    host.db_address = Some(address.to_string());
    host.region = region;
    let (guid, version) = (host.guid.clone(), host.version.clone());

    let db = state
        .databases
        .entry(address.to_string())
        .or_insert_with(Database::default);
    db.online = true;
    db.migrated = true;
    db.register(&guid, &version);

    state.start_evm(address);
    ok("Database configured")
}

fn enable_external(state: &mut LabState, address: &str, db_host: &str, region: u32) -> CommandOutput {
    let Some((guid, version)) = state
        .hosts
        .get(address)
        .map(|h| (h.guid.clone(), h.version.clone()))
    else {
        return fail("no such host");
    };
    match state.databases.get_mut(db_host) {
        Some(db) if db.online => db.register(&guid, &version),
        _ => return fail(format!("could not connect to server at {}", db_host)),
    }
    if let Some(host) = state.hosts.get_mut(address) {
        host.db_address = Some(db_host.to_string());
        host.region = region;
    }
    state.start_evm(address);
    ok("Database configured")
}

/// Rails runner executing the configuration loader
fn load_config(state: &mut LabState, address: &str, command: &str) -> CommandOutput {
    let Some(script_path) = command.split_whitespace().last() else {
        return fail("rails runner: missing script");
    };
    let Some(script) = text_file(state, address, script_path) else {
        return fail(format!("rails runner: cannot load {}", script_path));
    };
    let (Some(name), Some(file)) = (
        capture(r"VMDB::Config\.new\('([^']+)'\)", &script),
        capture(r"YAML\.load_file\('([^']+)'\)", &script),
    ) else {
        return fail("rails runner: unsupported script");
    };
    let Some(yaml) = text_file(state, address, &file) else {
        return fail(format!("Errno::ENOENT: No such file or directory - {}", file));
    };
    if serde_yaml::from_str::<serde_yaml::Value>(&yaml).is_err() {
        return fail("Psych::SyntaxError");
    }

    let Some(host) = state.hosts.get(address) else {
        return fail("no such host");
    };
    let guid = host.guid.clone();
    let db = host
        .db_address
        .as_ref()
        .and_then(|db| state.databases.get_mut(db))
        .filter(|db| db.online);
    match db {
        Some(db) => {
            db.settings.insert((guid, name), yaml);
            ok("CONFIG_LOADED\n")
        }
        None => fail("PG::ConnectionBad: could not connect to server"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heredoc() {
        let (path, body) = heredoc("cat > /etc/motd <<EOF\nhello\n\nworld\nEOF\n").unwrap();
        assert_eq!(path, "/etc/motd");
        assert_eq!(body, "hello\n\nworld\n");

        assert!(heredoc("cat /etc/motd").is_none());
        assert!(heredoc("cat > /etc/motd <<EOF\nunterminated\n").is_none());
    }
}
