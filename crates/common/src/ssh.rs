//! SSH executor
//!
//! A long-lived, credentialed shell session to an appliance. Commands return
//! `(exit code, combined output)`; a non-zero exit code is not an error, the
//! caller decides. Dropped sessions are transparently reopened on the next
//! command.

use crate::types::{Credentials, DEFAULT_SSH_PORT, VMDB_ROOT};
use crate::version::VersionTag;
use crate::{Error, Result};
use async_trait::async_trait;
use rand::distributions::{Alphanumeric, DistString};
use russh::client;
use russh::ChannelMsg;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace};

/// Default time a single command may run before it is abandoned
pub const RUNCMD_TIMEOUT: Duration = Duration::from_secs(1200);

/// Default time allowed for the TCP connect and SSH handshake
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of a remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub rc: u32,
    pub output: String,
}

impl CommandOutput {
    pub fn new(rc: u32, output: impl Into<String>) -> Self {
        Self {
            rc,
            output: output.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.rc == 0
    }

    /// Require a zero exit code, naming `step` in the failure
    pub fn check(self, address: &str, step: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            error!(address, step, rc = self.rc, "shell step failed");
            Err(Error::shell_step(address, step, &self.output))
        }
    }
}

/// Options for single-file transfers
#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    /// Permission bits applied to the uploaded file
    pub mode: Option<u32>,
    /// Create the parent directory before uploading
    pub create_parent: bool,
}

/// Remote shell capability of an appliance
#[async_trait]
pub trait Shell: Send + Sync {
    /// Host this shell executes on
    fn hostname(&self) -> &str;

    /// Run `command`, waiting at most `timeout` for it to exit
    async fn run_command_with_timeout(&self, command: &str, timeout: Duration)
        -> Result<CommandOutput>;

    /// Upload a single local file to `remote`
    async fn put_file_with(&self, local: &Path, remote: &str, options: &TransferOptions)
        -> Result<()>;

    /// Download a single remote file to `local`
    async fn get_file_with(&self, remote: &str, local: &Path, options: &TransferOptions)
        -> Result<()>;

    async fn run_command(&self, command: &str) -> Result<CommandOutput> {
        self.run_command_with_timeout(command, RUNCMD_TIMEOUT).await
    }

    async fn put_file(&self, local: &Path, remote: &str) -> Result<()> {
        self.put_file_with(local, remote, &TransferOptions::default()).await
    }

    async fn get_file(&self, remote: &str, local: &Path) -> Result<()> {
        self.get_file_with(remote, local, &TransferOptions::default()).await
    }

    /// Run a script through the rails runner inside the application directory
    async fn run_rails(&self, script: &str) -> Result<CommandOutput> {
        info!("Running rails command `{}`", script);
        self.run_command(&format!("cd {}; bin/rails runner {}", VMDB_ROOT, script))
            .await
    }

    /// Run a rake task inside the application directory
    async fn run_rake(&self, task: &str) -> Result<CommandOutput> {
        info!("Running rake command `{}`", task);
        self.run_command(&format!("cd {}; bin/rake -f {}/Rakefile {}", VMDB_ROOT, VMDB_ROOT, task))
            .await
    }

    /// Read the VERSION file; `master` builds map to the latest sentinel
    async fn get_version(&self) -> Result<VersionTag> {
        let result = self
            .run_command(&format!("cat {}/VERSION", VMDB_ROOT))
            .await?
            .check(self.hostname(), "read VERSION")?;
        VersionTag::parse(&result.output)
    }

    /// Time since boot
    async fn uptime(&self) -> Result<Duration> {
        let result = self
            .run_command("cat /proc/uptime")
            .await?
            .check(self.hostname(), "read uptime")?;
        let seconds = result
            .output
            .split_whitespace()
            .next()
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| Error::shell_step(self.hostname(), "parse uptime", &result.output))?;
        Ok(Duration::from_secs_f64(seconds))
    }

    /// Whether the appliance is a downstream (product) build
    async fn is_appliance_downstream(&self) -> Result<bool> {
        Ok(self.run_command("stat /var/www/miq/vmdb/BUILD").await?.success()
            && self.run_command("rpm -q cfme").await?.success())
    }
}

/// Whether `port` on `host` accepts TCP connections within `timeout`
pub async fn port_open(host: &str, port: u16, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            trace!("{}:{} refused: {}", host, port, e);
            false
        }
        Err(_) => {
            trace!("{}:{} timed out", host, port);
            false
        }
    }
}

/// Connection parameters of an SSH executor
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub hostname: String,
    pub port: u16,
    pub credentials: Credentials,
    pub connect_timeout: Duration,
    /// Mirror remote stdout/stderr to the local process as it arrives
    pub stream_output: bool,
}

impl SshConfig {
    pub fn new(hostname: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            hostname: hostname.into(),
            port: DEFAULT_SSH_PORT,
            credentials,
            connect_timeout: CONNECT_TIMEOUT,
            stream_output: false,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn stream_output(mut self, stream: bool) -> Self {
        self.stream_output = stream;
        self
    }
}

/// Accepts any host key; appliances are rebuilt constantly with fresh keys
struct AcceptAnyHostKey;

#[async_trait]
impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Raw channel result before sudo/quoting concerns
struct RawOutput {
    rc: u32,
    stdout: Vec<u8>,
    combined: Vec<u8>,
}

/// SSH executor backed by russh
pub struct SshClient {
    config: SshConfig,
    session: Mutex<Option<client::Handle<AcceptAnyHostKey>>>,
}

impl SshClient {
    /// Check the SSH port and open a session.
    ///
    /// Fails with a connectivity error when the port is unreachable within
    /// the connect timeout.
    pub async fn connect(config: SshConfig) -> Result<Self> {
        let client = Self {
            config,
            session: Mutex::new(None),
        };
        {
            let mut guard = client.session.lock().await;
            *guard = Some(client.open_session().await?);
        }
        Ok(client)
    }

    /// Client for another host using the same credentials and options
    pub async fn with_hostname(&self, hostname: &str) -> Result<Self> {
        let mut config = self.config.clone();
        config.hostname = hostname.to_string();
        Self::connect(config).await
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    fn is_root(&self) -> bool {
        self.config.credentials.username == "root"
    }

    async fn open_session(&self) -> Result<client::Handle<AcceptAnyHostKey>> {
        let host = &self.config.hostname;
        let port = self.config.port;
        let target = format!("{}:{}", host, port);

        if !port_open(host, port, self.config.connect_timeout).await {
            return Err(Error::Connectivity {
                target,
                reason: "SSH port unavailable".to_string(),
            });
        }

        debug!("Opening SSH session to {}", target);
        let ssh_config = Arc::new(client::Config::default());
        let mut handle = tokio::time::timeout(
            self.config.connect_timeout,
            client::connect(ssh_config, (host.as_str(), port), AcceptAnyHostKey),
        )
        .await
        .map_err(|_| Error::Connectivity {
            target: target.clone(),
            reason: format!(
                "SSH handshake timed out after {}s",
                self.config.connect_timeout.as_secs()
            ),
        })??;

        let creds = &self.config.credentials;
        if !handle
            .authenticate_password(&creds.username, &creds.password)
            .await?
        {
            return Err(Error::Authentication {
                user: creds.username.clone(),
                host: host.clone(),
            });
        }
        Ok(handle)
    }

    /// Run `command` on a fresh channel, reconnecting if the session was dropped
    async fn exec(&self, command: &str, stdin: Option<&[u8]>, timeout: Duration) -> Result<RawOutput> {
        let mut guard = self.session.lock().await;
        let reopen = guard.as_ref().map_or(true, |h| h.is_closed());
        if reopen {
            debug!("SSH session to {} is closed, reconnecting", self.config.hostname);
            *guard = Some(self.open_session().await?);
        }
        let Some(handle) = guard.as_ref() else {
            return Err(Error::Connectivity {
                target: self.config.hostname.clone(),
                reason: "no SSH session".to_string(),
            });
        };

        let run = async {
            let mut channel = handle.channel_open_session().await?;
            channel.exec(true, command).await?;
            if let Some(data) = stdin {
                channel.data(data).await?;
                channel.eof().await?;
            }

            let mut raw = RawOutput {
                rc: 1,
                stdout: Vec::new(),
                combined: Vec::new(),
            };
            let mut stdout = tokio::io::stdout();
            let mut stderr = tokio::io::stderr();
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => {
                        raw.stdout.extend_from_slice(data);
                        raw.combined.extend_from_slice(data);
                        if self.config.stream_output {
                            stdout.write_all(data).await?;
                        }
                    }
                    ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                        raw.combined.extend_from_slice(data);
                        if self.config.stream_output {
                            stderr.write_all(data).await?;
                        }
                    }
                    ChannelMsg::ExitStatus { exit_status } => raw.rc = exit_status,
                    _ => {}
                }
            }
            Ok::<_, Error>(raw)
        };

        tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| {
                error!("Command `{}` timed out after {}s", command, timeout.as_secs());
                Error::Connectivity {
                    target: self.config.hostname.clone(),
                    reason: format!("command timed out after {}s", timeout.as_secs()),
                }
            })?
    }

    /// Wrap for sudo when not logged in as root
    fn wrap(&self, command: &str) -> String {
        if self.is_root() {
            command.to_string()
        } else {
            format!("sudo -i bash -c {}", shell_words::quote(command))
        }
    }

    /// Close the session; the next command reconnects
    pub async fn close(&self) {
        let mut guard = self.session.lock().await;
        if let Some(handle) = guard.take() {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
        }
    }
}

#[async_trait]
impl Shell for SshClient {
    fn hostname(&self) -> &str {
        &self.config.hostname
    }

    async fn run_command_with_timeout(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        info!("Running command `{}`", command);
        let raw = self.exec(&self.wrap(command), None, timeout).await?;
        Ok(CommandOutput::new(
            raw.rc,
            String::from_utf8_lossy(&raw.combined).into_owned(),
        ))
    }

    async fn put_file_with(&self, local: &Path, remote: &str, options: &TransferOptions) -> Result<()> {
        info!("Transferring local file {} to remote {}", local.display(), remote);
        let data = tokio::fs::read(local).await?;

        if options.create_parent {
            if let Some(parent) = Path::new(remote).parent() {
                self.run_command(&format!("mkdir -p {}", shell_words::quote(&parent.to_string_lossy())))
                    .await?
                    .check(self.hostname(), "create remote directory")?;
            }
        }

        // Non-root users cannot write system paths directly; stage in $HOME then move
        let staged = if self.is_root() {
            remote.to_string()
        } else {
            format!(
                "/home/{}/temp_{}",
                self.config.credentials.username,
                Alphanumeric.sample_string(&mut rand::thread_rng(), 8)
            )
        };

        let raw = self
            .exec(
                &format!("cat > {}", shell_words::quote(&staged)),
                Some(&data),
                RUNCMD_TIMEOUT,
            )
            .await?;
        if raw.rc != 0 {
            return Err(Error::shell_step(
                self.hostname(),
                "upload file",
                &String::from_utf8_lossy(&raw.combined),
            ));
        }
        if staged != remote {
            self.run_command(&format!(
                "mv {} {}",
                shell_words::quote(&staged),
                shell_words::quote(remote)
            ))
            .await?
            .check(self.hostname(), "move staged upload")?;
        }
        if let Some(mode) = options.mode {
            self.run_command(&format!("chmod {:o} {}", mode, shell_words::quote(remote)))
                .await?
                .check(self.hostname(), "chmod uploaded file")?;
        }
        Ok(())
    }

    async fn get_file_with(&self, remote: &str, local: &Path, options: &TransferOptions) -> Result<()> {
        info!("Transferring remote file {} to local {}", remote, local.display());
        let command = if self.is_root() {
            format!("cat {}", shell_words::quote(remote))
        } else {
            format!("sudo -n cat {}", shell_words::quote(remote))
        };
        let raw = self.exec(&command, None, RUNCMD_TIMEOUT).await?;
        if raw.rc != 0 {
            return Err(Error::shell_step(
                self.hostname(),
                "download file",
                &String::from_utf8_lossy(&raw.combined),
            ));
        }
        if options.create_parent {
            if let Some(parent) = local.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(local, &raw.stdout).await?;
        #[cfg(unix)]
        if let Some(mode) = options.mode {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(local, std::fs::Permissions::from_mode(mode)).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for SshClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClient")
            .field("hostname", &self.config.hostname)
            .field("port", &self.config.port)
            .finish()
    }
}
