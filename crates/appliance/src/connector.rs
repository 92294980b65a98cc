//! Client factory seam
//!
//! The facade never constructs SSH, SQL or HTTP clients itself; it asks a
//! [`Connector`]. [`NetworkConnector`] builds the real clients, the e2e crate
//! plugs in a simulated lab.

use async_trait::async_trait;
use cfme_common::ssh::{self, SshClient, SshConfig, CONNECT_TIMEOUT};
use cfme_common::{Credentials, Db, DbTarget, HttpProber, Result, Shell, Vmdb, WebProbe};
use std::sync::Arc;

/// Factory for the three appliance interfaces
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a shell on `host`
    async fn shell(&self, host: &str, port: u16, credentials: &Credentials)
        -> Result<Arc<dyn Shell>>;

    /// Database accessor for `target`; must not connect eagerly
    fn vmdb(&self, target: DbTarget) -> Arc<dyn Vmdb>;

    /// Web UI prober for `url`
    fn web(&self, url: &str) -> Result<Arc<dyn WebProbe>>;

    /// Whether `port` on `host` accepts connections
    async fn port_open(&self, host: &str, port: u16) -> bool;
}

/// Connector over the real network
#[derive(Debug, Clone, Default)]
pub struct NetworkConnector {
    stream_output: bool,
}

impl NetworkConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror remote command output to the local terminal
    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream_output = stream;
        self
    }
}

#[async_trait]
impl Connector for NetworkConnector {
    async fn shell(&self, host: &str, port: u16, credentials: &Credentials) -> Result<Arc<dyn Shell>> {
        let config = SshConfig::new(host, credentials.clone())
            .port(port)
            .stream_output(self.stream_output);
        Ok(Arc::new(SshClient::connect(config).await?))
    }

    fn vmdb(&self, target: DbTarget) -> Arc<dyn Vmdb> {
        Arc::new(Db::new(target))
    }

    fn web(&self, url: &str) -> Result<Arc<dyn WebProbe>> {
        Ok(Arc::new(HttpProber::new(url)?))
    }

    async fn port_open(&self, host: &str, port: u16) -> bool {
        ssh::port_open(host, port, CONNECT_TIMEOUT).await
    }
}
