//! Appliance session setup

use anyhow::{Context as _, Result};
use cfme_appliance::{IPAppliance, NetworkConnector};
use cfme_common::{Catalog, Context, CredentialStore, Service};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Where to find configuration and which appliance to talk to
pub struct SessionOptions<'a> {
    pub catalog: &'a Path,
    pub credentials: &'a Path,
    pub data_dir: &'a Path,
    pub appliance: Option<&'a str>,
    pub ssh_port: Option<u16>,
    pub db_port: Option<u16>,
    pub stream_output: bool,
}

/// Load configuration and build the facade for the target appliance.
///
/// Without an explicit address the host of `env.base_url` is used.
pub fn connect(options: &SessionOptions<'_>) -> Result<IPAppliance> {
    let catalog = Catalog::load(options.catalog)
        .with_context(|| format!("loading catalog {}", options.catalog.display()))?;
    let credentials = CredentialStore::load(options.credentials)
        .with_context(|| format!("loading credentials {}", options.credentials.display()))?;

    let address = match options.appliance {
        Some(address) => address.to_string(),
        None => catalog
            .base_address()
            .context("no appliance given and env.base_url is unusable")?,
    };

    let ctx = Context::with_data_dir(catalog, credentials, options.data_dir);
    if let Some(port) = options.ssh_port {
        ctx.ports.set(Service::Ssh, port);
    }
    if let Some(port) = options.db_port {
        ctx.ports.set(Service::Db, port);
    }
    debug!(
        "Using appliance {} (ssh port {}, db port {})",
        address,
        ctx.ports.ssh(),
        ctx.ports.db()
    );

    let connector = Arc::new(NetworkConnector::new().streaming(options.stream_output));
    Ok(IPAppliance::new(address, ctx, connector))
}
