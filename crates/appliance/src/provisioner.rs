//! Appliance provisioning
//!
//! Resolves a template and a provider from the catalog, picks a free VM name
//! and deploys. The returned [`Appliance`] is not configured.

use crate::appliance::Appliance;
use crate::connector::Connector;
use crate::provider::{DeployArgs, ProviderRegistry, KIND_RHEVM, KIND_VIRTUALCENTER};
use cfme_common::{Context, Error, Result};
use rand::distributions::{Alphanumeric, DistString};
use std::sync::Arc;
use tracing::{debug, info};

/// Attempts at finding an unused generated VM name
pub const VM_NAME_ATTEMPTS: usize = 5;

/// Prefix of generated VM names
pub const DEFAULT_NAME_PREFIX: &str = "cfme";

/// What to provision
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    /// Looked up in `appliance_provisioning.versions` unless `template` is set
    pub version: Option<String>,
    pub template: Option<String>,
    /// Catalog default provider when unset
    pub provider_name: Option<String>,
    /// Generated when unset
    pub vm_name: Option<String>,
    pub name_prefix: String,
}

impl Default for ProvisionRequest {
    fn default() -> Self {
        Self {
            version: None,
            template: None,
            provider_name: None,
            vm_name: None,
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
        }
    }
}

impl ProvisionRequest {
    pub fn version(version: impl Into<String>) -> Self {
        Self {
            version: Some(version.into()),
            ..Default::default()
        }
    }

    pub fn template(template: impl Into<String>) -> Self {
        Self {
            template: Some(template.into()),
            ..Default::default()
        }
    }

    pub fn on_provider(mut self, provider_name: impl Into<String>) -> Self {
        self.provider_name = Some(provider_name.into());
        self
    }

    pub fn vm_name(mut self, vm_name: impl Into<String>) -> Self {
        self.vm_name = Some(vm_name.into());
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }
}

/// `{prefix}_{version digits}_{random}`, or `{prefix}_{random}` without a version
pub fn generate_vm_name(prefix: &str, version: Option<&str>) -> String {
    let suffix = Alphanumeric
        .sample_string(&mut rand::thread_rng(), 8)
        .to_lowercase();
    match version {
        Some(version) => {
            let digits: String = version.chars().filter(char::is_ascii_digit).collect();
            format!("{}_{}_{}", prefix, digits, suffix)
        }
        None => format!("{}_{}", prefix, suffix),
    }
}

/// Deploys appliances from catalog templates
pub struct Provisioner {
    ctx: Arc<Context>,
    providers: ProviderRegistry,
    connector: Arc<dyn Connector>,
}

impl Provisioner {
    pub fn new(ctx: Arc<Context>, providers: ProviderRegistry, connector: Arc<dyn Connector>) -> Self {
        Self {
            ctx,
            providers,
            connector,
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    fn resolve_template(&self, request: &ProvisionRequest) -> Result<String> {
        match (&request.template, &request.version) {
            (Some(template), _) => Ok(template.clone()),
            (None, Some(version)) => Ok(self.ctx.catalog.template_for_version(version)?.to_string()),
            (None, None) => Err(Error::ConfigLookup(
                "Either version or template name must be specified".into(),
            )),
        }
    }

    /// Deploy one appliance VM
    pub async fn provision(&self, request: ProvisionRequest) -> Result<Appliance> {
        let template = self.resolve_template(&request)?;
        let provider_key = match &request.provider_name {
            Some(name) => name.clone(),
            None => self.ctx.catalog.default_provider()?.to_string(),
        };
        let provider = self.providers.get(&provider_key)?;

        let vm_name = match request.vm_name {
            Some(vm_name) => vm_name,
            None => {
                let mut chosen = None;
                for attempt in 1..=VM_NAME_ATTEMPTS {
                    let candidate = generate_vm_name(&request.name_prefix, request.version.as_deref());
                    if provider.does_vm_exist(&candidate).await? {
                        debug!("VM name {} taken (attempt {})", candidate, attempt);
                        continue;
                    }
                    chosen = Some(candidate);
                    break;
                }
                chosen.ok_or_else(|| {
                    Error::Invariant(format!(
                        "no free VM name with prefix {} after {} attempts",
                        request.name_prefix, VM_NAME_ATTEMPTS
                    ))
                })?
            }
        };

        let mut args = DeployArgs {
            vm_name: vm_name.clone(),
            ..Default::default()
        };
        if let Some(config) = self.ctx.catalog.management_systems.get(&provider_key) {
            match config.kind.as_str() {
                KIND_RHEVM => args.cluster = config.default_cluster.clone(),
                KIND_VIRTUALCENTER => args.allowed_datastores = config.allowed_datastores.clone(),
                _ => {}
            }
        }

        info!("Deploying {} on {} as {}", template, provider_key, vm_name);
        provider.deploy_template(&template, &args).await?;

        Ok(Appliance::new(
            provider_key,
            provider,
            vm_name,
            self.ctx.clone(),
            self.connector.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryProvider, ScriptedConnector, ScriptedShell};
    use cfme_common::{Catalog, CredentialStore};

    const CATALOG: &str = r#"
appliance_provisioning:
  default_provider: rhev
  versions:
    5.3.2.7: cfme-5327
management_systems:
  rhev:
    type: rhevm
    default_cluster: iscsi
  vsphere:
    type: virtualcenter
    allowed_datastores: [ds1, ds2]
"#;

    fn provisioner(rhev: Arc<MemoryProvider>, vsphere: Arc<MemoryProvider>) -> Provisioner {
        let ctx = Context::new(Catalog::from_yaml(CATALOG).unwrap(), CredentialStore::default());
        let providers = ProviderRegistry::new()
            .with("rhev", rhev)
            .with("vsphere", vsphere);
        let connector = Arc::new(ScriptedConnector::new(Arc::new(ScriptedShell::new("x"))));
        Provisioner::new(ctx, providers, connector)
    }

    #[test]
    fn test_generated_names() {
        let name = generate_vm_name("cfme", Some("5.3.2.7"));
        assert!(name.starts_with("cfme_5327_"));
        assert_eq!(name.len(), "cfme_5327_".len() + 8);

        let name = generate_vm_name("test", None);
        assert!(name.starts_with("test_"));
        assert_eq!(name.len(), "test_".len() + 8);
    }

    #[tokio::test]
    async fn test_provision_rhevm_uses_cluster() {
        let rhev = Arc::new(MemoryProvider::new("10.0.0"));
        let p = provisioner(rhev.clone(), Arc::new(MemoryProvider::new("10.9.0")));

        let app = p.provision(ProvisionRequest::version("5.3.2.7")).await.unwrap();
        assert_eq!(app.provider_key(), "rhev");
        assert!(app.vm_name().starts_with("cfme_5327_"));

        let deployed = rhev.deployments();
        assert_eq!(deployed.len(), 1);
        assert_eq!(deployed[0].cluster.as_deref(), Some("iscsi"));
        assert_eq!(deployed[0].allowed_datastores, None);
    }

    #[tokio::test]
    async fn test_provision_virtualcenter_passes_datastores() {
        let vsphere = Arc::new(MemoryProvider::new("10.9.0"));
        let p = provisioner(Arc::new(MemoryProvider::new("10.0.0")), vsphere.clone());

        p.provision(
            ProvisionRequest::template("tpl")
                .on_provider("vsphere")
                .vm_name("fixed"),
        )
        .await
        .unwrap();
        let deployed = vsphere.deployments();
        assert_eq!(deployed[0].vm_name, "fixed");
        assert_eq!(deployed[0].cluster, None);
        assert_eq!(
            deployed[0].allowed_datastores,
            Some(vec!["ds1".to_string(), "ds2".to_string()])
        );
    }

    #[tokio::test]
    async fn test_unknown_version_is_lookup_error() {
        let p = provisioner(
            Arc::new(MemoryProvider::new("10.0.0")),
            Arc::new(MemoryProvider::new("10.9.0")),
        );
        let err = p
            .provision(ProvisionRequest::version("9.9"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::ConfigLookup(_)));

        let err = p.provision(ProvisionRequest::default()).await.err().unwrap();
        assert!(matches!(err, Error::ConfigLookup(_)));
    }
}
