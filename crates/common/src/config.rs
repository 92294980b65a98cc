//! Configuration catalog and credential store
//!
//! Both are plain value types loaded once at startup from YAML documents
//! shaped like `cfme_data.yaml` and `credentials.yaml`.

use crate::types::Credentials;
use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Configuration catalog
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub env: EnvConfig,

    #[serde(default)]
    pub appliance_provisioning: ProvisioningConfig,

    #[serde(default)]
    pub management_systems: BTreeMap<String, ProviderConfig>,

    #[serde(default)]
    pub basic_info: BasicInfo,

    /// NTP servers used by `fix_ntp_clock`
    #[serde(default)]
    pub clock_servers: Vec<String>,
}

/// Test environment settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvConfig {
    /// URL of the appliance under test, e.g. `https://10.0.0.1/`
    pub base_url: Option<String>,
}

/// Template catalog for provisioning
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    /// Version string -> template name
    #[serde(default, deserialize_with = "scalar_keys")]
    pub versions: BTreeMap<String, String>,

    /// Provider key used when none is given
    pub default_provider: Option<String>,
}

/// Per-provider parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub kind: String,

    /// RHEV cluster to deploy into
    pub default_cluster: Option<String>,

    /// vSphere datastores a deployment may use
    pub allowed_datastores: Option<Vec<String>>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Update repositories and other site-wide URLs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BasicInfo {
    pub rhel_updates_url: Option<String>,
    pub rhscl_updates_url: Option<String>,
}

/// YAML reads `5.3` as a float key; accept any scalar and keep its text form.
fn scalar_keys<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = serde_yaml::Mapping::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(k, v)| {
            let key = match k {
                serde_yaml::Value::String(s) => s,
                serde_yaml::Value::Number(n) => n.to_string(),
                other => {
                    return Err(serde::de::Error::custom(format!(
                        "unsupported version key {:?}",
                        other
                    )))
                }
            };
            let template = v.as_str().map(str::to_string).ok_or_else(|| {
                serde::de::Error::custom(format!("template for {} must be a string", key))
            })?;
            Ok((key, template))
        })
        .collect()
}

impl Catalog {
    /// Load the catalog from a YAML file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::from_yaml(&content)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Template name mapped to `version`
    pub fn template_for_version(&self, version: &str) -> Result<&str> {
        self.appliance_provisioning
            .versions
            .get(version)
            .map(String::as_str)
            .ok_or_else(|| {
                Error::ConfigLookup(format!("No template found matching version {}", version))
            })
    }

    /// Provider key used when the caller does not name one
    pub fn default_provider(&self) -> Result<&str> {
        self.appliance_provisioning
            .default_provider
            .as_deref()
            .ok_or_else(|| {
                Error::ConfigLookup("appliance_provisioning.default_provider is not set".into())
            })
    }

    /// Parameters of the provider `key`
    pub fn provider(&self, key: &str) -> Result<&ProviderConfig> {
        self.management_systems
            .get(key)
            .ok_or_else(|| Error::ConfigLookup(format!("management_systems.{} is not defined", key)))
    }

    /// Host part of `env.base_url`
    pub fn base_address(&self) -> Result<String> {
        let base_url = self
            .env
            .base_url
            .as_deref()
            .ok_or_else(|| Error::ConfigLookup("env.base_url is not set".into()))?;
        let parsed = reqwest::Url::parse(base_url)
            .map_err(|e| Error::ConfigLookup(format!("env.base_url {}: {}", base_url, e)))?;
        parsed
            .host_str()
            .map(str::to_string)
            .ok_or_else(|| Error::ConfigLookup(format!("env.base_url {} has no host", base_url)))
    }
}

/// Named credential bundles
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialStore {
    bundles: BTreeMap<String, Credentials>,
}

impl CredentialStore {
    /// Load from a YAML file; a missing file yields an empty store
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(serde_yaml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, credentials: Credentials) {
        self.bundles.insert(name.into(), credentials);
    }

    pub fn with(mut self, name: impl Into<String>, credentials: Credentials) -> Self {
        self.insert(name, credentials);
        self
    }

    pub fn get(&self, name: &str) -> Result<&Credentials> {
        self.bundles
            .get(name)
            .ok_or_else(|| Error::ConfigLookup(format!("credentials.{} is not defined", name)))
    }

    /// Shell credentials (`ssh` bundle)
    pub fn ssh(&self) -> Result<&Credentials> {
        self.get("ssh")
    }

    /// Database credentials (`database` bundle)
    pub fn database(&self) -> Result<&Credentials> {
        self.get("database")
    }
}
