//! Primary/secondary appliance sets
//!
//! The primary owns the database; secondaries attach to it. Secondaries must
//! not be newer than the primary, otherwise their first start would migrate
//! the primary's database.

use crate::appliance::Appliance;
use crate::plan::CustomConfigure;
use crate::provisioner::{ProvisionRequest, Provisioner};
use cfme_common::{Error, Result, VersionTag};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Declared version and final name of one member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberSpec {
    pub name: String,
    pub version: String,
}

/// Declarative set description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplianceSetSpec {
    pub primary_appliance: MemberSpec,
    #[serde(default)]
    pub secondary_appliances: Vec<MemberSpec>,
}

impl ApplianceSetSpec {
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Reject declared secondaries newer than the primary
    pub fn validate(&self) -> Result<()> {
        let primary = VersionTag::parse(&self.primary_appliance.version)?;
        for secondary in &self.secondary_appliances {
            check_not_newer(&primary, &VersionTag::parse(&secondary.version)?, &secondary.name)?;
        }
        Ok(())
    }
}

fn check_not_newer(primary: &VersionTag, secondary: &VersionTag, who: &str) -> Result<()> {
    if secondary > primary {
        return Err(Error::Invariant(format!(
            "secondary {} ({}) is newer than the primary ({}) and would migrate its database",
            who, secondary, primary
        )));
    }
    Ok(())
}

/// A primary appliance and the secondaries sharing its database
#[derive(Debug)]
pub struct ApplianceSet {
    primary: Appliance,
    secondaries: Vec<Appliance>,
}

impl ApplianceSet {
    pub fn new(primary: Appliance, secondaries: Vec<Appliance>) -> Self {
        Self {
            primary,
            secondaries,
        }
    }

    pub fn primary(&self) -> &Appliance {
        &self.primary
    }

    pub fn secondaries(&self) -> &[Appliance] {
        &self.secondaries
    }

    /// Secondaries first, then the primary
    pub fn all_appliances(&self) -> impl Iterator<Item = &Appliance> {
        self.secondaries.iter().chain(std::iter::once(&self.primary))
    }

    /// Member whose current server name is `name`
    pub fn find_by_name(&self, name: &str) -> Option<&Appliance> {
        self.all_appliances().find(|a| a.name() == name)
    }

    /// Compare running versions; no member is touched
    pub async fn validate_versions(&self) -> Result<()> {
        let primary = self.primary.version().await?;
        for secondary in &self.secondaries {
            check_not_newer(&primary, &secondary.version().await?, secondary.vm_name())?;
        }
        Ok(())
    }

    /// Configure the primary with an internal database, then each secondary
    /// in order against it.
    ///
    /// Names come from `spec` by position.
    pub async fn configure(&self, spec: &ApplianceSetSpec) -> Result<()> {
        if spec.secondary_appliances.len() != self.secondaries.len() {
            return Err(Error::Invariant(format!(
                "set has {} secondaries but {} names were given",
                self.secondaries.len(),
                spec.secondary_appliances.len()
            )));
        }
        self.validate_versions().await?;

        info!("Configuring primary appliance {}", self.primary.vm_name());
        self.primary
            .configure(Some(&CustomConfigure::named(&spec.primary_appliance.name)))
            .await?;
        let primary_address = self.primary.address().await?.to_string();

        for (secondary, member) in self.secondaries.iter().zip(&spec.secondary_appliances) {
            info!(
                "Configuring secondary appliance {} against {}",
                secondary.vm_name(),
                primary_address
            );
            secondary
                .configure(Some(&CustomConfigure::attached(&primary_address, &member.name)))
                .await?;
        }

        self.check_shared_database().await
    }

    /// Every secondary's database accessor points at the primary's
    pub async fn check_shared_database(&self) -> Result<()> {
        let primary_db = self.primary.ipapp().await?.db().await?;
        for secondary in &self.secondaries {
            let db = secondary.ipapp().await?.db().await?;
            if db.address() != primary_db.address() {
                return Err(Error::Invariant(format!(
                    "secondary {} uses database {} instead of {}",
                    secondary.vm_name(),
                    db.address(),
                    primary_db.address()
                )));
            }
        }
        Ok(())
    }
}

/// Provision every member of `spec`, then configure the set.
///
/// Declared versions are checked before anything is deployed.
pub async fn provision_appliance_set(
    provisioner: &Provisioner,
    spec: &ApplianceSetSpec,
    name_prefix: &str,
) -> Result<ApplianceSet> {
    spec.validate()?;

    let request = |member: &MemberSpec| ProvisionRequest::version(&member.version).prefix(name_prefix);
    let primary = provisioner.provision(request(&spec.primary_appliance));
    let secondaries = try_join_all(
        spec.secondary_appliances
            .iter()
            .map(|member| provisioner.provision(request(member))),
    );
    let (primary, secondaries) = futures::try_join!(primary, secondaries)?;

    let set = ApplianceSet::new(primary, secondaries);
    set.configure(spec).await?;
    Ok(set)
}
