//! Bring-up plans
//!
//! `configure` without options runs the default plan of the appliance's
//! version series. Any explicit option replaces the plan with the fixed
//! custom sequence in [`CustomConfigure`].

use crate::ipappliance::{
    ExternalDbOptions, IPAppliance, InternalDbOptions, RhelUpdate, DB_TIMEOUT, SSH_TIMEOUT,
    WEB_UI_TIMEOUT,
};
use cfme_common::{Result, VersionTag};
use std::fmt;
use std::time::Duration;
use tracing::info;

/// Web UI budget used inside plans, covering first boot migrations
pub const PLAN_WEB_UI_TIMEOUT: Duration = Duration::from_secs(1800);

/// Built-in automate domain and its writable clone
pub const SOURCE_DOMAIN: &str = "ManageIQ";
pub const TARGET_DOMAIN: &str = "Default";

/// One bring-up operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    UpdateRhel { skip_broken: bool },
    EnableInternalDb,
    WaitForWebUi,
    FixNtpClock,
    PrecompileAssets,
    LoosenPgssl,
    CloneDomain,
    DeployMerkyl,
}

impl Step {
    pub async fn run(self, ipapp: &IPAppliance) -> Result<()> {
        match self {
            Step::UpdateRhel { skip_broken } => {
                ipapp
                    .update_rhel(RhelUpdate {
                        skip_broken,
                        ..Default::default()
                    })
                    .await
            }
            Step::EnableInternalDb => ipapp.enable_internal_db(0).await,
            Step::WaitForWebUi => ipapp.wait_for_web_ui(PLAN_WEB_UI_TIMEOUT, true).await,
            Step::FixNtpClock => ipapp.fix_ntp_clock().await,
            Step::PrecompileAssets => ipapp.precompile_assets().await,
            Step::LoosenPgssl => ipapp.loosen_pgssl(false).await,
            Step::CloneDomain => ipapp.clone_domain(SOURCE_DOMAIN, TARGET_DOMAIN).await,
            Step::DeployMerkyl => ipapp.deploy_merkyl(true).await,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::UpdateRhel { .. } => "update_rhel",
            Step::EnableInternalDb => "enable_internal_db",
            Step::WaitForWebUi => "wait_for_web_ui",
            Step::FixNtpClock => "fix_ntp_clock",
            Step::PrecompileAssets => "precompile_assets",
            Step::LoosenPgssl => "loosen_pgssl",
            Step::CloneDomain => "clone_domain",
            Step::DeployMerkyl => "deploy_merkyl",
        };
        f.write_str(name)
    }
}

/// Ordered default steps for a version series
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliancePlan {
    steps: Vec<Step>,
}

impl AppliancePlan {
    pub fn series_5_2() -> Self {
        Self {
            steps: vec![
                Step::UpdateRhel { skip_broken: true },
                Step::EnableInternalDb,
                Step::WaitForWebUi,
                Step::FixNtpClock,
                Step::DeployMerkyl,
            ],
        }
    }

    pub fn series_5_3() -> Self {
        Self {
            steps: vec![
                Step::UpdateRhel { skip_broken: false },
                Step::EnableInternalDb,
                Step::WaitForWebUi,
                Step::PrecompileAssets,
                Step::LoosenPgssl,
                Step::CloneDomain,
                Step::DeployMerkyl,
            ],
        }
    }

    pub fn latest() -> Self {
        Self {
            steps: vec![
                Step::WaitForWebUi,
                Step::LoosenPgssl,
                Step::CloneDomain,
                Step::DeployMerkyl,
            ],
        }
    }

    /// Plan for `version`; anything before 5.3 gets the 5.2 plan, newer
    /// numbered releases the 5.3 plan
    pub fn for_version(version: &VersionTag) -> Self {
        if version.is_latest() {
            Self::latest()
        } else if version.is_older_than("5.3") {
            Self::series_5_2()
        } else {
            Self::series_5_3()
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub async fn run(&self, ipapp: &IPAppliance) -> Result<()> {
        for (n, step) in self.steps.iter().enumerate() {
            info!(address = ipapp.address(), "Step {}/{}: {}", n + 1, self.steps.len(), step);
            step.run(ipapp).await?;
        }
        Ok(())
    }
}

/// Explicit configuration options
#[derive(Debug, Clone)]
pub struct CustomConfigure {
    pub region: u32,
    /// External database to attach to; internal when unset
    pub db_address: Option<String>,
    /// Fetch the encryption key from this appliance (internal database only)
    pub key_address: Option<String>,
    pub db_name: Option<String>,
    pub db_username: Option<String>,
    pub db_password: Option<String>,
    pub ssh_password: Option<String>,
    pub fix_ntp_clock: bool,
    pub patch_ajax_wait: bool,
    pub wait_for_db: bool,
    pub loosen_pgssl: bool,
    /// Rename the server and restart evm when it differs from the current name
    pub name_to_set: Option<String>,
}

impl Default for CustomConfigure {
    fn default() -> Self {
        Self {
            region: 0,
            db_address: None,
            key_address: None,
            db_name: None,
            db_username: None,
            db_password: None,
            ssh_password: None,
            fix_ntp_clock: true,
            patch_ajax_wait: true,
            wait_for_db: true,
            loosen_pgssl: true,
            name_to_set: None,
        }
    }
}

impl CustomConfigure {
    /// Internal database with the given final name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name_to_set: Some(name.into()),
            ..Default::default()
        }
    }

    /// External database on `db_address` with the given final name
    pub fn attached(db_address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            db_address: Some(db_address.into()),
            name_to_set: Some(name.into()),
            ..Default::default()
        }
    }

    /// Run the custom sequence; returns the new name if the server was renamed
    pub async fn run(&self, ipapp: &IPAppliance, current_name: &str) -> Result<Option<String>> {
        if self.fix_ntp_clock {
            ipapp.fix_ntp_clock().await?;
        }
        if self.patch_ajax_wait {
            ipapp.patch_ajax_wait(false).await?;
        }

        match &self.db_address {
            None => {
                ipapp
                    .enable_internal_db_with(InternalDbOptions {
                        region: self.region,
                        key_address: self.key_address.clone(),
                        db_password: self.db_password.clone(),
                        ssh_password: self.ssh_password.clone(),
                    })
                    .await?
            }
            Some(db_address) => {
                ipapp
                    .enable_external_db_with(ExternalDbOptions {
                        db_address: db_address.clone(),
                        region: self.region,
                        db_name: self.db_name.clone(),
                        db_username: self.db_username.clone(),
                        db_password: self.db_password.clone(),
                    })
                    .await?
            }
        }
        if self.wait_for_db {
            ipapp.wait_for_db(DB_TIMEOUT).await?;
        }
        ipapp.wait_for_web_ui(PLAN_WEB_UI_TIMEOUT, true).await?;

        if self.loosen_pgssl {
            ipapp.loosen_pgssl(false).await?;
        }

        match &self.name_to_set {
            Some(name) if name != current_name => {
                ipapp.rename_server(name).await?;
                ipapp.restart_evm_service(false).await?;
                ipapp.wait_for_web_ui(WEB_UI_TIMEOUT, true).await?;
                Ok(Some(name.clone()))
            }
            _ => Ok(None),
        }
    }
}

/// Full configure flow: wait for SSH, then the custom sequence or the
/// version's default plan.
///
/// Returns the new server name if the appliance was renamed.
pub async fn configure(
    ipapp: &IPAppliance,
    custom: Option<&CustomConfigure>,
    current_name: &str,
) -> Result<Option<String>> {
    info!("Configuring appliance {}", ipapp.address());
    ipapp.wait_for_ssh(SSH_TIMEOUT).await?;
    let renamed = match custom {
        Some(custom) => custom.run(ipapp, current_name).await?,
        None => {
            let version = ipapp.version().await?;
            AppliancePlan::for_version(&version).run(ipapp).await?;
            None
        }
    };
    ipapp.mark_configured();
    info!("Appliance {} configured", ipapp.address());
    Ok(renamed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(version: &str) -> Vec<String> {
        AppliancePlan::for_version(&VersionTag::parse(version).unwrap())
            .steps()
            .iter()
            .map(Step::to_string)
            .collect()
    }

    #[test]
    fn test_plan_by_series() {
        assert_eq!(
            plan("5.2.5.2"),
            [
                "update_rhel",
                "enable_internal_db",
                "wait_for_web_ui",
                "fix_ntp_clock",
                "deploy_merkyl"
            ]
        );
        assert_eq!(
            plan("5.3.2.7"),
            [
                "update_rhel",
                "enable_internal_db",
                "wait_for_web_ui",
                "precompile_assets",
                "loosen_pgssl",
                "clone_domain",
                "deploy_merkyl"
            ]
        );
        assert_eq!(
            plan("master"),
            ["wait_for_web_ui", "loosen_pgssl", "clone_domain", "deploy_merkyl"]
        );
    }

    #[test]
    fn test_unmapped_versions_split_at_5_3() {
        assert_eq!(plan("5.1.0"), plan("5.2"));
        assert_eq!(plan("5.4.0.1"), plan("5.3"));
    }

    #[test]
    fn test_5_2_updates_skip_broken() {
        assert_eq!(
            AppliancePlan::series_5_2().steps()[0],
            Step::UpdateRhel { skip_broken: true }
        );
    }

    #[test]
    fn test_custom_defaults() {
        let custom = CustomConfigure::attached("10.0.0.1", "EVM2");
        assert!(custom.fix_ntp_clock && custom.patch_ajax_wait && custom.loosen_pgssl);
        assert_eq!(custom.db_address.as_deref(), Some("10.0.0.1"));
        assert_eq!(CustomConfigure::named("x").db_address, None);
    }
}
