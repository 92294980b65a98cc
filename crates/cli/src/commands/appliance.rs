//! Appliance bring-up commands

use anyhow::{bail, Result};
use cfme_appliance::plan::{SOURCE_DOMAIN, TARGET_DOMAIN};
use cfme_appliance::{configure, CustomConfigure, ExternalDbOptions, IPAppliance, InternalDbOptions, RhelUpdate};
use clap::{Args, Subcommand};
use serde::Serialize;
use std::time::Duration;

use crate::output::{print_item, print_success, print_warning, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum ApplianceCommands {
    /// Show the appliance version
    Version,

    /// Run the default plan, or the custom sequence when any option is given
    Configure(ConfigureArgs),

    /// Enable the appliance's own database
    EnableInternalDb {
        #[arg(long, default_value = "0")]
        region: u32,

        /// Fetch the encryption key from this appliance instead of generating one
        #[arg(long)]
        key_address: Option<String>,
    },

    /// Attach to a database on another host
    EnableExternalDb {
        db_address: String,

        #[arg(long, default_value = "0")]
        region: u32,

        #[arg(long)]
        db_name: Option<String>,
    },

    /// Wait for the web UI to come up (or go down)
    WaitForWebUi {
        /// Seconds
        #[arg(long, default_value = "900")]
        timeout: u64,

        /// Wait for the UI to stop instead
        #[arg(long)]
        stopped: bool,
    },

    /// Wait for the database to be online, created and migrated
    WaitForDb {
        /// Seconds
        #[arg(long, default_value = "180")]
        timeout: u64,
    },

    /// Restart evmserverd
    RestartEvm {
        /// Kill ruby workers before starting
        #[arg(long)]
        rude: bool,
    },

    /// Add update repositories and run yum update
    UpdateRhel {
        /// Repository URL; repeatable
        #[arg(long = "url")]
        urls: Vec<String>,

        #[arg(long)]
        no_reboot: bool,

        #[arg(long)]
        skip_broken: bool,
    },

    /// Clone an automate domain into a writable one
    CloneDomain {
        #[arg(default_value = SOURCE_DOMAIN)]
        source: String,

        #[arg(default_value = TARGET_DOMAIN)]
        dest: String,
    },

    /// Accept password logins to postgres from anywhere
    LoosenPgssl {
        #[arg(long)]
        with_ssl: bool,
    },

    /// Describe why evm is not running
    Diagnose,
}

#[derive(Args, Default)]
pub struct ConfigureArgs {
    /// External database address; internal database when unset
    #[arg(long)]
    pub db_address: Option<String>,

    #[arg(long)]
    pub region: Option<u32>,

    /// Server name to set
    #[arg(long)]
    pub name: Option<String>,

    #[arg(long)]
    pub key_address: Option<String>,

    #[arg(long)]
    pub no_fix_ntp: bool,

    #[arg(long)]
    pub no_patch_ajax: bool,

    #[arg(long)]
    pub no_wait_db: bool,

    #[arg(long)]
    pub no_loosen_pgssl: bool,
}

impl ConfigureArgs {
    /// Custom options, or `None` for the default plan
    pub fn custom(&self) -> Option<CustomConfigure> {
        let explicit = self.db_address.is_some()
            || self.region.is_some()
            || self.name.is_some()
            || self.key_address.is_some()
            || self.no_fix_ntp
            || self.no_patch_ajax
            || self.no_wait_db
            || self.no_loosen_pgssl;
        if !explicit {
            return None;
        }
        Some(CustomConfigure {
            region: self.region.unwrap_or(0),
            db_address: self.db_address.clone(),
            key_address: self.key_address.clone(),
            name_to_set: self.name.clone(),
            fix_ntp_clock: !self.no_fix_ntp,
            patch_ajax_wait: !self.no_patch_ajax,
            wait_for_db: !self.no_wait_db,
            loosen_pgssl: !self.no_loosen_pgssl,
            ..Default::default()
        })
    }
}

#[derive(Serialize)]
struct VersionDisplay {
    address: String,
    version: String,
}

impl TableDisplay for VersionDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Address", "Version"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.address.clone(), self.version.clone()]
    }
}

pub async fn execute(cmd: ApplianceCommands, ipapp: &IPAppliance, format: OutputFormat) -> Result<()> {
    match cmd {
        ApplianceCommands::Version => {
            let version = ipapp.version().await?;
            print_item(
                &VersionDisplay {
                    address: ipapp.address().to_string(),
                    version: version.to_string(),
                },
                format,
            );
        }

        ApplianceCommands::Configure(args) => {
            let current = ipapp.server_name().await.ok().flatten().unwrap_or_default();
            let custom = args.custom();
            if let Some(name) = configure(ipapp, custom.as_ref(), &current).await? {
                print_success(&format!("Appliance {} renamed to {}", ipapp.address(), name));
            }
            print_success(&format!("Appliance {} configured", ipapp.address()));
        }

        ApplianceCommands::EnableInternalDb { region, key_address } => {
            ipapp
                .enable_internal_db_with(InternalDbOptions {
                    region,
                    key_address,
                    ..Default::default()
                })
                .await?;
            print_success(&format!("Internal database enabled in region {}", region));
        }

        ApplianceCommands::EnableExternalDb {
            db_address,
            region,
            db_name,
        } => {
            let mut options = ExternalDbOptions::new(&db_address, region);
            options.db_name = db_name;
            ipapp.enable_external_db_with(options).await?;
            print_success(&format!("Attached to database on {}", db_address));
        }

        ApplianceCommands::WaitForWebUi { timeout, stopped } => {
            ipapp
                .wait_for_web_ui(Duration::from_secs(timeout), !stopped)
                .await?;
            print_success(if stopped { "Web UI is down" } else { "Web UI is up" });
        }

        ApplianceCommands::WaitForDb { timeout } => {
            ipapp.wait_for_db(Duration::from_secs(timeout)).await?;
            print_success("Database is ready");
        }

        ApplianceCommands::RestartEvm { rude } => {
            ipapp.restart_evm_service(rude).await?;
            print_success("evmserverd restarted");
        }

        ApplianceCommands::UpdateRhel {
            urls,
            no_reboot,
            skip_broken,
        } => {
            ipapp
                .update_rhel(RhelUpdate {
                    urls,
                    reboot: !no_reboot,
                    skip_broken,
                })
                .await?;
            print_success("Appliance updated");
        }

        ApplianceCommands::CloneDomain { source, dest } => {
            ipapp.clone_domain(&source, &dest).await?;
            print_success(&format!("Domain {} cloned to {}", source, dest));
        }

        ApplianceCommands::LoosenPgssl { with_ssl } => {
            ipapp.loosen_pgssl(with_ssl).await?;
            print_success("Postgres permissions loosened");
        }

        ApplianceCommands::Diagnose => match ipapp.diagnose_evm_failure().await? {
            None => print_success("No problem found, evmserverd restarted"),
            Some(problem) => {
                print_warning(&problem);
                bail!("appliance {} is unhealthy", ipapp.address());
            }
        },
    }

    Ok(())
}
