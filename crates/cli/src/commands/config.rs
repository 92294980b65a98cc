//! Configuration document commands

use anyhow::{Context, Result};
use cfme_appliance::IPAppliance;
use clap::Subcommand;
use std::path::PathBuf;

use crate::output::{print_document, print_success, OutputFormat};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print a configuration document, e.g. `vmdb`
    GetYaml { name: String },

    /// Replace a configuration document with the contents of a YAML file
    SetYaml { name: String, file: PathBuf },
}

pub async fn execute(cmd: ConfigCommands, ipapp: &IPAppliance, format: OutputFormat) -> Result<()> {
    match cmd {
        ConfigCommands::GetYaml { name } => {
            let document = ipapp.get_yaml(&name).await?;
            print_document(&document, format);
        }

        ConfigCommands::SetYaml { name, file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let document: serde_yaml::Value = serde_yaml::from_str(&content)
                .with_context(|| format!("parsing {}", file.display()))?;
            ipapp.set_yaml(&name, &document).await?;
            print_success(&format!("Configuration {} written", name));
        }
    }

    Ok(())
}
