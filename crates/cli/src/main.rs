//! cfme - appliance bring-up from the command line
//!
//! Every subcommand targets one appliance, given with `--appliance` or taken
//! from `env.base_url` in the catalog.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod client;
mod commands;
mod output;

use commands::appliance::ApplianceCommands;
use commands::config::ConfigCommands;

/// CFME appliance control plane
#[derive(Parser)]
#[command(name = "cfme")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Appliance address
    #[arg(short, long, global = true, env = "CFME_APPLIANCE")]
    appliance: Option<String>,

    /// Configuration catalog
    #[arg(long, default_value = "conf/cfme_data.yaml", global = true)]
    catalog: PathBuf,

    /// Credential store
    #[arg(long, default_value = "conf/credentials.yaml", global = true)]
    credentials: PathBuf,

    /// Directory of bundled support files
    #[arg(long, default_value = cfme_common::context::DEFAULT_DATA_DIR, global = true)]
    data_dir: PathBuf,

    /// Override the SSH port
    #[arg(long, global = true)]
    ssh_port: Option<u16>,

    /// Override the database port
    #[arg(long, global = true)]
    db_port: Option<u16>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output and mirror remote command output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Appliance(ApplianceCommands),

    #[command(flatten)]
    Config(ConfigCommands),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    let ipapp = client::connect(&client::SessionOptions {
        catalog: &cli.catalog,
        credentials: &cli.credentials,
        data_dir: &cli.data_dir,
        appliance: cli.appliance.as_deref(),
        ssh_port: cli.ssh_port,
        db_port: cli.db_port,
        stream_output: cli.verbose,
    })?;

    let result = match cli.command {
        Commands::Appliance(cmd) => commands::appliance::execute(cmd, &ipapp, cli.format).await,
        Commands::Config(cmd) => commands::config::execute(cmd, &ipapp, cli.format).await,
    };
    if let Err(e) = &result {
        output::print_error(&format!("{:#}", e));
    }
    result
}
