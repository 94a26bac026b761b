//! Command-line argument definitions (clap).

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "x570-fanctl")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "PID chassis fan controller for the ASRock X570D4U-2L2T BMC", long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "/config/config.yaml")]
    pub config: PathBuf,

    /// Run without sending IPMI commands
    #[arg(long)]
    pub dry_run: bool,

    /// Run the IPMI self-test and exit
    #[arg(long)]
    pub test_ipmi: bool,

    /// Override the configured log level (debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}
