//! CLI argument parsing for realtime-sync

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::subscription::SubscriptionSpec;

/// Real-time subscription manager simulator
#[derive(Parser, Debug)]
#[command(name = "realtime-sync")]
#[command(about = "Run and inspect a real-time subscription manager against an in-memory change feed")]
#[command(version)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (defaults to the platform config directory)
    #[arg(long, value_name = "PATH", global = true, env = "REALTIME_SYNC_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a simulated session and print JSON status snapshots
    #[command(visible_alias = "sim")]
    Simulate(SimulateArgs),

    /// Print the effective configuration as TOML
    Config,
}

// ============================================================================
// Simulate Subcommand
// ============================================================================

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Subscription as TABLE:TOKEN[,TOKEN...][:PRIORITY]; repeatable
    #[arg(long = "table", value_name = "SPEC")]
    pub tables: Vec<SubscriptionSpec>,

    /// Stop after this many seconds (0 runs until Ctrl-C)
    #[arg(long, default_value = "30")]
    pub duration_secs: u64,

    /// Print a status snapshot every N seconds
    #[arg(long, default_value = "5")]
    pub report_every_secs: u64,

    /// Inject a failure every N seconds, alternating bind errors and network flaps (0 disables)
    #[arg(long, default_value = "10")]
    pub flap_every_secs: u64,

    /// Emit one synthetic row change every N milliseconds
    #[arg(long, default_value = "1000")]
    pub change_every_ms: u64,
}

impl SimulateArgs {
    /// Requested subscriptions, or a small default workload
    pub fn specs(&self) -> Vec<SubscriptionSpec> {
        if !self.tables.is_empty() {
            return self.tables.clone();
        }
        ["jobs:jobs-list:high", "timesheets:timesheets", "crew_assignments:crew-list:low"]
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect()
    }
}
