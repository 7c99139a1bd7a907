use bridgehub::hub::{DEFAULT_HUB_PORT, DEFAULT_PIN};
use bridgehub::registry::DEFAULT_ADVERTISER;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "bridgehub")]
#[command(version)]
#[command(about = "Home-automation hub supervising accessory bridge workers", long_about = None)]
pub(crate) struct Cli {
    /// Verbose logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the hub: supervise workers and serve the control plane
    Hub {
        /// Port of the hub's own accessory server
        #[arg(long, default_value_t = DEFAULT_HUB_PORT)]
        port: u16,

        /// Setup pin of the hub bridge
        #[arg(long, default_value = DEFAULT_PIN)]
        pin: String,

        /// Start workers in debug mode
        #[arg(long)]
        debug: bool,

        /// Tell workers they run inside a container
        #[arg(long)]
        container: bool,

        /// Keep accessories whose extension is no longer installed
        #[arg(long)]
        orphans: bool,
    },

    /// Run one bridge worker (started by the hub)
    Worker {
        /// Bridge id
        #[arg(long)]
        bridge: String,

        /// Port of the bridge's accessory server
        #[arg(long)]
        port: u16,

        #[arg(long)]
        debug: bool,

        #[arg(long)]
        container: bool,

        #[arg(long)]
        orphans: bool,
    },

    /// Manage registered bridges
    Bridge {
        #[command(subcommand)]
        command: BridgeCommands,
    },

    /// Show hub and worker status
    Status,

    /// Call a route on the hub or on a bridge worker
    Call {
        /// "hub" or a bridge id
        target: String,

        /// Route path, e.g. status:get
        path: String,

        /// Parameters as JSON
        #[arg(long)]
        params: Option<String>,

        /// Body as JSON
        #[arg(long)]
        body: Option<String>,
    },

    /// Show recent output of a bridge worker
    Logs {
        /// Bridge id
        id: String,

        /// Number of recent lines to show
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,
    },

    /// Export a bridge's state to a backup archive
    Export {
        /// Bridge id
        id: String,

        /// Output .zip path
        out: PathBuf,
    },
}

#[derive(Subcommand, Clone)]
pub(crate) enum BridgeCommands {
    /// Register a new bridge
    Create {
        /// Display name; the id is derived from it
        name: String,

        #[arg(long)]
        port: u16,

        #[arg(long, default_value = DEFAULT_PIN)]
        pin: String,

        /// Pairing username (AA:BB:CC:DD:EE:FF); generated when omitted
        #[arg(long)]
        username: Option<String>,

        #[arg(long, default_value = DEFAULT_ADVERTISER)]
        advertiser: String,
    },

    /// List registered bridges
    List,

    /// Update a bridge's details
    Info {
        id: String,

        #[arg(long)]
        display: Option<String>,

        #[arg(long)]
        pin: Option<String>,

        #[arg(long)]
        autostart: Option<u32>,

        #[arg(long)]
        advertiser: Option<String>,
    },

    /// Reserve a port range for a bridge's child accessories
    Ports { id: String, start: u16, end: u16 },

    /// Remove a bridge and its stored state
    Uninstall { id: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn worker_contract_parses() {
        let cli = Cli::try_parse_from([
            "bridgehub", "worker", "--bridge", "kitchen", "--port", "51828", "--debug",
            "--verbose", "--container", "--orphans",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Worker {
                bridge,
                port,
                debug,
                container,
                orphans,
            } => {
                assert_eq!(bridge, "kitchen");
                assert_eq!(port, 51828);
                assert!(debug && container && orphans);
            }
            _ => panic!("expected worker"),
        }
    }
}
