//! Process arguments that augment (not replace) environment-variable
//! configuration (§4.I, SPEC_FULL §1).

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "node-agent", version, about = "LAN host discovery and wake agent")]
pub struct Args {
    /// Override the `tracing-subscriber` filter (e.g. "debug", "node_agent=trace").
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the agent loop (default if no subcommand is given).
    Run {
        /// Run a single discovery sync then exit, instead of looping.
        #[arg(long)]
        once: bool,
    },
    /// Parse and validate configuration, then exit 0 or 1.
    ConfigCheck,
    /// Send a Wake-on-LAN packet to a stored host and exit.
    Wake {
        /// Host name as stored in the local database.
        name: String,
    },
    /// Run one discovery sync against the LAN and exit.
    Scan,
    /// List hosts in the local store.
    ListHosts,
}
