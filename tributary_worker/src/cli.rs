use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(
    name = "tributary-worker",
    version,
    about = "Integration sync worker"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Consume the job queues until SIGINT/SIGTERM (default if no subcommand given).
    Run {
        /// Use in-memory integration store and operation sink instead of the HTTP API.
        #[arg(long, env = "TRIBUTARY_DEV")]
        dev: bool,
    },

    /// Schedule a sync job for one integration.
    Enqueue {
        /// Tenant id (UUID).
        #[arg(long)]
        tenant_id: Uuid,

        /// Integration id (UUID).
        #[arg(long)]
        integration_id: Uuid,

        /// Treat the run as the first sync (ignores the retrospective window).
        #[arg(long)]
        onboarding: bool,

        /// Deliver the job after this many seconds, routed through the delay queue.
        #[arg(long, default_value = "0")]
        delay_seconds: u64,
    },

    /// Print current configuration (redacted secrets).
    Config,
}

impl Commands {
    /// `run` as if given on the command line, so its env fallbacks apply.
    pub fn default_run() -> Result<Self, clap::Error> {
        let cli = Cli::try_parse_from(["tributary-worker", "run"])?;
        Ok(cli.command.unwrap_or(Self::Run { dev: false }))
    }
}
