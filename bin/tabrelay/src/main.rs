mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "tabrelay")]
#[command(about = "Drive a browser's tabs through a correlated WebSocket relay", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Run the bridge (HTTP control API + agent endpoint)
    Bridge {
        /// Port to listen on (overrides config bridge.port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (overrides config bridge.host)
        #[arg(long)]
        host: Option<String>,
    },

    /// Run the agent against a DevTools-enabled browser
    Agent {
        /// Bridge WebSocket URL (overrides config agent.bridgeUrl)
        #[arg(long)]
        bridge_url: Option<String>,

        /// Browser remote debugging port (overrides config agent.cdpPort)
        #[arg(long)]
        cdp_port: Option<u16>,

        /// Tab ids to attach at start-up (see `tabrelay tabs`)
        #[arg(long = "attach", value_name = "TAB_ID")]
        attach: Vec<i64>,

        /// Attach every open page at start-up
        #[arg(long)]
        attach_all: bool,
    },

    /// List the browser's open pages and their tab ids
    Tabs {
        /// Browser remote debugging port (overrides config agent.cdpPort)
        #[arg(long)]
        cdp_port: Option<u16>,
    },

    /// Show configuration, persisted agent state and bridge health
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Init { force } => {
            commands::init::run(force).await?;
        }
        Commands::Bridge { port, host } => {
            commands::bridge::run(host, port).await?;
        }
        Commands::Agent {
            bridge_url,
            cdp_port,
            attach,
            attach_all,
        } => {
            commands::agent::run(bridge_url, cdp_port, attach, attach_all).await?;
        }
        Commands::Tabs { cdp_port } => {
            commands::tabs::run(cdp_port).await?;
        }
        Commands::Status => {
            commands::status::run().await?;
        }
    }

    Ok(())
}
