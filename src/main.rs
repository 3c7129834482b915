use anyhow::Result;
use clap::{Parser, Subcommand};
use clawrepl::agent::EchoAgent;
use clawrepl::config::Config;
use clawrepl::gateway;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Multi-terminal REPL server for long-lived AI agents.
#[derive(Parser, Debug)]
#[command(name = "clawrepl")]
#[command(version)]
#[command(about = "Attach many terminals to one agent process.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the gateway and serve attached terminals
    Serve {
        /// Bind host (loopback only)
        #[arg(long)]
        host: Option<String>,

        /// Bind port (0 picks a free port)
        #[arg(long)]
        port: Option<u16>,

        /// Path to config.toml (default: ~/.clawrepl/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Accept requests without a bearer token
        #[arg(long)]
        no_auth: bool,

        /// Shut down after this many seconds of no traffic and no
        /// attached terminals (overrides config)
        #[arg(long)]
        idle_shutdown: Option<u64>,
    },

    /// Print the default configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            host,
            port,
            config,
            no_auth,
            idle_shutdown,
        } => {
            let mut config = Config::load(config.as_deref())?;
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            if no_auth {
                config.gateway.require_token = false;
            }
            if let Some(secs) = idle_shutdown {
                config.gateway.idle_shutdown_secs = secs;
            }

            gateway::run_gateway(&config, Arc::new(EchoAgent::new())).await
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&Config::default())?);
            Ok(())
        }
    }
}
