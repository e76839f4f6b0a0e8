use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use loghub::config::HubConfig;
use loghub::daemon::{run_daemon, HubClient};
use loghub::daemon_log::{init_daemon_log, log_filter};
use loghub::hub_paths;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "loghubd")]
#[command(about = "Daemon serving append-only logs to local client sessions")]
#[command(version)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon until a client stops it
    Run {
        /// Config file (defaults to ~/.loghub/config.yaml when present)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// RPC port (overrides the config file)
        #[arg(long)]
        port: Option<u16>,

        /// Events port (overrides the config file)
        #[arg(long)]
        events_port: Option<u16>,

        /// Never announce topics
        #[arg(long)]
        no_announce: bool,

        /// Log to stderr instead of the daemon log file
        #[arg(long)]
        foreground: bool,
    },

    /// Print the status of the running daemon as JSON
    Status,

    /// Stop the running daemon
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            port,
            events_port,
            no_announce,
            foreground,
        } => {
            let mut config = HubConfig::resolve(config.as_deref(), &hub_paths::config_path()?)?;
            if port.is_some() {
                config.server.port = port;
            }
            if events_port.is_some() {
                config.server.events_port = events_port;
            }
            config.network.no_announce |= no_announce;
            config.validate()?;

            if foreground {
                tracing_subscriber::fmt()
                    .with_env_filter(log_filter(&config.log.level)?)
                    .with_writer(std::io::stderr)
                    .try_init()
                    .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))?;
            } else {
                init_daemon_log(&hub_paths::daemon_log_path()?, &config.log.level)?;
            }

            run_daemon(config).await
        }
        Commands::Status => {
            let client = HubClient::from_port_file().await?;
            let status = client.status().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&status).context("Failed to encode status")?
            );
            Ok(())
        }
        Commands::Stop => {
            let client = HubClient::from_port_file().await?;
            client.shutdown().await?;
            println!("loghub daemon stopping");
            Ok(())
        }
    }
}
