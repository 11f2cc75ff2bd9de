use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use dhcplink::{ClientConfig, DhcpClient, Lease, Result};

#[derive(Parser)]
#[command(name = "dhcplink")]
#[command(author, version, about = "An embeddable RFC 2131 DHCPv4 client", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Run,
    ShowConfig,
    ShowLease,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = ClientConfig::load_or_default(&cli.config).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting DHCP client with config: {:?}", cli.config);
            let mut client = DhcpClient::new(config)?;
            client.add_lease_received_listener(|lease| info!("Lease acquired: {}", lease));
            client.add_lease_renewed_listener(|lease| info!("Lease renewed: {}", lease));
            client.start().await?;

            tokio::signal::ctrl_c().await?;
            info!("Received shutdown signal, stopping client...");
            client.stop();
            Ok(())
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::ShowLease => {
            let lease = match &config.lease_file {
                Some(path) => Lease::load(path),
                None => {
                    println!("No lease file configured.");
                    return Ok(());
                }
            };
            println!("{}", lease);
            Ok(())
        }
    }
}
