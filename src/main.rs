// bci-hub control center binary

use bci_hub::hub::{execute_command, HubCli};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bci_hub=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = HubCli::parse();

    if let Err(e) = execute_command(cli.command).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
