// chatrelay server binary

use chatrelay::chat::{ChatServer, ServerCli};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatrelay=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = ServerCli::parse();

    // Certificate and bind failures abort before any connection is accepted
    let server = match ChatServer::bind(cli.into_config()).await {
        Ok(server) => server,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    tracing::info!("Chat relay stopped");
    Ok(())
}
