use fleet_navigator::NavigatorConfig;
use fleet_navigator::NavigatorServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = NavigatorConfig::load()?;

    // Identity or store failures abort startup
    let server = NavigatorServer::new(config)?;
    server.start().await?;

    Ok(())
}
