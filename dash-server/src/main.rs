use dash_server::config::ServerConfig;
use dash_server::logging;
use dash_server::services::ServiceContainer;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = ServerConfig::load()?;
    let (_logging, _guard) = logging::init_logging(&config.log)?;

    let container = ServiceContainer::new(config)?;
    container.start()?;
    info!(
        "dash-server started (ports {:?}, {} available)",
        container.port_pool.port_range(),
        container.port_pool.available_count()
    );

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    container.shutdown().await;
    Ok(())
}
