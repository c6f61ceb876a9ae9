use billing_notify::config::PipelineConfig;
use billing_notify::services::{Backends, ServiceContainer};
use billing_notify::{clock, database, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = PipelineConfig::from_env()?;
    let _log_guard = logging::init(&config.logging)?;

    let pool =
        database::init_pool_with_size(&config.database.url, config.database.max_connections)
            .await?;
    database::run_migrations(&pool).await?;

    let backends = Backends::from_config(&config, clock::system()).await?;
    let container = ServiceContainer::new(pool, config, backends)?;
    container.start();
    tracing::info!("billing-notify started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    container.shutdown().await?;

    Ok(())
}
