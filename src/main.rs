use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use vaultwatch_indexer::config::Config;
use vaultwatch_indexer::indexer::chain::run_chain_crawler;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    // Initialize structured logging (set RUST_LOG=info for output)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    tracing::info!("VaultWatch Indexer starting");

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = Config::load(&config_path)?;
    let chains = config.active_chains()?;
    tracing::info!(
        chains = chains.len(),
        "Configuration loaded from {}",
        config_path
    );

    // Create database connection pool
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .map_err(|e| eyre::eyre!("Failed to connect to database: {}", e))?;

    tracing::info!("Connected to PostgreSQL");

    // Run migrations
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| eyre::eyre!("Failed to run migrations: {}", e))?;

    tracing::info!("Database migrations complete");

    // Create shutdown signal
    let shutdown = CancellationToken::new();

    // Spawn one crawler task per active chain
    let mut handles = Vec::new();
    for chain_config in chains {
        let pool = pool.clone();
        let shutdown = shutdown.clone();
        let chain_name = chain_config.name.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = run_chain_crawler(chain_config, pool, shutdown).await {
                tracing::error!(chain = %chain_name, error = %e, "Chain crawler failed");
            }
        });

        handles.push(handle);
    }

    tracing::info!("All chain crawlers started. Press Ctrl+C to stop.");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping all crawlers...");
    shutdown.cancel();

    // Wait for all tasks to finish
    for handle in handles {
        let _ = handle.await;
    }

    tracing::info!("VaultWatch Indexer stopped gracefully");
    Ok(())
}
