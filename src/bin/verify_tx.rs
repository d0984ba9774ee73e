//! One-shot operational entry point for the fallback verifier: check a
//! transaction hash the live crawler may have missed and backfill it.
//!
//! Usage: verify-tx <chain-id> <tx-hash> [config-path]

use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use vaultwatch_indexer::config::Config;
use vaultwatch_indexer::indexer::verifier::Verifier;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(chain_id), Some(tx_hash)) = (args.next(), args.next()) else {
        eprintln!("usage: verify-tx <chain-id> <tx-hash> [config-path]");
        std::process::exit(2);
    };
    let config_path = args.next().unwrap_or_else(|| "config.toml".to_string());

    let config = Config::load(&config_path)?;

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&config.database.url)
        .await
        .map_err(|e| eyre::eyre!("Failed to connect to database: {}", e))?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| eyre::eyre!("Failed to run migrations: {}", e))?;

    let verifier = Verifier::new(pool, config.chains.clone())?;
    let outcome = verifier.verify(&chain_id, &tx_hash).await?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);

    if !outcome.found {
        std::process::exit(1);
    }
    Ok(())
}
