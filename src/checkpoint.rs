use sqlx::{PgConnection, PgPool};

use crate::db::repository;

/// Last fully processed block for a chain, or `None` before the first cycle.
pub async fn get(pool: &PgPool, chain_id: &str) -> eyre::Result<Option<u64>> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT last_processed_block FROM checkpoints WHERE chain_id = $1",
    )
    .bind(chain_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(b,)| b as u64))
}

/// Upsert the checkpoint. Called inside the batch's persist transaction so
/// the checkpoint never runs ahead of the rows it covers.
pub async fn set(conn: &mut PgConnection, chain_id: &str, block: u64) -> eyre::Result<()> {
    sqlx::query(
        "INSERT INTO checkpoints (chain_id, last_processed_block, updated_at) \
         VALUES ($1, $2, NOW()) \
         ON CONFLICT (chain_id) DO UPDATE \
         SET last_processed_block = $2, updated_at = NOW()",
    )
    .bind(chain_id)
    .bind(block as i64)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Resolve the crawler's resume point on startup.
///
/// Order: the checkpoint row, else `MAX(block_number)` from the transaction
/// table, else `start_block - 1`. The result is written back so the next
/// restart takes the fast path.
pub async fn load_or_recover(
    pool: &PgPool,
    chain_id: &str,
    start_block: u64,
) -> eyre::Result<u64> {
    if let Some(checkpoint) = get(pool, chain_id).await? {
        return Ok(checkpoint);
    }

    let recovered = match repository::max_block_number(pool, chain_id).await? {
        Some(max_block) => {
            tracing::info!(
                chain_id,
                max_block,
                "No checkpoint found, recovered resume point from transaction table"
            );
            max_block
        }
        None => start_block - 1,
    };

    let mut conn = pool.acquire().await?;
    set(&mut conn, chain_id, recovered).await?;

    Ok(recovered)
}
