use sqlx::{PgConnection, PgPool};

use crate::indexer::types::{TransactionRecord, VaultTransaction};

/// Insert a batch of rows using multi-row INSERT. Chunks into groups of 500
/// to stay within PostgreSQL parameter limits.
///
/// Conflicts on `transaction_hash` fall through to a per-row upsert that only
/// ever raises `confirmations` and is a no-op when nothing changed, so
/// replaying a window is idempotent and concurrent writers converge on one
/// row per event.
pub async fn insert_transactions_batch(
    conn: &mut PgConnection,
    rows: &[VaultTransaction],
) -> eyre::Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }

    let mut written = 0u64;
    for chunk in rows.chunks(500) {
        let mut query_builder: sqlx::QueryBuilder<sqlx::Postgres> = sqlx::QueryBuilder::new(
            "INSERT INTO vault_transactions (transaction_hash, chain_id, address, operation, \
             raw_amount, amount, token_decimals, token_address, contract_address, block_number, \
             block_hash, block_time, confirmations, require_confirmations, status) ",
        );

        query_builder.push_values(chunk, |mut b, t| {
            b.push_bind(&t.transaction_hash)
                .push_bind(&t.chain_id)
                .push_bind(&t.address)
                .push_bind(t.operation.as_str())
                .push_bind(&t.raw_amount)
                .push_bind(&t.amount)
                .push_bind(t.token_decimals)
                .push_bind(&t.token_address)
                .push_bind(&t.contract_address)
                .push_bind(t.block_number)
                .push_bind(&t.block_hash)
                .push_bind(t.block_time)
                .push_bind(t.confirmations)
                .push_bind(t.require_confirmations)
                .push_bind(t.status.as_str());
        });

        query_builder.push(
            " ON CONFLICT (transaction_hash) DO UPDATE \
             SET confirmations = EXCLUDED.confirmations, \
                 status = EXCLUDED.status, \
                 updated_at = NOW() \
             WHERE vault_transactions.confirmations < EXCLUDED.confirmations",
        );
        let result = query_builder.build().execute(&mut *conn).await?;
        written += result.rows_affected();
    }

    Ok(written)
}

/// Insert or update a single row, keyed on `transaction_hash`.
///
/// The update path only fires when it would raise `confirmations`, so the
/// call is idempotent and never regresses a row.
pub async fn upsert_transaction(
    conn: &mut PgConnection,
    t: &VaultTransaction,
) -> eyre::Result<bool> {
    let result = sqlx::query(
        "INSERT INTO vault_transactions (transaction_hash, chain_id, address, operation, \
         raw_amount, amount, token_decimals, token_address, contract_address, block_number, \
         block_hash, block_time, confirmations, require_confirmations, status) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
         ON CONFLICT (transaction_hash) DO UPDATE \
         SET confirmations = EXCLUDED.confirmations, \
             status = EXCLUDED.status, \
             updated_at = NOW() \
         WHERE vault_transactions.confirmations < EXCLUDED.confirmations",
    )
    .bind(&t.transaction_hash)
    .bind(&t.chain_id)
    .bind(&t.address)
    .bind(t.operation.as_str())
    .bind(&t.raw_amount)
    .bind(&t.amount)
    .bind(t.token_decimals)
    .bind(&t.token_address)
    .bind(&t.contract_address)
    .bind(t.block_number)
    .bind(&t.block_hash)
    .bind(t.block_time)
    .bind(t.confirmations)
    .bind(t.require_confirmations)
    .bind(t.status.as_str())
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Recompute confirmations for every unconfirmed row of a chain against the
/// current head, flipping status to CONFIRMED when the row's own threshold
/// is met. Only ever raises the count. Returns the number of rows touched.
pub async fn refresh_confirmations(
    conn: &mut PgConnection,
    chain_id: &str,
    head: u64,
) -> eyre::Result<u64> {
    let result = sqlx::query(
        "UPDATE vault_transactions \
         SET confirmations = LEAST($2 - block_number + 1, require_confirmations), \
             status = CASE \
                 WHEN LEAST($2 - block_number + 1, require_confirmations) >= require_confirmations \
                 THEN 'CONFIRMED' ELSE 'PENDING' END, \
             updated_at = NOW() \
         WHERE chain_id = $1 \
           AND confirmations < require_confirmations \
           AND LEAST($2 - block_number + 1, require_confirmations) > confirmations",
    )
    .bind(chain_id)
    .bind(head as i64)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

/// Delete all rows at or above a block number (reorg rollback).
pub async fn delete_from_block(
    conn: &mut PgConnection,
    chain_id: &str,
    from_block: u64,
) -> eyre::Result<u64> {
    let result = sqlx::query(
        "DELETE FROM vault_transactions WHERE chain_id = $1 AND block_number >= $2",
    )
    .bind(chain_id)
    .bind(from_block as i64)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

/// Highest persisted block for a chain. Used for checkpoint recovery.
pub async fn max_block_number(pool: &PgPool, chain_id: &str) -> eyre::Result<Option<u64>> {
    let row: (Option<i64>,) = sqlx::query_as(
        "SELECT MAX(block_number) FROM vault_transactions WHERE chain_id = $1",
    )
    .bind(chain_id)
    .fetch_one(pool)
    .await?;

    Ok(row.0.map(|b| b as u64))
}

/// Look up a row by its canonical (lower-hex) transaction hash.
pub async fn get_by_tx_hash(
    pool: &PgPool,
    chain_id: &str,
    transaction_hash: &str,
) -> eyre::Result<Option<TransactionRecord>> {
    let record = sqlx::query_as::<_, TransactionRecord>(
        "SELECT * FROM vault_transactions WHERE chain_id = $1 AND transaction_hash = $2",
    )
    .bind(chain_id)
    .bind(transaction_hash)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Rows of a chain still below their confirmation threshold.
pub async fn count_unconfirmed(pool: &PgPool, chain_id: &str) -> eyre::Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM vault_transactions \
         WHERE chain_id = $1 AND confirmations < require_confirmations",
    )
    .bind(chain_id)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}
