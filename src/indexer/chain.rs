use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::{Address, B256};
use futures::StreamExt;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::checkpoint;
use crate::config::ChainConfig;
use crate::db::repository;
use crate::indexer::block_cache::{BlockCache, BlockEntry};
use crate::indexer::decoder::EventRegistry;
use crate::indexer::types::VaultTransaction;
use crate::rpc::{BlockMeta, RpcPool};

/// Upper bound on concurrent block-metadata fetches within one cycle.
const BLOCK_FETCH_CONCURRENCY: usize = 8;

/// Main entry point for a single chain's crawler task.
///
/// Resolves the resume point, then repeatedly runs the crawl cycle until
/// shutdown. A failed cycle never advances the checkpoint; it is retried
/// after `retry_delay` up to `max_retries` times, then after `restart_delay`.
pub async fn run_chain_crawler(
    config: ChainConfig,
    pool: PgPool,
    shutdown: CancellationToken,
) -> eyre::Result<()> {
    tracing::info!(chain = %config.name, chain_id = %config.chain_id, "Starting chain crawler");

    let contract = Address::from_str(&config.contract_address)
        .map_err(|e| eyre::eyre!("Invalid contract address '{}': {}", config.contract_address, e))?;
    let rpc = RpcPool::new(&config.rpc_urls, Duration::from_secs(config.rpc_timeout_secs))?;

    let last_processed =
        checkpoint::load_or_recover(&pool, &config.chain_id, config.start_block).await?;
    let unconfirmed = repository::count_unconfirmed(&pool, &config.chain_id).await?;
    tracing::info!(
        chain = %config.name,
        last_processed,
        unconfirmed,
        "Resume point resolved"
    );

    let crawler = ChainCrawler {
        registry: EventRegistry::standard(),
        cache: BlockCache::new(),
        contract,
        config,
        pool,
        rpc,
        last_processed,
    };

    crawler.run(shutdown).await
}

enum Cycle {
    /// Window persisted, more blocks remain below head.
    Progressed,
    /// Nothing left to process at the current head.
    CaughtUp,
    /// A reorg was rolled back; re-enter immediately.
    Reorged,
}

struct ChainCrawler {
    config: ChainConfig,
    contract: Address,
    pool: PgPool,
    rpc: RpcPool,
    registry: EventRegistry,
    cache: BlockCache,
    last_processed: u64,
}

impl ChainCrawler {
    async fn run(mut self, shutdown: CancellationToken) -> eyre::Result<()> {
        let mut attempts: u32 = 0;

        while !shutdown.is_cancelled() {
            let delay = match self.run_cycle().await {
                Ok(Cycle::Reorged) => {
                    attempts = 0;
                    continue;
                }
                Ok(Cycle::Progressed) => {
                    attempts = 0;
                    Duration::from_millis(self.config.polling_interval_ms)
                }
                Ok(Cycle::CaughtUp) => {
                    attempts = 0;
                    Duration::from_millis(self.config.restart_delay_ms)
                }
                Err(e) => {
                    attempts += 1;
                    if attempts <= self.config.max_retries {
                        tracing::error!(
                            chain = %self.config.name,
                            attempt = attempts,
                            max_retries = self.config.max_retries,
                            error = %e,
                            "Crawl cycle failed, retrying"
                        );
                        Duration::from_millis(self.config.retry_delay_ms)
                    } else {
                        tracing::error!(
                            chain = %self.config.name,
                            error = %e,
                            "Crawl cycle failed after all retries, backing off"
                        );
                        attempts = 0;
                        Duration::from_millis(self.config.restart_delay_ms)
                    }
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        tracing::info!(chain = %self.config.name, "Chain crawler stopped");
        Ok(())
    }

    /// One crawl cycle: head, reorg probe, window fetch, persist, advance.
    async fn run_cycle(&mut self) -> eyre::Result<Cycle> {
        let head = self.rpc.head_block_number().await?;

        if let Some(fork_block) = self.probe_reorg().await? {
            self.rollback(fork_block).await?;
            return Ok(Cycle::Reorged);
        }

        let Some((from_block, to_block)) =
            batch_window(self.last_processed, head, self.config.batch_size)
        else {
            return Ok(Cycle::CaughtUp);
        };

        let logs = self
            .rpc
            .logs(
                self.contract,
                from_block,
                to_block,
                self.registry.event_signatures(),
            )
            .await?;
        let events = self.registry.parse_all(&logs);

        let needed = blocks_to_cache(
            from_block,
            to_block,
            head,
            self.config.reorg_depth,
            events.iter().map(|e| e.block_number),
        );
        self.populate_cache(&needed).await?;

        // Stamp rows with cached block metadata. A miss here means an earlier
        // RPC response was bad; refetch once, then skip the event.
        let mut rows = Vec::with_capacity(events.len());
        for event in &events {
            let entry = match self.cache.get(event.block_number) {
                Some(entry) => entry.clone(),
                None => match self.rpc.block_by_number(event.block_number).await? {
                    Some(meta) => {
                        let entry = BlockEntry::from(meta);
                        self.cache.put(event.block_number, entry.clone());
                        entry
                    }
                    None => {
                        tracing::warn!(
                            chain = %self.config.name,
                            block = event.block_number,
                            tx_hash = %event.transaction_hash,
                            "Block metadata unavailable, skipping event"
                        );
                        continue;
                    }
                },
            };
            rows.push(VaultTransaction::from_event(event, &entry, head, &self.config)?);
        }

        // Persist the batch, refresh confirmations of prior rows, and advance
        // the checkpoint in one transaction: an observer sees all or nothing.
        let mut tx = self.pool.begin().await?;
        let written = repository::insert_transactions_batch(&mut tx, &rows).await?;
        let refreshed =
            repository::refresh_confirmations(&mut tx, &self.config.chain_id, head).await?;
        checkpoint::set(&mut tx, &self.config.chain_id, to_block).await?;
        tx.commit().await?;

        self.last_processed = to_block;
        self.cache
            .prune(head.saturating_sub(self.config.reorg_depth));

        tracing::info!(
            chain = %self.config.name,
            from = from_block,
            to = to_block,
            head,
            events = events.len(),
            written,
            refreshed,
            "Processed block window"
        );

        Ok(if to_block == head {
            Cycle::CaughtUp
        } else {
            Cycle::Progressed
        })
    }

    /// Walk back up to `reorg_depth` blocks from the checkpoint, comparing
    /// cached hashes against the canonical chain. Returns the deepest
    /// divergent height, or `None` when history is intact.
    async fn probe_reorg(&mut self) -> eyre::Result<Option<u64>> {
        let mut divergent: Option<u64> = None;

        for i in 0..self.config.reorg_depth {
            let Some(height) = self.last_processed.checked_sub(i) else {
                break;
            };
            if height < self.config.start_block {
                break;
            }
            let Some(cached) = self.cache.get(height).cloned() else {
                continue;
            };
            let Some(canonical) = self.rpc.block_by_number(height).await? else {
                continue;
            };

            let (next, stop) = fold_divergence(divergent, height, cached.hash, canonical.hash);
            divergent = next;
            if stop {
                // Canonical data is authoritative for the matching block.
                self.cache.put(height, BlockEntry::from(canonical));
                break;
            }
        }

        Ok(divergent)
    }

    /// Delete every row at or above the fork and rewind the checkpoint, in
    /// one transaction, then drop the stale cache suffix.
    async fn rollback(&mut self, fork_block: u64) -> eyre::Result<()> {
        let rewound = fork_block.saturating_sub(1);

        let mut tx = self.pool.begin().await?;
        let deleted = repository::delete_from_block(&mut tx, &self.config.chain_id, fork_block).await?;
        checkpoint::set(&mut tx, &self.config.chain_id, rewound).await?;
        tx.commit().await?;

        self.cache.drop_from(fork_block);
        self.last_processed = rewound;

        tracing::warn!(
            chain = %self.config.name,
            fork_block,
            deleted,
            last_processed = rewound,
            "Reorg rollback complete"
        );

        Ok(())
    }

    /// Fetch block metadata for every needed height not already cached,
    /// with a bounded parallel fan-out across the pool.
    async fn populate_cache(&mut self, needed: &BTreeSet<u64>) -> eyre::Result<()> {
        let missing: Vec<u64> = needed
            .iter()
            .copied()
            .filter(|n| self.cache.get(*n).is_none())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let rpc = &self.rpc;
        let fetched: Vec<(u64, eyre::Result<Option<BlockMeta>>)> =
            futures::stream::iter(missing)
                .map(|n| async move { (n, rpc.block_by_number(n).await) })
                .buffer_unordered(BLOCK_FETCH_CONCURRENCY)
                .collect()
                .await;

        for (number, result) in fetched {
            match result? {
                Some(meta) => self.cache.put(number, BlockEntry::from(meta)),
                None => {
                    tracing::warn!(
                        chain = %self.config.name,
                        block = number,
                        "Node has not seen block yet"
                    );
                }
            }
        }

        Ok(())
    }
}

/// The next unprocessed window `[from, to]`, or `None` when caught up.
fn batch_window(last_processed: u64, head: u64, batch_size: u64) -> Option<(u64, u64)> {
    let from = last_processed + 1;
    if from > head {
        return None;
    }
    Some((from, (from + batch_size - 1).min(head)))
}

/// Heights whose metadata this cycle must hold: blocks carrying events (to
/// stamp rows) plus the window's tail inside the reorg horizon (so the next
/// probe has hashes to compare).
fn blocks_to_cache(
    from_block: u64,
    to_block: u64,
    head: u64,
    reorg_depth: u64,
    event_blocks: impl IntoIterator<Item = u64>,
) -> BTreeSet<u64> {
    let mut needed: BTreeSet<u64> = event_blocks.into_iter().collect();
    let horizon = head.saturating_sub(reorg_depth.saturating_sub(1));
    for n in from_block.max(horizon)..=to_block {
        needed.insert(n);
    }
    needed
}

/// One step of the reorg probe's descending walk: a hash mismatch records
/// the height (deeper mismatches overwrite, so the deepest wins) and keeps
/// walking; a match stops the walk, since no deeper divergence is possible.
fn fold_divergence(
    divergent: Option<u64>,
    height: u64,
    cached_hash: B256,
    canonical_hash: B256,
) -> (Option<u64>, bool) {
    if cached_hash == canonical_hash {
        (divergent, true)
    } else {
        (Some(height), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_window() {
        // S1: checkpoint 999, head 1010, batch 100 -> [1000, 1010].
        assert_eq!(batch_window(999, 1010, 100), Some((1000, 1010)));
        // Window bounded by batch size.
        assert_eq!(batch_window(999, 2000, 100), Some((1000, 1099)));
        // Caught up.
        assert_eq!(batch_window(1010, 1010, 100), None);
        assert_eq!(batch_window(1010, 1005, 100), None);
    }

    #[test]
    fn test_blocks_to_cache_event_blocks_always_included() {
        // Window far behind the reorg horizon: only event blocks needed.
        let needed = blocks_to_cache(1000, 1099, 5000, 12, vec![1005, 1050]);
        assert_eq!(needed.into_iter().collect::<Vec<_>>(), vec![1005, 1050]);
    }

    #[test]
    fn test_blocks_to_cache_window_tail_in_horizon() {
        // Head 1010, depth 12 -> horizon [999, 1010]; window [1000, 1010].
        let needed = blocks_to_cache(1000, 1010, 1010, 12, vec![1005]);
        assert_eq!(
            needed.into_iter().collect::<Vec<_>>(),
            (1000..=1010).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_blocks_to_cache_partial_overlap() {
        // Head 1100, depth 12 -> horizon starts at 1089; window [1000, 1099].
        let needed = blocks_to_cache(1000, 1099, 1100, 12, vec![1004]);
        let expected: Vec<u64> = std::iter::once(1004).chain(1089..=1099).collect();
        assert_eq!(needed.into_iter().collect::<Vec<_>>(), expected);
    }

    #[test]
    fn test_fold_divergence_deepest_wins() {
        let h = |b: u8| B256::repeat_byte(b);

        // Walk 1015 -> 1013: mismatches at 1015 and 1014, match at 1013.
        let (d, stop) = fold_divergence(None, 1015, h(1), h(2));
        assert_eq!((d, stop), (Some(1015), false));
        let (d, stop) = fold_divergence(d, 1014, h(3), h(4));
        assert_eq!((d, stop), (Some(1014), false));
        let (d, stop) = fold_divergence(d, 1013, h(5), h(5));
        assert_eq!((d, stop), (Some(1014), true));
    }

    #[test]
    fn test_fold_divergence_clean_history() {
        let h = |b: u8| B256::repeat_byte(b);
        let (d, stop) = fold_divergence(None, 1020, h(7), h(7));
        assert_eq!((d, stop), (None, true));
    }
}
