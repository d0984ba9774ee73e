use std::future::Future;
use std::time::Duration;

use alloy::primitives::{Address, B256};
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::types::{BlockNumberOrTag, Filter, Log, TransactionReceipt};
use alloy::transports::TransportResult;

/// Minimal block header data the crawler needs.
#[derive(Debug, Clone, Copy)]
pub struct BlockMeta {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: u64,
}

/// A façade over the ordered RPC endpoint list of one chain.
///
/// Every call runs against the first endpoint; on a recoverable error the
/// pool advances to the next one and retries, and only surfaces the last
/// error once all endpoints are exhausted. Non-recoverable errors propagate
/// immediately. Providers are built once per endpoint and reused.
pub struct RpcPool {
    providers: Vec<(String, RootProvider)>,
    call_timeout: Duration,
}

impl RpcPool {
    pub fn new(endpoints: &[String], call_timeout: Duration) -> eyre::Result<Self> {
        if endpoints.is_empty() {
            return Err(eyre::eyre!("RPC pool needs at least one endpoint"));
        }
        let mut providers = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let url = endpoint
                .parse()
                .map_err(|e| eyre::eyre!("Invalid RPC URL '{}': {}", endpoint, e))?;
            providers.push((endpoint.clone(), RootProvider::new_http(url)));
        }
        Ok(Self {
            providers,
            call_timeout,
        })
    }

    pub async fn head_block_number(&self) -> eyre::Result<u64> {
        self.failover("eth_blockNumber", |p| async move {
            p.get_block_number().await
        })
        .await
    }

    /// Returns `None` when the node has not yet seen the block.
    pub async fn block_by_number(&self, number: u64) -> eyre::Result<Option<BlockMeta>> {
        let block = self
            .failover("eth_getBlockByNumber", |p| async move {
                p.get_block_by_number(BlockNumberOrTag::Number(number)).await
            })
            .await?;

        Ok(block.map(|b| BlockMeta {
            number,
            hash: b.header.hash,
            parent_hash: b.header.parent_hash,
            timestamp: b.header.timestamp,
        }))
    }

    pub async fn transaction_receipt(
        &self,
        tx_hash: B256,
    ) -> eyre::Result<Option<TransactionReceipt>> {
        self.failover("eth_getTransactionReceipt", |p| async move {
            p.get_transaction_receipt(tx_hash).await
        })
        .await
    }

    /// Fetch logs emitted by `contract` in `[from_block, to_block]` whose
    /// `topic0` is one of `event_signatures`.
    pub async fn logs(
        &self,
        contract: Address,
        from_block: u64,
        to_block: u64,
        event_signatures: Vec<B256>,
    ) -> eyre::Result<Vec<Log>> {
        self.failover("eth_getLogs", |p| {
            let filter = Filter::new()
                .address(contract)
                .event_signature(event_signatures.clone())
                .from_block(from_block)
                .to_block(to_block);
            async move { p.get_logs(&filter).await }
        })
        .await
    }

    async fn failover<T, F, Fut>(&self, op: &'static str, f: F) -> eyre::Result<T>
    where
        F: Fn(RootProvider) -> Fut,
        Fut: Future<Output = TransportResult<T>>,
    {
        let mut last_error: Option<eyre::Report> = None;

        for (endpoint, provider) in &self.providers {
            match tokio::time::timeout(self.call_timeout, f(provider.clone())).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    let message = e.to_string();
                    if !is_recoverable(&message) {
                        return Err(eyre::eyre!("{} failed on {}: {}", op, endpoint, message));
                    }
                    tracing::warn!(%op, %endpoint, error = %message, "Recoverable RPC error, trying next endpoint");
                    last_error = Some(eyre::eyre!("{} failed on {}: {}", op, endpoint, message));
                }
                Err(_) => {
                    tracing::warn!(
                        %op,
                        %endpoint,
                        timeout_ms = self.call_timeout.as_millis() as u64,
                        "RPC call timed out, trying next endpoint"
                    );
                    last_error = Some(eyre::eyre!("{} timed out on {}", op, endpoint));
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| eyre::eyre!("{} failed: no endpoints configured", op)))
    }
}

/// Classify an RPC error as worth retrying on another endpoint.
///
/// Substring inspection of the error display. Intentionally a single small
/// predicate so it can be swapped for structured error codes once the client
/// exposes them.
pub fn is_recoverable(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("429")
        || message.contains("too many requests")
        || message.contains("rate limit")
        || message.contains("pruned")
        || message.contains("missing trie node")
        || message.contains("disconnect")
        || message.contains("connection")
        || message.contains("could not detect network")
        || message.contains("internal error")
        || message.contains("timed out")
        || message.contains("timeout")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_errors() {
        assert!(is_recoverable("HTTP error 429 Too Many Requests"));
        assert!(is_recoverable("your app has exceeded its rate limit"));
        assert!(is_recoverable("requested block has been pruned"));
        assert!(is_recoverable("missing trie node abc123"));
        assert!(is_recoverable("websocket disconnect"));
        assert!(is_recoverable("error sending request: connection refused"));
        assert!(is_recoverable("could not detect network"));
        assert!(is_recoverable("Internal error: please retry"));
        assert!(is_recoverable("operation timed out"));
    }

    #[test]
    fn test_non_recoverable_errors() {
        assert!(!is_recoverable("invalid argument 0: hex string without 0x prefix"));
        assert!(!is_recoverable("unauthorized: invalid api key"));
        assert!(!is_recoverable("execution reverted"));
        assert!(!is_recoverable("deserialization error: missing field"));
    }

    #[test]
    fn test_pool_rejects_empty_endpoint_list() {
        assert!(RpcPool::new(&[], Duration::from_secs(30)).is_err());
    }

    #[test]
    fn test_pool_rejects_malformed_url() {
        let endpoints = vec!["not a url".to_string()];
        assert!(RpcPool::new(&endpoints, Duration::from_secs(30)).is_err());
    }
}
