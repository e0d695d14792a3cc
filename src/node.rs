use crate::error::ScanError;
use crate::models::{RawBlock, RawReceipt, RawTransaction, TxStatus};
use crate::rate_limiter::RateLimiter;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use ethers::providers::Middleware;
use ethers::types::{Transaction, TransactionReceipt, H256, U256, U64};
use log::debug;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// The read-only view of a chain node the scanner needs.
///
/// `Ok(None)` means the node does not have the data yet; callers retry it like a transient
/// failure, since the head number can race ahead of block availability.
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn latest_block_number(&self) -> Result<u64, ScanError>;

    async fn block(&self, number: u64) -> Result<Option<RawBlock>, ScanError>;

    /// How many transactions the node says block `number` holds.
    async fn block_transaction_count(&self, number: u64) -> Result<Option<usize>, ScanError>;

    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<RawReceipt>, ScanError>;
}

/// [`NodeClient`] backed by an `ethers` middleware stack.
pub struct EthersNode<M> {
    provider: Arc<M>,
}

impl<M> EthersNode<M> {
    pub fn new(provider: Arc<M>) -> Self {
        EthersNode { provider }
    }
}

#[async_trait]
impl<M> NodeClient for EthersNode<M>
where
    M: Middleware + 'static,
{
    async fn latest_block_number(&self) -> Result<u64, ScanError> {
        let number = self
            .provider
            .get_block_number()
            .await
            .map_err(ScanError::transport)?;
        Ok(number.as_u64())
    }

    async fn block(&self, number: u64) -> Result<Option<RawBlock>, ScanError> {
        let Some(block) = self
            .provider
            .get_block_with_txs(number)
            .await
            .map_err(ScanError::transport)?
        else {
            return Ok(None);
        };

        Ok(Some(RawBlock {
            number,
            hash: block.hash.map(|h| format!("{:?}", h)).unwrap_or_default(),
            timestamp: block.timestamp.low_u64(),
            transactions: block.transactions.iter().map(raw_transaction).collect(),
        }))
    }

    async fn block_transaction_count(&self, number: u64) -> Result<Option<usize>, ScanError> {
        let count: Option<U256> = self
            .provider
            .provider()
            .request("eth_getBlockTransactionCountByNumber", [U64::from(number)])
            .await
            .map_err(ScanError::transport)?;
        Ok(count.map(|count| count.low_u64() as usize))
    }

    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<RawReceipt>, ScanError> {
        let hash: H256 = tx_hash.parse().map_err(|_| ScanError::MalformedReceipt {
            tx_hash: tx_hash.to_string(),
            reason: "not a 32-byte hash".to_string(),
        })?;
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(ScanError::transport)?;
        Ok(receipt.as_ref().map(raw_receipt))
    }
}

/// Counters for every call issued through a [`ThrottledNode`].
#[derive(Debug, Default)]
pub struct RpcStats {
    calls: AtomicU64,
    failures: AtomicU64,
}

impl RpcStats {
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Fraction of calls that succeeded; 1.0 before any call was made.
    pub fn success_rate(&self) -> f64 {
        let calls = self.calls();
        if calls == 0 {
            return 1.0;
        }
        calls.saturating_sub(self.failures()) as f64 / calls as f64
    }
}

/// Wraps a [`NodeClient`] so every call waits on the shared [`RateLimiter`], carries a
/// timeout and is counted.
pub struct ThrottledNode {
    inner: Arc<dyn NodeClient>,
    limiter: Arc<RateLimiter>,
    call_timeout: Duration,
    policy: RetryPolicy,
    stats: RpcStats,
}

impl ThrottledNode {
    pub fn new(
        inner: Arc<dyn NodeClient>,
        limiter: Arc<RateLimiter>,
        call_timeout: Duration,
        policy: RetryPolicy,
    ) -> Self {
        ThrottledNode {
            inner,
            limiter,
            call_timeout,
            policy,
            stats: RpcStats::default(),
        }
    }

    pub fn stats(&self) -> &RpcStats {
        &self.stats
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    async fn call<T, F>(&self, operation: &'static str, request: F) -> Result<T, ScanError>
    where
        F: Future<Output = Result<T, ScanError>>,
    {
        self.limiter.acquire().await;
        self.stats.calls.fetch_add(1, Ordering::Relaxed);
        let result = match timeout(self.call_timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(ScanError::Timeout { operation }),
        };
        if let Err(err) = &result {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
            debug!("{} failed: {}", operation, err);
        }
        result
    }

    /// One rate-limited attempt; `None` when the node has no such block yet.
    pub async fn block_once(&self, number: u64) -> Result<Option<RawBlock>, ScanError> {
        self.call("eth_getBlockByNumber", self.inner.block(number)).await
    }

    /// One rate-limited attempt at the declared transaction count of a block.
    pub async fn transaction_count_once(&self, number: u64) -> Result<Option<usize>, ScanError> {
        self.call(
            "eth_getBlockTransactionCountByNumber",
            self.inner.block_transaction_count(number),
        )
        .await
    }

    pub async fn receipt_once(&self, tx_hash: &str) -> Result<Option<RawReceipt>, ScanError> {
        self.call(
            "eth_getTransactionReceipt",
            self.inner.transaction_receipt(tx_hash),
        )
        .await
    }

    /// Chain head, retried under the node policy.
    pub async fn latest_block_number(&self) -> Result<u64, ScanError> {
        self.policy
            .run("eth_blockNumber", || {
                self.call("eth_blockNumber", self.inner.latest_block_number())
            })
            .await
            .map_err(ScanError::from)
    }

    /// Receipt for `tx_hash`, retried until the node has it or the budget runs out.
    pub async fn receipt(&self, tx_hash: &str) -> Result<RawReceipt, ScanError> {
        let label = format!("receipt {}", tx_hash);
        self.policy
            .run(&label, || async {
                let receipt = self
                    .receipt_once(tx_hash)
                    .await?
                    .ok_or_else(|| ScanError::NotFound(format!("receipt {}", tx_hash)))?;
                check_receipt(tx_hash, &receipt)?;
                Ok::<_, ScanError>(receipt)
            })
            .await
            .map_err(ScanError::from)
    }
}

/// A receipt must belong to the transaction it was requested for.
pub fn check_receipt(tx_hash: &str, receipt: &RawReceipt) -> Result<(), ScanError> {
    if receipt.tx_hash.eq_ignore_ascii_case(tx_hash) {
        Ok(())
    } else {
        Err(ScanError::MalformedReceipt {
            tx_hash: tx_hash.to_string(),
            reason: format!("receipt is for {}", receipt.tx_hash),
        })
    }
}

fn raw_transaction(tx: &Transaction) -> RawTransaction {
    RawTransaction {
        hash: format!("{:?}", tx.hash),
        from: format!("{:?}", tx.from),
        to: tx.to.map(|addr| format!("{:?}", addr)),
        input: tx.input.to_vec(),
    }
}

fn raw_receipt(receipt: &TransactionReceipt) -> RawReceipt {
    RawReceipt {
        tx_hash: format!("{:?}", receipt.transaction_hash),
        status: receipt.status.map(|status| {
            if status.is_zero() {
                TxStatus::Failed
            } else {
                TxStatus::Success
            }
        }),
        contract_address: receipt.contract_address.map(|addr| format!("{:?}", addr)),
        gas_used: receipt.gas_used.map(|gas| gas.low_u64()),
        logs_count: receipt.logs.len(),
    }
}
