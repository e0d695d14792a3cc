use crate::cache::BlockCache;
use crate::classifier::is_creation_candidate;
use crate::error::ScanError;
use crate::models::FetchedBlock;
use crate::node::{check_receipt, ThrottledNode};
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinSet;

type SharedFetch = Shared<BoxFuture<'static, Result<Arc<FetchedBlock>, ScanError>>>;

/// A fetch in progress, or one that failed and has not been handed to a consumer yet.
struct Inflight {
    id: u64,
    fetch: SharedFetch,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Fetches blocks ahead of the consumer and serves them out of a [`BlockCache`].
///
/// Concurrent requests for the same block share one fetch. Background prefetches run on a
/// `JoinSet` so they can be dropped on shutdown; a consumer awaiting the same block keeps
/// driving the shared fetch to completion. A failed background fetch is kept until the
/// consumer asks for that block, so the error reaches it without a second retry budget.
pub struct Prefetcher {
    node: Arc<ThrottledNode>,
    cache: BlockCache,
    inflight: Mutex<HashMap<u64, Inflight>>,
    next_id: AtomicU64,
    background: Mutex<JoinSet<()>>,
}

impl Prefetcher {
    pub fn new(node: Arc<ThrottledNode>, cache_capacity: usize) -> Self {
        Prefetcher {
            node,
            cache: BlockCache::new(cache_capacity),
            inflight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            background: Mutex::new(JoinSet::new()),
        }
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    /// The block from cache, or fetched now if it is not there.
    pub async fn get(self: &Arc<Self>, number: u64) -> Result<Arc<FetchedBlock>, ScanError> {
        if let Some(block) = self.cache.get(number) {
            return Ok(block);
        }
        let (id, fetch) = self.fetch_shared(number);
        let result = fetch.await;
        if result.is_err() {
            self.forget(number, id);
        }
        result
    }

    /// Starts background fetches for up to `count` blocks from `from`, never past `last`.
    pub fn prefetch(self: &Arc<Self>, from: u64, count: usize, last: Option<u64>) {
        let mut tasks = lock(&self.background);
        while tasks.try_join_next().is_some() {}

        for number in (from..).take(count) {
            if last.is_some_and(|last| number > last) {
                break;
            }
            if self.cache.contains(number) || lock(&self.inflight).contains_key(&number) {
                continue;
            }
            let (_, fetch) = self.fetch_shared(number);
            tasks.spawn(async move {
                if let Err(err) = fetch.await {
                    warn!("Prefetch of block {} failed: {}", number, err);
                }
            });
        }
    }

    /// Drops background fetches nobody is waiting on. Failed fetches stay for their consumer.
    pub fn cancel_pending(&self) {
        lock(&self.background).abort_all();
        lock(&self.inflight).retain(|_, entry| entry.fetch.peek().is_some());
    }

    pub fn release(&self) {
        lock(&self.background).abort_all();
        lock(&self.inflight).clear();
        self.cache.clear();
    }

    fn forget(&self, number: u64, id: u64) {
        let mut inflight = lock(&self.inflight);
        if inflight.get(&number).is_some_and(|entry| entry.id == id) {
            inflight.remove(&number);
        }
    }

    fn fetch_shared(self: &Arc<Self>, number: u64) -> (u64, SharedFetch) {
        let mut inflight = lock(&self.inflight);
        if let Some(entry) = inflight.get(&number) {
            return (entry.id, entry.fetch.clone());
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // A fetch that just finished has already landed in the cache.
        if let Some(block) = self.cache.get(number) {
            return (id, futures::future::ready(Ok(block)).boxed().shared());
        }

        let this = self.clone();
        let fetch = async move {
            let result = this.fetch_validated(number).await.map(Arc::new);
            if let Ok(block) = &result {
                if let Some(evicted) = this.cache.insert(block.clone()) {
                    debug!("Evicted block {} from cache", evicted);
                }
                this.forget(number, id);
            }
            result
        }
        .boxed()
        .shared();
        inflight.insert(
            number,
            Inflight {
                id,
                fetch: fetch.clone(),
            },
        );
        (id, fetch)
    }

    async fn fetch_validated(&self, number: u64) -> Result<FetchedBlock, ScanError> {
        let label = format!("block {}", number);
        self.node
            .policy()
            .run(&label, || self.fetch_once(number))
            .await
            .map_err(ScanError::from)
    }

    /// One attempt at a block plus the receipts of its creation candidates.
    ///
    /// A short body or a mismatched receipt fails the attempt as a whole. Receipts the node
    /// cannot serve yet are left out and fetched later by the worker that needs them.
    async fn fetch_once(&self, number: u64) -> Result<FetchedBlock, ScanError> {
        let (block, declared) = futures::try_join!(
            self.node.block_once(number),
            self.node.transaction_count_once(number)
        )?;
        let not_found = || ScanError::NotFound(format!("block {}", number));
        let block = block.ok_or_else(not_found)?;
        let declared = declared.ok_or_else(not_found)?;

        if declared != block.transactions.len() {
            return Err(ScanError::TxCountMismatch {
                block: number,
                declared,
                parsed: block.transactions.len(),
            });
        }

        let candidates: Vec<_> = block
            .transactions
            .iter()
            .filter(|tx| is_creation_candidate(tx))
            .collect();
        let fetched = join_all(
            candidates
                .iter()
                .map(|tx| self.node.receipt_once(&tx.hash)),
        )
        .await;

        let mut receipts = HashMap::with_capacity(candidates.len());
        for (tx, result) in candidates.into_iter().zip(fetched) {
            match result {
                Ok(Some(receipt)) => {
                    check_receipt(&tx.hash, &receipt)?;
                    receipts.insert(tx.hash.clone(), receipt);
                }
                Ok(None) => debug!("Receipt for {} not available yet", tx.hash),
                Err(err) => debug!("Receipt for {} deferred: {}", tx.hash, err),
            }
        }

        debug!(
            "Fetched block {} ({} transactions, {} receipts)",
            number,
            block.transactions.len(),
            receipts.len()
        );
        Ok(FetchedBlock { block, receipts })
    }
}
