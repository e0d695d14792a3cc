use crate::classifier::{classify_transaction, is_creation_candidate};
use crate::error::ScanError;
use crate::models::{BlockRecord, FetchedBlock, TransactionRecord, TxType};
use crate::node::ThrottledNode;
use crate::report::ErrorRecord;
use futures::future::join_all;
use log::warn;
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Everything learned about one block once all of its batches have reported back.
#[derive(Debug, Clone)]
pub struct BlockOutcome {
    pub block: BlockRecord,
    pub transactions: Vec<TransactionRecord>,
    pub errors: Vec<ErrorRecord>,
    pub batches: usize,
    pub failed_batches: usize,
}

impl BlockOutcome {
    pub fn number(&self) -> u64 {
        self.block.block_number
    }

    /// A block fails only when every one of its batches did.
    pub fn is_failed(&self) -> bool {
        self.batches > 0 && self.failed_batches == self.batches
    }

    pub fn creations(&self) -> impl Iterator<Item = &TransactionRecord> {
        self.transactions
            .iter()
            .filter(|tx| tx.tx_type == TxType::ContractCreation)
    }
}

#[derive(Debug, Default)]
struct BatchResult {
    records: Vec<TransactionRecord>,
    errors: Vec<ErrorRecord>,
}

impl BatchResult {
    fn failed(&self) -> bool {
        self.records.is_empty() && !self.errors.is_empty()
    }
}

/// Splits a block into fixed-size batches and classifies them on a bounded worker pool.
///
/// The pool is a semaphore shared by every block in flight, so at most `workers` batches run
/// at once across the whole scan.
pub struct BatchDispatcher {
    node: Arc<ThrottledNode>,
    workers: Arc<Semaphore>,
    batch_size: usize,
}

impl BatchDispatcher {
    pub fn new(node: Arc<ThrottledNode>, workers: usize, batch_size: usize) -> Self {
        BatchDispatcher {
            node,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            batch_size: batch_size.max(1),
        }
    }

    /// Stops handing out worker permits; batches already running finish.
    pub fn close(&self) {
        self.workers.close();
    }

    /// Classifies every transaction of `block` and waits for all batches before returning.
    pub async fn process_block(&self, block: Arc<FetchedBlock>) -> BlockOutcome {
        let number = block.number();
        let total = block.block.transactions.len();
        let mut handles = Vec::with_capacity(total.div_ceil(self.batch_size));

        for start in (0..total).step_by(self.batch_size) {
            let range = start..(start + self.batch_size).min(total);
            let permit = match self.workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(err) => {
                    let err = ScanError::Worker(err.to_string());
                    handles.push(tokio::spawn(async move {
                        BatchResult {
                            records: vec![],
                            errors: vec![ErrorRecord::for_block(&err, number)],
                        }
                    }));
                    continue;
                }
            };
            let node = self.node.clone();
            let block = block.clone();
            handles.push(tokio::spawn(async move {
                let result = run_batch(&node, &block, range).await;
                drop(permit);
                result
            }));
        }

        let mut outcome = BlockOutcome {
            block: block.record(),
            transactions: Vec::with_capacity(total),
            errors: vec![],
            batches: handles.len(),
            failed_batches: 0,
        };
        for joined in join_all(handles).await {
            let result = joined.unwrap_or_else(|err| BatchResult {
                records: vec![],
                errors: vec![ErrorRecord::for_block(&ScanError::from(err), number)],
            });
            if result.failed() {
                outcome.failed_batches += 1;
            }
            outcome.transactions.extend(result.records);
            outcome.errors.extend(result.errors);
        }

        if !outcome.errors.is_empty() {
            warn!(
                "Block {}: {} transaction errors, {}/{} batches failed",
                number,
                outcome.errors.len(),
                outcome.failed_batches,
                outcome.batches
            );
        }
        outcome
    }
}

async fn run_batch(
    node: &ThrottledNode,
    block: &FetchedBlock,
    range: Range<usize>,
) -> BatchResult {
    let mut result = BatchResult::default();
    for tx in &block.block.transactions[range] {
        let receipt = if is_creation_candidate(tx) {
            match block.receipts.get(&tx.hash) {
                Some(receipt) => Some(receipt.clone()),
                None => match node.receipt(&tx.hash).await {
                    Ok(receipt) => Some(receipt),
                    Err(err) => {
                        warn!(
                            "Block {}: receipt for {} unavailable: {}",
                            block.number(),
                            tx.hash,
                            err
                        );
                        result
                            .errors
                            .push(ErrorRecord::for_transaction(&err, block.number(), &tx.hash));
                        continue;
                    }
                },
            }
        } else {
            None
        };
        result
            .records
            .push(classify_transaction(&block.block, tx, receipt.as_ref()));
    }
    result
}
