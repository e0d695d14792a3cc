use crate::dispatcher::BlockOutcome;
use crate::error::ScanError;
use crate::models::{BlockRecord, DedupKey, TransactionRecord};
use crate::report::ErrorRecord;
use crate::retry::RetryPolicy;
use crate::sink::PersistenceSink;
use dashmap::DashSet;
use log::{debug, error};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Keys already handed to the sink during this run.
#[derive(Debug, Default)]
pub struct Deduplicator {
    seen: DashSet<DedupKey>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `key`; false if it was claimed before.
    pub fn claim(&self, key: DedupKey) -> bool {
        self.seen.insert(key)
    }

    /// Gives a claim back so a later attempt at the same record is not dropped.
    pub fn release(&self, key: &DedupKey) {
        self.seen.remove(key);
    }
}

/// What flushing one block produced.
#[derive(Debug, Default)]
pub struct FlushReport {
    pub block_persisted: bool,
    pub creations_persisted: usize,
    pub duplicates: usize,
    pub errors: Vec<ErrorRecord>,
}

/// Sends classified records to the sink at most once per run, with bounded retries.
pub struct PersistenceGateway {
    sink: Arc<dyn PersistenceSink>,
    dedup: Deduplicator,
    policy: RetryPolicy,
    duplicates: AtomicU64,
}

impl PersistenceGateway {
    pub fn new(sink: Arc<dyn PersistenceSink>, policy: RetryPolicy) -> Self {
        PersistenceGateway {
            sink,
            dedup: Deduplicator::new(),
            policy,
            duplicates: AtomicU64::new(0),
        }
    }

    pub fn sink(&self) -> &Arc<dyn PersistenceSink> {
        &self.sink
    }

    pub fn duplicates_dropped(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    pub async fn upsert_block(&self, block: &BlockRecord) -> Result<(), ScanError> {
        let label = format!("upsert block {}", block.block_number);
        self.policy
            .run(&label, || self.sink.upsert_block(block))
            .await
            .map_err(ScanError::from)
    }

    /// Persists one creation. `Ok(false)` when the record was already sent this run.
    pub async fn persist_creation(&self, tx: &TransactionRecord) -> Result<bool, ScanError> {
        let key = tx.dedup_key();
        if !self.dedup.claim(key.clone()) {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Dropping duplicate {} in block {}",
                key.tx_hash, key.block_number
            );
            return Ok(false);
        }

        let label = format!("upsert creation {}", tx.hash);
        let result = self
            .policy
            .run(&label, || self.sink.upsert_contract_creation(tx))
            .await;
        match result {
            Ok(()) => Ok(true),
            Err(err) => {
                self.dedup.release(&key);
                Err(ScanError::from(err))
            }
        }
    }

    /// Writes the block row, then each of its contract creations.
    ///
    /// Creations are skipped when the block row could not be written.
    pub async fn flush(&self, outcome: &BlockOutcome) -> FlushReport {
        let number = outcome.number();
        let mut report = FlushReport::default();

        if let Err(err) = self.upsert_block(&outcome.block).await {
            error!("Block {} not persisted: {}", number, err);
            report.errors.push(ErrorRecord::for_block(&err, number));
            return report;
        }
        report.block_persisted = true;

        for tx in outcome.creations() {
            match self.persist_creation(tx).await {
                Ok(true) => report.creations_persisted += 1,
                Ok(false) => report.duplicates += 1,
                Err(err) => {
                    error!("Contract creation {} not persisted: {}", tx.hash, err);
                    report
                        .errors
                        .push(ErrorRecord::for_transaction(&err, number, &tx.hash));
                }
            }
        }
        report
    }
}
