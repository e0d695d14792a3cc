#![allow(dead_code)]

use async_trait::async_trait;
use contract_scanner::config::ScannerConfig;
use contract_scanner::error::{ScanError, SinkError};
use contract_scanner::models::{
    BlockRecord, RawBlock, RawReceipt, RawTransaction, TransactionRecord, TxStatus,
};
use contract_scanner::node::NodeClient;
use contract_scanner::sink::PersistenceSink;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub const CREATION_CODE: [u8; 6] = [0x60, 0x80, 0x60, 0x40, 0x52, 0x00];

pub fn tx_hash(block: u64, index: usize) -> String {
    format!("0x{:064x}", block * 10_000 + index as u64)
}

pub fn fast_config() -> ScannerConfig {
    ScannerConfig {
        requests_per_second: 10_000,
        call_timeout_ms: 1_000,
        fetch_attempts: 3,
        sink_attempts: 3,
        retry_min_delay_ms: 1,
        retry_max_delay_ms: 5,
        head_poll_interval_ms: 50,
        ..ScannerConfig::default()
    }
}

/// Builds blocks and their receipts for the fake node.
pub struct BlockFixture {
    pub block: RawBlock,
    pub receipts: Vec<RawReceipt>,
}

impl BlockFixture {
    pub fn new(number: u64) -> Self {
        BlockFixture {
            block: RawBlock {
                number,
                hash: format!("0x{:064x}", number),
                timestamp: 1_700_000_000 + number * 12,
                transactions: vec![],
            },
            receipts: vec![],
        }
    }

    fn push(&mut self, to: Option<&str>, input: Vec<u8>) -> String {
        let hash = tx_hash(self.block.number, self.block.transactions.len());
        self.block.transactions.push(RawTransaction {
            hash: hash.clone(),
            from: "0x00000000000000000000000000000000000000aa".to_string(),
            to: to.map(str::to_string),
            input,
        });
        hash
    }

    pub fn normal(mut self, count: usize) -> Self {
        for _ in 0..count {
            self.push(Some("0x00000000000000000000000000000000000000bb"), vec![]);
        }
        self
    }

    pub fn creation(mut self) -> Self {
        let hash = self.push(None, CREATION_CODE.to_vec());
        let index = self.block.transactions.len();
        self.receipts.push(RawReceipt {
            tx_hash: hash,
            status: Some(TxStatus::Success),
            contract_address: Some(format!("0x{:040x}", self.block.number * 100 + index as u64)),
            gas_used: Some(120_000),
            logs_count: 0,
        });
        self
    }

    /// `to = null` but the deployment reverted: no contract address.
    pub fn failed_creation(mut self) -> Self {
        let hash = self.push(None, CREATION_CODE.to_vec());
        self.receipts.push(RawReceipt {
            tx_hash: hash,
            status: Some(TxStatus::Failed),
            contract_address: None,
            gas_used: Some(80_000),
            logs_count: 0,
        });
        self
    }

    /// A creation whose receipt the node never serves.
    pub fn creation_without_receipt(mut self) -> Self {
        self.push(None, CREATION_CODE.to_vec());
        self
    }
}

#[derive(Default)]
pub struct MockNode {
    blocks: Mutex<HashMap<u64, RawBlock>>,
    receipts: Mutex<HashMap<String, RawReceipt>>,
    head: AtomicU64,
    head_down: AtomicBool,
    block_calls: Mutex<HashMap<u64, usize>>,
    receipt_calls: AtomicUsize,
    short_bodies: Mutex<HashMap<u64, usize>>,
    stalls: Mutex<HashMap<u64, usize>>,
    unreachable: Mutex<HashSet<u64>>,
    delays: Mutex<HashMap<u64, Duration>>,
    default_delay: Mutex<Option<Duration>>,
}

impl MockNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, fixture: BlockFixture) {
        let mut receipts = self.receipts.lock().unwrap();
        for receipt in fixture.receipts {
            receipts.insert(receipt.tx_hash.clone(), receipt);
        }
        let number = fixture.block.number;
        self.blocks.lock().unwrap().insert(number, fixture.block);
        self.head.fetch_max(number, Ordering::SeqCst);
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    /// Serve a body missing its last transaction the next `times` fetches of `number`.
    pub fn truncate(&self, number: u64, times: usize) {
        self.short_bodies.lock().unwrap().insert(number, times);
    }

    /// The next `times` fetches of `number` never answer.
    pub fn stall(&self, number: u64, times: usize) {
        self.stalls.lock().unwrap().insert(number, times);
    }

    /// Every later head query fails.
    pub fn take_head_down(&self) {
        self.head_down.store(true, Ordering::SeqCst);
    }

    pub fn make_unreachable(&self, number: u64) {
        self.unreachable.lock().unwrap().insert(number);
    }

    pub fn delay(&self, number: u64, delay: Duration) {
        self.delays.lock().unwrap().insert(number, delay);
    }

    pub fn delay_all(&self, delay: Duration) {
        *self.default_delay.lock().unwrap() = Some(delay);
    }

    pub fn block_calls(&self, number: u64) -> usize {
        self.block_calls
            .lock()
            .unwrap()
            .get(&number)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_block_calls(&self) -> usize {
        self.block_calls.lock().unwrap().values().sum()
    }

    pub fn receipt_calls(&self) -> usize {
        self.receipt_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeClient for MockNode {
    async fn latest_block_number(&self) -> Result<u64, ScanError> {
        if self.head_down.load(Ordering::SeqCst) {
            return Err(ScanError::Transport("connection reset".to_string()));
        }
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn block(&self, number: u64) -> Result<Option<RawBlock>, ScanError> {
        *self.block_calls.lock().unwrap().entry(number).or_default() += 1;

        let stalled = match self.stalls.lock().unwrap().get_mut(&number) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        if stalled {
            std::future::pending::<()>().await;
        }

        let delay = self
            .delays
            .lock()
            .unwrap()
            .get(&number)
            .copied()
            .or(*self.default_delay.lock().unwrap());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.unreachable.lock().unwrap().contains(&number) {
            return Err(ScanError::Transport("connection refused".to_string()));
        }
        let Some(mut block) = self.blocks.lock().unwrap().get(&number).cloned() else {
            return Ok(None);
        };
        let mut short = self.short_bodies.lock().unwrap();
        if let Some(remaining) = short.get_mut(&number) {
            if *remaining > 0 {
                *remaining -= 1;
                block.transactions.pop();
            }
        }
        Ok(Some(block))
    }

    async fn block_transaction_count(&self, number: u64) -> Result<Option<usize>, ScanError> {
        if self.unreachable.lock().unwrap().contains(&number) {
            return Err(ScanError::Transport("connection refused".to_string()));
        }
        Ok(self
            .blocks
            .lock()
            .unwrap()
            .get(&number)
            .map(|block| block.transactions.len()))
    }

    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<RawReceipt>, ScanError> {
        self.receipt_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.receipts.lock().unwrap().get(tx_hash).cloned())
    }
}

/// Records every upsert; rows are keyed like the real tables.
#[derive(Default)]
pub struct MemorySink {
    blocks: Mutex<BTreeMap<u64, BlockRecord>>,
    creations: Mutex<BTreeMap<String, TransactionRecord>>,
    block_order: Mutex<Vec<u64>>,
    block_calls: AtomicUsize,
    creation_calls: AtomicUsize,
    transient_creation_failures: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `times` creation upserts fail with a transient error.
    pub fn fail_creations(&self, times: usize) {
        self.transient_creation_failures
            .store(times, Ordering::SeqCst);
    }

    pub fn block_calls(&self) -> usize {
        self.block_calls.load(Ordering::SeqCst)
    }

    pub fn creation_calls(&self) -> usize {
        self.creation_calls.load(Ordering::SeqCst)
    }

    pub fn block_rows(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }

    pub fn creation_rows(&self) -> Vec<TransactionRecord> {
        self.creations.lock().unwrap().values().cloned().collect()
    }

    pub fn block_order(&self) -> Vec<u64> {
        self.block_order.lock().unwrap().clone()
    }
}

#[async_trait]
impl PersistenceSink for MemorySink {
    async fn upsert_block(&self, block: &BlockRecord) -> Result<(), SinkError> {
        self.block_calls.fetch_add(1, Ordering::SeqCst);
        self.block_order.lock().unwrap().push(block.block_number);
        self.blocks
            .lock()
            .unwrap()
            .insert(block.block_number, block.clone());
        Ok(())
    }

    async fn upsert_contract_creation(&self, tx: &TransactionRecord) -> Result<(), SinkError> {
        self.creation_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .transient_creation_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SinkError::Transient("503 Service Unavailable".to_string()));
        }
        self.creations
            .lock()
            .unwrap()
            .insert(tx.hash.clone(), tx.clone());
        Ok(())
    }
}
