use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A transaction as it came out of the node, before classification.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTransaction {
    pub hash: String,
    pub from: String,
    pub to: Option<String>,
    pub input: Vec<u8>,
}

/// A block body as returned by the node.
#[derive(Debug, Clone, PartialEq)]
pub struct RawBlock {
    pub number: u64,
    pub hash: String,
    pub timestamp: u64,
    pub transactions: Vec<RawTransaction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawReceipt {
    pub tx_hash: String,
    pub status: Option<TxStatus>,
    pub contract_address: Option<String>,
    pub gas_used: Option<u64>,
    pub logs_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    Normal,
    ContractCreation,
    /// Looked like a creation but the receipt deployed nothing.
    Other,
}

/// A validated block plus the receipts fetched for its creation candidates.
///
/// Immutable once built; the cache hands out `Arc`s to it.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedBlock {
    pub block: RawBlock,
    pub receipts: HashMap<String, RawReceipt>,
}

impl FetchedBlock {
    pub fn number(&self) -> u64 {
        self.block.number
    }

    pub fn record(&self) -> BlockRecord {
        BlockRecord {
            block_number: self.block.number,
            block_hash: self.block.hash.clone(),
            timestamp: format_timestamp(self.block.timestamp),
            transaction_count: self.block.transactions.len(),
        }
    }
}

/// Row written for every processed block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub block_number: u64,
    pub block_hash: String,
    pub timestamp: String,
    pub transaction_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionRecord {
    pub hash: String,
    pub block_number: u64,
    pub timestamp: u64,
    pub from: String,
    pub to: Option<String>,
    /// Only known when a receipt was inspected.
    pub status: Option<TxStatus>,
    pub logs_count: Option<usize>,
    pub tx_type: TxType,
    pub contract_address: Option<String>,
    pub gas_used: Option<u64>,
}

impl TransactionRecord {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            block_number: self.block_number,
            tx_hash: self.hash.clone(),
        }
    }
}

/// Row written for every confirmed contract deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractCreation {
    pub block_number: u64,
    pub tx_hash: String,
    pub contract_address: String,
    pub creator_address: String,
    pub timestamp: String,
    pub gas_used: u64,
}

impl ContractCreation {
    pub fn from_record(tx: &TransactionRecord) -> Option<Self> {
        if tx.tx_type != TxType::ContractCreation {
            return None;
        }
        Some(ContractCreation {
            block_number: tx.block_number,
            tx_hash: tx.hash.clone(),
            contract_address: tx.contract_address.clone()?,
            creator_address: tx.from.clone(),
            timestamp: format_timestamp(tx.timestamp),
            gas_used: tx.gas_used.unwrap_or_default(),
        })
    }
}

/// Identity of a persisted creation within one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupKey {
    pub block_number: u64,
    pub tx_hash: String,
}

pub fn format_timestamp(secs: u64) -> String {
    i64::try_from(secs)
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}
