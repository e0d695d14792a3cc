use crate::error::{ErrorKind, ScanError};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use std::path::Path;

/// One failure, as it appears in the final report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub block_number: Option<u64>,
    pub tx_hash: Option<String>,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(err: &ScanError) -> Self {
        ErrorRecord {
            kind: err.kind(),
            block_number: None,
            tx_hash: None,
            message: err.to_string(),
        }
    }

    pub fn for_block(err: &ScanError, block_number: u64) -> Self {
        ErrorRecord {
            block_number: Some(block_number),
            ..Self::new(err)
        }
    }

    pub fn for_transaction(err: &ScanError, block_number: u64, tx_hash: &str) -> Self {
        ErrorRecord {
            block_number: Some(block_number),
            tx_hash: Some(tx_hash.to_string()),
            ..Self::new(err)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RunMode {
    /// Every block in `[from, to]`.
    Range { from: u64, to: u64 },
    /// Follow the chain head for `duration_secs`.
    Tail { duration_secs: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedBlock {
    pub block_number: u64,
    pub reason: String,
}

/// Summary emitted when a run reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub mode: RunMode,
    pub first_block: Option<u64>,
    pub last_block: Option<u64>,
    /// Fully flushed blocks, in flush order.
    pub processed_blocks: Vec<u64>,
    pub failed_blocks: Vec<FailedBlock>,
    pub last_completed_block: Option<u64>,
    pub transactions_seen: u64,
    /// Creations written to the sink. Duplicates and creations whose upsert failed are not
    /// counted; the latter appear in `errors`.
    pub found_contract_creations: u64,
    pub duplicates_dropped: u64,
    pub block_gaps: u64,
    pub blocks_per_sec: f64,
    pub creations_per_sec: f64,
    pub rpc_calls: u64,
    pub rpc_failures: u64,
    pub rpc_success_rate: f64,
    pub elapsed_secs: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub errors: Vec<ErrorRecord>,
}

impl RunReport {
    pub fn fatal_errors(&self) -> usize {
        self.errors
            .iter()
            .filter(|err| err.kind == ErrorKind::Fatal)
            .count()
    }

    pub fn log_summary(&self) {
        info!(
            "Run {:?}: blocks {:?}..={:?}, {} processed, {} failed, {} contract creations",
            self.status,
            self.first_block,
            self.last_block,
            self.processed_blocks.len(),
            self.failed_blocks.len(),
            self.found_contract_creations
        );
        info!(
            "{:.2} blocks/s, {:.2} creations/s, {} gaps, RPC success {:.1}% of {} calls, {:.1}s elapsed",
            self.blocks_per_sec,
            self.creations_per_sec,
            self.block_gaps,
            self.rpc_success_rate * 100.0,
            self.rpc_calls,
            self.elapsed_secs
        );
        if !self.errors.is_empty() {
            warn!("{} errors recorded during the run", self.errors.len());
        }
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
    }
}
