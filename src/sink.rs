use crate::error::SinkError;
use crate::models::{BlockRecord, TransactionRecord};
use async_trait::async_trait;

/// Where scanned data ends up.
///
/// Both operations must be idempotent on the record's primary key (block number, transaction
/// hash): writing the same record twice leaves one logical row.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn upsert_block(&self, block: &BlockRecord) -> Result<(), SinkError>;

    async fn upsert_contract_creation(&self, tx: &TransactionRecord) -> Result<(), SinkError>;

    /// Cheap connectivity probe run before scanning starts.
    async fn health_check(&self) -> Result<(), SinkError> {
        Ok(())
    }
}
