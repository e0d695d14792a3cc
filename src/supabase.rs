use crate::error::SinkError;
use crate::models::{BlockRecord, ContractCreation, TransactionRecord};
use crate::sink::PersistenceSink;
use async_trait::async_trait;
use log::info;
use serde::Serialize;

pub const BLOCKS_TABLE: &str = "blocks";
pub const CREATIONS_TABLE: &str = "contract_creations";

/// PostgREST upserts into a Supabase project.
///
/// Rows are merged on their primary key (`block_number`, `tx_hash`), so repeated writes from
/// retries or later runs collapse into one row.
pub struct SupabaseSink {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl SupabaseSink {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        SupabaseSink {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    /// Reads `SUPABASE_URL` and `SUPABASE_KEY`.
    pub fn from_env() -> Result<Self, SinkError> {
        let url = std::env::var("SUPABASE_URL")
            .map_err(|_| SinkError::Rejected("SUPABASE_URL is not set".to_string()))?;
        let key = std::env::var("SUPABASE_KEY")
            .map_err(|_| SinkError::Rejected("SUPABASE_KEY is not set".to_string()))?;
        Ok(Self::new(url, key))
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    async fn upsert<T: Serialize + ?Sized>(
        &self,
        table: &str,
        on_conflict: &str,
        row: &T,
    ) -> Result<(), SinkError> {
        self.client
            .post(self.table_url(table))
            .query(&[("on_conflict", on_conflict)])
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(row)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceSink for SupabaseSink {
    async fn upsert_block(&self, block: &BlockRecord) -> Result<(), SinkError> {
        self.upsert(BLOCKS_TABLE, "block_number", block).await
    }

    async fn upsert_contract_creation(&self, tx: &TransactionRecord) -> Result<(), SinkError> {
        let row = ContractCreation::from_record(tx)
            .ok_or_else(|| SinkError::Rejected(format!("{} is not a contract creation", tx.hash)))?;
        self.upsert(CREATIONS_TABLE, "tx_hash", &row).await
    }

    async fn health_check(&self) -> Result<(), SinkError> {
        self.client
            .get(self.table_url(BLOCKS_TABLE))
            .query(&[("select", "block_number"), ("limit", "1")])
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .send()
            .await?
            .error_for_status()?;
        info!("Connected to Supabase at {}", self.base_url);
        Ok(())
    }
}
