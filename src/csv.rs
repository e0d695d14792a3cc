use crate::error::SinkError;
use crate::models::{BlockRecord, ContractCreation, TransactionRecord};
use crate::sink::PersistenceSink;
use async_trait::async_trait;
use csv::{Writer, WriterBuilder};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const BLOCKS_FILE: &str = "blocks.csv";
pub const CREATIONS_FILE: &str = "contract_creations.csv";

/// Column order of [`BlockRecord`] rows.
pub const BLOCK_COLUMNS: [&str; 4] = [
    "block_number",
    "block_hash",
    "timestamp",
    "transaction_count",
];
/// Column order of [`ContractCreation`] rows.
pub const CREATION_COLUMNS: [&str; 6] = [
    "block_number",
    "tx_hash",
    "contract_address",
    "creator_address",
    "timestamp",
    "gas_used",
];

pub fn export_csv<'a, R, I>(rows: I, path: &Path) -> csv::Result<()>
where
    R: Serialize + 'a,
    I: IntoIterator<Item = &'a R>,
{
    let mut wtr = Writer::from_path(path)?;
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}

/// A CSV file keyed by primary key. New keys are appended; a changed row rewrites the file.
struct CsvTable<K, R> {
    path: PathBuf,
    rows: BTreeMap<K, R>,
    writer: Writer<File>,
}

impl<K: Ord, R: Serialize + PartialEq> CsvTable<K, R> {
    /// Truncates `path` and writes the header row.
    fn create(path: PathBuf, columns: &[&str]) -> Result<Self, SinkError> {
        let mut writer = WriterBuilder::new().has_headers(false).from_path(&path)?;
        writer.write_record(columns)?;
        writer
            .flush()
            .map_err(|err| SinkError::Transient(err.to_string()))?;
        Ok(CsvTable {
            path,
            rows: BTreeMap::new(),
            writer,
        })
    }

    fn upsert(&mut self, key: K, row: R) -> Result<(), SinkError> {
        match self.rows.get(&key) {
            Some(existing) if *existing == row => Ok(()),
            Some(_) => {
                self.rows.insert(key, row);
                export_csv(self.rows.values(), &self.path)?;
                let file = File::options()
                    .append(true)
                    .open(&self.path)
                    .map_err(|err| SinkError::Transient(err.to_string()))?;
                self.writer = WriterBuilder::new().has_headers(false).from_writer(file);
                Ok(())
            }
            None => {
                self.writer.serialize(&row)?;
                self.writer
                    .flush()
                    .map_err(|err| SinkError::Transient(err.to_string()))?;
                self.rows.insert(key, row);
                Ok(())
            }
        }
    }

    fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Writes `blocks.csv` and `contract_creations.csv` into a directory.
pub struct CsvSink {
    blocks: Mutex<CsvTable<u64, BlockRecord>>,
    creations: Mutex<CsvTable<String, ContractCreation>>,
}

impl CsvSink {
    pub fn create(dir: impl AsRef<Path>) -> Result<Self, SinkError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|err| SinkError::Rejected(err.to_string()))?;
        Ok(CsvSink {
            blocks: Mutex::new(CsvTable::create(dir.join(BLOCKS_FILE), &BLOCK_COLUMNS)?),
            creations: Mutex::new(CsvTable::create(
                dir.join(CREATIONS_FILE),
                &CREATION_COLUMNS,
            )?),
        })
    }

    pub fn creation_count(&self) -> usize {
        self.creations.lock().map(|t| t.len()).unwrap_or_default()
    }
}

fn poisoned<T>(_: T) -> SinkError {
    SinkError::Rejected("csv writer poisoned by an earlier panic".to_string())
}

#[async_trait]
impl PersistenceSink for CsvSink {
    async fn upsert_block(&self, block: &BlockRecord) -> Result<(), SinkError> {
        self.blocks
            .lock()
            .map_err(poisoned)?
            .upsert(block.block_number, block.clone())
    }

    async fn upsert_contract_creation(&self, tx: &TransactionRecord) -> Result<(), SinkError> {
        let row = ContractCreation::from_record(tx)
            .ok_or_else(|| SinkError::Rejected(format!("{} is not a contract creation", tx.hash)))?;
        self.creations
            .lock()
            .map_err(poisoned)?
            .upsert(row.tx_hash.clone(), row)
    }
}
