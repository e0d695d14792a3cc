/// # Modules Overview
///
/// This crate scans blocks of an EVM chain for contract-creation transactions and hands
/// deduplicated records to a persistence sink. A scan either walks a fixed block range or
/// tails the chain head for a bounded time.

/// `cache`
///
/// Bounded least-recently-used store of fetched blocks (`BlockCache`).
pub mod cache;

/// `classifier`
///
/// Two-phase contract-creation detection: a cheap pre-filter on the transaction body
/// (`is_creation_candidate`) and confirmation against the receipt (`confirm`, `classify`).
///
/// Example usage:
/// ```rust,ignore
/// let tx_type = classifier::classify(&tx, receipt.as_ref());
/// ```
pub mod classifier;

/// `config`
///
/// Default tunables and `ScannerConfig`, loadable from `SCANNER_*` environment variables.
pub mod config;

/// `controller`
///
/// `RunController` owns the scanning loop: it admits block numbers (range or head tailing),
/// drives prefetching and batch classification, flushes results through the persistence
/// gateway and produces the final `RunReport`. `ShutdownHandle` stops a run gracefully.
///
/// Example usage:
/// ```rust,ignore
/// let mut controller = RunController::new(config, node, sink)?;
/// let report = controller.run(RunMode::Range { from: 100, to: 200 }).await?;
/// ```
pub mod controller;

/// `csv`
///
/// `CsvSink` writes `blocks.csv` and `contract_creations.csv`, upserting on primary key.
pub mod csv;

/// `dedup`
///
/// `Deduplicator` remembers which (block, transaction) pairs were already persisted in the
/// current run; `PersistenceGateway` wraps the sink with deduplication and bounded retries.
pub mod dedup;

/// `dispatcher`
///
/// `BatchDispatcher` splits a block's transactions into fixed-size batches, classifies them
/// on a bounded worker pool and merges the results into a `BlockOutcome`.
pub mod dispatcher;

pub mod error;

/// `models`
///
/// Core data structures:
/// * `RawBlock`, `RawTransaction`, `RawReceipt` – node data before classification.
/// * `FetchedBlock` – a validated block plus candidate receipts, as held in the cache.
/// * `TransactionRecord`, `TxType`, `TxStatus` – classified transactions.
/// * `BlockRecord`, `ContractCreation` – rows written to the sink.
/// * `DedupKey` – identity used to suppress duplicates within a run.
pub mod models;

/// `node`
///
/// The `NodeClient` trait, its `ethers` implementation (`EthersNode`) and `ThrottledNode`,
/// which adds rate limiting, per-call timeouts, retries and call statistics.
///
/// Example usage:
/// ```rust,ignore
/// let provider = Arc::new(Provider::<Http>::try_from(rpc_url)?);
/// let node: Arc<dyn NodeClient> = Arc::new(EthersNode::new(provider));
/// ```
pub mod node;

/// `prefetch`
///
/// `Prefetcher` fetches and validates blocks ahead of consumption, sharing in-flight fetches
/// and serving repeat requests from the cache.
pub mod prefetch;

pub mod rate_limiter;

/// `report`
///
/// `RunReport` and the types it is built from (`RunStatus`, `RunMode`, `ErrorRecord`).
pub mod report;

pub mod retry;

/// `sink`
///
/// The `PersistenceSink` trait: idempotent `upsert_block` and `upsert_contract_creation`.
pub mod sink;

/// `supabase`
///
/// `SupabaseSink` upserts rows into Supabase tables over its REST interface.
pub mod supabase;
