use crate::config::ScannerConfig;
use crate::dedup::PersistenceGateway;
use crate::dispatcher::{BatchDispatcher, BlockOutcome};
use crate::error::ScanError;
use crate::node::{NodeClient, ThrottledNode};
use crate::prefetch::Prefetcher;
use crate::rate_limiter::RateLimiter;
use crate::report::{ErrorRecord, FailedBlock, RunMode, RunReport, RunStatus};
use crate::sink::PersistenceSink;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, Instant};

/// Requests a graceful stop of a running scan. Cloneable; any clone may fire it.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Counters and history of one run, folded into the [`RunReport`] at the end.
#[derive(Debug)]
pub struct RunState {
    pub processed_blocks: Vec<u64>,
    pub failed_blocks: Vec<FailedBlock>,
    pub found_contract_creations: u64,
    pub transactions_seen: u64,
    pub last_completed_block: Option<u64>,
    pub errors: Vec<ErrorRecord>,
    pub consecutive_failures: u32,
    start_time: Instant,
    started_at: DateTime<Utc>,
}

impl RunState {
    fn new() -> Self {
        RunState {
            processed_blocks: vec![],
            failed_blocks: vec![],
            found_contract_creations: 0,
            transactions_seen: 0,
            last_completed_block: None,
            errors: vec![],
            consecutive_failures: 0,
            start_time: Instant::now(),
            started_at: Utc::now(),
        }
    }

    fn mark_failed(&mut self, number: u64, reason: String) {
        self.failed_blocks.push(FailedBlock {
            block_number: number,
            reason,
        });
    }

    fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    fn blocks_seen(&self) -> impl Iterator<Item = u64> + '_ {
        self.processed_blocks
            .iter()
            .copied()
            .chain(self.failed_blocks.iter().map(|b| b.block_number))
    }
}

/// Flags raised by the block source, read by the run loop.
#[derive(Default)]
struct RunSignals {
    fatal: AtomicBool,
    cancelled: AtomicBool,
    errors: Mutex<Vec<ErrorRecord>>,
}

impl RunSignals {
    fn should_stop(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    fn record(&self, record: ErrorRecord) {
        self.errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record);
    }

    fn fail(&self, err: &ScanError) {
        error!("Aborting run: {}", err);
        self.record(ErrorRecord::new(err));
        self.fatal.store(true, Ordering::SeqCst);
    }

    fn take_errors(&self) -> Vec<ErrorRecord> {
        std::mem::take(
            &mut *self
                .errors
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }
}

type Processed = (u64, Result<BlockOutcome, ScanError>);

/// Drives a scan from `Idle` to a terminal state and produces the [`RunReport`].
pub struct RunController {
    config: ScannerConfig,
    node: Arc<ThrottledNode>,
    prefetcher: Arc<Prefetcher>,
    dispatcher: Arc<BatchDispatcher>,
    gateway: PersistenceGateway,
    status: RunStatus,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RunController {
    pub fn new(
        config: ScannerConfig,
        node: Arc<dyn NodeClient>,
        sink: Arc<dyn PersistenceSink>,
    ) -> Result<Self, ScanError> {
        config.validate()?;
        let limiter = Arc::new(RateLimiter::per_second(config.requests_per_second));
        let node = Arc::new(ThrottledNode::new(
            node,
            limiter,
            config.call_timeout(),
            config.fetch_policy(),
        ));
        let prefetcher = Arc::new(Prefetcher::new(node.clone(), config.cache_capacity));
        let dispatcher = Arc::new(BatchDispatcher::new(
            node.clone(),
            config.workers,
            config.batch_size,
        ));
        let gateway = PersistenceGateway::new(sink, config.sink_policy());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(RunController {
            config,
            node,
            prefetcher,
            dispatcher,
            gateway,
            status: RunStatus::Idle,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        })
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Runs the scan to completion. Errors only when the run cannot start; everything that
    /// goes wrong once running ends up in the report.
    pub async fn run(&mut self, mode: RunMode) -> Result<RunReport, ScanError> {
        if self.status != RunStatus::Idle {
            return Err(ScanError::InvalidState(format!(
                "run already started ({:?})",
                self.status
            )));
        }
        if let RunMode::Range { from, to } = mode {
            if from > to {
                return Err(ScanError::InvalidConfig(format!(
                    "empty block range {}..={}",
                    from, to
                )));
            }
        }

        self.status = RunStatus::Running;
        let mut state = RunState::new();
        let signals = Arc::new(RunSignals::default());

        if let Err(err) = self.gateway.sink().health_check().await {
            warn!("Sink health check failed: {}", err);
        }

        let (source, ordered) = match mode {
            RunMode::Range { from, to } => {
                info!("Scanning blocks {} to {}", from, to);
                (self.range_source(from, to, signals.clone()), false)
            }
            RunMode::Tail { duration_secs } => match self.node.latest_block_number().await {
                Ok(head) => {
                    info!("Tailing chain from head {} for {}s", head, duration_secs);
                    let deadline = Instant::now() + Duration::from_secs(duration_secs);
                    (self.tail_source(head, deadline, signals.clone()), true)
                }
                Err(err) => {
                    signals.fail(&ScanError::Fatal(format!("cannot read chain head: {}", err)));
                    (stream::empty().boxed(), true)
                }
            },
        };

        let depth = self.config.prefetch_depth.max(1);
        let prefetcher = self.prefetcher.clone();
        let dispatcher = self.dispatcher.clone();
        let pipelines =
            source.map(move |number| process(prefetcher.clone(), dispatcher.clone(), number));
        let mut outcomes: BoxStream<'static, Processed> = if ordered {
            pipelines.buffered(depth).boxed()
        } else {
            pipelines.buffer_unordered(depth).boxed()
        };

        let mut shutdown = self.shutdown_rx.clone();
        let mut watching = true;
        loop {
            tokio::select! {
                next = outcomes.next() => match next {
                    Some((number, result)) => self.flush(number, result, &mut state, &signals).await,
                    None => break,
                },
                changed = shutdown.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                    } else if *shutdown.borrow() {
                        watching = false;
                        warn!("Shutdown requested, draining in-flight blocks");
                        self.prefetcher.cancel_pending();
                    }
                }
            }
        }
        drop(outcomes);

        self.status = if signals.fatal.load(Ordering::SeqCst) {
            RunStatus::Failed
        } else if signals.cancelled.load(Ordering::SeqCst) {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };
        state.errors.extend(signals.take_errors());

        self.prefetcher.release();
        self.dispatcher.close();

        let report = self.report(mode, state);
        report.log_summary();
        Ok(report)
    }

    /// Block numbers `from..=to`, stopping early on shutdown or a fatal error.
    fn range_source(&self, from: u64, to: u64, signals: Arc<RunSignals>) -> BoxStream<'static, u64> {
        let prefetcher = self.prefetcher.clone();
        let shutdown = self.shutdown_rx.clone();
        let depth = self.config.prefetch_depth;

        stream::unfold(Some(from), move |next| {
            let prefetcher = prefetcher.clone();
            let shutdown = shutdown.clone();
            let signals = signals.clone();
            async move {
                let number = next?;
                if signals.should_stop() {
                    return None;
                }
                if *shutdown.borrow() {
                    signals.cancelled.store(true, Ordering::SeqCst);
                    return None;
                }
                if number < to {
                    prefetcher.prefetch(number + 1, depth, Some(to));
                }
                let following = (number < to).then(|| number + 1);
                Some((number, following))
            }
        })
        .boxed()
    }

    /// Block numbers from `head` onwards as the chain produces them, until `deadline`.
    fn tail_source(
        &self,
        head: u64,
        deadline: Instant,
        signals: Arc<RunSignals>,
    ) -> BoxStream<'static, u64> {
        struct Tail {
            next: u64,
            head: u64,
            head_failures: u32,
            shutdown: watch::Receiver<bool>,
        }

        let prefetcher = self.prefetcher.clone();
        let node = self.node.clone();
        let depth = self.config.prefetch_depth;
        let poll_interval = self.config.head_poll_interval();
        let max_failures = self.config.max_consecutive_failures;
        let start = Tail {
            next: head,
            head,
            head_failures: 0,
            shutdown: self.shutdown_rx.clone(),
        };

        stream::unfold(start, move |mut tail| {
            let prefetcher = prefetcher.clone();
            let node = node.clone();
            let signals = signals.clone();
            async move {
                loop {
                    if signals.should_stop() || Instant::now() >= deadline {
                        return None;
                    }
                    if *tail.shutdown.borrow() {
                        signals.cancelled.store(true, Ordering::SeqCst);
                        return None;
                    }
                    if tail.next <= tail.head {
                        let number = tail.next;
                        tail.next += 1;
                        prefetcher.prefetch(tail.next, depth, Some(tail.head));
                        return Some((number, tail));
                    }

                    tokio::select! {
                        _ = sleep(poll_interval) => {}
                        _ = sleep_until(deadline) => return None,
                        changed = tail.shutdown.changed() => {
                            if changed.is_err() {
                                return None;
                            }
                            continue;
                        }
                    }

                    match node.latest_block_number().await {
                        Ok(latest) => {
                            tail.head_failures = 0;
                            tail.head = tail.head.max(latest);
                        }
                        Err(err) => {
                            tail.head_failures += 1;
                            warn!("Head poll failed ({} in a row): {}", tail.head_failures, err);
                            signals.record(ErrorRecord::new(&err));
                            if tail.head_failures >= max_failures {
                                signals.fail(&ScanError::Fatal(format!(
                                    "chain head unreachable for {} consecutive polls",
                                    tail.head_failures
                                )));
                            }
                        }
                    }
                }
            }
        })
        .boxed()
    }

    async fn flush(
        &self,
        number: u64,
        result: Result<BlockOutcome, ScanError>,
        state: &mut RunState,
        signals: &RunSignals,
    ) {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("Block {} failed: {}", number, err);
                state.errors.push(ErrorRecord::for_block(&err, number));
                state.mark_failed(number, err.to_string());
                self.note_block_failure(state, signals);
                return;
            }
        };

        state.transactions_seen += outcome.transactions.len() as u64;
        state.errors.extend(outcome.errors.iter().cloned());
        if outcome.is_failed() {
            error!("Block {}: all {} batches failed", number, outcome.batches);
            state.mark_failed(number, format!("all {} batches failed", outcome.batches));
            self.note_block_failure(state, signals);
            return;
        }
        state.consecutive_failures = 0;

        let flushed = self.gateway.flush(&outcome).await;
        state.errors.extend(flushed.errors.iter().cloned());
        if !flushed.block_persisted {
            state.mark_failed(number, "block row not persisted".to_string());
            return;
        }

        let creations = flushed.creations_persisted;
        state.found_contract_creations += creations as u64;
        state.processed_blocks.push(number);
        state.last_completed_block = state.last_completed_block.max(Some(number));
        info!(
            "Block {}: {} transactions, {} contract creations",
            number,
            outcome.transactions.len(),
            creations
        );

        let interval = self.config.progress_log_interval.max(1);
        let processed = state.processed_blocks.len() as u64;
        if processed % interval == 0 {
            let elapsed = state.elapsed().as_secs_f64();
            info!(
                "Processed {} blocks, {} contract creations ({:.2} blocks/s)",
                processed,
                state.found_contract_creations,
                rate(processed, elapsed)
            );
        }
    }

    fn note_block_failure(&self, state: &mut RunState, signals: &RunSignals) {
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.config.max_consecutive_failures
            && !signals.should_stop()
        {
            signals.fail(&ScanError::Fatal(format!(
                "{} consecutive blocks failed",
                state.consecutive_failures
            )));
        }
    }

    fn report(&self, mode: RunMode, state: RunState) -> RunReport {
        let elapsed = state.elapsed().as_secs_f64();
        let first_block = state.blocks_seen().min();
        let last_block = state.blocks_seen().max();
        let span = match (first_block, last_block) {
            (Some(first), Some(last)) => last - first + 1,
            _ => 0,
        };
        let processed = state.processed_blocks.len() as u64;
        let stats = self.node.stats();

        RunReport {
            status: self.status,
            mode,
            first_block,
            last_block,
            block_gaps: span.saturating_sub(processed),
            blocks_per_sec: rate(processed, elapsed),
            creations_per_sec: rate(state.found_contract_creations, elapsed),
            rpc_calls: stats.calls(),
            rpc_failures: stats.failures(),
            rpc_success_rate: stats.success_rate(),
            duplicates_dropped: self.gateway.duplicates_dropped(),
            elapsed_secs: elapsed,
            started_at: state.started_at,
            finished_at: Utc::now(),
            processed_blocks: state.processed_blocks,
            failed_blocks: state.failed_blocks,
            last_completed_block: state.last_completed_block,
            transactions_seen: state.transactions_seen,
            found_contract_creations: state.found_contract_creations,
            errors: state.errors,
        }
    }
}

async fn process(
    prefetcher: Arc<Prefetcher>,
    dispatcher: Arc<BatchDispatcher>,
    number: u64,
) -> Processed {
    match prefetcher.get(number).await {
        Ok(block) => (number, Ok(dispatcher.process_block(block).await)),
        Err(err) => (number, Err(err)),
    }
}

fn rate(count: u64, elapsed_secs: f64) -> f64 {
    if elapsed_secs > 0.0 {
        count as f64 / elapsed_secs
    } else {
        0.0
    }
}
