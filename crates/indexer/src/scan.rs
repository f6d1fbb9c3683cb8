//! Checkpointed, resumable scanning over a height range.
//!
//! One owner thread holds the cursor and the checkpoint. Workers fetch and
//! classify heights and send results back over a channel; the owner commits
//! each batch atomically together with its checkpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{bounded, unbounded};
use stakeidx_log::{log_debug, log_error, log_info, log_warn};
use stakeidx_primitives::{
    HeightRange, OutPoint, RangeSet, ScanCheckpoint, ScanState, ScanTarget, StakeBlockSummary,
    StakeEvent, TxInput,
};
use stakeidx_storage::KeyValueStore;

use crate::attribution::{self, AttributionConfig, PrevOutputs};
use crate::classify::{self, AddressFilter};
use crate::error::IndexError;
use crate::ledger::{BatchCommit, Ledger};
use crate::metrics::{BatchTally, ScanProgress};
use crate::rpc::{retry_delay, ChainSource};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScanRequest {
    pub scan_key: String,
    pub start: u32,
    pub target: ScanTarget,
    /// Rescan from `start` when this key's checkpoint is already completed.
    pub restart_completed: bool,
}

impl ScanRequest {
    pub fn new(scan_key: impl Into<String>, start: u32, target: ScanTarget) -> Self {
        Self {
            scan_key: scan_key.into(),
            start,
            target,
            restart_completed: false,
        }
    }

    /// Backfills are re-queued under the same key while their range still has
    /// holes, so a finished run is redone rather than resumed past its end.
    pub fn backfill(range: HeightRange) -> Self {
        Self {
            restart_completed: true,
            ..Self::new(
                backfill_key(range),
                range.start,
                ScanTarget::Height(range.end),
            )
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.scan_key.trim().is_empty() {
            return Err("scan key is empty".to_string());
        }
        if let ScanTarget::Height(end) = self.target {
            if end < self.start {
                return Err(format!("end {end} is below start {}", self.start));
            }
        }
        Ok(())
    }

    /// Heights this request may touch, for overlap checks.
    pub fn span(&self) -> HeightRange {
        let end = match self.target {
            ScanTarget::Height(end) => end.max(self.start),
            ScanTarget::Tip => u32::MAX,
        };
        HeightRange {
            start: self.start,
            end,
        }
    }
}

pub fn backfill_key(range: HeightRange) -> String {
    format!("backfill-{}-{}", range.start, range.end)
}

#[derive(Clone, Debug)]
pub struct ScanConfig {
    pub batch_size: u32,
    pub workers: usize,
    /// Extra attempts per height after a transient failure.
    pub height_retries: u32,
    pub retry_backoff: Duration,
    pub filter: Arc<AddressFilter>,
    pub attribution: AttributionConfig,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            workers: 4,
            height_retries: 3,
            retry_backoff: Duration::from_millis(500),
            filter: Arc::new(AddressFilter::All),
            attribution: AttributionConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScanOutcome {
    pub scan_key: String,
    pub state: ScanState,
    pub last_completed_height: Option<u32>,
}

/// What one height contributed to its batch.
#[derive(Clone, Debug, Default)]
pub struct ProcessedHeight {
    pub height: u32,
    pub events: Vec<StakeEvent>,
    /// Present for stake-produced blocks only.
    pub summary: Option<StakeBlockSummary>,
    pub spent: Vec<OutPoint>,
    pub anomalies: u64,
}

enum HeightOutcome {
    Processed(ProcessedHeight),
    Skipped { height: u32, error: IndexError },
    Fatal { height: u32, error: IndexError },
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Fetches, classifies and attributes a single height. Per-event anomalies are
/// counted and logged; the height still succeeds.
pub fn process_height<C: ChainSource + ?Sized>(
    chain: &C,
    height: u32,
    config: &ScanConfig,
) -> Result<ProcessedHeight, IndexError> {
    let block = chain.block_at_height(height)?;
    let spent = block
        .transactions
        .iter()
        .flat_map(|tx| tx.inputs.iter().filter_map(TxInput::prevout).copied())
        .collect();
    let mut processed = ProcessedHeight {
        height,
        spent,
        ..ProcessedHeight::default()
    };
    if !classify::is_stake_block(&block) {
        return Ok(processed);
    }

    let mut reward_txid = None;
    let mut prev_outputs = PrevOutputs::new(chain);
    if let Some(extraction) = classify::extract(&block, &config.filter, &mut prev_outputs)? {
        reward_txid = Some(extraction.reward_tx.txid);
        if !extraction.outputs.is_empty() {
            let trace = prev_outputs.trace(extraction.reward_tx, &config.attribution)?;
            for output in &extraction.outputs {
                match attribution::resolve(
                    &output.address,
                    output.gross_value,
                    &trace,
                    &config.attribution,
                ) {
                    Ok(attribution) => processed.events.push(StakeEvent {
                        beneficiary_address: output.address.clone(),
                        funding_address: attribution.funding_address,
                        block_height: block.height,
                        block_hash: block.hash.clone(),
                        block_time: block.time,
                        reward_txid: extraction.reward_tx.txid,
                        output_index: output.output_index,
                        reward_amount: attribution.reward_amount,
                        funding_stake_amount: attribution.funding_stake_amount,
                        confidence: attribution.confidence,
                    }),
                    Err(IndexError::DataAnomaly(message)) => {
                        processed.anomalies += 1;
                        log_warn!("height {height} ({}): {message}", extraction.strategy.as_str());
                    }
                    Err(err) => return Err(err),
                }
            }
        }
    }
    processed.summary = Some(StakeBlockSummary {
        height,
        hash: block.hash,
        time: block.time,
        reward_txid,
        events: processed.events.len() as u32,
        anomalies: processed.anomalies as u32,
    });
    Ok(processed)
}

fn process_with_retry<C: ChainSource + ?Sized>(
    chain: &C,
    height: u32,
    config: &ScanConfig,
) -> HeightOutcome {
    let mut attempt = 0u32;
    loop {
        match process_height(chain, height, config) {
            Ok(processed) => return HeightOutcome::Processed(processed),
            Err(error) if error.is_fatal() => return HeightOutcome::Fatal { height, error },
            Err(error) if error.is_transient() && attempt < config.height_retries => {
                attempt += 1;
                let delay = retry_delay(config.retry_backoff, attempt);
                log_debug!(
                    "height {height} attempt {attempt}/{} failed: {error}; retrying in {}ms",
                    config.height_retries,
                    delay.as_millis()
                );
                thread::sleep(delay);
            }
            Err(error) => {
                log_warn!(
                    "skipping height {height} after {} attempt(s): {error}",
                    attempt + 1
                );
                return HeightOutcome::Skipped { height, error };
            }
        }
    }
}

/// Runs every height of `range` through a bounded worker pool. Returns the
/// outcomes in height order, or the first fatal error.
fn fetch_batch<C: ChainSource + ?Sized>(
    chain: &C,
    range: HeightRange,
    config: &ScanConfig,
    scan_key: &str,
) -> Result<Vec<HeightOutcome>, IndexError> {
    let count = range.height_count() as usize;
    let workers = config.workers.clamp(1, count.max(1));
    let abort = AtomicBool::new(false);
    let (job_tx, job_rx) = bounded::<u32>(workers * 2);
    let (result_tx, result_rx) = unbounded::<HeightOutcome>();

    let mut outcomes = thread::scope(|scope| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let abort = &abort;
            scope.spawn(move || {
                stakeidx_log::set_thread_job(Some(scan_key));
                while let Ok(height) = job_rx.recv() {
                    if abort.load(Ordering::Relaxed) {
                        break;
                    }
                    let outcome = process_with_retry(chain, height, config);
                    if matches!(outcome, HeightOutcome::Fatal { .. }) {
                        abort.store(true, Ordering::Relaxed);
                    }
                    if result_tx.send(outcome).is_err() {
                        break;
                    }
                }
                stakeidx_log::set_thread_job(None);
            });
        }
        drop(job_rx);
        drop(result_tx);

        for height in range.start..=range.end {
            if abort.load(Ordering::Relaxed) || job_tx.send(height).is_err() {
                break;
            }
        }
        drop(job_tx);
        result_rx.iter().collect::<Vec<_>>()
    });

    if let Some(position) = outcomes
        .iter()
        .position(|outcome| matches!(outcome, HeightOutcome::Fatal { .. }))
    {
        if let HeightOutcome::Fatal { height, error } = outcomes.swap_remove(position) {
            log_error!("height {height} failed fatally: {error}");
            return Err(error);
        }
    }
    outcomes.sort_by_key(|outcome| match outcome {
        HeightOutcome::Processed(processed) => processed.height,
        HeightOutcome::Skipped { height, .. } | HeightOutcome::Fatal { height, .. } => *height,
    });
    Ok(outcomes)
}

fn sample_tip<C: ChainSource + ?Sized>(chain: &C, config: &ScanConfig) -> Result<u32, IndexError> {
    let mut attempt = 0u32;
    loop {
        match chain.chain_height().map_err(IndexError::from) {
            Ok(height) => return Ok(height),
            Err(error) if error.is_transient() && attempt < config.height_retries => {
                attempt += 1;
                let delay = retry_delay(config.retry_backoff, attempt);
                log_debug!("chain height attempt {attempt} failed: {error}");
                thread::sleep(delay);
            }
            Err(error) => return Err(error),
        }
    }
}

fn load_checkpoint<S: KeyValueStore>(
    ledger: &Ledger<S>,
    request: &ScanRequest,
) -> Result<ScanCheckpoint, IndexError> {
    let fresh = || ScanCheckpoint::new(&request.scan_key, request.start, request.target, now_secs());
    match ledger.checkpoint(&request.scan_key)? {
        Some(checkpoint)
            if request.restart_completed && checkpoint.state == ScanState::Completed =>
        {
            log_info!(
                "scan {}: previous run completed at {:?}; rescanning from {}",
                request.scan_key,
                checkpoint.last_completed_height,
                request.start
            );
            Ok(fresh())
        }
        Some(mut checkpoint)
            if checkpoint.start_height <= request.start
                && request.start <= checkpoint.resume_height() =>
        {
            checkpoint.target = request.target;
            Ok(checkpoint)
        }
        Some(checkpoint) => {
            log_info!(
                "scan {}: start {} does not continue checkpoint at {}; starting over",
                request.scan_key,
                request.start,
                checkpoint.resume_height()
            );
            Ok(fresh())
        }
        None => Ok(fresh()),
    }
}

/// Drives a scan job to completion, cancellation or failure. The checkpoint is
/// persisted before any failure is returned.
pub fn run_scan<C: ChainSource + ?Sized, S: KeyValueStore>(
    chain: &C,
    ledger: &Ledger<S>,
    config: &ScanConfig,
    request: &ScanRequest,
    cancel: &AtomicBool,
    progress: &ScanProgress,
) -> Result<ScanOutcome, IndexError> {
    request
        .validate()
        .map_err(IndexError::ConfigurationFatal)?;
    let mut checkpoint = load_checkpoint(ledger, request)?;
    checkpoint.state = ScanState::Running;
    checkpoint.updated_at = now_secs();
    ledger.put_checkpoint(&checkpoint)?;
    progress.mark_started(checkpoint.resume_height());
    if let Some(last) = checkpoint.last_completed_height {
        progress.set_checkpoint(last);
    }
    log_info!(
        "scan {}: running from {} to {}",
        request.scan_key,
        checkpoint.resume_height(),
        request.target
    );

    let result = drive(chain, ledger, config, request, cancel, progress, &mut checkpoint);
    checkpoint.state = match &result {
        Ok(state) => *state,
        Err(_) => ScanState::Failed,
    };
    checkpoint.updated_at = now_secs();
    if let Err(err) = ledger.put_checkpoint(&checkpoint) {
        log_error!("scan {}: cannot record final checkpoint: {err}", request.scan_key);
        if result.is_ok() {
            return Err(err);
        }
    }
    match result {
        Ok(state) => {
            log_info!(
                "scan {}: {} at {:?}",
                request.scan_key,
                state.as_str(),
                checkpoint.last_completed_height
            );
            Ok(ScanOutcome {
                scan_key: request.scan_key.clone(),
                state,
                last_completed_height: checkpoint.last_completed_height,
            })
        }
        Err(err) => {
            log_error!("scan {}: failed: {err}", request.scan_key);
            Err(err)
        }
    }
}

fn drive<C: ChainSource + ?Sized, S: KeyValueStore>(
    chain: &C,
    ledger: &Ledger<S>,
    config: &ScanConfig,
    request: &ScanRequest,
    cancel: &AtomicBool,
    progress: &ScanProgress,
    checkpoint: &mut ScanCheckpoint,
) -> Result<ScanState, IndexError> {
    let batch_size = config.batch_size.max(1);
    loop {
        if cancel.load(Ordering::Relaxed) {
            return Ok(ScanState::Cancelled);
        }
        let tip = sample_tip(chain, config)?;
        let target = match request.target {
            ScanTarget::Height(end) if end > tip => {
                log_warn!(
                    "scan {}: target {end} is above chain tip {tip}; stopping at tip",
                    request.scan_key
                );
                tip
            }
            ScanTarget::Height(end) => end,
            ScanTarget::Tip => tip,
        };
        progress.set_target(target);

        let cursor = checkpoint.resume_height();
        if cursor > target || checkpoint.last_completed_height == Some(u32::MAX) {
            return Ok(ScanState::Completed);
        }
        let batch = HeightRange {
            start: cursor,
            end: cursor.saturating_add(batch_size - 1).min(target),
        };
        let outcomes = fetch_batch(chain, batch, config, &request.scan_key)?;

        let mut events = Vec::new();
        let mut summaries = Vec::new();
        let mut spent = Vec::new();
        let mut processed_heights = Vec::new();
        let mut skipped = Vec::new();
        let mut transient_skips = 0u64;
        let mut tally = BatchTally::default();
        for outcome in outcomes {
            match outcome {
                HeightOutcome::Processed(processed) => {
                    processed_heights.push(processed.height);
                    tally.anomalies += processed.anomalies;
                    if let Some(summary) = processed.summary {
                        tally.stake_blocks += 1;
                        summaries.push(summary);
                    }
                    events.extend(processed.events);
                    spent.extend(processed.spent);
                }
                HeightOutcome::Skipped { height, error } => {
                    if error.is_transient() {
                        transient_skips += 1;
                    }
                    skipped.push(height);
                }
                HeightOutcome::Fatal { error, .. } => return Err(error),
            }
        }
        if transient_skips == batch.height_count() {
            return Err(IndexError::TransientIo(format!(
                "every height in {batch} failed to fetch; node unreachable"
            )));
        }

        tally.blocks = processed_heights.len() as u64;
        tally.skipped = skipped.len() as u64;
        let mut next = checkpoint.clone();
        next.last_completed_height = Some(batch.end);
        next.updated_at = now_secs();
        let commit = BatchCommit {
            events,
            summaries,
            spent,
            covered: RangeSet::from_heights(processed_heights),
            skipped,
            checkpoint: next.clone(),
        };
        let stats = ledger.commit_batch(&commit)?;
        *checkpoint = next;
        tally.events = stats.inserted;
        tally.duplicates = stats.duplicates;
        progress.record_batch(&tally);
        progress.set_checkpoint(batch.end);
        log_info!(
            "scan {}: committed {batch} ({} new events, {} duplicate, {} stake blocks, {} skipped, {} anomalies)",
            request.scan_key,
            tally.events,
            tally.duplicates,
            tally.stake_blocks,
            tally.skipped,
            tally.anomalies
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backfill_requests_are_keyed_by_range() {
        let range = HeightRange::new(100, 250).expect("range");
        let request = ScanRequest::backfill(range);
        assert_eq!(request.scan_key, "backfill-100-250");
        assert_eq!(request.span(), range);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn validate_rejects_inverted_ranges() {
        let request = ScanRequest::new("bad", 10, ScanTarget::Height(9));
        assert!(request.validate().is_err());
        assert!(ScanRequest::new(" ", 0, ScanTarget::Tip).validate().is_err());
        assert_eq!(
            ScanRequest::new("fwd", 7, ScanTarget::Tip).span().end,
            u32::MAX
        );
    }
}
