//! Job control: one manager thread owns every scan job and the backfill queue.
//!
//! Callers talk to it through a cloneable [`JobControl`]. Scan threads report
//! back on a separate channel when they finish.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use serde::{Serialize, Serializer};
use stakeidx_log::{log_info, log_warn};
use stakeidx_primitives::{HeightRange, ScanState};
use stakeidx_storage::KeyValueStore;

use crate::error::{IndexError, JobError};
use crate::gaps;
use crate::ledger::Ledger;
use crate::metrics::{ProgressSnapshot, ScanProgress};
use crate::reconcile::{self, ReconcileStats};
use crate::rpc::ChainSource;
use crate::scan::{run_scan, ScanConfig, ScanOutcome, ScanRequest};

#[derive(Clone, Debug)]
pub struct JobSettings {
    pub scan: ScanConfig,
    /// Confirmations before an output may stake.
    pub maturity: u32,
    /// Lower bound of every gap audit.
    pub first_stake_height: u32,
    pub backfill_chunk: u32,
    pub max_backfills: usize,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            scan: ScanConfig::default(),
            maturity: 150,
            first_stake_height: 0,
            backfill_chunk: 10_000,
            max_backfills: 2,
        }
    }
}

fn serialize_state<S: Serializer>(state: &ScanState, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(state.as_str())
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub scan_key: String,
    pub start: u32,
    pub target: String,
    #[serde(serialize_with = "serialize_state")]
    pub state: ScanState,
    pub last_completed_height: Option<u32>,
    pub error: Option<String>,
    pub progress: ProgressSnapshot,
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GapReport {
    pub domain_start: u32,
    pub domain_end: u32,
    pub missing_heights: u64,
    pub ranges: Vec<String>,
    /// Backfills queued by this audit.
    pub queued: usize,
    /// Backfill jobs this audit started.
    pub started: Vec<String>,
}

type Reply<T> = Sender<Result<T, JobError>>;

enum JobCommand {
    Start {
        request: ScanRequest,
        reply: Reply<JobStatus>,
    },
    Status {
        key: String,
        reply: Reply<JobStatus>,
    },
    List {
        reply: Sender<Vec<JobStatus>>,
    },
    Wait {
        key: String,
        reply: Reply<JobStatus>,
    },
    Cancel {
        key: String,
        reply: Reply<()>,
    },
    GapAudit {
        reply: Reply<GapReport>,
    },
    Reconcile {
        limit: usize,
        reply: Reply<ReconcileStats>,
    },
    Shutdown {
        reply: Sender<()>,
    },
}

struct Finished {
    key: String,
    result: Result<ScanOutcome, IndexError>,
}

struct Job {
    request: ScanRequest,
    state: ScanState,
    cancel: Arc<AtomicBool>,
    progress: Arc<ScanProgress>,
    handle: Option<JoinHandle<()>>,
    last_completed_height: Option<u32>,
    error: Option<String>,
    waiters: Vec<Reply<JobStatus>>,
}

impl Job {
    fn status(&self) -> JobStatus {
        let progress = self.progress.snapshot();
        JobStatus {
            scan_key: self.request.scan_key.clone(),
            start: self.request.start,
            target: self.request.target.to_string(),
            state: self.state,
            last_completed_height: self
                .last_completed_height
                .or_else(|| progress.last_checkpoint.map(|height| height as u32)),
            error: self.error.clone(),
            progress,
        }
    }

    fn is_running(&self) -> bool {
        !self.state.is_terminal()
    }
}

/// Handle for talking to a running [`JobManager`].
#[derive(Clone)]
pub struct JobControl {
    tx: Sender<JobCommand>,
}

impl JobControl {
    fn request<T>(&self, build: impl FnOnce(Sender<T>) -> JobCommand) -> Result<T, JobError> {
        let (reply, rx) = bounded(1);
        self.tx
            .send(build(reply))
            .map_err(|_| JobError::ManagerStopped)?;
        rx.recv().map_err(|_| JobError::ManagerStopped)
    }

    pub fn start(&self, request: ScanRequest) -> Result<JobStatus, JobError> {
        self.request(|reply| JobCommand::Start { request, reply })?
    }

    pub fn status(&self, key: &str) -> Result<JobStatus, JobError> {
        let key = key.to_string();
        self.request(|reply| JobCommand::Status { key, reply })?
    }

    pub fn list(&self) -> Result<Vec<JobStatus>, JobError> {
        self.request(|reply| JobCommand::List { reply })
    }

    /// Blocks until the job reaches a terminal state.
    pub fn wait(&self, key: &str) -> Result<JobStatus, JobError> {
        let key = key.to_string();
        self.request(|reply| JobCommand::Wait { key, reply })?
    }

    pub fn cancel(&self, key: &str) -> Result<(), JobError> {
        let key = key.to_string();
        self.request(|reply| JobCommand::Cancel { key, reply })?
    }

    pub fn gap_audit(&self) -> Result<GapReport, JobError> {
        self.request(|reply| JobCommand::GapAudit { reply })?
    }

    pub fn reconcile(&self, limit: usize) -> Result<ReconcileStats, JobError> {
        self.request(|reply| JobCommand::Reconcile { limit, reply })?
    }

    /// Cancels every job and waits for in-flight batches to commit.
    pub fn shutdown(&self) -> Result<(), JobError> {
        self.request(|reply| JobCommand::Shutdown { reply })
    }
}

pub struct JobManager<C: ?Sized, S> {
    chain: Arc<C>,
    ledger: Arc<Ledger<S>>,
    settings: JobSettings,
    jobs: BTreeMap<String, Job>,
    pending_backfills: VecDeque<HeightRange>,
    reconciling: Arc<AtomicBool>,
    finished_tx: Sender<Finished>,
}

impl<C, S> JobManager<C, S>
where
    C: ChainSource + ?Sized + 'static,
    S: KeyValueStore + 'static,
{
    /// Spawns the manager thread.
    pub fn spawn(
        chain: Arc<C>,
        ledger: Arc<Ledger<S>>,
        settings: JobSettings,
    ) -> Result<(JobControl, JoinHandle<()>), JobError> {
        let (tx, rx) = unbounded();
        let (finished_tx, finished_rx) = unbounded();
        let manager = JobManager {
            chain,
            ledger,
            settings,
            jobs: BTreeMap::new(),
            pending_backfills: VecDeque::new(),
            reconciling: Arc::new(AtomicBool::new(false)),
            finished_tx,
        };
        let handle = thread::Builder::new()
            .name("job-manager".to_string())
            .spawn(move || manager.run(rx, finished_rx))
            .map_err(|err| JobError::Failed(format!("cannot spawn job manager: {err}")))?;
        Ok((JobControl { tx }, handle))
    }

    fn run(mut self, rx: Receiver<JobCommand>, finished_rx: Receiver<Finished>) {
        loop {
            select! {
                recv(rx) -> command => match command {
                    Ok(JobCommand::Shutdown { reply }) => {
                        self.shutdown(&finished_rx);
                        let _ = reply.send(());
                        return;
                    }
                    Ok(command) => self.handle(command),
                    Err(_) => {
                        self.shutdown(&finished_rx);
                        return;
                    }
                },
                recv(finished_rx) -> finished => {
                    if let Ok(finished) = finished {
                        self.finish(finished);
                    }
                }
            }
        }
    }

    fn handle(&mut self, command: JobCommand) {
        match command {
            JobCommand::Start { request, reply } => {
                let _ = reply.send(self.start(request));
            }
            JobCommand::Status { key, reply } => {
                let status = self
                    .jobs
                    .get(&key)
                    .map(Job::status)
                    .ok_or(JobError::UnknownJob(key));
                let _ = reply.send(status);
            }
            JobCommand::List { reply } => {
                let _ = reply.send(self.jobs.values().map(Job::status).collect());
            }
            JobCommand::Wait { key, reply } => match self.jobs.get_mut(&key) {
                Some(job) if job.is_running() => job.waiters.push(reply),
                Some(job) => {
                    let _ = reply.send(Ok(job.status()));
                }
                None => {
                    let _ = reply.send(Err(JobError::UnknownJob(key)));
                }
            },
            JobCommand::Cancel { key, reply } => {
                let result = match self.jobs.get(&key) {
                    Some(job) if job.is_running() => {
                        job.cancel.store(true, Ordering::Relaxed);
                        log_info!("cancel requested for {key}");
                        Ok(())
                    }
                    Some(_) => Ok(()),
                    None => Err(JobError::UnknownJob(key)),
                };
                let _ = reply.send(result);
            }
            JobCommand::GapAudit { reply } => {
                let _ = reply.send(self.gap_audit());
            }
            JobCommand::Reconcile { limit, reply } => self.reconcile(limit, reply),
            JobCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn start(&mut self, request: ScanRequest) -> Result<JobStatus, JobError> {
        request.validate().map_err(JobError::InvalidRequest)?;
        if self
            .jobs
            .get(&request.scan_key)
            .is_some_and(Job::is_running)
        {
            return Err(JobError::AlreadyRunning(request.scan_key));
        }

        let key = request.scan_key.clone();
        let cancel = Arc::new(AtomicBool::new(false));
        let progress = Arc::new(ScanProgress::new());
        let handle = {
            let chain = Arc::clone(&self.chain);
            let ledger = Arc::clone(&self.ledger);
            let config = self.settings.scan.clone();
            let request = request.clone();
            let cancel = Arc::clone(&cancel);
            let progress = Arc::clone(&progress);
            let finished_tx = self.finished_tx.clone();
            thread::Builder::new()
                .name(format!("scan-{key}"))
                .spawn(move || {
                    stakeidx_log::set_thread_job(Some(&request.scan_key));
                    let result = run_scan(
                        chain.as_ref(),
                        ledger.as_ref(),
                        &config,
                        &request,
                        &cancel,
                        &progress,
                    );
                    stakeidx_log::set_thread_job(None);
                    let _ = finished_tx.send(Finished {
                        key: request.scan_key.clone(),
                        result,
                    });
                })
                .map_err(|err| JobError::Failed(format!("cannot spawn scan {key}: {err}")))?
        };

        let job = Job {
            request,
            state: ScanState::Running,
            cancel,
            progress,
            handle: Some(handle),
            last_completed_height: None,
            error: None,
            waiters: Vec::new(),
        };
        let status = job.status();
        self.jobs.insert(key, job);
        Ok(status)
    }

    fn finish(&mut self, finished: Finished) {
        let Some(job) = self.jobs.get_mut(&finished.key) else {
            return;
        };
        if let Some(handle) = job.handle.take() {
            if handle.join().is_err() {
                log_warn!("scan thread {} panicked", finished.key);
            }
        }
        match finished.result {
            Ok(outcome) => {
                job.state = outcome.state;
                job.last_completed_height = outcome.last_completed_height;
            }
            Err(err) => {
                job.state = ScanState::Failed;
                job.error = Some(err.to_string());
            }
        }
        let status = job.status();
        for waiter in job.waiters.drain(..) {
            let _ = waiter.send(Ok(status.clone()));
        }
        self.launch_backfills();
    }

    fn running_spans(&self) -> Vec<HeightRange> {
        self.jobs
            .values()
            .filter(|job| job.is_running())
            .map(|job| job.request.span())
            .collect()
    }

    fn gap_audit(&mut self) -> Result<GapReport, JobError> {
        let tip = self
            .chain
            .chain_height()
            .map_err(|err| JobError::Failed(format!("cannot read chain height: {err}")))?;
        let Some(domain) = HeightRange::new(self.settings.first_stake_height, tip) else {
            return Ok(GapReport {
                domain_start: self.settings.first_stake_height,
                domain_end: tip,
                ..GapReport::default()
            });
        };
        let mut busy = self.running_spans();
        busy.extend(self.pending_backfills.iter().copied());
        let gaps = gaps::find_gaps(self.ledger.as_ref(), domain, &busy, self.settings.backfill_chunk)
            .map_err(|err| JobError::Failed(err.to_string()))?;

        let mut report = GapReport {
            domain_start: domain.start,
            domain_end: domain.end,
            missing_heights: gaps.iter().map(HeightRange::height_count).sum(),
            ranges: gaps.iter().map(ToString::to_string).collect(),
            queued: gaps.len(),
            started: Vec::new(),
        };
        self.pending_backfills.extend(gaps);
        report.started = self.launch_backfills();
        log_info!(
            "gap audit over {domain}: {} missing heights in {} range(s), {} started",
            report.missing_heights,
            report.ranges.len(),
            report.started.len()
        );
        Ok(report)
    }

    fn launch_backfills(&mut self) -> Vec<String> {
        let mut started = Vec::new();
        loop {
            let running = self
                .jobs
                .iter()
                .filter(|(key, job)| key.starts_with("backfill-") && job.is_running())
                .count();
            if running >= self.settings.max_backfills {
                break;
            }
            let Some(range) = self.pending_backfills.pop_front() else {
                break;
            };
            let request = ScanRequest::backfill(range);
            let key = request.scan_key.clone();
            match self.start(request) {
                Ok(_) => started.push(key),
                Err(JobError::AlreadyRunning(_)) => {}
                Err(err) => log_warn!("cannot start {key}: {err}"),
            }
        }
        started
    }

    fn reconcile(&mut self, limit: usize, reply: Reply<ReconcileStats>) {
        if self.reconciling.swap(true, Ordering::AcqRel) {
            let _ = reply.send(Err(JobError::AlreadyRunning("reconcile".to_string())));
            return;
        }
        let chain = Arc::clone(&self.chain);
        let ledger = Arc::clone(&self.ledger);
        let maturity = self.settings.maturity;
        let reconciling = Arc::clone(&self.reconciling);
        let spawned = thread::Builder::new()
            .name("reconcile".to_string())
            .spawn(move || {
                stakeidx_log::set_thread_job(Some("reconcile"));
                let result = reconcile::reconcile(chain.as_ref(), ledger.as_ref(), limit, maturity)
                    .map_err(|err| JobError::Failed(err.to_string()));
                reconciling.store(false, Ordering::Release);
                let _ = reply.send(result);
            });
        if let Err(err) = spawned {
            self.reconciling.store(false, Ordering::Release);
            log_warn!("cannot spawn reconcile thread: {err}");
        }
    }

    fn shutdown(&mut self, finished_rx: &Receiver<Finished>) {
        self.pending_backfills.clear();
        for job in self.jobs.values().filter(|job| job.is_running()) {
            job.cancel.store(true, Ordering::Relaxed);
        }
        while self.jobs.values().any(Job::is_running) {
            match finished_rx.recv() {
                Ok(finished) => self.finish(finished),
                Err(_) => break,
            }
        }
        log_info!("job manager stopped");
    }
}
