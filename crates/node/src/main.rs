//! Command-line front end and long-running service for the stake indexer.

mod admin;
mod config;

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use serde::Serialize;
use stakeidx_consensus::chain_params;
use stakeidx_indexer::{
    find_gaps, reconcile, snapshot_address, AttributionConfig, AddressFilter, JobControl,
    JobError, JobManager, JobSettings, JobStatus, Ledger, RpcClient, ScanConfig, ScanRequest,
};
use stakeidx_log::{self as logging, log_error, log_info, log_warn};
use stakeidx_primitives::{HeightRange, ScanState, ScanTarget};
use stakeidx_storage::fjall::{FjallStore, FjallTelemetrySnapshot};
use stakeidx_storage::memory::MemoryStore;
use stakeidx_storage::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch};
use tokio::sync::watch;

pub use config::{Backend, CliAction, Command, Config};
use config::{parse_args, usage};

const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";
const DB_DIR_NAME: &str = "db";
const FORWARD_SCAN_KEY: &str = "forward";
const FORWARD_RESTART_SECS: u64 = 30;
const LOG_CAPTURE_LINES: usize = 2000;

pub(crate) type Chain = RpcClient;

pub(crate) enum Store {
    Memory(MemoryStore),
    Fjall(FjallStore),
}

impl Store {
    pub fn fjall_telemetry_snapshot(&self) -> Option<FjallTelemetrySnapshot> {
        match self {
            Store::Fjall(store) => Some(store.telemetry_snapshot()),
            Store::Memory(_) => None,
        }
    }
}

impl KeyValueStore for Store {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            Store::Memory(store) => store.get(column, key),
            Store::Fjall(store) => store.get(column, key),
        }
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.put(column, key, value),
            Store::Fjall(store) => store.put(column, key, value),
        }
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.delete(column, key),
            Store::Fjall(store) => store.delete(column, key),
        }
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        match self {
            Store::Memory(store) => store.scan_prefix(column, prefix),
            Store::Fjall(store) => store.scan_prefix(column, prefix),
        }
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.for_each_prefix(column, prefix, visitor),
            Store::Fjall(store) => store.for_each_prefix(column, prefix, visitor),
        }
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.write_batch(batch),
            Store::Fjall(store) => store.write_batch(batch),
        }
    }
}

struct DataDirLock {
    _file: File,
}

fn lock_data_dir(data_dir: &Path) -> Result<DataDirLock, String> {
    let lock_path = data_dir.join(DATA_DIR_LOCK_FILE_NAME);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|err| format!("failed to open lock file {}: {err}", lock_path.display()))?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={}", std::process::id());
            let _ = file.flush();
            Ok(DataDirLock { _file: file })
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            let mut holder = String::new();
            let _ =
                File::open(&lock_path).and_then(|mut reader| reader.read_to_string(&mut holder));
            let holder = holder.trim();
            let suffix = if holder.is_empty() {
                String::new()
            } else {
                format!(" ({holder})")
            };
            Err(format!(
                "data dir {} is already locked (another stakeidx instance may be running); lock file {}{suffix}",
                data_dir.display(),
                lock_path.display()
            ))
        }
        Err(err) => Err(format!(
            "failed to lock data dir {} (lock file {}): {err}",
            data_dir.display(),
            lock_path.display()
        )),
    }
}

fn open_store(config: &Config) -> Result<Store, String> {
    match config.backend {
        Backend::Memory => Ok(Store::Memory(MemoryStore::new())),
        Backend::Fjall => {
            let path = config.data_dir.join(DB_DIR_NAME);
            FjallStore::open_with_options(&path, config.db.clone())
                .map(Store::Fjall)
                .map_err(|err| format!("failed to open database {}: {err}", path.display()))
        }
    }
}

pub async fn run_entry() -> Result<(), String> {
    match parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("stakeidx {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::Run(config) => run_with_config(*config).await,
    }
}

/// Shared handles every command works against.
pub(crate) struct Context {
    pub config: Config,
    pub chain: Arc<Chain>,
    pub ledger: Arc<Ledger<Store>>,
    pub settings: JobSettings,
}

async fn run_with_config(config: Config) -> Result<(), String> {
    logging::init(logging::LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: config.log_timestamps,
    });
    if let Some(path) = config.log_file.as_deref() {
        logging::redirect_to_file(path)
            .map_err(|err| format!("failed to open log file {}: {err}", path.display()))?;
    }

    fs::create_dir_all(&config.data_dir).map_err(|err| {
        format!(
            "failed to create data dir {}: {err}",
            config.data_dir.display()
        )
    })?;
    let _lock = lock_data_dir(&config.data_dir)?;

    let store = open_store(&config)?;
    let ledger = Arc::new(Ledger::open(store).map_err(|err| err.to_string())?);
    let chain = Arc::new(RpcClient::new(config.rpc.clone()));
    let settings = job_settings(&config);
    log_info!(
        "stakeidx {} network={} backend={:?} rpc={}",
        env!("CARGO_PKG_VERSION"),
        config.network.as_str(),
        config.backend,
        chain.url()
    );

    let context = Arc::new(Context {
        config,
        chain,
        ledger,
        settings,
    });
    match context.config.command.clone() {
        Command::Status => print_json(&status_report(&context)?),
        Command::Snapshot { address } => {
            let ctx = Arc::clone(&context);
            let stats = blocking(move || {
                snapshot_address(
                    ctx.chain.as_ref(),
                    ctx.ledger.as_ref(),
                    &address,
                    ctx.settings.maturity,
                )
                .map_err(|err| err.to_string())
            })
            .await?;
            print_json(&stats)
        }
        Command::Gaps => {
            let ctx = Arc::clone(&context);
            let report = blocking(move || gap_report(&ctx)).await?;
            print_json(&report)
        }
        Command::Reconcile { limit } => {
            let ctx = Arc::clone(&context);
            let limit = limit.unwrap_or(ctx.config.reconcile_batch);
            let stats = blocking(move || {
                reconcile(
                    ctx.chain.as_ref(),
                    ctx.ledger.as_ref(),
                    limit,
                    ctx.settings.maturity,
                )
                .map_err(|err| err.to_string())
            })
            .await?;
            print_json(&stats)
        }
        Command::Scan { start, end, key } => run_scan_command(&context, start, end, key).await,
        Command::Backfill => run_backfill_command(&context).await,
        Command::Serve => serve(context).await,
    }
}

fn job_settings(config: &Config) -> JobSettings {
    let params = chain_params(config.network);
    let filter = if config.track.is_empty() {
        AddressFilter::All
    } else {
        AddressFilter::tracked(config.track.iter().cloned())
    };
    let defaults = JobSettings::default();
    JobSettings {
        scan: ScanConfig {
            batch_size: config.batch_size,
            workers: config.workers.max(1),
            height_retries: config.height_retries,
            filter: Arc::new(filter),
            attribution: AttributionConfig {
                pool_address: config.pool_address.clone(),
                ..AttributionConfig::default()
            },
            ..ScanConfig::default()
        },
        maturity: params.staking_maturity,
        first_stake_height: config.first_height.unwrap_or(params.first_stake_height),
        ..defaults
    }
}

async fn blocking<T, F>(work: F) -> Result<T, String>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, String> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| format!("worker task failed: {err}"))?
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value).map_err(|err| err.to_string())?;
    println!("{text}");
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CheckpointView {
    pub scan_key: String,
    pub start_height: u32,
    pub last_completed_height: Option<u32>,
    pub target: String,
    pub state: &'static str,
    pub updated_at: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StatusReport {
    pub checkpoints: Vec<CheckpointView>,
    pub covered_ranges: Vec<String>,
    pub skipped_heights: Vec<String>,
    pub pending_estimates: usize,
}

pub(crate) fn status_report(context: &Context) -> Result<StatusReport, String> {
    let ledger = context.ledger.as_ref();
    let checkpoints = ledger
        .checkpoints()
        .map_err(|err| err.to_string())?
        .into_iter()
        .map(|cp| CheckpointView {
            start_height: cp.start_height,
            last_completed_height: cp.last_completed_height,
            target: cp.target.to_string(),
            state: cp.state.as_str(),
            updated_at: cp.updated_at,
            scan_key: cp.scan_key,
        })
        .collect();
    let covered = stakeidx_indexer::covered_heights(ledger).map_err(|err| err.to_string())?;
    let skipped = ledger.skipped_heights().map_err(|err| err.to_string())?;
    let pending = ledger
        .pending_estimates(usize::MAX)
        .map_err(|err| err.to_string())?
        .len();
    Ok(StatusReport {
        checkpoints,
        covered_ranges: covered.ranges().iter().map(ToString::to_string).collect(),
        skipped_heights: skipped.ranges().iter().map(ToString::to_string).collect(),
        pending_estimates: pending,
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GapListing {
    domain_start: u32,
    domain_end: u32,
    missing_heights: u64,
    ranges: Vec<String>,
}

/// Read-only gap listing; nothing is queued.
fn gap_report(context: &Context) -> Result<GapListing, String> {
    let tip = stakeidx_indexer::ChainSource::chain_height(context.chain.as_ref())
        .map_err(|err| format!("cannot read chain height: {err}"))?;
    let first = context.settings.first_stake_height;
    let Some(domain) = HeightRange::new(first, tip) else {
        return Ok(GapListing {
            domain_start: first,
            domain_end: tip,
            missing_heights: 0,
            ranges: Vec::new(),
        });
    };
    let gaps = find_gaps(
        context.ledger.as_ref(),
        domain,
        &[],
        context.settings.backfill_chunk,
    )
    .map_err(|err| err.to_string())?;
    Ok(GapListing {
        domain_start: domain.start,
        domain_end: domain.end,
        missing_heights: gaps.iter().map(HeightRange::height_count).sum(),
        ranges: gaps.iter().map(ToString::to_string).collect(),
    })
}

fn spawn_manager(context: &Context) -> Result<JobControl, String> {
    let (control, _handle) = JobManager::spawn(
        Arc::clone(&context.chain),
        Arc::clone(&context.ledger),
        context.settings.clone(),
    )
    .map_err(|err| err.to_string())?;
    Ok(control)
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                log_warn!("failed to install SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Cancels `keys` once a shutdown signal arrives.
fn cancel_on_signal(control: JobControl, keys: Vec<String>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        shutdown_signal().await;
        log_info!("Signal received; cancelling jobs.");
        let _ = tokio::task::spawn_blocking(move || {
            for key in keys {
                if let Err(err) = control.cancel(&key) {
                    log_warn!("cancel {key} failed: {err}");
                }
            }
        })
        .await;
    })
}

fn finished_ok(status: &JobStatus) -> Result<(), String> {
    match status.state {
        ScanState::Completed | ScanState::Cancelled => Ok(()),
        _ => Err(format!(
            "scan {} ended {}: {}",
            status.scan_key,
            status.state.as_str(),
            status.error.as_deref().unwrap_or("no detail")
        )),
    }
}

async fn run_scan_command(
    context: &Context,
    start: Option<u32>,
    end: ScanTarget,
    key: Option<String>,
) -> Result<(), String> {
    let start = start.unwrap_or(context.settings.first_stake_height);
    let key = key.unwrap_or_else(|| format!("scan-{start}-{end}"));
    let control = spawn_manager(context)?;
    let request = ScanRequest::new(key.clone(), start, end);
    let watcher = cancel_on_signal(control.clone(), vec![key.clone()]);

    let waiter = control.clone();
    let status = blocking(move || {
        waiter.start(request).map_err(|err| err.to_string())?;
        waiter.wait(&key).map_err(|err| err.to_string())
    })
    .await;
    watcher.abort();
    let _ = blocking(move || control.shutdown().map_err(|err| err.to_string())).await;

    let status = status?;
    print_json(&status)?;
    finished_ok(&status)
}

async fn run_backfill_command(context: &Context) -> Result<(), String> {
    let control = spawn_manager(context)?;
    let auditor = control.clone();
    let report = blocking(move || auditor.gap_audit().map_err(|err| err.to_string())).await?;
    log_info!(
        "{} missing heights in {} ranges",
        report.missing_heights,
        report.ranges.len()
    );

    let keys: Vec<String> = report
        .ranges
        .iter()
        .map(|range| format!("backfill-{range}"))
        .collect();
    let watcher = cancel_on_signal(control.clone(), keys.clone());
    let waiter = control.clone();
    let statuses = blocking(move || {
        let mut statuses = Vec::with_capacity(keys.len());
        for key in &keys {
            // Queued ranges start only as earlier ones finish.
            loop {
                match waiter.wait(key) {
                    Ok(status) => {
                        statuses.push(status);
                        break;
                    }
                    Err(JobError::UnknownJob(_)) => std::thread::sleep(Duration::from_millis(200)),
                    Err(err) => return Err(err.to_string()),
                }
            }
        }
        Ok(statuses)
    })
    .await;
    watcher.abort();
    let _ = blocking(move || control.shutdown().map_err(|err| err.to_string())).await;

    let statuses = statuses?;
    print_json(&statuses)?;
    statuses.iter().try_for_each(finished_ok)
}

async fn serve(context: Arc<Context>) -> Result<(), String> {
    logging::enable_capture(LOG_CAPTURE_LINES);
    let control = spawn_manager(&context)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    {
        let context = Arc::clone(&context);
        let control = control.clone();
        let addr = context.config.admin_addr;
        tokio::spawn(async move {
            if let Err(err) = admin::serve_admin(addr, context, control).await {
                log_error!("admin server stopped: {err}");
            }
        });
    }

    // Register the forward scan before the first gap audit so its span counts
    // as busy and the audit does not queue backfills over the same heights.
    {
        let context = Arc::clone(&context);
        let control = control.clone();
        if let Err(err) = blocking(move || start_forward_scan(&context, &control)).await {
            log_warn!("forward scan failed to start: {err}");
        }
    }
    spawn_periodic(
        "forward scan",
        Duration::from_secs(FORWARD_RESTART_SECS),
        shutdown_rx.clone(),
        {
            let context = Arc::clone(&context);
            let control = control.clone();
            move || start_forward_scan(&context, &control)
        },
    );
    spawn_periodic(
        "gap audit",
        Duration::from_secs(context.config.gap_interval_secs.max(1)),
        shutdown_rx.clone(),
        {
            let control = control.clone();
            move || {
                let report = control.gap_audit().map_err(|err| err.to_string())?;
                if report.missing_heights > 0 {
                    log_info!(
                        "gap audit found {} missing heights; started {}",
                        report.missing_heights,
                        report.started.len()
                    );
                }
                Ok(())
            }
        },
    );
    spawn_periodic(
        "reconcile",
        Duration::from_secs(context.config.reconcile_interval_secs.max(1)),
        shutdown_rx,
        {
            let control = control.clone();
            let batch = context.config.reconcile_batch;
            move || match control.reconcile(batch) {
                Ok(stats) => {
                    if stats.examined > 0 {
                        log_info!(
                            "reconcile examined {} upgraded {} unknown {}",
                            stats.examined,
                            stats.upgraded,
                            stats.left_unknown
                        );
                    }
                    Ok(())
                }
                Err(JobError::AlreadyRunning(_)) => Ok(()),
                Err(err) => Err(err.to_string()),
            }
        },
    );

    shutdown_signal().await;
    log_info!("Signal received; requesting shutdown.");
    let _ = shutdown_tx.send(true);
    blocking(move || control.shutdown().map_err(|err| err.to_string())).await?;
    log_info!("shutdown complete");
    Ok(())
}

/// Starts (or resumes) the tip-following scan unless it is already running.
fn start_forward_scan(context: &Context, control: &JobControl) -> Result<(), String> {
    let start = match context.ledger.checkpoint(FORWARD_SCAN_KEY) {
        Ok(Some(checkpoint)) => checkpoint.start_height,
        Ok(None) => context.settings.first_stake_height,
        Err(err) => return Err(err.to_string()),
    };
    let request = ScanRequest::new(FORWARD_SCAN_KEY, start, ScanTarget::Tip);
    match control.start(request) {
        Ok(_) | Err(JobError::AlreadyRunning(_)) => Ok(()),
        Err(err) => Err(err.to_string()),
    }
}

/// Runs `task` on the blocking pool now and then every `every` until shutdown.
fn spawn_periodic<F>(
    name: &'static str,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
    task: F,
) where
    F: Fn() -> Result<(), String> + Send + Sync + 'static,
{
    let task = Arc::new(task);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            let task = Arc::clone(&task);
            match tokio::task::spawn_blocking(move || task()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => log_warn!("{name} failed: {err}"),
                Err(err) => log_warn!("{name} task panicked: {err}"),
            }
        }
    });
}
