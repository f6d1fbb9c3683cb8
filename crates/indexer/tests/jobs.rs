mod common;

use std::sync::Arc;
use std::time::Duration;

use common::FixtureChain;
use stakeidx_indexer::{
    AddressFilter, JobControl, JobError, JobManager, JobSettings, Ledger, ScanConfig, ScanRequest,
};
use stakeidx_primitives::{ScanState, ScanTarget};
use stakeidx_storage::memory::MemoryStore;

fn settings(filter: AddressFilter) -> JobSettings {
    JobSettings {
        scan: ScanConfig {
            batch_size: 40,
            workers: 3,
            height_retries: 2,
            retry_backoff: Duration::from_millis(1),
            filter: Arc::new(filter),
            ..ScanConfig::default()
        },
        maturity: 10,
        first_stake_height: 0,
        backfill_chunk: 50,
        max_backfills: 2,
    }
}

fn spawn(
    chain: FixtureChain,
    filter: AddressFilter,
) -> (JobControl, Arc<FixtureChain>, Arc<Ledger<MemoryStore>>) {
    let chain = Arc::new(chain);
    let ledger = Arc::new(Ledger::open(MemoryStore::new()).expect("ledger"));
    let (control, _handle) =
        JobManager::spawn(Arc::clone(&chain), Arc::clone(&ledger), settings(filter))
            .expect("manager");
    (control, chain, ledger)
}

#[test]
fn start_wait_and_list() {
    let mut chain = FixtureChain::new(120);
    chain.add_stake(30, "X", 500, 2);
    chain.add_stake(90, "X", 500, 2);
    let (control, _chain, ledger) = spawn(chain, AddressFilter::All);

    let started = control
        .start(ScanRequest::new("fwd", 0, ScanTarget::Tip))
        .expect("start");
    assert_eq!(started.scan_key, "fwd");

    let done = control.wait("fwd").expect("wait");
    assert_eq!(done.state, ScanState::Completed);
    assert_eq!(done.last_completed_height, Some(120));
    assert_eq!(done.progress.events_found, 2);
    assert_eq!(ledger.all_events().expect("events").len(), 2);

    let jobs = control.list().expect("list");
    assert_eq!(jobs.len(), 1);
    assert_eq!(control.status("fwd").expect("status").state, ScanState::Completed);
    control.shutdown().expect("shutdown");
}

#[test]
fn bad_requests_are_rejected() {
    let (control, _chain, _ledger) = spawn(FixtureChain::new(10), AddressFilter::All);
    assert!(matches!(
        control.start(ScanRequest::new("bad", 9, ScanTarget::Height(3))),
        Err(JobError::InvalidRequest(_))
    ));
    assert!(matches!(control.status("nope"), Err(JobError::UnknownJob(_))));
    assert!(matches!(control.cancel("nope"), Err(JobError::UnknownJob(_))));
    control.shutdown().expect("shutdown");
    assert!(matches!(control.list(), Err(JobError::ManagerStopped)));
}

#[test]
fn forward_scan_plus_backfill_leaves_only_genuine_empty_stake_blocks() {
    let mut chain = FixtureChain::new(300);
    let mut untracked = Vec::new();
    for height in (10..=290).step_by(20) {
        if height % 60 == 10 {
            chain.add_stake(height, "Y", 800, 3);
            untracked.push(height);
        } else {
            chain.add_stake(height, "X", 800, 3);
        }
    }
    chain.fail_times(150, 3);
    let (control, chain, ledger) = spawn(chain, AddressFilter::tracked(["X"]));

    control
        .start(ScanRequest::new("fwd", 0, ScanTarget::Height(300)))
        .expect("start");
    assert_eq!(control.wait("fwd").expect("wait").state, ScanState::Completed);
    assert!(ledger.skipped_heights().expect("skipped").contains(150));

    let report = control.gap_audit().expect("audit");
    assert_eq!(report.ranges, vec!["150-150".to_string()]);
    assert_eq!(report.started, vec!["backfill-150-150".to_string()]);
    let backfill = control.wait("backfill-150-150").expect("wait");
    assert_eq!(backfill.state, ScanState::Completed);

    let empty: Vec<u32> = ledger
        .stake_blocks_without_events(None)
        .expect("summaries")
        .iter()
        .map(|summary| summary.height)
        .collect();
    assert_eq!(empty, untracked);
    let tracked_blocks = chain.stake_heights().len() - untracked.len();
    assert_eq!(ledger.all_events().expect("events").len(), tracked_blocks);

    let again = control.gap_audit().expect("audit");
    assert_eq!(again.missing_heights, 0);
    assert!(again.started.is_empty());
    control.shutdown().expect("shutdown");
}

#[test]
fn reconcile_through_the_manager() {
    let mut chain = FixtureChain::new(50);
    let missing = stakeidx_primitives::OutPoint::new(common::txid(9_999), 0);
    let coinstake = common::spending(2, &[missing], vec![common::output(0, 40, "Z")]);
    chain.add_block(
        20,
        stakeidx_primitives::ValidationType::Stake,
        vec![common::generation(3, Vec::new()), coinstake],
    );
    chain.set_utxos(
        "Z",
        vec![stakeidx_indexer::AddressUtxo {
            address: "Z".to_string(),
            outpoint: stakeidx_primitives::OutPoint::new(common::txid(4), 1),
            value: 900,
            height: 5,
        }],
    );
    let (control, _chain, ledger) = spawn(chain, AddressFilter::All);
    control
        .start(ScanRequest::new("fwd", 0, ScanTarget::Tip))
        .expect("start");
    control.wait("fwd").expect("wait");
    assert_eq!(ledger.pending_estimates(10).expect("pending").len(), 1);

    let stats = control.reconcile(10).expect("reconcile");
    assert_eq!(stats.upgraded, 1);
    assert!(ledger.pending_estimates(10).expect("pending").is_empty());
    control.shutdown().expect("shutdown");
}

#[test]
fn gap_audit_after_forward_start_queues_no_overlap() {
    let mut chain = FixtureChain::new(2_000);
    for height in (10..2_000).step_by(50) {
        chain.add_stake(height, "X", 500, 2);
    }
    let (control, _chain, ledger) = spawn(chain, AddressFilter::All);
    control
        .start(ScanRequest::new("forward", 0, ScanTarget::Tip))
        .expect("start");

    let report = control.gap_audit().expect("audit");
    assert_eq!(report.queued, 0);
    assert!(report.started.is_empty());

    assert_eq!(control.wait("forward").expect("wait").state, ScanState::Completed);
    assert_eq!(ledger.all_events().expect("events").len(), 40);
    assert_eq!(control.list().expect("list").len(), 1);
    control.shutdown().expect("shutdown");
}
