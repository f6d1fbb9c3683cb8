mod common;

use std::sync::atomic::AtomicBool;

use common::{generation, output, spending, txid, FixtureChain};
use stakeidx_indexer::{
    reconcile, run_scan, snapshot_address, AddressUtxo, IndexError, Ledger, ScanConfig,
    ScanProgress, ScanRequest,
};
use stakeidx_primitives::{Confidence, OutPoint, ScanTarget, ValidationType};
use stakeidx_storage::memory::MemoryStore;

const MATURITY: u32 = 150;

fn utxo(address: &str, tag: u32, value: i64, height: u32) -> AddressUtxo {
    AddressUtxo {
        address: address.to_string(),
        outpoint: OutPoint::new(txid(tag), 0),
        value,
        height,
    }
}

/// Height 400 pays "U" from an untraceable input; height 401 is a direct stake by "D".
fn chain() -> FixtureChain {
    let mut chain = FixtureChain::new(500);
    let coinstake = spending(40, &[OutPoint::new(txid(4_040), 0)], vec![output(0, 12, "U")]);
    chain.add_block(400, ValidationType::Stake, vec![generation(41, Vec::new()), coinstake]);
    chain.add_stake(401, "D", 1_000, 5);
    chain
}

fn scanned(chain: &FixtureChain) -> Ledger<MemoryStore> {
    let ledger = Ledger::open(MemoryStore::new()).expect("ledger");
    run_scan(
        chain,
        &ledger,
        &ScanConfig::default(),
        &ScanRequest::new("fwd", 395, ScanTarget::Tip),
        &AtomicBool::new(false),
        &ScanProgress::new(),
    )
    .expect("scan");
    ledger
}

#[test]
fn snapshot_flags_maturity_and_vanished_outputs() {
    let mut chain = chain();
    chain.set_utxos("U", vec![utxo("U", 1, 300, 100), utxo("U", 2, 50, 480)]);
    let ledger = Ledger::open(MemoryStore::new()).expect("ledger");
    let stats = snapshot_address(&chain, &ledger, "U", MATURITY).expect("snapshot");
    assert_eq!(stats.live, 2);
    assert_eq!(stats.mature, 1);
    assert_eq!(stats.flagged_spent, 0);

    chain.set_utxos("U", vec![utxo("U", 2, 50, 480)]);
    let stats = snapshot_address(&chain, &ledger, "U", MATURITY).expect("snapshot");
    assert_eq!(stats.flagged_spent, 1);
    let gone = ledger
        .unspent_output(&OutPoint::new(txid(1), 0))
        .expect("read")
        .expect("cached");
    assert!(gone.spent);
}

#[test]
fn unknown_events_become_estimated_from_mature_holdings() {
    let mut chain = chain();
    chain.set_utxos(
        "U",
        vec![utxo("U", 1, 300, 100), utxo("U", 2, 200, 200), utxo("U", 3, 50, 480)],
    );
    let ledger = scanned(&chain);
    let direct_before = ledger.events_at_height(401).expect("events");
    assert_eq!(direct_before[0].confidence, Confidence::Direct);

    let stats = reconcile(&chain, &ledger, 100, MATURITY).expect("reconcile");
    assert_eq!(stats.examined, 1);
    assert_eq!(stats.upgraded, 1);
    assert_eq!(stats.left_unknown, 0);

    let event = &ledger.events_at_height(400).expect("events")[0];
    assert_eq!(event.confidence, Confidence::Estimated);
    assert_eq!(event.funding_stake_amount, Some(500));
    assert_eq!(event.reward_amount, 12);
    assert_eq!(ledger.events_at_height(401).expect("events"), direct_before);

    let again = reconcile(&chain, &ledger, 100, MATURITY).expect("reconcile");
    assert_eq!(again.examined, 0);
}

#[test]
fn confidence_never_moves_backwards() {
    let mut chain = chain();
    chain.set_utxos("U", vec![utxo("U", 1, 300, 100)]);
    let ledger = scanned(&chain);
    reconcile(&chain, &ledger, 100, MATURITY).expect("reconcile");

    let estimated = ledger.events_at_height(400).expect("events")[0].outpoint();
    let direct = ledger.events_at_height(401).expect("events")[0].outpoint();
    for outpoint in [estimated, direct] {
        let err = ledger.upgrade_confidence(&outpoint, 1).unwrap_err();
        assert!(matches!(err, IndexError::PersistenceConflict(_)));
    }
    assert_eq!(
        ledger.stake_event(&estimated).expect("read").expect("event").funding_stake_amount,
        Some(300)
    );
}

#[test]
fn nothing_mature_leaves_event_unknown() {
    let mut chain = chain();
    chain.set_utxos("U", vec![utxo("U", 3, 50, 480)]);
    let ledger = scanned(&chain);
    let stats = reconcile(&chain, &ledger, 100, MATURITY).expect("reconcile");
    assert_eq!(stats.upgraded, 0);
    assert_eq!(stats.left_unknown, 1);
    assert_eq!(ledger.pending_estimates(10).expect("pending").len(), 1);
}

#[test]
fn unresolvable_head_does_not_starve_later_events() {
    let mut chain = FixtureChain::new(500);
    for (height, address, tag) in [(5u32, "POOR", 50u32), (6, "RICH", 60)] {
        let untraceable = OutPoint::new(txid(tag * 100), 0);
        let coinstake = spending(tag, &[untraceable], vec![output(0, 9, address)]);
        let coinbase = generation(tag + 1, Vec::new());
        chain.add_block(height, ValidationType::Stake, vec![coinbase, coinstake]);
    }
    chain.set_utxos("RICH", vec![utxo("RICH", 7, 500, 100)]);
    let ledger = Ledger::open(MemoryStore::new()).expect("ledger");
    run_scan(
        &chain,
        &ledger,
        &ScanConfig::default(),
        &ScanRequest::new("fwd", 0, ScanTarget::Height(10)),
        &AtomicBool::new(false),
        &ScanProgress::new(),
    )
    .expect("scan");
    assert_eq!(ledger.pending_estimates(10).expect("pending").len(), 2);

    let first = reconcile(&chain, &ledger, 1, MATURITY).expect("first pass");
    assert_eq!((first.examined, first.upgraded), (1, 0));
    let second = reconcile(&chain, &ledger, 1, MATURITY).expect("second pass");
    assert_eq!((second.examined, second.upgraded), (1, 1));
    let rich = &ledger.events_at_height(6).expect("events")[0];
    assert_eq!(rich.confidence, Confidence::Estimated);
    assert_eq!(rich.funding_stake_amount, Some(500));

    let third = reconcile(&chain, &ledger, 1, MATURITY).expect("third pass");
    assert_eq!((third.examined, third.left_unknown), (1, 1));
    let pending = ledger.pending_estimates(10).expect("pending");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].beneficiary_address, "POOR");
}
