//! Estimating unknown stake amounts from the funder's current holdings.
//!
//! Current holdings are not holdings at stake time, so the result is only
//! ever tagged estimated and never replaces a direct value.

use std::collections::BTreeMap;

use serde::Serialize;
use stakeidx_consensus::Amount;
use stakeidx_log::{log_debug, log_info, log_warn};
use stakeidx_primitives::{StakeEvent, UnspentOutput};
use stakeidx_storage::KeyValueStore;

use crate::error::IndexError;
use crate::ledger::Ledger;
use crate::rpc::ChainSource;

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotStats {
    pub live: u64,
    pub mature: u64,
    /// Cached outputs the node no longer reports.
    pub flagged_spent: u64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileStats {
    pub examined: u64,
    pub upgraded: u64,
    pub left_unknown: u64,
    pub address_errors: u64,
}

fn is_mature(tip: u32, creation_height: u32, maturity: u32) -> bool {
    creation_height <= tip && tip - creation_height + 1 >= maturity
}

/// Refreshes the cached unspent outputs of `address` from the node.
pub fn snapshot_address<C: ChainSource + ?Sized, S: KeyValueStore>(
    chain: &C,
    ledger: &Ledger<S>,
    address: &str,
    maturity: u32,
) -> Result<SnapshotStats, IndexError> {
    let tip = chain.chain_height()?;
    let live: Vec<UnspentOutput> = chain
        .address_utxos(address)?
        .into_iter()
        .map(|utxo| UnspentOutput {
            address: address.to_string(),
            outpoint: utxo.outpoint,
            value: utxo.value,
            creation_height: utxo.height,
            spent: false,
            maturity_eligible: is_mature(tip, utxo.height, maturity),
        })
        .collect();
    let flagged_spent = ledger.replace_address_utxos(address, &live)?;
    let stats = SnapshotStats {
        live: live.len() as u64,
        mature: live.iter().filter(|utxo| utxo.maturity_eligible).count() as u64,
        flagged_spent,
    };
    log_debug!(
        "snapshot {address}: {} live, {} mature, {} gone",
        stats.live,
        stats.mature,
        stats.flagged_spent
    );
    Ok(stats)
}

fn mature_holdings<S: KeyValueStore>(
    ledger: &Ledger<S>,
    address: &str,
) -> Result<Amount, IndexError> {
    Ok(ledger
        .unspent_for_address(address)?
        .iter()
        .filter(|utxo| !utxo.spent && utxo.maturity_eligible)
        .map(|utxo| utxo.value)
        .sum())
}

/// Upgrades up to `limit` unknown-confidence events, continuing where the
/// previous pass stopped. Addresses whose snapshot fails are skipped;
/// credential or storage failures abort the pass.
pub fn reconcile<C: ChainSource + ?Sized, S: KeyValueStore>(
    chain: &C,
    ledger: &Ledger<S>,
    limit: usize,
    maturity: u32,
) -> Result<ReconcileStats, IndexError> {
    let page = ledger.pending_after_cursor(limit)?;
    let last_examined = page.last().cloned();
    let mut by_funder: BTreeMap<String, Vec<StakeEvent>> = BTreeMap::new();
    for event in page {
        by_funder
            .entry(event.funding_address.clone())
            .or_default()
            .push(event);
    }

    let mut stats = ReconcileStats::default();
    for (address, events) in by_funder {
        stats.examined += events.len() as u64;
        match snapshot_address(chain, ledger, &address, maturity) {
            Ok(_) => {}
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                log_warn!("reconcile: cannot snapshot {address}: {err}");
                stats.address_errors += 1;
                stats.left_unknown += events.len() as u64;
                continue;
            }
        }
        let holdings = mature_holdings(ledger, &address)?;
        if holdings <= 0 {
            stats.left_unknown += events.len() as u64;
            continue;
        }
        for event in events {
            match ledger.upgrade_confidence(&event.outpoint(), holdings) {
                Ok(_) => stats.upgraded += 1,
                Err(IndexError::PersistenceConflict(message)) => {
                    log_debug!("reconcile: {message}");
                }
                Err(err) => return Err(err),
            }
        }
    }
    if let Some(event) = last_examined {
        ledger.advance_reconcile_cursor(&event)?;
    }
    log_info!(
        "reconcile: examined {}, upgraded {}, still unknown {}, address errors {}",
        stats.examined,
        stats.upgraded,
        stats.left_unknown,
        stats.address_errors
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maturity_counts_the_creation_block() {
        assert!(is_mature(1149, 1000, 150));
        assert!(!is_mature(1148, 1000, 150));
        assert!(!is_mature(999, 1000, 1));
        assert!(is_mature(1000, 1000, 1));
    }
}
