//! Idempotent persistence of stake events, the unspent-output cache, scan
//! checkpoints and height coverage.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use stakeidx_consensus::Amount;
use stakeidx_log::log_warn;
use stakeidx_primitives::{
    address_hash, decode, encode, Confidence, HeightRange, OutPoint, RangeSet, ScanCheckpoint,
    StakeBlockSummary, StakeEvent, UnspentOutput,
};
use stakeidx_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::error::IndexError;

const SCHEMA_KEY: &[u8] = b"schema_version";
const SCHEMA_VERSION: u32 = 1;
const RECONCILE_CURSOR_KEY: &[u8] = b"reconcile_cursor";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpsertOutcome {
    Inserted,
    /// The key already existed; the stored row was left as is.
    Unchanged,
}

/// Everything one scan batch writes, applied in a single atomic batch.
#[derive(Clone, Debug)]
pub struct BatchCommit {
    pub events: Vec<StakeEvent>,
    pub summaries: Vec<StakeBlockSummary>,
    /// Outpoints consumed by any transaction in the batch.
    pub spent: Vec<OutPoint>,
    /// Heights fully processed; skipped heights are not included.
    pub covered: RangeSet,
    pub skipped: Vec<u32>,
    pub checkpoint: ScanCheckpoint,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommitStats {
    pub inserted: u64,
    pub duplicates: u64,
    pub marked_spent: u64,
}

fn height_key(height: u32) -> [u8; 4] {
    height.to_be_bytes()
}

fn height_outpoint_key(height: u32, outpoint: &OutPoint) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + OutPoint::KEY_LEN);
    key.extend_from_slice(&height_key(height));
    key.extend_from_slice(&outpoint.key());
    key
}

fn address_outpoint_key(address: &str, outpoint: &OutPoint) -> Vec<u8> {
    let mut key = Vec::with_capacity(32 + OutPoint::KEY_LEN);
    key.extend_from_slice(&address_hash(address));
    key.extend_from_slice(&outpoint.key());
    key
}

fn decode_height(key: &[u8]) -> Result<u32, IndexError> {
    let bytes: [u8; 4] = key
        .get(..4)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| IndexError::Store(StoreError::Corrupt("short height key".into())))?;
    Ok(u32::from_be_bytes(bytes))
}

pub struct Ledger<S> {
    store: S,
    write_lock: Mutex<()>,
}

impl<S: KeyValueStore> Ledger<S> {
    /// Opens the ledger, stamping a fresh store with the schema version.
    pub fn open(store: S) -> Result<Self, IndexError> {
        match store.get(Column::Meta, SCHEMA_KEY)? {
            Some(bytes) => {
                let version = bytes
                    .as_slice()
                    .try_into()
                    .map(u32::from_le_bytes)
                    .map_err(|_| IndexError::ConfigurationFatal("unreadable schema version".into()))?;
                if version != SCHEMA_VERSION {
                    return Err(IndexError::ConfigurationFatal(format!(
                        "store schema version {version} is not supported (expected {SCHEMA_VERSION})"
                    )));
                }
            }
            None => store.put(Column::Meta, SCHEMA_KEY, &SCHEMA_VERSION.to_le_bytes())?,
        }
        Ok(Self {
            store,
            write_lock: Mutex::new(()),
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, IndexError> {
        self.write_lock
            .lock()
            .map_err(|_| IndexError::Store(StoreError::Backend("ledger write lock poisoned".into())))
    }

    pub fn stake_event(&self, outpoint: &OutPoint) -> Result<Option<StakeEvent>, IndexError> {
        self.store
            .get(Column::StakeEvent, &outpoint.key())?
            .map(|bytes| decode::<StakeEvent>(&bytes))
            .transpose()
            .map_err(Into::into)
    }

    fn stage_event(batch: &mut WriteBatch, event: &StakeEvent) {
        let outpoint = event.outpoint();
        batch.put(Column::StakeEvent, outpoint.key(), encode(event));
        batch.put(
            Column::EventHeight,
            height_outpoint_key(event.block_height, &outpoint),
            Vec::new(),
        );
        if event.confidence == Confidence::Unknown {
            batch.put(
                Column::PendingEstimate,
                height_outpoint_key(event.block_height, &outpoint),
                Vec::new(),
            );
        }
    }

    /// Inserts the event unless its (txid, output index) key already exists.
    pub fn upsert_stake_event(&self, event: &StakeEvent) -> Result<UpsertOutcome, IndexError> {
        if event.reward_amount <= 0 {
            return Err(IndexError::DataAnomaly(format!(
                "refusing to store non-positive reward {} for {}:{}",
                event.reward_amount, event.reward_txid, event.output_index
            )));
        }
        let _guard = self.lock()?;
        if self.store.get(Column::StakeEvent, &event.outpoint().key())?.is_some() {
            return Ok(UpsertOutcome::Unchanged);
        }
        let mut batch = WriteBatch::new();
        Self::stage_event(&mut batch, event);
        self.store.write_batch(&batch)?;
        Ok(UpsertOutcome::Inserted)
    }

    /// The single permitted update: an unknown stake amount becomes estimated.
    ///
    /// Returns `PersistenceConflict` when the row is no longer unknown.
    pub fn upgrade_confidence(
        &self,
        outpoint: &OutPoint,
        estimated_amount: Amount,
    ) -> Result<StakeEvent, IndexError> {
        let _guard = self.lock()?;
        let mut event = self.stake_event(outpoint)?.ok_or_else(|| {
            IndexError::PersistenceConflict(format!(
                "no event {}:{}",
                outpoint.txid, outpoint.index
            ))
        })?;
        if event.confidence != Confidence::Unknown {
            return Err(IndexError::PersistenceConflict(format!(
                "event {}:{} is already {}",
                outpoint.txid,
                outpoint.index,
                event.confidence.as_str()
            )));
        }
        event.funding_stake_amount = Some(estimated_amount);
        event.confidence = Confidence::Estimated;
        let mut batch = WriteBatch::new();
        batch.put(Column::StakeEvent, outpoint.key(), encode(&event));
        batch.delete(
            Column::PendingEstimate,
            height_outpoint_key(event.block_height, outpoint),
        );
        self.store.write_batch(&batch)?;
        Ok(event)
    }

    fn events_from_index(
        &self,
        column: Column,
        prefix: &[u8],
        limit: usize,
    ) -> Result<Vec<StakeEvent>, IndexError> {
        let mut keys = Vec::new();
        self.store.for_each_prefix(column, prefix, &mut |key, _| {
            if key.len() == 4 + OutPoint::KEY_LEN {
                keys.push(key.to_vec());
            }
            Ok(keys.len() < limit)
        })?;
        self.load_indexed(column, keys)
    }

    /// Resolves (height, outpoint) index keys to their events.
    fn load_indexed(
        &self,
        column: Column,
        keys: Vec<Vec<u8>>,
    ) -> Result<Vec<StakeEvent>, IndexError> {
        let mut events = Vec::with_capacity(keys.len());
        for key in keys {
            match self.store.get(Column::StakeEvent, &key[4..])? {
                Some(bytes) => events.push(decode::<StakeEvent>(&bytes)?),
                None => log_warn!("{} index points at a missing event", column.as_str()),
            }
        }
        Ok(events)
    }

    pub fn events_at_height(&self, height: u32) -> Result<Vec<StakeEvent>, IndexError> {
        self.events_from_index(Column::EventHeight, &height_key(height), usize::MAX)
    }

    pub fn all_events(&self) -> Result<Vec<StakeEvent>, IndexError> {
        self.events_from_index(Column::EventHeight, &[], usize::MAX)
    }

    /// Oldest events still waiting for a stake amount.
    pub fn pending_estimates(&self, limit: usize) -> Result<Vec<StakeEvent>, IndexError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.events_from_index(Column::PendingEstimate, &[], limit)
    }

    /// Next `limit` pending events after the reconcile cursor, wrapping to the
    /// oldest once the end of the index is reached. Rows that stay pending are
    /// therefore revisited only after every other pending row has had a turn.
    pub fn pending_after_cursor(&self, limit: usize) -> Result<Vec<StakeEvent>, IndexError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let cursor = self.store.get(Column::Meta, RECONCILE_CURSOR_KEY)?;
        let mut after = Vec::new();
        let mut before = Vec::new();
        self.store
            .for_each_prefix(Column::PendingEstimate, &[], &mut |key, _| {
                if key.len() != 4 + OutPoint::KEY_LEN {
                    return Ok(true);
                }
                match cursor.as_deref() {
                    Some(cursor) if key <= cursor => {
                        if before.len() < limit {
                            before.push(key.to_vec());
                        }
                    }
                    _ => after.push(key.to_vec()),
                }
                Ok(after.len() < limit)
            })?;
        let wrap = limit - after.len();
        after.extend(before.into_iter().take(wrap));
        self.load_indexed(Column::PendingEstimate, after)
    }

    /// Records `event` as the last pending row a reconcile pass examined.
    pub fn advance_reconcile_cursor(&self, event: &StakeEvent) -> Result<(), IndexError> {
        self.store.put(
            Column::Meta,
            RECONCILE_CURSOR_KEY,
            &height_outpoint_key(event.block_height, &event.outpoint()),
        )?;
        Ok(())
    }

    /// Pure overwrite; the cache has no history.
    pub fn upsert_unspent_output(&self, utxo: &UnspentOutput) -> Result<(), IndexError> {
        let mut batch = WriteBatch::new();
        batch.put(Column::Utxo, utxo.outpoint.key(), encode(utxo));
        batch.put(
            Column::AddressUtxo,
            address_outpoint_key(&utxo.address, &utxo.outpoint),
            Vec::new(),
        );
        self.store.write_batch(&batch)?;
        Ok(())
    }

    pub fn unspent_output(&self, outpoint: &OutPoint) -> Result<Option<UnspentOutput>, IndexError> {
        self.store
            .get(Column::Utxo, &outpoint.key())?
            .map(|bytes| decode::<UnspentOutput>(&bytes))
            .transpose()
            .map_err(Into::into)
    }

    pub fn unspent_for_address(&self, address: &str) -> Result<Vec<UnspentOutput>, IndexError> {
        let prefix = address_hash(address);
        let rows = self.store.scan_prefix(Column::AddressUtxo, &prefix)?;
        let mut out = Vec::with_capacity(rows.len());
        for (key, _) in rows {
            let Some(outpoint) = OutPoint::from_key(&key[prefix.len()..]) else {
                continue;
            };
            if let Some(utxo) = self.unspent_output(&outpoint)? {
                out.push(utxo);
            }
        }
        Ok(out)
    }

    /// Flags cached outputs as consumed. Unknown outpoints are ignored.
    pub fn mark_spent(&self, outpoints: &[OutPoint]) -> Result<u64, IndexError> {
        let _guard = self.lock()?;
        let mut batch = WriteBatch::new();
        let marked = self.stage_spent(&mut batch, outpoints)?;
        self.store.write_batch(&batch)?;
        Ok(marked)
    }

    fn stage_spent(&self, batch: &mut WriteBatch, outpoints: &[OutPoint]) -> Result<u64, IndexError> {
        let mut marked = 0;
        for outpoint in outpoints {
            if let Some(mut utxo) = self.unspent_output(outpoint)? {
                if !utxo.spent {
                    utxo.spent = true;
                    batch.put(Column::Utxo, outpoint.key(), encode(&utxo));
                    marked += 1;
                }
            }
        }
        Ok(marked)
    }

    /// Replaces an address's cached outputs with `live`. Cached outputs missing
    /// from `live` are kept but flagged spent. Returns how many were flagged.
    pub fn replace_address_utxos(
        &self,
        address: &str,
        live: &[UnspentOutput],
    ) -> Result<u64, IndexError> {
        let _guard = self.lock()?;
        let live_keys: HashSet<OutPoint> = live.iter().map(|utxo| utxo.outpoint).collect();
        let mut batch = WriteBatch::new();
        let mut flagged = 0;
        for mut cached in self.unspent_for_address(address)? {
            if !live_keys.contains(&cached.outpoint) && !cached.spent {
                cached.spent = true;
                batch.put(Column::Utxo, cached.outpoint.key(), encode(&cached));
                flagged += 1;
            }
        }
        for utxo in live {
            batch.put(Column::Utxo, utxo.outpoint.key(), encode(utxo));
            batch.put(
                Column::AddressUtxo,
                address_outpoint_key(address, &utxo.outpoint),
                Vec::new(),
            );
        }
        self.store.write_batch(&batch)?;
        Ok(flagged)
    }

    pub fn checkpoint(&self, scan_key: &str) -> Result<Option<ScanCheckpoint>, IndexError> {
        self.store
            .get(Column::Checkpoint, scan_key.as_bytes())?
            .map(|bytes| decode::<ScanCheckpoint>(&bytes))
            .transpose()
            .map_err(Into::into)
    }

    pub fn checkpoints(&self) -> Result<Vec<ScanCheckpoint>, IndexError> {
        let rows = self.store.scan_prefix(Column::Checkpoint, &[])?;
        rows.iter()
            .map(|(_, value)| decode::<ScanCheckpoint>(value).map_err(Into::into))
            .collect()
    }

    pub fn put_checkpoint(&self, checkpoint: &ScanCheckpoint) -> Result<(), IndexError> {
        let _guard = self.lock()?;
        self.store.put(
            Column::Checkpoint,
            checkpoint.scan_key.as_bytes(),
            &encode(checkpoint),
        )?;
        Ok(())
    }

    pub fn coverage(&self) -> Result<RangeSet, IndexError> {
        let rows = self.store.scan_prefix(Column::Coverage, &[])?;
        let mut set = RangeSet::new();
        for (_, value) in rows {
            set.insert(decode::<HeightRange>(&value)?);
        }
        Ok(set)
    }

    pub fn skipped_heights(&self) -> Result<RangeSet, IndexError> {
        let rows = self.store.scan_prefix(Column::SkippedHeight, &[])?;
        let mut heights = Vec::with_capacity(rows.len());
        for (key, _) in rows {
            heights.push(decode_height(&key)?);
        }
        Ok(RangeSet::from_heights(heights))
    }

    pub fn stake_block(&self, height: u32) -> Result<Option<StakeBlockSummary>, IndexError> {
        self.store
            .get(Column::StakeBlock, &height_key(height))?
            .map(|bytes| decode::<StakeBlockSummary>(&bytes))
            .transpose()
            .map_err(Into::into)
    }

    /// Stake-produced blocks that a scan processed and found no event in.
    pub fn stake_blocks_without_events(
        &self,
        range: Option<HeightRange>,
    ) -> Result<Vec<StakeBlockSummary>, IndexError> {
        let mut out = Vec::new();
        self.store
            .for_each_prefix(Column::StakeBlock, &[], &mut |key, value| {
                let height = u32::from_be_bytes(
                    key.try_into()
                        .map_err(|_| StoreError::Corrupt("bad stake block key".into()))?,
                );
                if let Some(range) = range {
                    if height > range.end {
                        return Ok(false);
                    }
                    if height < range.start {
                        return Ok(true);
                    }
                }
                let summary = decode::<StakeBlockSummary>(value)
                    .map_err(|err| StoreError::Corrupt(err.to_string()))?;
                if summary.events == 0 {
                    out.push(summary);
                }
                Ok(true)
            })?;
        Ok(out)
    }

    /// Applies a scan batch atomically. Events whose key already exists are
    /// counted as duplicates and left untouched.
    pub fn commit_batch(&self, commit: &BatchCommit) -> Result<CommitStats, IndexError> {
        let _guard = self.lock()?;
        let mut stats = CommitStats::default();
        let mut batch = WriteBatch::new();
        let mut seen: HashSet<OutPoint> = HashSet::new();

        for event in &commit.events {
            let outpoint = event.outpoint();
            if event.reward_amount <= 0 {
                log_warn!(
                    "dropping non-positive reward {} at {}:{}",
                    event.reward_amount,
                    outpoint.txid,
                    outpoint.index
                );
                continue;
            }
            if !seen.insert(outpoint)
                || self.store.get(Column::StakeEvent, &outpoint.key())?.is_some()
            {
                stats.duplicates += 1;
                continue;
            }
            Self::stage_event(&mut batch, event);
            stats.inserted += 1;
        }

        for summary in &commit.summaries {
            batch.put(Column::StakeBlock, height_key(summary.height), encode(summary));
        }

        stats.marked_spent = self.stage_spent(&mut batch, &commit.spent)?;

        if !commit.covered.is_empty() {
            let old_rows = self.store.scan_prefix(Column::Coverage, &[])?;
            let mut merged = RangeSet::new();
            for (_, value) in &old_rows {
                merged.insert(decode::<HeightRange>(value)?);
            }
            merged.union(&commit.covered);
            let starts: HashSet<[u8; 4]> = merged
                .ranges()
                .iter()
                .map(|range| height_key(range.start))
                .collect();
            for (key, _) in old_rows {
                if !starts.contains(key.as_slice()) {
                    batch.delete(Column::Coverage, key);
                }
            }
            for range in merged.ranges() {
                batch.put(Column::Coverage, height_key(range.start), encode(range));
            }
            for (key, _) in self.store.scan_prefix(Column::SkippedHeight, &[])? {
                if commit.covered.contains(decode_height(&key)?) {
                    batch.delete(Column::SkippedHeight, key);
                }
            }
        }
        for height in &commit.skipped {
            batch.put(Column::SkippedHeight, height_key(*height), Vec::new());
        }

        batch.put(
            Column::Checkpoint,
            commit.checkpoint.scan_key.as_bytes().to_vec(),
            encode(&commit.checkpoint),
        );
        self.store.write_batch(&batch)?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stakeidx_primitives::{ScanState, ScanTarget, Txid};
    use stakeidx_storage::memory::MemoryStore;

    fn ledger() -> Ledger<MemoryStore> {
        Ledger::open(MemoryStore::new()).expect("open")
    }

    fn event(txid: u8, index: u32, height: u32, confidence: Confidence) -> StakeEvent {
        StakeEvent {
            beneficiary_address: "X".to_string(),
            funding_address: "X".to_string(),
            block_height: height,
            block_hash: format!("{height:064x}"),
            block_time: 0,
            reward_txid: Txid([txid; 32]),
            output_index: index,
            reward_amount: 3,
            funding_stake_amount: (confidence == Confidence::Direct).then_some(100),
            confidence,
        }
    }

    fn checkpoint(last: u32) -> ScanCheckpoint {
        ScanCheckpoint {
            scan_key: "forward".to_string(),
            start_height: 1,
            last_completed_height: Some(last),
            target: ScanTarget::Tip,
            state: ScanState::Running,
            updated_at: 0,
        }
    }

    #[test]
    fn upsert_is_keyed_on_outpoint() {
        let ledger = ledger();
        let first = event(1, 0, 10, Confidence::Direct);
        assert_eq!(ledger.upsert_stake_event(&first).expect("upsert"), UpsertOutcome::Inserted);

        let mut changed = first.clone();
        changed.reward_amount = 999;
        assert_eq!(ledger.upsert_stake_event(&changed).expect("upsert"), UpsertOutcome::Unchanged);
        assert_eq!(
            ledger.stake_event(&first.outpoint()).expect("get"),
            Some(first)
        );
    }

    #[test]
    fn upsert_rejects_non_positive_reward() {
        let ledger = ledger();
        let mut bad = event(1, 0, 10, Confidence::Direct);
        bad.reward_amount = 0;
        assert!(matches!(
            ledger.upsert_stake_event(&bad),
            Err(IndexError::DataAnomaly(_))
        ));
    }

    #[test]
    fn confidence_upgrade_only_from_unknown() {
        let ledger = ledger();
        let direct = event(1, 0, 10, Confidence::Direct);
        let unknown = event(2, 1, 11, Confidence::Unknown);
        ledger.upsert_stake_event(&direct).expect("direct");
        ledger.upsert_stake_event(&unknown).expect("unknown");
        assert_eq!(ledger.pending_estimates(10).expect("pending").len(), 1);

        let err = ledger.upgrade_confidence(&direct.outpoint(), 5).unwrap_err();
        assert!(matches!(err, IndexError::PersistenceConflict(_)));

        let upgraded = ledger.upgrade_confidence(&unknown.outpoint(), 5).expect("upgrade");
        assert_eq!(upgraded.confidence, Confidence::Estimated);
        assert_eq!(upgraded.funding_stake_amount, Some(5));
        assert!(ledger.pending_estimates(10).expect("pending").is_empty());

        let again = ledger.upgrade_confidence(&unknown.outpoint(), 6).unwrap_err();
        assert!(matches!(again, IndexError::PersistenceConflict(_)));
        assert_eq!(
            ledger
                .stake_event(&unknown.outpoint())
                .expect("get")
                .and_then(|e| e.funding_stake_amount),
            Some(5)
        );
    }

    #[test]
    fn commit_batch_counts_duplicates_and_merges_coverage() {
        let ledger = ledger();
        let commit = BatchCommit {
            events: vec![
                event(1, 0, 10, Confidence::Direct),
                event(1, 0, 10, Confidence::Direct),
                event(2, 0, 12, Confidence::Unknown),
            ],
            summaries: Vec::new(),
            spent: Vec::new(),
            covered: RangeSet::from_ranges(HeightRange::new(10, 11)),
            skipped: vec![12],
            checkpoint: checkpoint(12),
        };
        let stats = ledger.commit_batch(&commit).expect("commit");
        assert_eq!(stats.inserted, 2);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(ledger.all_events().expect("events").len(), 2);
        assert_eq!(ledger.skipped_heights().expect("skipped"), RangeSet::from_heights([12]));

        let follow_up = BatchCommit {
            events: vec![event(2, 0, 12, Confidence::Unknown)],
            summaries: Vec::new(),
            spent: Vec::new(),
            covered: RangeSet::from_ranges(HeightRange::new(12, 20)),
            skipped: Vec::new(),
            checkpoint: checkpoint(20),
        };
        let stats = ledger.commit_batch(&follow_up).expect("commit");
        assert_eq!(stats.inserted, 0);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(
            ledger.coverage().expect("coverage"),
            RangeSet::from_ranges(HeightRange::new(10, 20))
        );
        assert!(ledger.skipped_heights().expect("skipped").is_empty());
        assert_eq!(
            ledger
                .checkpoint("forward")
                .expect("checkpoint")
                .and_then(|cp| cp.last_completed_height),
            Some(20)
        );
    }

    #[test]
    fn spent_marking_and_address_snapshot() {
        let ledger = ledger();
        let a = UnspentOutput {
            address: "F".to_string(),
            outpoint: OutPoint::new(Txid([7; 32]), 0),
            value: 40,
            creation_height: 5,
            spent: false,
            maturity_eligible: true,
        };
        let b = UnspentOutput {
            outpoint: OutPoint::new(Txid([8; 32]), 1),
            value: 60,
            ..a.clone()
        };
        ledger.upsert_unspent_output(&a).expect("a");
        ledger.upsert_unspent_output(&b).expect("b");
        assert_eq!(ledger.unspent_for_address("F").expect("list").len(), 2);

        assert_eq!(ledger.mark_spent(&[a.outpoint, OutPoint::new(Txid([9; 32]), 0)]).expect("mark"), 1);
        assert!(ledger.unspent_output(&a.outpoint).expect("get").expect("a").spent);

        let c = UnspentOutput {
            outpoint: OutPoint::new(Txid([10; 32]), 0),
            value: 70,
            ..a.clone()
        };
        let flagged = ledger.replace_address_utxos("F", &[c.clone()]).expect("replace");
        assert_eq!(flagged, 1);
        let live: Vec<_> = ledger
            .unspent_for_address("F")
            .expect("list")
            .into_iter()
            .filter(|utxo| !utxo.spent)
            .collect();
        assert_eq!(live, vec![c]);
    }

    #[test]
    fn stake_blocks_without_events_filters_by_range() {
        let ledger = ledger();
        let summary = |height, events| StakeBlockSummary {
            height,
            hash: String::new(),
            time: 0,
            reward_txid: None,
            events,
            anomalies: 0,
        };
        let commit = BatchCommit {
            events: Vec::new(),
            summaries: vec![summary(5, 0), summary(6, 1), summary(300, 0)],
            spent: Vec::new(),
            covered: RangeSet::new(),
            skipped: Vec::new(),
            checkpoint: checkpoint(300),
        };
        ledger.commit_batch(&commit).expect("commit");
        let all = ledger.stake_blocks_without_events(None).expect("all");
        assert_eq!(all.iter().map(|s| s.height).collect::<Vec<_>>(), vec![5, 300]);
        let low = ledger
            .stake_blocks_without_events(HeightRange::new(1, 100))
            .expect("low");
        assert_eq!(low.len(), 1);
    }

    #[test]
    fn schema_version_mismatch_is_fatal() {
        let store = MemoryStore::new();
        store.put(Column::Meta, SCHEMA_KEY, &7u32.to_le_bytes()).expect("put");
        assert!(matches!(
            Ledger::open(store),
            Err(IndexError::ConfigurationFatal(_))
        ));
    }
}
