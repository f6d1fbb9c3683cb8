//! Coverage audit: which heights of the stake era no scan has vouched for.

use stakeidx_primitives::{HeightRange, RangeSet};
use stakeidx_storage::KeyValueStore;

use crate::error::IndexError;
use crate::ledger::Ledger;

/// Heights some scan has processed, minus the ones it had to skip.
pub fn covered_heights<S: KeyValueStore>(ledger: &Ledger<S>) -> Result<RangeSet, IndexError> {
    let mut covered = ledger.coverage()?;
    let checkpointed = RangeSet::from_ranges(
        ledger
            .checkpoints()?
            .iter()
            .filter_map(|checkpoint| checkpoint.completed_range()),
    );
    covered.union(&checkpointed);
    Ok(covered.subtract(&ledger.skipped_heights()?))
}

/// Missing sub-ranges of `domain`, at most `chunk` heights each, avoiding
/// every range currently owned by a running job.
pub fn find_gaps<S: KeyValueStore>(
    ledger: &Ledger<S>,
    domain: HeightRange,
    in_flight: &[HeightRange],
    chunk: u32,
) -> Result<Vec<HeightRange>, IndexError> {
    let missing = covered_heights(ledger)?
        .missing_within(domain)
        .subtract(&RangeSet::from_ranges(in_flight.iter().copied()));
    Ok(missing
        .ranges()
        .iter()
        .flat_map(|range| range.chunks(chunk.max(1)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stakeidx_primitives::{ScanCheckpoint, ScanState, ScanTarget};
    use stakeidx_storage::memory::MemoryStore;

    use crate::ledger::BatchCommit;

    fn range(start: u32, end: u32) -> HeightRange {
        HeightRange::new(start, end).expect("range")
    }

    fn ledger() -> Ledger<MemoryStore> {
        Ledger::open(MemoryStore::new()).expect("ledger")
    }

    #[test]
    fn empty_ledger_is_one_big_gap() {
        let gaps = find_gaps(&ledger(), range(100, 349), &[], 100).expect("gaps");
        assert_eq!(gaps, vec![range(100, 199), range(200, 299), range(300, 349)]);
    }

    #[test]
    fn checkpoints_and_skips_shape_the_gaps() {
        let ledger = ledger();
        let mut checkpoint = ScanCheckpoint::new("fwd", 100, ScanTarget::Tip, 0);
        checkpoint.last_completed_height = Some(199);
        checkpoint.state = ScanState::Cancelled;
        ledger
            .commit_batch(&BatchCommit {
                events: Vec::new(),
                summaries: Vec::new(),
                spent: Vec::new(),
                covered: RangeSet::from_ranges([range(100, 149), range(151, 199)]),
                skipped: vec![150],
                checkpoint,
            })
            .expect("commit");

        let gaps = find_gaps(&ledger, range(100, 260), &[], 1000).expect("gaps");
        assert_eq!(gaps, vec![range(150, 150), range(200, 260)]);
    }

    #[test]
    fn in_flight_ranges_are_left_alone() {
        let gaps = find_gaps(&ledger(), range(0, 99), &[range(20, 49)], 1000).expect("gaps");
        assert_eq!(gaps, vec![range(0, 19), range(50, 99)]);
    }
}
