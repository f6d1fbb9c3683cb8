//! Fjall-backed store: one partition per [`Column`], batches committed atomically.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fjall::{Batch, Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use crate::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch, WriteOp};

#[derive(Clone, Debug)]
pub struct FjallOptions {
    pub cache_bytes: Option<u64>,
    pub write_buffer_bytes: Option<u64>,
    pub journal_bytes: Option<u64>,
    pub memtable_bytes: Option<u32>,
    pub fsync_ms: Option<u16>,
    /// Fsync every batch commit. Checkpoint rows ride in the same batch as the
    /// events they cover, so turning this off trades crash-resume safety for speed.
    pub sync_commits: bool,
}

impl Default for FjallOptions {
    fn default() -> Self {
        Self {
            cache_bytes: None,
            write_buffer_bytes: None,
            journal_bytes: None,
            memtable_bytes: None,
            fsync_ms: None,
            sync_commits: true,
        }
    }
}

/// Storage-engine gauges surfaced on the admin API.
#[derive(Clone, Debug, Default)]
pub struct FjallTelemetrySnapshot {
    pub write_buffer_bytes: u64,
    pub journal_count: u64,
    pub journal_disk_space_bytes: u64,
    pub active_compactions: u64,
    pub stake_event_segments: u64,
    pub utxo_segments: u64,
}

/// Rate-limits the slow-commit warning so a stalled disk does not flood the log.
struct SlowCommitLog {
    threshold: Duration,
    interval_secs: u64,
    last_logged_secs: AtomicU64,
}

impl SlowCommitLog {
    const fn new() -> Self {
        Self {
            threshold: Duration::from_millis(500),
            interval_secs: 30,
            last_logged_secs: AtomicU64::new(0),
        }
    }

    fn should_log(&self, elapsed: Duration) -> bool {
        if elapsed < self.threshold {
            return false;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let last = self.last_logged_secs.load(Ordering::Relaxed);
        now.saturating_sub(last) >= self.interval_secs
            && self
                .last_logged_secs
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
    }
}

pub struct FjallStore {
    keyspace: Keyspace,
    partitions: Vec<PartitionHandle>,
    durability: PersistMode,
    slow_commits: SlowCommitLog,
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_options(path, FjallOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: FjallOptions,
    ) -> Result<Self, StoreError> {
        let mut config = Config::new(path);
        if let Some(bytes) = options.cache_bytes {
            config = config.cache_size(bytes);
        }
        if let Some(bytes) = options.write_buffer_bytes {
            config = config.max_write_buffer_size(bytes);
        }
        if let Some(bytes) = options.journal_bytes {
            config = config.max_journaling_size(bytes);
        }
        if let Some(ms) = options.fsync_ms {
            config = config.fsync_ms(Some(ms));
        }
        let keyspace = config.open().map_err(backend)?;

        let mut create = PartitionCreateOptions::default();
        if let Some(bytes) = options.memtable_bytes {
            create = create.max_memtable_size(bytes);
        }
        let partitions = Column::ALL
            .iter()
            .map(|column| keyspace.open_partition(column.as_str(), create.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?;

        Ok(Self {
            keyspace,
            partitions,
            durability: if options.sync_commits {
                PersistMode::SyncData
            } else {
                PersistMode::Buffer
            },
            slow_commits: SlowCommitLog::new(),
        })
    }

    fn partition(&self, column: Column) -> &PartitionHandle {
        // `partitions` is built from `Column::ALL`, whose order matches `index()`.
        &self.partitions[column.index()]
    }

    pub fn telemetry_snapshot(&self) -> FjallTelemetrySnapshot {
        let segments = |column: Column| self.partition(column).segment_count() as u64;
        FjallTelemetrySnapshot {
            write_buffer_bytes: self.keyspace.write_buffer_size(),
            journal_count: self.keyspace.journal_count() as u64,
            journal_disk_space_bytes: self.keyspace.journal_disk_space(),
            active_compactions: self.keyspace.active_compactions() as u64,
            stake_event_segments: segments(Column::StakeEvent),
            utxo_segments: segments(Column::Utxo),
        }
    }
}

impl KeyValueStore for FjallStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.partition(column)
            .get(key)
            .map(|value| value.map(|bytes| bytes.to_vec()))
            .map_err(backend)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.partition(column).insert(key, value).map_err(backend)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.partition(column).remove(key).map_err(backend)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let mut rows = Vec::new();
        self.for_each_prefix(column, prefix, &mut |key, value| {
            rows.push((key.to_vec(), value.to_vec()));
            Ok(true)
        })?;
        Ok(rows)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        for entry in self.partition(column).prefix(prefix) {
            let (key, value) = entry.map_err(backend)?;
            if !visitor(key.as_ref(), value.as_ref())? {
                break;
            }
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut pending = Batch::with_capacity(self.keyspace.clone(), batch.len())
            .durability(Some(self.durability));
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    pending.insert(self.partition(*column), key.as_slice(), value.as_slice());
                }
                WriteOp::Delete { column, key } => {
                    pending.remove(self.partition(*column), key.as_slice());
                }
            }
        }

        let started = Instant::now();
        pending.commit().map_err(backend)?;
        let elapsed = started.elapsed();
        if self.slow_commits.should_log(elapsed) {
            stakeidx_log::log_warn!(
                "ledger commit of {} ops took {}ms (write buffer {}B, {} journals)",
                batch.len(),
                elapsed.as_millis(),
                self.keyspace.write_buffer_size(),
                self.keyspace.journal_count(),
            );
        }
        Ok(())
    }
}

fn backend(err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(err.to_string())
}
