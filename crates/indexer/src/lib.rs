//! Stake-event indexing pipeline.
//!
//! Blocks flow from a [`ChainSource`] through the classifier and attribution
//! resolver into the [`Ledger`], driven by [`run_scan`] and supervised by the
//! [`JobManager`].

pub mod attribution;
pub mod classify;
pub mod error;
pub mod gaps;
pub mod jobs;
pub mod ledger;
pub mod metrics;
pub mod reconcile;
pub mod rpc;
pub mod scan;

pub use attribution::{Attribution, AttributionConfig, PrevOutputs, TraceResult};
pub use classify::{AddressFilter, Extraction, InlineOrigins, RewardOutput, SpentOrigins, Strategy};
pub use error::{IndexError, JobError, RpcError};
pub use gaps::{covered_heights, find_gaps};
pub use jobs::{GapReport, JobControl, JobManager, JobSettings, JobStatus};
pub use ledger::{BatchCommit, CommitStats, Ledger, UpsertOutcome};
pub use metrics::{BatchTally, ProgressSnapshot, RpcMetrics, RpcMetricsSnapshot, ScanProgress};
pub use reconcile::{reconcile, snapshot_address, ReconcileStats, SnapshotStats};
pub use rpc::{AddressUtxo, ChainSource, RpcClient, RpcConfig};
pub use scan::{process_height, run_scan, ProcessedHeight, ScanConfig, ScanOutcome, ScanRequest};
