use std::fmt;

use stakeidx_primitives::DecodeError;
use stakeidx_storage::StoreError;

/// Node RPC failures, as seen by the client.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RpcError {
    /// Connection refused, reset, or timed out.
    Transport(String),
    /// Non-JSON reply with a non-success status.
    Http { status: i32, body: String },
    Unauthorized(i32),
    Malformed(String),
    /// The node answered with an error object.
    Node { code: i64, message: String },
}

/// Node is still loading its block index.
const RPC_IN_WARMUP: i64 = -28;

impl RpcError {
    pub fn is_transient(&self) -> bool {
        match self {
            RpcError::Transport(_) => true,
            RpcError::Http { status, .. } => *status >= 500 || *status == 429,
            RpcError::Node { code, message } => {
                *code == RPC_IN_WARMUP
                    || message.contains("Work queue depth exceeded")
                    || message.to_ascii_lowercase().contains("loading")
            }
            RpcError::Unauthorized(_) | RpcError::Malformed(_) => false,
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Transport(message) => write!(f, "rpc transport error: {message}"),
            RpcError::Http { status, body } => write!(f, "rpc http {status}: {body}"),
            RpcError::Unauthorized(status) => {
                write!(f, "rpc credentials rejected (http {status})")
            }
            RpcError::Malformed(message) => write!(f, "malformed rpc response: {message}"),
            RpcError::Node { code, message } => write!(f, "node error {code}: {message}"),
        }
    }
}

impl std::error::Error for RpcError {}

#[derive(Debug)]
pub enum IndexError {
    /// Retry with backoff; escalates only once the retry budget is spent.
    TransientIo(String),
    /// Structurally valid data that breaks an expectation. Skip the item.
    DataAnomaly(String),
    /// Lost an idempotent write race. Callers treat this as already done.
    PersistenceConflict(String),
    /// Abort the job and tell the operator.
    ConfigurationFatal(String),
    Store(StoreError),
    Decode(DecodeError),
}

impl IndexError {
    pub fn is_transient(&self) -> bool {
        matches!(self, IndexError::TransientIo(_))
    }

    /// Errors that end the job instead of skipping one height.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IndexError::ConfigurationFatal(_) | IndexError::Store(_) | IndexError::Decode(_)
        )
    }
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexError::TransientIo(message) => write!(f, "transient i/o: {message}"),
            IndexError::DataAnomaly(message) => write!(f, "data anomaly: {message}"),
            IndexError::PersistenceConflict(message) => {
                write!(f, "persistence conflict: {message}")
            }
            IndexError::ConfigurationFatal(message) => write!(f, "fatal: {message}"),
            IndexError::Store(err) => write!(f, "store: {err}"),
            IndexError::Decode(err) => write!(f, "decode: {err}"),
        }
    }
}

impl std::error::Error for IndexError {}

impl From<RpcError> for IndexError {
    fn from(err: RpcError) -> Self {
        if err.is_transient() {
            return IndexError::TransientIo(err.to_string());
        }
        match err {
            RpcError::Unauthorized(_) => IndexError::ConfigurationFatal(err.to_string()),
            RpcError::Http { status, .. } if status == 404 => {
                IndexError::ConfigurationFatal(format!("{err} (wrong rpc url?)"))
            }
            _ => IndexError::DataAnomaly(err.to_string()),
        }
    }
}

impl From<StoreError> for IndexError {
    fn from(err: StoreError) -> Self {
        IndexError::Store(err)
    }
}

impl From<DecodeError> for IndexError {
    fn from(err: DecodeError) -> Self {
        IndexError::Decode(err)
    }
}

/// Job-control failures reported back to operators.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum JobError {
    AlreadyRunning(String),
    UnknownJob(String),
    InvalidRequest(String),
    Failed(String),
    ManagerStopped,
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobError::AlreadyRunning(key) => write!(f, "job {key} is already running"),
            JobError::UnknownJob(key) => write!(f, "no job named {key}"),
            JobError::InvalidRequest(message) => write!(f, "invalid request: {message}"),
            JobError::Failed(message) => write!(f, "{message}"),
            JobError::ManagerStopped => write!(f, "job manager has stopped"),
        }
    }
}

impl std::error::Error for JobError {}
