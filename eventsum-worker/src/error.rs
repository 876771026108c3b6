use eventsum_common::rules::RuleError;
use eventsum_common::store::StoreError;
use thiserror::Error;

/// Errors that stop the worker from starting or keep it from running.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("store is unreachable: {0}")]
    StoreUnreachable(#[from] StoreError),
    #[error("rule registration failed: {0}")]
    Rules(#[from] RuleError),
    #[error("the batcher was already started")]
    AlreadyStarted,
    #[error("the batcher is stopped")]
    Stopped,
    #[error("failed to set up metrics: {0}")]
    Metrics(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not decode a failure dump line: {0}")]
    Dump(#[from] serde_json::Error),
}

/// Why a single row could not be persisted. Rows failing with any of these are handed to
/// the failure sink; the rest of the batch carries on.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PersistError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("no {dependency} id was resolved for hash {hash}")]
    MissingDependency {
        dependency: &'static str,
        hash: String,
    },
    #[error("period merge still conflicting after {attempts} attempts")]
    ContentionExhausted { attempts: u32 },
    #[error("could not consolidate accumulators: {0}")]
    Consolidate(#[from] RuleError),
}

/// Errors returned to callers of the query surface.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("range start {start} is after range end {end}")]
    InvertedRange { start: String, end: String },
    #[error("group names must not be empty")]
    EmptyGroupName,
    #[error("a group named {0:?} already exists")]
    GroupExists(String),
    #[error("no group {0}")]
    GroupNotFound(String),
    #[error("the default group cannot be renamed or deleted")]
    DefaultGroup,
}
