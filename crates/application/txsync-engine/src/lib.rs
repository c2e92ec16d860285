pub mod engine;
pub mod notify;
mod receipts;
pub mod remote;
pub mod report;

use txsync_persistence::StorageError;

pub use engine::{EngineOptions, SyncEngine};
pub use notify::{Message, MessageAggregator, MessageSink, Severity};
pub use remote::{ChainExplorer, EtherscanExplorer, RemoteBatch, RemoteError};
pub use report::{CategoryReport, SyncFailure, SyncReport};

/// Failure of an engine entry point.
///
/// Remote failures during range syncs are reported, not returned; `Remote` only surfaces from
/// calls that ask for one specific record.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("local store failure: {0}")]
    Store(#[from] StorageError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}
