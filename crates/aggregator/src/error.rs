use thiserror::Error;

/// Run-level failures of the aggregator loop. Stopping is not an error.
#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("snapshot sink closed")]
    SnapshotSink,
    #[error("watch-list sink closed")]
    WatchSink,
    #[error("serializing snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("aggregator task failed: {0}")]
    Join(String),
}
