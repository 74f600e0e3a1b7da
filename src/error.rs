use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BenchError {
    /// Rejected before any worker starts.
    #[error("{0}")]
    Configuration(String),

    #[error("failed to connect to broker at {address}: {reason}")]
    Connection { address: String, reason: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    /// Receive deadline elapsed. Subscribers treat this as end-of-run.
    #[error("receive timed out after {0:?}")]
    Timeout(Duration),

    #[error("broker connection closed")]
    Disconnected,

    #[error("broker transport error: {0}")]
    Transport(#[from] redis::RedisError),

    #[error("worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("failed to create latency histogram: {0}")]
    Histogram(#[from] hdrhistogram::CreationError),
}

pub type Result<T> = std::result::Result<T, BenchError>;
