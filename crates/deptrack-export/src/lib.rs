//! Telemetry sinks for deptrack

#[cfg(feature = "jsonl")]
pub mod jsonl;

#[cfg(feature = "jsonl")]
pub use jsonl::{JsonlSink, JsonlSinkConfig};

use thiserror::Error;

/// Errors raised while setting up or writing a sink
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type SinkResult<T> = Result<T, SinkError>;
