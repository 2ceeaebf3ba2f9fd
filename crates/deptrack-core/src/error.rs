//! Error types and the entry-point guard
//!
//! Instrumentation must never be the cause of a failure in the host
//! application. Every public tracker entry point runs through [`guard`],
//! which logs and swallows both returned errors and panics.

use std::any::Any;
use std::panic;
use thiserror::Error;
use tracing::warn;

/// Errors raised inside tracker logic
#[derive(Error, Debug)]
pub enum DependencyError {
    #[error("Invalid call metadata: {0}")]
    InvalidInput(String),

    #[error("Invalid header value: {0}")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),

    #[error("Invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type DependencyResult<T> = Result<T, DependencyError>;

/// Run a tracker entry point and contain whatever goes wrong inside it.
///
/// Returns `None` when the closure returned an error or panicked. Both cases
/// are logged with the method name and the key label.
pub fn guard<T>(method: &str, key: u64, f: impl FnOnce() -> DependencyResult<T>) -> Option<T> {
    match panic::catch_unwind(panic::AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!("{} failed for key {:#x}: {}", method, key, e);
            None
        }
        Err(payload) => {
            warn!(
                "{} panicked for key {:#x}: {}",
                method,
                key,
                panic_message(payload.as_ref())
            );
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
