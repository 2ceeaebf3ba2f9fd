//! deptrack core - Operation records, telemetry, sinks and propagation
//!
//! This crate provides the foundational types shared by the dependency
//! trackers:
//!
//! - **Records**: in-flight operation state and call outcomes
//! - **Telemetry**: the sealed dependency record handed to sinks
//! - **Sinks**: where finished telemetry goes
//! - **Propagation**: distributed-trace header injection and parsing
//! - **Config / Metrics**: agent configuration and tracking counters

pub mod config;
pub mod error;
pub mod metrics;
pub mod propagation;
pub mod record;
pub mod replay;
pub mod sink;
pub mod telemetry;

// Re-export commonly used types
pub use error::{guard, DependencyError, DependencyResult};
pub use metrics::TrackingMetrics;
pub use propagation::TraceContext;
pub use record::{
    DependencyKind, FailureInfo, OperationHandle, OperationRecord, ResponseInfo,
};
pub use sink::{BroadcastSink, NullSink, TelemetrySink};
pub use telemetry::DependencyTelemetry;

/// Agent version
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
