//! Begin/end correlation and telemetry assembly
//!
//! Instrumentation sources report outbound calls as separate begin and end
//! notifications. The trackers here pair them through a correlation store,
//! stamp distributed-trace headers on outgoing requests and emit exactly one
//! [`DependencyTelemetry`](deptrack_core::DependencyTelemetry) per call.
//!
//! Data flow:
//!
//! ```text
//! source -> Tracker::on_begin -> Store::try_begin
//!        -> Tracker::on_end   -> Store::complete -> Assembler::finish -> sink
//! ```

pub mod assembler;
pub mod http;
pub mod key;
pub mod profile_client;
pub mod resolver;
pub mod sql;
pub mod store;

pub use assembler::{build_telemetry, TelemetryAssembler};
pub use http::{HttpOutcome, HttpRequest, HttpTracker, HttpTrackerConfig};
pub use key::{address_key, synthetic_key, Protocol};
pub use profile_client::ProfileApiClient;
pub use resolver::{ApplicationIdProvider, CorrelationIdResolver, ResolverError};
pub use sql::{SqlCall, SqlError, SqlOperation, SqlOutcome, SqlTracker, SqlTrackerConfig};
pub use store::{
    CapacityBoundStore, Completion, CorrelationStore, IdentityBoundStore, StoreStrategy,
};
