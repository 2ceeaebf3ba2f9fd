//! Telemetry assembly
//!
//! Seals a completed operation record into [`DependencyTelemetry`] and hands
//! it to the sink.

use deptrack_core::metrics::{self, ProtocolMetrics};
use deptrack_core::{DependencyTelemetry, OperationRecord, TelemetrySink};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Build the telemetry for a completed record.
///
/// Record properties come first; baggage captured at begin only fills keys
/// that are still free. Terminal fields that were never set read as an
/// unsuccessful zero-length call.
pub fn build_telemetry(record: &OperationRecord) -> DependencyTelemetry {
    let mut properties = record.properties.clone();
    for (key, value) in &record.baggage {
        properties
            .entry(key.clone())
            .or_insert_with(|| value.clone());
    }

    DependencyTelemetry {
        id: record.id.clone(),
        trace_id: record.trace_id.clone(),
        parent_id: record.parent_id.clone(),
        name: record.name.clone(),
        target: record.target.clone(),
        kind: record.kind.clone(),
        data: record.data.clone(),
        timestamp: record.timestamp,
        duration: record.duration.unwrap_or(Duration::ZERO),
        success: record.success.unwrap_or(false),
        result_code: record.result_code.clone().unwrap_or_default(),
        properties,
    }
}

/// Forwards sealed telemetry to a sink
#[derive(Clone)]
pub struct TelemetryAssembler {
    sink: Arc<dyn TelemetrySink>,
}

impl TelemetryAssembler {
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &Arc<dyn TelemetrySink> {
        &self.sink
    }

    /// Seal `record` and deliver it
    pub fn finish(&self, record: &OperationRecord, counters: &ProtocolMetrics) {
        let telemetry = Arc::new(build_telemetry(record));
        trace!(
            "Emitting {} dependency {} ({}) to {}",
            telemetry.kind,
            telemetry.name,
            telemetry.result_code,
            self.sink.name()
        );
        self.sink.track(telemetry);
        metrics::incr(&counters.emitted);
    }
}
