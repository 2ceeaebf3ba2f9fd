//! Telemetry sinks
//!
//! A sink receives finished dependency telemetry. Delivery is
//! fire-and-forget from the tracker's point of view: `track` returns nothing
//! and must not panic. Buffering and retries belong to the sink.

use crate::telemetry::DependencyTelemetry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

/// Destination for finished telemetry
pub trait TelemetrySink: Send + Sync {
    /// Sink name, for diagnostics
    fn name(&self) -> &str;

    /// Hand over one finished record
    fn track(&self, telemetry: Arc<DependencyTelemetry>);

    /// Flush anything buffered
    fn flush(&self) {}
}

/// Discards everything
#[derive(Debug, Default)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn name(&self) -> &str {
        "null"
    }

    fn track(&self, _telemetry: Arc<DependencyTelemetry>) {}
}

/// Fans telemetry out to broadcast subscribers.
///
/// Records are dropped silently when nobody is subscribed.
pub struct BroadcastSink {
    tx: broadcast::Sender<Arc<DependencyTelemetry>>,
    sent: AtomicU64,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            sent: AtomicU64::new(0),
        }
    }

    /// Subscribe to tracked telemetry
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DependencyTelemetry>> {
        self.tx.subscribe()
    }

    /// Records handed to at least one subscriber
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

impl TelemetrySink for BroadcastSink {
    fn name(&self) -> &str {
        "broadcast"
    }

    fn track(&self, telemetry: Arc<DependencyTelemetry>) {
        match self.tx.send(telemetry) {
            Ok(_) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => trace!("No subscribers for dependency telemetry"),
        }
    }
}

/// Forwards every record to each of a set of sinks
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, sink: Arc<dyn TelemetrySink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl TelemetrySink for FanoutSink {
    fn name(&self) -> &str {
        "fanout"
    }

    fn track(&self, telemetry: Arc<DependencyTelemetry>) {
        for sink in &self.sinks {
            sink.track(telemetry.clone());
        }
    }

    fn flush(&self) {
        for sink in &self.sinks {
            sink.flush();
        }
    }
}
