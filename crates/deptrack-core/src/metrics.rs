//! Tracking metrics for the dependency collector
//!
//! Lock-free counters describing how begin/end notifications were paired,
//! how the correlation stores behaved and how the correlation-id resolver
//! performed. Exported in Prometheus text format or as JSON.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Shared counters for one tracking pipeline
#[derive(Debug)]
pub struct TrackingMetrics {
    /// When the collector was started
    start_time: Instant,
    /// HTTP tracker counters
    pub http: ProtocolMetrics,
    /// SQL tracker counters
    pub sql: ProtocolMetrics,
    /// Correlation store counters
    pub store: StoreMetrics,
    /// Correlation-id resolver counters
    pub resolver: ResolverMetrics,
}

impl Default for TrackingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-protocol pairing counters
#[derive(Debug, Default)]
pub struct ProtocolMetrics {
    /// Begins that inserted a new record
    pub begins: AtomicU64,
    /// Begins that found the key already open
    pub duplicate_begins: AtomicU64,
    /// Begins skipped (self-traffic, invalid input)
    pub skipped: AtomicU64,
    /// Ends that completed a record
    pub ends: AtomicU64,
    /// Ends with no matching begin
    pub unmatched_ends: AtomicU64,
    /// Ends that found a user-created record and left it alone
    pub user_owned: AtomicU64,
    /// Ends that closed bookkeeping without emitting telemetry
    pub silent_ends: AtomicU64,
    /// Telemetry records handed to the sink
    pub emitted: AtomicU64,
    /// Entry points that failed internally (error or panic)
    pub failures: AtomicU64,
}

/// Correlation store counters
#[derive(Debug, Default)]
pub struct StoreMetrics {
    /// Entries evicted by the capacity bound
    pub evicted: AtomicU64,
    /// Entries dropped because their call object died
    pub swept: AtomicU64,
}

/// Correlation-id resolver counters
#[derive(Debug, Default)]
pub struct ResolverMetrics {
    /// Positive cache hits
    pub hits: AtomicU64,
    /// Negative cache hits
    pub negative_hits: AtomicU64,
    /// Cache misses
    pub misses: AtomicU64,
    /// Lookups issued to the provider
    pub lookups: AtomicU64,
    /// Lookups that failed
    pub failures: AtomicU64,
    /// Misses that joined an outstanding lookup
    pub coalesced: AtomicU64,
}

/// Increment a counter
pub fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl TrackingMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            http: ProtocolMetrics::default(),
            sql: ProtocolMetrics::default(),
            store: StoreMetrics::default(),
            resolver: ResolverMetrics::default(),
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Export metrics in Prometheus format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP deptrack_uptime_seconds Time since the collector started\n");
        output.push_str("# TYPE deptrack_uptime_seconds gauge\n");
        output.push_str(&format!(
            "deptrack_uptime_seconds {}\n\n",
            self.uptime_seconds()
        ));

        let (http, sql) = (&self.http, &self.sql);
        let protocol_counters = [
            ("begins_total", "Begins that opened a record", &http.begins, &sql.begins),
            (
                "duplicate_begins_total",
                "Begins for an already open key",
                &http.duplicate_begins,
                &sql.duplicate_begins,
            ),
            ("skipped_total", "Begins skipped", &http.skipped, &sql.skipped),
            ("ends_total", "Ends that completed a record", &http.ends, &sql.ends),
            (
                "unmatched_ends_total",
                "Ends with no matching begin",
                &http.unmatched_ends,
                &sql.unmatched_ends,
            ),
            (
                "user_owned_total",
                "Ends that found a user-created record",
                &http.user_owned,
                &sql.user_owned,
            ),
            (
                "silent_ends_total",
                "Ends closed without telemetry",
                &http.silent_ends,
                &sql.silent_ends,
            ),
            ("emitted_total", "Telemetry records emitted", &http.emitted, &sql.emitted),
            (
                "failures_total",
                "Entry points that failed internally",
                &http.failures,
                &sql.failures,
            ),
        ];

        for (name, help, http_counter, sql_counter) in protocol_counters {
            output.push_str(&format!("# HELP deptrack_{} {}\n", name, help));
            output.push_str(&format!("# TYPE deptrack_{} counter\n", name));
            output.push_str(&format!(
                "deptrack_{}{{protocol=\"http\"}} {}\n",
                name,
                http_counter.load(Ordering::Relaxed)
            ));
            output.push_str(&format!(
                "deptrack_{}{{protocol=\"sql\"}} {}\n\n",
                name,
                sql_counter.load(Ordering::Relaxed)
            ));
        }

        output.push_str("# HELP deptrack_store_evicted_total Entries evicted by capacity\n");
        output.push_str("# TYPE deptrack_store_evicted_total counter\n");
        output.push_str(&format!(
            "deptrack_store_evicted_total {}\n\n",
            self.store.evicted.load(Ordering::Relaxed)
        ));

        output.push_str("# HELP deptrack_store_swept_total Entries dropped with their call\n");
        output.push_str("# TYPE deptrack_store_swept_total counter\n");
        output.push_str(&format!(
            "deptrack_store_swept_total {}\n\n",
            self.store.swept.load(Ordering::Relaxed)
        ));

        output.push_str("# HELP deptrack_resolver_cache_total Resolver cache outcomes\n");
        output.push_str("# TYPE deptrack_resolver_cache_total counter\n");
        output.push_str(&format!(
            "deptrack_resolver_cache_total{{result=\"hit\"}} {}\n",
            self.resolver.hits.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "deptrack_resolver_cache_total{{result=\"negative_hit\"}} {}\n",
            self.resolver.negative_hits.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "deptrack_resolver_cache_total{{result=\"miss\"}} {}\n\n",
            self.resolver.misses.load(Ordering::Relaxed)
        ));

        output.push_str("# HELP deptrack_resolver_lookups_total Lookups issued\n");
        output.push_str("# TYPE deptrack_resolver_lookups_total counter\n");
        output.push_str(&format!(
            "deptrack_resolver_lookups_total {}\n",
            self.resolver.lookups.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "deptrack_resolver_lookup_failures_total {}\n",
            self.resolver.failures.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "deptrack_resolver_coalesced_total {}\n",
            self.resolver.coalesced.load(Ordering::Relaxed)
        ));

        output
    }

    /// Export metrics as JSON
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "uptime_seconds": self.uptime_seconds(),
            "http": self.http.to_json(),
            "sql": self.sql.to_json(),
            "store": {
                "evicted": self.store.evicted.load(Ordering::Relaxed),
                "swept": self.store.swept.load(Ordering::Relaxed),
            },
            "resolver": {
                "hits": self.resolver.hits.load(Ordering::Relaxed),
                "negative_hits": self.resolver.negative_hits.load(Ordering::Relaxed),
                "misses": self.resolver.misses.load(Ordering::Relaxed),
                "lookups": self.resolver.lookups.load(Ordering::Relaxed),
                "failures": self.resolver.failures.load(Ordering::Relaxed),
                "coalesced": self.resolver.coalesced.load(Ordering::Relaxed),
            },
        })
    }
}

impl ProtocolMetrics {
    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "begins": self.begins.load(Ordering::Relaxed),
            "duplicate_begins": self.duplicate_begins.load(Ordering::Relaxed),
            "skipped": self.skipped.load(Ordering::Relaxed),
            "ends": self.ends.load(Ordering::Relaxed),
            "unmatched_ends": self.unmatched_ends.load(Ordering::Relaxed),
            "user_owned": self.user_owned.load(Ordering::Relaxed),
            "silent_ends": self.silent_ends.load(Ordering::Relaxed),
            "emitted": self.emitted.load(Ordering::Relaxed),
            "failures": self.failures.load(Ordering::Relaxed),
        })
    }

    /// Records currently open according to the counters
    pub fn open(&self) -> u64 {
        let opened = self.begins.load(Ordering::Relaxed);
        let closed =
            self.ends.load(Ordering::Relaxed) + self.silent_ends.load(Ordering::Relaxed);
        opened.saturating_sub(closed)
    }
}
