//! SQL dependency tracking
//!
//! Commands are keyed by the command object; connection and transaction
//! operations by the connection. The end of an async command may arrive as
//! a continuation on the runtime, see [`SqlTracker::end_when`] and
//! [`SqlTracker::instrument`].

use crate::assembler::TelemetryAssembler;
use crate::store::{Completion, CorrelationStore};
use deptrack_core::config::SqlSettings;
use deptrack_core::metrics::{self, TrackingMetrics};
use deptrack_core::{
    guard, DependencyKind, DependencyResult, FailureInfo, OperationHandle, OperationRecord,
    TelemetrySink, TraceContext,
};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// What is being executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlOperation {
    /// A command with its text
    Command {
        text: String,
        stored_procedure: bool,
    },
    /// A connection or transaction verb such as `Open` or `Commit`
    Connection(String),
}

/// Begin notification payload for a database call
#[derive(Debug, Clone)]
pub struct SqlCall {
    pub data_source: String,
    pub database: String,
    pub operation: SqlOperation,
    pub parent: Option<TraceContext>,
    pub baggage: Vec<(String, String)>,
}

impl SqlCall {
    pub fn command(data_source: &str, database: &str, text: &str) -> Self {
        Self::new(
            data_source,
            database,
            SqlOperation::Command {
                text: text.to_string(),
                stored_procedure: false,
            },
        )
    }

    pub fn stored_procedure(data_source: &str, database: &str, name: &str) -> Self {
        Self::new(
            data_source,
            database,
            SqlOperation::Command {
                text: name.to_string(),
                stored_procedure: true,
            },
        )
    }

    pub fn connection(data_source: &str, database: &str, verb: &str) -> Self {
        Self::new(
            data_source,
            database,
            SqlOperation::Connection(verb.to_string()),
        )
    }

    fn new(data_source: &str, database: &str, operation: SqlOperation) -> Self {
        Self {
            data_source: data_source.to_string(),
            database: database.to_string(),
            operation,
            parent: None,
            baggage: Vec::new(),
        }
    }

    pub fn with_parent(mut self, parent: TraceContext) -> Self {
        self.parent = Some(parent);
        self
    }
}

/// Outcome of an awaited database call, as far as the tracker cares
pub trait SqlOutcome {
    fn failure(&self) -> Option<FailureInfo>;
}

/// Error of a database call.
///
/// Drivers that surface a server error number report it through
/// [`provider_code`](Self::provider_code); it becomes the result code.
pub trait SqlError: fmt::Display {
    fn provider_code(&self) -> Option<i32> {
        None
    }
}

impl SqlError for String {}

impl SqlError for &str {}

impl SqlError for std::io::Error {}

impl<T, E: SqlError> SqlOutcome for Result<T, E> {
    fn failure(&self) -> Option<FailureInfo> {
        self.as_ref().err().map(|e| match e.provider_code() {
            Some(code) => FailureInfo::database(code, e.to_string()),
            None => FailureInfo::new("SqlException", e.to_string()),
        })
    }
}

/// SQL tracker settings
#[derive(Debug, Clone)]
pub struct SqlTrackerConfig {
    /// Report command text in the telemetry data field
    pub capture_command_text: bool,
}

impl Default for SqlTrackerConfig {
    fn default() -> Self {
        Self {
            capture_command_text: true,
        }
    }
}

impl From<&SqlSettings> for SqlTrackerConfig {
    fn from(settings: &SqlSettings) -> Self {
        Self {
            capture_command_text: settings.capture_command_text,
        }
    }
}

/// Tracks database calls over a correlation store
pub struct SqlTracker<S: CorrelationStore> {
    store: Arc<S>,
    assembler: TelemetryAssembler,
    config: SqlTrackerConfig,
    metrics: Arc<TrackingMetrics>,
}

impl<S: CorrelationStore> SqlTracker<S> {
    pub fn new(store: Arc<S>, sink: Arc<dyn TelemetrySink>, config: SqlTrackerConfig) -> Self {
        Self {
            store,
            assembler: TelemetryAssembler::new(sink),
            config,
            metrics: Arc::new(TrackingMetrics::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<TrackingMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<TrackingMetrics> {
        &self.metrics
    }

    /// Begin notification. Returns `true` when a new record was opened.
    pub fn on_begin(&self, key: &S::Key, call: &SqlCall) -> bool {
        self.guarded("SqlTracker::on_begin", key, || {
            let (_, inserted) = self.store.try_begin(key, || self.new_record(call));
            if inserted {
                metrics::incr(&self.metrics.sql.begins);
            } else {
                metrics::incr(&self.metrics.sql.duplicate_begins);
                debug!("Duplicate begin for open command on {}", call.data_source);
            }
            Ok(inserted)
        })
        .unwrap_or(false)
    }

    /// End notification. `failure` is `None` for a successful call. Returns
    /// `true` when telemetry was emitted.
    pub fn on_end(&self, key: &S::Key, failure: Option<&FailureInfo>) -> bool {
        self.guarded("SqlTracker::on_end", key, || {
            let Some(handle) = self.take(key) else {
                return Ok(false);
            };
            self.finish(&handle, failure);
            Ok(true)
        })
        .unwrap_or(false)
    }

    /// Start an operation owned by application code. Instrumentation ends,
    /// silent or not, leave it open until [`stop_user_operation`].
    ///
    /// [`stop_user_operation`]: Self::stop_user_operation
    pub fn start_user_operation(&self, key: &S::Key, call: &SqlCall) -> bool {
        self.guarded("SqlTracker::start_user_operation", key, || {
            match self.store.complete(key) {
                Completion::UserOwned => {
                    metrics::incr(&self.metrics.sql.duplicate_begins);
                    debug!("User operation already open on {}", call.data_source);
                    return Ok(false);
                }
                Completion::Completed(existing) => {
                    debug!("User operation replaces open record {}", existing.lock().id);
                }
                Completion::NotFound => {}
            }
            let (_, inserted) = self
                .store
                .try_begin(key, || self.new_record(call).user_created());
            if inserted {
                metrics::incr(&self.metrics.sql.begins);
            }
            Ok(inserted)
        })
        .unwrap_or(false)
    }

    /// Finish an operation started with [`start_user_operation`].
    ///
    /// [`start_user_operation`]: Self::start_user_operation
    pub fn stop_user_operation(&self, key: &S::Key, failure: Option<&FailureInfo>) -> bool {
        self.guarded("SqlTracker::stop_user_operation", key, || {
            let Some(handle) = self.store.complete_user_created(key) else {
                debug!("No user operation to stop");
                return Ok(false);
            };
            self.finish(&handle, failure);
            Ok(true)
        })
        .unwrap_or(false)
    }

    /// Close the record without emitting anything
    pub fn on_end_silent(&self, key: &S::Key) -> bool {
        self.guarded("SqlTracker::on_end_silent", key, || {
            let closed = self.take(key).is_some();
            if closed {
                metrics::incr(&self.metrics.sql.silent_ends);
            }
            Ok(closed)
        })
        .unwrap_or(false)
    }

    /// Begin, await `future`, end. The future's output is returned unchanged.
    pub async fn instrument<F>(&self, key: &S::Key, call: &SqlCall, future: F) -> F::Output
    where
        F: Future,
        F::Output: SqlOutcome,
    {
        self.on_begin(key, call);
        let output = future.await;
        let failure = output.failure();
        self.on_end(key, failure.as_ref());
        output
    }

    fn finish(&self, handle: &OperationHandle, failure: Option<&FailureInfo>) {
        let mut record = handle.lock();
        match failure {
            None => record.stop(true, "0"),
            Some(failure) => {
                let code = failure
                    .provider_code
                    .map_or_else(|| "0".to_string(), |code| code.to_string());
                record.stop(false, code);
            }
        }
        metrics::incr(&self.metrics.sql.ends);
        self.assembler.finish(&record, &self.metrics.sql);
    }

    fn take(&self, key: &S::Key) -> Option<OperationHandle> {
        match self.store.complete(key) {
            Completion::Completed(handle) => Some(handle),
            Completion::UserOwned => {
                metrics::incr(&self.metrics.sql.user_owned);
                trace!("Leaving user-created operation open");
                None
            }
            Completion::NotFound => {
                metrics::incr(&self.metrics.sql.unmatched_ends);
                debug!("End without matching begin");
                None
            }
        }
    }

    fn guarded<T>(
        &self,
        method: &str,
        key: &S::Key,
        f: impl FnOnce() -> DependencyResult<T>,
    ) -> Option<T> {
        let result = guard(method, self.store.key_label(key), f);
        if result.is_none() {
            metrics::incr(&self.metrics.sql.failures);
        }
        result
    }

    fn new_record(&self, call: &SqlCall) -> OperationRecord {
        let mut record = OperationRecord::new(DependencyKind::Sql, call.parent.as_ref());
        record.target = format!("{} | {}", call.data_source, call.database);
        match &call.operation {
            SqlOperation::Command {
                text,
                stored_procedure,
            } => {
                record.name = if *stored_procedure {
                    format!("{} | {}", record.target, text)
                } else {
                    record.target.clone()
                };
                if self.config.capture_command_text {
                    record.data = text.clone();
                }
            }
            SqlOperation::Connection(verb) => {
                record.name = format!("{} | {}", record.target, verb);
                record.data = verb.clone();
            }
        }
        record.baggage = call.baggage.clone();
        record
    }
}

impl<S> SqlTracker<S>
where
    S: CorrelationStore + 'static,
    S::Key: Send + 'static,
{
    /// Run the end notification once `future` resolves, as a task on the
    /// ambient runtime. The failure is read from the future's output.
    ///
    /// Returns `None` when there is no runtime; the record is then left to
    /// the store's bound.
    pub fn end_when<F>(self: &Arc<Self>, key: S::Key, future: F) -> Option<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: SqlOutcome + Send + 'static,
    {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                debug!("No runtime for SQL continuation, record left to the store bound");
                return None;
            }
        };

        let tracker = self.clone();
        Some(runtime.spawn(async move {
            let output = future.await;
            let failure = output.failure();
            tracker.on_end(&key, failure.as_ref());
            output
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CapacityBoundStore, IdentityBoundStore};
    use crate::test_support::CollectingSink;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn tracker() -> (SqlTracker<CapacityBoundStore>, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::default());
        let tracker = SqlTracker::new(
            Arc::new(CapacityBoundStore::new(1024)),
            sink.clone(),
            SqlTrackerConfig::default(),
        );
        (tracker, sink)
    }

    #[test]
    fn test_duplicate_begin_single_record() {
        let (tracker, sink) = tracker();
        let call = SqlCall::stored_procedure("db1", "orders", "EXEC sp_x");

        assert!(tracker.on_begin(&2, &call));
        assert!(!tracker.on_begin(&2, &call));
        assert!(tracker.on_end(&2, None));

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
        assert_eq!(records[0].result_code, "0");
        assert_eq!(records[0].kind, DependencyKind::Sql);
        assert_eq!(records[0].target, "db1 | orders");
        assert_eq!(records[0].name, "db1 | orders | EXEC sp_x");
        assert_eq!(records[0].data, "EXEC sp_x");
        assert_eq!(tracker.metrics().sql.duplicate_begins.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_text_command_naming() {
        let (tracker, sink) = tracker();
        tracker.on_begin(&1, &SqlCall::command("db1", "orders", "SELECT 1"));
        tracker.on_end(&1, None);

        let telemetry = &sink.records()[0];
        assert_eq!(telemetry.name, "db1 | orders");
        assert_eq!(telemetry.data, "SELECT 1");
    }

    #[test]
    fn test_command_text_not_captured() {
        let sink = Arc::new(CollectingSink::default());
        let tracker = SqlTracker::new(
            Arc::new(CapacityBoundStore::new(16)),
            sink.clone(),
            SqlTrackerConfig {
                capture_command_text: false,
            },
        );
        tracker.on_begin(&1, &SqlCall::command("db1", "orders", "SELECT secret"));
        tracker.on_end(&1, None);
        assert_eq!(sink.records()[0].data, "");
    }

    #[test]
    fn test_connection_operation() {
        let (tracker, sink) = tracker();
        tracker.on_begin(&5, &SqlCall::connection("db1", "orders", "Commit"));
        tracker.on_end(&5, None);

        let telemetry = &sink.records()[0];
        assert_eq!(telemetry.name, "db1 | orders | Commit");
        assert_eq!(telemetry.data, "Commit");
    }

    #[test]
    fn test_database_failure_code() {
        let (tracker, sink) = tracker();
        tracker.on_begin(&1, &SqlCall::command("db1", "orders", "UPDATE t"));
        tracker.on_end(&1, Some(&FailureInfo::database(1205, "deadlock victim")));
        tracker.on_begin(&2, &SqlCall::command("db1", "orders", "UPDATE t"));
        tracker.on_end(&2, Some(&FailureInfo::new("IOException", "socket closed")));

        let records = sink.records();
        assert!(!records[0].success);
        assert_eq!(records[0].result_code, "1205");
        assert!(!records[1].success);
        assert_eq!(records[1].result_code, "0");
    }

    #[test]
    fn test_silent_end_emits_nothing() {
        let (tracker, sink) = tracker();
        tracker.on_begin(&3, &SqlCall::connection("db1", "orders", "Open"));

        assert!(tracker.on_end_silent(&3));
        assert!(!tracker.on_end(&3, None));
        assert_eq!(sink.len(), 0);
        assert!(tracker.store().is_empty());
        assert_eq!(tracker.metrics().sql.silent_ends.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_end_without_begin() {
        let (tracker, sink) = tracker();
        assert!(!tracker.on_end(&9, None));
        assert!(!tracker.on_end_silent(&9));
        assert_eq!(sink.len(), 0);
        assert_eq!(tracker.metrics().sql.unmatched_ends.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_instrument_returns_output() {
        let (tracker, sink) = tracker();
        let call = SqlCall::command("db1", "orders", "SELECT 1");

        let ok = tracker
            .instrument(&1, &call, async { Ok::<u32, String>(7) })
            .await;
        assert_eq!(ok, Ok(7));
        let err = tracker
            .instrument(&2, &call, async { Err::<u32, String>("syntax error".to_string()) })
            .await;
        assert_eq!(err, Err("syntax error".to_string()));

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert!(records[0].success);
        assert!(!records[1].success);
    }

    #[derive(Debug)]
    struct ServerError {
        number: i32,
    }

    impl fmt::Display for ServerError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "server error {}", self.number)
        }
    }

    impl SqlError for ServerError {
        fn provider_code(&self) -> Option<i32> {
            Some(self.number)
        }
    }

    #[tokio::test]
    async fn test_instrument_keeps_server_error_number() {
        let (tracker, sink) = tracker();
        let call = SqlCall::command("db1", "orders", "UPDATE t");

        let output = tracker
            .instrument(&1, &call, async { Err::<(), _>(ServerError { number: 1205 }) })
            .await;
        assert!(output.is_err());
        tracker
            .instrument(&2, &call, async { Err::<(), _>("timeout") })
            .await
            .unwrap_err();

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert!(!records[0].success);
        assert_eq!(records[0].result_code, "1205");
        assert!(!records[1].success);
        assert_eq!(records[1].result_code, "0");
    }

    #[test]
    fn test_user_operation_survives_instrumentation_ends() {
        let (tracker, sink) = tracker();
        let call = SqlCall::command("db1", "orders", "SELECT 1");

        assert!(tracker.start_user_operation(&6, &call));
        assert!(!tracker.start_user_operation(&6, &call));
        assert!(!tracker.on_begin(&6, &call));
        assert!(!tracker.on_end(&6, None));
        assert!(!tracker.on_end_silent(&6));
        assert_eq!(sink.len(), 0);
        assert_eq!(tracker.store().len(), 1);
        assert_eq!(tracker.metrics().sql.user_owned.load(Ordering::Relaxed), 2);

        assert!(tracker.stop_user_operation(&6, Some(&FailureInfo::database(2627, "dup key"))));
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].result_code, "2627");
        assert!(tracker.store().is_empty());
    }

    #[test]
    fn test_stop_user_operation_leaves_instrumentation_record() {
        let (tracker, sink) = tracker();
        tracker.on_begin(&7, &SqlCall::connection("db1", "orders", "Open"));

        assert!(!tracker.stop_user_operation(&7, None));
        assert_eq!(tracker.store().len(), 1);
        assert!(tracker.on_end(&7, None));
        assert_eq!(sink.records()[0].name, "db1 | orders | Open");
    }

    #[tokio::test]
    async fn test_end_when_runs_as_continuation() {
        struct Command;

        let sink = Arc::new(CollectingSink::default());
        let tracker = Arc::new(SqlTracker::new(
            Arc::new(IdentityBoundStore::<Command>::new(64)),
            sink.clone(),
            SqlTrackerConfig::default(),
        ));
        let command = Arc::new(Command);

        tracker.on_begin(&command, &SqlCall::stored_procedure("db1", "orders", "sp_x"));
        let handle = tracker
            .end_when(command.clone(), async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, String>("rows")
            })
            .unwrap();
        assert_eq!(sink.len(), 0);

        assert_eq!(handle.await.unwrap(), Ok("rows"));
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].duration >= Duration::from_millis(20));
        assert!(tracker.store().is_empty());
    }

    #[test]
    fn test_end_when_without_runtime() {
        let (tracker, _sink) = tracker();
        let tracker = Arc::new(tracker);
        tracker.on_begin(&4, &SqlCall::command("db1", "orders", "SELECT 1"));
        assert!(tracker.end_when(4, async { Ok::<_, String>(()) }).is_none());
        assert_eq!(tracker.store().len(), 1);
    }
}
