//! Feeds recorded call events through the trackers

use deptrack_core::replay::CallEvent;
use deptrack_core::{FailureInfo, ResponseInfo, TraceContext};
use deptrack_correlate::{
    synthetic_key, CorrelationStore, HttpOutcome, HttpRequest, HttpTracker, Protocol, SqlCall,
    SqlTracker,
};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, trace};

/// Stand-in for the call object of a replayed event
#[derive(Debug)]
pub struct ReplayCall {
    pub call_id: u64,
}

/// Turns recorded call ids into store keys
pub trait KeyMapper {
    type Key;

    fn begin_key(&mut self, protocol: Protocol, call_id: u64) -> Self::Key;

    /// Key for an end notification; the call is released afterwards
    fn end_key(&mut self, protocol: Protocol, call_id: u64) -> Self::Key;
}

/// Synthetic keys for the capacity-bound store
#[derive(Debug, Default)]
pub struct SyntheticKeys;

impl KeyMapper for SyntheticKeys {
    type Key = u64;

    fn begin_key(&mut self, protocol: Protocol, call_id: u64) -> u64 {
        synthetic_key(&call_id, protocol)
    }

    fn end_key(&mut self, protocol: Protocol, call_id: u64) -> u64 {
        synthetic_key(&call_id, protocol)
    }
}

/// Live call objects for the identity-bound store.
///
/// A call object exists from its first begin until its end, like a request
/// object in an instrumented application.
#[derive(Debug, Default)]
pub struct IdentityKeys {
    live: HashMap<(Protocol, u64), Arc<ReplayCall>>,
}

impl KeyMapper for IdentityKeys {
    type Key = Arc<ReplayCall>;

    fn begin_key(&mut self, protocol: Protocol, call_id: u64) -> Arc<ReplayCall> {
        self.live
            .entry((protocol, call_id))
            .or_insert_with(|| {
                let call = Arc::new(ReplayCall { call_id });
                trace!("New {} call object for call {}", protocol.as_str(), call.call_id);
                call
            })
            .clone()
    }

    fn end_key(&mut self, protocol: Protocol, call_id: u64) -> Arc<ReplayCall> {
        // An end for a call never begun gets an object the store has not seen
        self.live
            .remove(&(protocol, call_id))
            .unwrap_or_else(|| Arc::new(ReplayCall { call_id }))
    }
}

/// Dispatches events to the HTTP and SQL trackers
pub struct ReplayDriver<S: CorrelationStore, M> {
    http: HttpTracker<S>,
    sql: SqlTracker<S>,
    keys: M,
    dispatched: u64,
}

impl<S, M> ReplayDriver<S, M>
where
    S: CorrelationStore,
    M: KeyMapper<Key = S::Key>,
{
    pub fn new(http: HttpTracker<S>, sql: SqlTracker<S>, keys: M) -> Self {
        Self {
            http,
            sql,
            keys,
            dispatched: 0,
        }
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    /// Open records across both trackers
    pub fn open_records(&self) -> usize {
        self.http.store().len() + self.sql.store().len()
    }

    pub fn dispatch(&mut self, event: CallEvent) {
        self.dispatched += 1;
        match event {
            CallEvent::HttpBegin {
                call_id,
                url,
                method,
                headers,
                traceparent,
                baggage,
                ..
            } => {
                let key = self.keys.begin_key(Protocol::Http, call_id);
                let method = Method::from_bytes(method.as_bytes()).unwrap_or(Method::GET);
                let mut request = HttpRequest::new(method, url);
                request.headers = header_map(&headers);
                request.parent = traceparent.as_deref().and_then(TraceContext::from_traceparent);
                request.baggage = baggage;
                self.http.on_begin(&key, &mut request);
            }
            CallEvent::HttpEnd {
                call_id,
                status,
                headers,
                failure,
                ..
            } => {
                let key = self.keys.end_key(Protocol::Http, call_id);
                let outcome = match (failure, status) {
                    (Some(failure), _) => HttpOutcome::Failure(failure),
                    (None, Some(status)) => HttpOutcome::Response(ResponseInfo {
                        status,
                        headers: header_map(&headers),
                    }),
                    (None, None) => HttpOutcome::Failure(FailureInfo::new(
                        "Unknown",
                        "end without status or failure",
                    )),
                };
                self.http.on_end(&key, &outcome);
            }
            CallEvent::SqlBegin {
                call_id,
                data_source,
                database,
                command_text,
                stored_procedure,
                operation,
                ..
            } => {
                let key = self.keys.begin_key(Protocol::Sql, call_id);
                let text = command_text.unwrap_or_default();
                let call = match operation {
                    Some(verb) => SqlCall::connection(&data_source, &database, &verb),
                    None if stored_procedure => {
                        SqlCall::stored_procedure(&data_source, &database, &text)
                    }
                    None => SqlCall::command(&data_source, &database, &text),
                };
                self.sql.on_begin(&key, &call);
            }
            CallEvent::SqlEnd {
                call_id,
                failure,
                silent,
                ..
            } => {
                let key = self.keys.end_key(Protocol::Sql, call_id);
                if silent {
                    self.sql.on_end_silent(&key);
                } else {
                    self.sql.on_end(&key, failure.as_ref());
                }
            }
        }
    }
}

fn header_map(headers: &BTreeMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            _ => debug!("Dropping invalid recorded header {:?}", name),
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use deptrack_core::{BroadcastSink, DependencyKind, DependencyTelemetry, TelemetrySink};
    use deptrack_correlate::{
        CapacityBoundStore, HttpTrackerConfig, IdentityBoundStore, SqlTrackerConfig,
    };
    use std::sync::atomic::Ordering;
    use tokio::sync::broadcast;

    fn events() -> Vec<CallEvent> {
        let lines = [
            r#"{"event":"http_begin","call_id":1,"url":"http://svc/a","headers":{"x-app":"1"}}"#,
            r#"{"event":"sql_begin","call_id":2,"data_source":"db1","database":"orders","command_text":"EXEC sp_x","stored_procedure":true}"#,
            r#"{"event":"sql_begin","call_id":2,"data_source":"db1","database":"orders","command_text":"EXEC sp_x","stored_procedure":true}"#,
            r#"{"event":"sql_end","call_id":2}"#,
            r#"{"event":"http_end","call_id":1,"status":404}"#,
            r#"{"event":"http_end","call_id":99,"status":200}"#,
            r#"{"event":"sql_begin","call_id":3,"data_source":"db1","database":"orders","operation":"Open"}"#,
            r#"{"event":"sql_end","call_id":3,"silent":true}"#,
        ];
        lines
            .iter()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn collect(
        sink: &BroadcastSink,
        rx: &mut broadcast::Receiver<Arc<DependencyTelemetry>>,
    ) -> Vec<Arc<DependencyTelemetry>> {
        let mut out = Vec::new();
        while let Ok(telemetry) = rx.try_recv() {
            out.push(telemetry);
        }
        assert_eq!(out.len() as u64, sink.sent());
        out
    }

    #[test]
    fn test_capacity_replay() {
        let sink = Arc::new(BroadcastSink::new(64));
        let mut rx = sink.subscribe();
        let shared: Arc<dyn TelemetrySink> = sink.clone();
        let mut driver = ReplayDriver::new(
            HttpTracker::new(
                Arc::new(CapacityBoundStore::new(128)),
                shared.clone(),
                HttpTrackerConfig::default(),
            ),
            SqlTracker::new(
                Arc::new(CapacityBoundStore::new(128)),
                shared,
                SqlTrackerConfig::default(),
            ),
            SyntheticKeys,
        );

        for event in events() {
            driver.dispatch(event);
        }

        let records = collect(&sink, &mut rx);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, DependencyKind::Sql);
        assert_eq!(records[0].name, "db1 | orders | EXEC sp_x");
        assert!(records[0].success);
        assert_eq!(records[1].name, "GET /a");
        assert_eq!(records[1].result_code, "404");
        assert!(!records[1].success);
        assert_eq!(driver.open_records(), 0);
        assert_eq!(driver.dispatched(), 8);
    }

    #[test]
    fn test_identity_replay() {
        let sink = Arc::new(BroadcastSink::new(64));
        let mut rx = sink.subscribe();
        let shared: Arc<dyn TelemetrySink> = sink.clone();
        let mut driver = ReplayDriver::new(
            HttpTracker::new(
                Arc::new(IdentityBoundStore::<ReplayCall>::new(16)),
                shared.clone(),
                HttpTrackerConfig::default(),
            ),
            SqlTracker::new(
                Arc::new(IdentityBoundStore::<ReplayCall>::new(16)),
                shared,
                SqlTrackerConfig::default(),
            ),
            IdentityKeys::default(),
        );

        for event in events() {
            driver.dispatch(event);
        }

        assert_eq!(collect(&sink, &mut rx).len(), 2);
        assert_eq!(driver.open_records(), 0);
        assert!(driver.keys.live.is_empty());
        assert_eq!(
            driver
                .http
                .metrics()
                .http
                .unmatched_ends
                .load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_header_map_skips_invalid() {
        let mut headers = BTreeMap::new();
        headers.insert("x-ok".to_string(), "1".to_string());
        headers.insert("bad name".to_string(), "2".to_string());
        let map = header_map(&headers);
        assert_eq!(map.len(), 1);
        assert_eq!(map["x-ok"], "1");
    }
}
