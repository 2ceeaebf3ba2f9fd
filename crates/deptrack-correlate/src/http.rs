//! HTTP dependency tracking
//!
//! Pairs request begin/end notifications, injects correlation headers into
//! the outgoing request and classifies the response. Calls to the telemetry
//! ingestion endpoint and the profile service are never tracked, otherwise
//! exporting telemetry would itself produce telemetry.

use crate::assembler::TelemetryAssembler;
use crate::resolver::CorrelationIdResolver;
use crate::store::{Completion, CorrelationStore};
use deptrack_core::config::AgentConfig;
use deptrack_core::metrics::{self, TrackingMetrics};
use deptrack_core::propagation::{self, HeaderInjection};
use deptrack_core::{
    guard, DependencyKind, DependencyResult, FailureInfo, OperationRecord, ResponseInfo,
    TelemetrySink, TraceContext,
};
use http::{HeaderMap, Method};
use std::sync::Arc;
use tracing::{debug, trace};
use url::Url;

/// Outgoing request as seen by the begin notification
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub method: Method,
    /// Outgoing headers; correlation headers are added here
    pub headers: HeaderMap,
    /// Ambient operation the call belongs to
    pub parent: Option<TraceContext>,
    pub baggage: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            headers: HeaderMap::new(),
            parent: None,
            baggage: Vec::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_parent(mut self, parent: TraceContext) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_baggage(mut self, key: &str, value: &str) -> Self {
        self.baggage.push((key.to_string(), value.to_string()));
        self
    }
}

/// What the end notification carries
#[derive(Debug, Clone)]
pub enum HttpOutcome {
    Response(ResponseInfo),
    /// The call failed before a response arrived
    Failure(FailureInfo),
}

impl HttpOutcome {
    pub fn status(status: u16) -> Self {
        HttpOutcome::Response(ResponseInfo::new(status))
    }
}

/// HTTP tracker settings
#[derive(Debug, Clone, Default)]
pub struct HttpTrackerConfig {
    /// Instrumentation key of the local application
    pub instrumentation_key: Option<String>,

    /// Hosts whose calls are never tracked (lowercase)
    pub excluded_hosts: Vec<String>,

    pub injection: HeaderInjection,
}

impl HttpTrackerConfig {
    /// Derive tracker settings from the agent configuration. The ingestion
    /// and profile endpoints are always excluded.
    pub fn from_config(config: &AgentConfig) -> Self {
        let mut excluded_hosts: Vec<String> = config
            .http
            .excluded_hosts
            .iter()
            .map(|h| h.to_lowercase())
            .collect();
        for endpoint in [&config.http.ingestion_endpoint, &config.resolver.endpoint] {
            let host = Url::parse(endpoint)
                .ok()
                .and_then(|u| u.host_str().map(str::to_lowercase));
            if let Some(host) = host {
                if !excluded_hosts.contains(&host) {
                    excluded_hosts.push(host);
                }
            }
        }

        Self {
            instrumentation_key: config.agent.instrumentation_key.clone(),
            excluded_hosts,
            injection: config.http.injection,
        }
    }
}

/// Tracks outbound HTTP calls over a correlation store
pub struct HttpTracker<S: CorrelationStore> {
    store: Arc<S>,
    assembler: TelemetryAssembler,
    resolver: Option<Arc<CorrelationIdResolver>>,
    config: HttpTrackerConfig,
    metrics: Arc<TrackingMetrics>,
}

impl<S: CorrelationStore> HttpTracker<S> {
    pub fn new(store: Arc<S>, sink: Arc<dyn TelemetrySink>, config: HttpTrackerConfig) -> Self {
        Self {
            store,
            assembler: TelemetryAssembler::new(sink),
            resolver: None,
            config,
            metrics: Arc::new(TrackingMetrics::new()),
        }
    }

    /// Enable cross-component correlation and `Request-Context` injection
    pub fn with_resolver(mut self, resolver: Arc<CorrelationIdResolver>) -> Self {
        self.resolver = Some(resolver);
        self
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
    pub fn on_begin(&self, key: &S::Key, request: &mut HttpRequest) -> bool {
        self.guarded("HttpTracker::on_begin", key, || {
            self.begin(key, request, false)
        })
        .unwrap_or(false)
    }

    /// End notification. Returns `true` when telemetry was emitted.
    pub fn on_end(&self, key: &S::Key, outcome: &HttpOutcome) -> bool {
        self.guarded("HttpTracker::on_end", key, || self.end(key, outcome))
            .unwrap_or(false)
    }

    /// Start an operation owned by application code. The instrumentation end
    /// path leaves it alone; it is finished by [`stop_user_operation`].
    ///
    /// [`stop_user_operation`]: Self::stop_user_operation
    pub fn start_user_operation(&self, key: &S::Key, request: &mut HttpRequest) -> bool {
        self.guarded("HttpTracker::start_user_operation", key, || {
            self.begin(key, request, true)
        })
        .unwrap_or(false)
    }

    /// Finish an operation started with [`start_user_operation`].
    ///
    /// [`start_user_operation`]: Self::start_user_operation
    pub fn stop_user_operation(&self, key: &S::Key, outcome: &HttpOutcome) -> bool {
        self.guarded("HttpTracker::stop_user_operation", key, || {
            let Some(handle) = self.store.complete_user_created(key) else {
                debug!("No user operation to stop");
                return Ok(false);
            };
            let mut record = handle.lock();
            self.classify(&mut record, outcome);
            metrics::incr(&self.metrics.http.ends);
            self.assembler.finish(&record, &self.metrics.http);
            Ok(true)
        })
        .unwrap_or(false)
    }

    fn guarded<T>(
        &self,
        method: &str,
        key: &S::Key,
        f: impl FnOnce() -> DependencyResult<T>,
    ) -> Option<T> {
        let result = guard(method, self.store.key_label(key), f);
        if result.is_none() {
            metrics::incr(&self.metrics.http.failures);
        }
        result
    }

    fn begin(
        &self,
        key: &S::Key,
        request: &mut HttpRequest,
        user_created: bool,
    ) -> DependencyResult<bool> {
        let url = match parse_target(&request.url) {
            Some(url) => url,
            None => {
                debug!("Skipping request with unusable URL {:?}", request.url);
                metrics::incr(&self.metrics.http.skipped);
                return Ok(false);
            }
        };
        if self.is_excluded(&url) {
            trace!("Skipping self-traffic to {}", url);
            metrics::incr(&self.metrics.http.skipped);
            return Ok(false);
        }

        if user_created {
            // An instrumentation record for the key gives way to the user's
            match self.store.complete(key) {
                Completion::UserOwned => {
                    metrics::incr(&self.metrics.http.duplicate_begins);
                    debug!("User operation already open for request to {}", url);
                    return Ok(false);
                }
                Completion::Completed(existing) => {
                    debug!("User operation replaces open record {}", existing.lock().id);
                }
                Completion::NotFound => {}
            }
        }

        let (handle, inserted) = self.store.try_begin(key, || {
            let record = new_record(&url, request);
            if user_created {
                record.user_created()
            } else {
                record
            }
        });
        if !inserted {
            metrics::incr(&self.metrics.http.duplicate_begins);
            debug!("Duplicate begin for open request to {}", url);
            return Ok(false);
        }
        metrics::incr(&self.metrics.http.begins);

        let ctx = handle.lock().context();
        let local_app_id = self.local_app_id();
        let added = propagation::inject_outgoing(
            &mut request.headers,
            &ctx,
            &request.baggage,
            local_app_id.as_deref(),
            &self.config.injection,
        );
        trace!("Injected {} correlation headers into {}", added, url);
        Ok(true)
    }

    fn end(&self, key: &S::Key, outcome: &HttpOutcome) -> DependencyResult<bool> {
        match self.store.complete(key) {
            Completion::NotFound => {
                metrics::incr(&self.metrics.http.unmatched_ends);
                debug!("End without matching begin");
                Ok(false)
            }
            Completion::UserOwned => {
                metrics::incr(&self.metrics.http.user_owned);
                trace!("Leaving user-created operation open");
                Ok(false)
            }
            Completion::Completed(handle) => {
                let mut record = handle.lock();
                self.classify(&mut record, outcome);
                metrics::incr(&self.metrics.http.ends);
                self.assembler.finish(&record, &self.metrics.http);
                Ok(true)
            }
        }
    }

    fn classify(&self, record: &mut OperationRecord, outcome: &HttpOutcome) {
        match outcome {
            HttpOutcome::Response(response) => {
                let success = (100..400).contains(&response.status);
                record.stop(success, response.status.to_string());
                self.annotate_cross_component(record, &response.headers);
            }
            HttpOutcome::Failure(failure) => {
                record.stop(false, failure.classification.clone());
            }
        }
    }

    fn annotate_cross_component(&self, record: &mut OperationRecord, headers: &HeaderMap) {
        let Some(remote) = propagation::response_app_id(headers) else {
            return;
        };
        match self.local_app_id() {
            Some(local) if local != remote => {
                record.kind = DependencyKind::CrossComponent;
                record.target = format!("{} | {}", record.target, remote);
            }
            Some(_) => {}
            None => trace!("Local application id not resolved yet"),
        }
    }

    fn local_app_id(&self) -> Option<String> {
        let resolver = self.resolver.as_ref()?;
        let ikey = self.config.instrumentation_key.as_deref()?;
        resolver.try_resolve(ikey)
    }

    fn is_excluded(&self, url: &Url) -> bool {
        url.host_str().is_some_and(|host| {
            let host = host.to_lowercase();
            self.config.excluded_hosts.iter().any(|h| *h == host)
        })
    }
}

fn parse_target(raw: &str) -> Option<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let url = Url::parse(raw).ok()?;
    url.host_str()?;
    Some(url)
}

fn new_record(url: &Url, request: &HttpRequest) -> OperationRecord {
    let mut record = OperationRecord::new(DependencyKind::Http, request.parent.as_ref());
    let host = url.host_str().unwrap_or_default();
    record.target = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    record.name = format!("{} {}", request.method, url.path());
    record.data = url.to_string();
    record.baggage = request.baggage.clone();
    record
}
