//! Correlation-id resolver
//!
//! Maps an instrumentation key to the application id the ingestion service
//! assigned to it. The tracker path only ever calls [`try_resolve`], which
//! answers from the cache and otherwise starts a background lookup and
//! returns `None` straight away.
//!
//! Failed lookups are cached too, for a shorter time, so an unreachable
//! profile service is not hammered. Concurrent misses for one key share a
//! single outstanding lookup.
//!
//! [`try_resolve`]: CorrelationIdResolver::try_resolve

use async_trait::async_trait;
use deptrack_core::config::{ResolverSettings, MAX_CACHE_TTL_SECS};
use deptrack_core::metrics::{self, TrackingMetrics};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Errors from an application-id lookup
#[derive(Error, Debug)]
pub enum ResolverError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("No application id for key {0}")]
    NotFound(String),

    #[error("Profile service error: {status} - {message}")]
    Server { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Lookup timed out")]
    Timeout,

    #[error("Invalid profile endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Source of application ids
#[async_trait]
pub trait ApplicationIdProvider: Send + Sync {
    async fn fetch_app_id(&self, instrumentation_key: &str) -> Result<String, ResolverError>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    app_id: Option<String>,
    expires_at: Instant,
}

/// TTL-cached, coalescing application-id resolver
pub struct CorrelationIdResolver {
    provider: Arc<dyn ApplicationIdProvider>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    in_flight: Mutex<HashMap<String, broadcast::Sender<Option<String>>>>,
    positive_ttl: Duration,
    negative_ttl: Duration,
    timeout: Duration,
    metrics: Arc<TrackingMetrics>,
}

/// Publishes a `None` result if a lookup task dies before finishing, so
/// waiters are released.
struct LookupGuard {
    resolver: Arc<CorrelationIdResolver>,
    key: String,
    finished: bool,
}

impl Drop for LookupGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.resolver.publish(&self.key, None);
        }
    }
}

impl CorrelationIdResolver {
    pub fn new(provider: Arc<dyn ApplicationIdProvider>) -> Self {
        Self::from_settings(provider, &ResolverSettings::default())
    }

    pub fn from_settings(
        provider: Arc<dyn ApplicationIdProvider>,
        settings: &ResolverSettings,
    ) -> Self {
        Self {
            provider,
            cache: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            positive_ttl: settings.positive_ttl(),
            negative_ttl: settings.negative_ttl(),
            timeout: settings.timeout(),
            metrics: Arc::new(TrackingMetrics::new()),
        }
    }

    pub fn with_ttls(mut self, positive: Duration, negative: Duration) -> Self {
        self.positive_ttl = positive;
        self.negative_ttl = negative;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<TrackingMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Answer from the cache without waiting.
    ///
    /// On a miss a lookup is started on the ambient tokio runtime, if there
    /// is one, and `None` is returned.
    pub fn try_resolve(self: &Arc<Self>, instrumentation_key: &str) -> Option<String> {
        if let Some(cached) = self.cached(instrumentation_key) {
            return cached;
        }
        metrics::incr(&self.metrics.resolver.misses);

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let _ = self.join_or_start(instrumentation_key, &runtime);
            }
            Err(_) => trace!(
                "No runtime to resolve {}, skipping lookup",
                instrumentation_key
            ),
        }
        None
    }

    /// Resolve, waiting for a lookup if the cache has no answer
    pub async fn resolve(self: &Arc<Self>, instrumentation_key: &str) -> Option<String> {
        if let Some(cached) = self.cached(instrumentation_key) {
            return cached;
        }
        metrics::incr(&self.metrics.resolver.misses);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return None;
        };
        match self.join_or_start(instrumentation_key, &runtime) {
            Ok(mut rx) => rx.recv().await.unwrap_or(None),
            Err(cached) => cached,
        }
    }

    /// Cached answer, if one is still fresh. `Some(None)` is a cached failure.
    fn cached(&self, instrumentation_key: &str) -> Option<Option<String>> {
        let cache = self.cache.read();
        let entry = cache.get(instrumentation_key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        if entry.app_id.is_some() {
            metrics::incr(&self.metrics.resolver.hits);
        } else {
            metrics::incr(&self.metrics.resolver.negative_hits);
        }
        Some(entry.app_id.clone())
    }

    /// Subscribe to the outstanding lookup for the key, starting one if none
    /// is running. `Err` carries a cache answer that landed in the meantime.
    fn join_or_start(
        self: &Arc<Self>,
        instrumentation_key: &str,
        runtime: &tokio::runtime::Handle,
    ) -> Result<broadcast::Receiver<Option<String>>, Option<String>> {
        let mut in_flight = self.in_flight.lock();

        // A lookup may have published between the first check and the lock
        if let Some(cached) = self.cached(instrumentation_key) {
            return Err(cached);
        }

        if let Some(tx) = in_flight.get(instrumentation_key) {
            metrics::incr(&self.metrics.resolver.coalesced);
            return Ok(tx.subscribe());
        }

        let (tx, rx) = broadcast::channel(1);
        in_flight.insert(instrumentation_key.to_string(), tx);
        drop(in_flight);

        let resolver = self.clone();
        let key = instrumentation_key.to_string();
        runtime.spawn(async move {
            resolver.lookup(key).await;
        });
        Ok(rx)
    }

    async fn lookup(self: Arc<Self>, instrumentation_key: String) {
        let mut guard = LookupGuard {
            resolver: self.clone(),
            key: instrumentation_key.clone(),
            finished: false,
        };
        metrics::incr(&self.metrics.resolver.lookups);

        let result = match tokio::time::timeout(
            self.timeout,
            self.provider.fetch_app_id(&instrumentation_key),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ResolverError::Timeout),
        };

        let (app_id, ttl) = match result {
            Ok(app_id) => {
                debug!("Resolved {} to application id {}", instrumentation_key, app_id);
                (Some(app_id), self.positive_ttl)
            }
            Err(e) => {
                metrics::incr(&self.metrics.resolver.failures);
                debug!("Application id lookup for {} failed: {}", instrumentation_key, e);
                (None, self.negative_ttl)
            }
        };

        self.cache.write().insert(
            instrumentation_key.clone(),
            CacheEntry {
                app_id: app_id.clone(),
                expires_at: expiry(ttl),
            },
        );
        self.publish(&instrumentation_key, app_id);
        guard.finished = true;
    }

    fn publish(&self, instrumentation_key: &str, app_id: Option<String>) {
        if let Some(tx) = self.in_flight.lock().remove(instrumentation_key) {
            // No receivers is fine, the cache has the answer
            let _ = tx.send(app_id);
        }
    }

    /// Drop every cached answer
    pub fn clear(&self) {
        self.cache.write().clear();
    }

    pub fn cached_len(&self) -> usize {
        self.cache.read().len()
    }
}

/// Cache expiry `ttl` from now, capped so it cannot overflow the clock
fn expiry(ttl: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(ttl.min(Duration::from_secs(MAX_CACHE_TTL_SECS)))
        .unwrap_or(now)
}
