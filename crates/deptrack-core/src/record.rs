//! Operation records - the in-flight state of one tracked call
//!
//! A record is created when a begin notification is accepted by the
//! correlation store and lives there until the matching end (or until the
//! store evicts it). Terminal fields are only written on completion.

use crate::propagation::{self, TraceContext};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared handle to a record held by a correlation store.
///
/// The mutex gives begin-before-end visibility: everything written while the
/// record was built is seen by whichever thread completes it.
pub type OperationHandle = Arc<Mutex<OperationRecord>>;

/// Kind of dependency call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum DependencyKind {
    Http,
    Sql,
    /// Call into another monitored component (response named a different app id)
    CrossComponent,
    Custom(String),
}

impl DependencyKind {
    pub fn as_str(&self) -> &str {
        match self {
            DependencyKind::Http => "Http",
            DependencyKind::Sql => "SQL",
            DependencyKind::CrossComponent => "cross-component",
            DependencyKind::Custom(s) => s.as_str(),
        }
    }
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<DependencyKind> for String {
    fn from(kind: DependencyKind) -> Self {
        kind.as_str().to_string()
    }
}

impl From<String> for DependencyKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Http" => DependencyKind::Http,
            "SQL" => DependencyKind::Sql,
            "cross-component" => DependencyKind::CrossComponent,
            _ => DependencyKind::Custom(s),
        }
    }
}

/// Mutable in-flight state for one tracked call
#[derive(Debug, Clone)]
pub struct OperationRecord {
    /// Span id of this dependency call (16 hex chars)
    pub id: String,

    /// Trace id shared with the parent operation (32 hex chars)
    pub trace_id: String,

    /// Span id of the parent operation, if the call had one
    pub parent_id: Option<String>,

    pub name: String,

    pub target: String,

    pub kind: DependencyKind,

    /// URL or command text
    pub data: String,

    /// Monotonic start, used for the duration
    pub start: Instant,

    /// Wall-clock start, reported on the telemetry
    pub timestamp: DateTime<Utc>,

    /// Application code started this operation; the instrumentation end path
    /// must leave it alone.
    pub is_user_created: bool,

    /// Custom properties
    pub properties: BTreeMap<String, String>,

    /// Baggage captured at begin, in arrival order
    pub baggage: Vec<(String, String)>,

    pub duration: Option<Duration>,

    pub success: Option<bool>,

    pub result_code: Option<String>,
}

impl OperationRecord {
    /// Create a record with fresh ids, parented to `parent` when given
    pub fn new(kind: DependencyKind, parent: Option<&TraceContext>) -> Self {
        let (trace_id, parent_id) = match parent {
            Some(ctx) => (ctx.trace_id.clone(), Some(ctx.span_id.clone())),
            None => (propagation::new_trace_id(), None),
        };

        Self {
            id: propagation::new_span_id(),
            trace_id,
            parent_id,
            name: String::new(),
            target: String::new(),
            kind,
            data: String::new(),
            start: Instant::now(),
            timestamp: Utc::now(),
            is_user_created: false,
            properties: BTreeMap::new(),
            baggage: Vec::new(),
            duration: None,
            success: None,
            result_code: None,
        }
    }

    /// Mark the record as owned by application code
    pub fn user_created(mut self) -> Self {
        self.is_user_created = true;
        self
    }

    /// Wrap the record in a shareable handle
    pub fn into_handle(self) -> OperationHandle {
        Arc::new(Mutex::new(self))
    }

    /// Trace context to propagate to the callee
    pub fn context(&self) -> TraceContext {
        TraceContext {
            trace_id: self.trace_id.clone(),
            span_id: self.id.clone(),
            trace_flags: Some(propagation::SAMPLED_FLAG),
        }
    }

    /// Set the terminal fields
    pub fn stop(&mut self, success: bool, result_code: impl Into<String>) {
        self.duration = Some(self.start.elapsed());
        self.success = Some(success);
        self.result_code = Some(result_code.into());
    }

    pub fn is_completed(&self) -> bool {
        self.duration.is_some()
    }

    /// Rough heap footprint, used by byte-budgeted stores
    pub fn estimated_size(&self) -> usize {
        let strings = self.id.len()
            + self.trace_id.len()
            + self.parent_id.as_ref().map_or(0, String::len)
            + self.name.len()
            + self.target.len()
            + self.data.len()
            + self.result_code.as_ref().map_or(0, String::len);
        let properties: usize = self.properties.iter().map(|(k, v)| k.len() + v.len()).sum();
        let baggage: usize = self.baggage.iter().map(|(k, v)| k.len() + v.len()).sum();
        std::mem::size_of::<Self>() + strings + properties + baggage
    }
}

/// Response descriptor delivered with an end notification
#[derive(Debug, Clone, Default)]
pub struct ResponseInfo {
    pub status: u16,
    pub headers: http::HeaderMap,
}

impl ResponseInfo {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: http::HeaderMap::new(),
        }
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = http::HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }
}

/// Exception descriptor delivered with an end notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    /// Classification of the failure (e.g. "Timeout", "ConnectFailure")
    pub classification: String,

    pub message: String,

    /// Error number reported by a database provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_code: Option<i32>,
}

impl FailureInfo {
    pub fn new(classification: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            classification: classification.into(),
            message: message.into(),
            provider_code: None,
        }
    }

    /// Failure raised by the database provider itself
    pub fn database(code: i32, message: impl Into<String>) -> Self {
        Self {
            classification: "DatabaseError".to_string(),
            message: message.into(),
            provider_code: Some(code),
        }
    }
}
