//! Distributed-trace header propagation
//!
//! Outgoing HTTP calls carry the caller's correlation ids so the callee can
//! parent its own telemetry. Headers are only ever added when absent: a
//! value supplied by the application is never overwritten or duplicated.
//!
//! Responses may carry a `Request-Context` header naming the callee's
//! application id, which the HTTP tracker uses for cross-component
//! annotation.

use crate::error::DependencyResult;
use http::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Legacy hierarchical request id: `|<trace>.<span>.`
pub const REQUEST_ID_HEADER: &str = "request-id";
/// Legacy root operation id
pub const ROOT_ID_HEADER: &str = "x-ms-request-root-id";
/// Legacy parent (this call's) id
pub const PARENT_ID_HEADER: &str = "x-ms-request-id";
/// W3C trace context
pub const TRACEPARENT_HEADER: &str = "traceparent";
/// Baggage
pub const CORRELATION_CONTEXT_HEADER: &str = "correlation-context";
/// Component identity, sent on requests and returned on responses
pub const REQUEST_CONTEXT_HEADER: &str = "request-context";

/// Key inside `Request-Context` that carries the application id
pub const APP_ID_KEY: &str = "appId";
/// Format prefix of the application id value
pub const APP_ID_PREFIX: &str = "cid-v1:";

/// W3C `sampled` trace flag
pub const SAMPLED_FLAG: u8 = 0x01;

const TRACEPARENT_VERSION: &str = "00";

/// W3C trace context of an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    /// W3C Trace ID (32 hex chars)
    pub trace_id: String,
    /// W3C Span ID (16 hex chars)
    pub span_id: String,
    /// Trace flags
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_flags: Option<u8>,
}

impl TraceContext {
    /// Start a new trace
    pub fn new_root() -> Self {
        Self {
            trace_id: new_trace_id(),
            span_id: new_span_id(),
            trace_flags: Some(SAMPLED_FLAG),
        }
    }

    /// Render as a `traceparent` header value
    pub fn to_traceparent(&self) -> String {
        format!(
            "{}-{}-{}-{:02x}",
            TRACEPARENT_VERSION,
            self.trace_id,
            self.span_id,
            self.trace_flags.unwrap_or(SAMPLED_FLAG)
        )
    }

    /// Parse a `traceparent` header value. Returns `None` for anything that
    /// is not a well-formed version-00 value with non-zero ids.
    pub fn from_traceparent(value: &str) -> Option<Self> {
        let mut parts = value.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;
        if parts.next().is_some() || version != TRACEPARENT_VERSION {
            return None;
        }
        if !is_lower_hex(trace_id, 32) || !is_lower_hex(span_id, 16) || !is_lower_hex(flags, 2) {
            return None;
        }
        if trace_id.bytes().all(|b| b == b'0') || span_id.bytes().all(|b| b == b'0') {
            return None;
        }

        Some(Self {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            trace_flags: u8::from_str_radix(flags, 16).ok(),
        })
    }

    /// Render as a legacy hierarchical `Request-Id`
    pub fn to_request_id(&self) -> String {
        format!("|{}.{}.", self.trace_id, self.span_id)
    }
}

fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// New 32-hex-char trace id
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// New 16-hex-char span id
pub fn new_span_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

/// Which header families get injected into outgoing requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderInjection {
    /// `Request-Id`, root-id and parent-id headers
    pub legacy: bool,

    /// W3C `traceparent`
    pub w3c: bool,

    /// `Correlation-Context` baggage
    pub baggage: bool,

    /// `Request-Context` with the local application id
    pub request_context: bool,
}

impl Default for HeaderInjection {
    fn default() -> Self {
        Self {
            legacy: true,
            w3c: true,
            baggage: true,
            request_context: true,
        }
    }
}

impl HeaderInjection {
    /// Inject nothing
    pub fn disabled() -> Self {
        Self {
            legacy: false,
            w3c: false,
            baggage: false,
            request_context: false,
        }
    }
}

/// Insert `value` under `name` unless the header is already present.
/// Returns whether the header was added.
pub fn insert_if_absent(
    headers: &mut HeaderMap,
    name: &'static str,
    value: &str,
) -> DependencyResult<bool> {
    if headers.contains_key(name) {
        return Ok(false);
    }
    headers.insert(name, HeaderValue::from_str(value)?);
    Ok(true)
}

/// Inject correlation headers for an outgoing call.
///
/// `ctx` is the context of the dependency call itself (its span id becomes
/// the callee's parent). Each header is added independently: a value that
/// is not a valid header value is logged and skipped. Returns the number of
/// headers added.
pub fn inject_outgoing(
    headers: &mut HeaderMap,
    ctx: &TraceContext,
    baggage: &[(String, String)],
    local_app_id: Option<&str>,
    injection: &HeaderInjection,
) -> usize {
    let mut wanted: Vec<(&'static str, String)> = Vec::new();

    if injection.legacy {
        wanted.push((REQUEST_ID_HEADER, ctx.to_request_id()));
        wanted.push((ROOT_ID_HEADER, ctx.trace_id.clone()));
        wanted.push((PARENT_ID_HEADER, ctx.span_id.clone()));
    }
    if injection.w3c {
        wanted.push((TRACEPARENT_HEADER, ctx.to_traceparent()));
    }
    if injection.baggage {
        let value = format_baggage(baggage);
        if !value.is_empty() {
            wanted.push((CORRELATION_CONTEXT_HEADER, value));
        }
    }
    if injection.request_context {
        if let Some(app_id) = local_app_id {
            wanted.push((REQUEST_CONTEXT_HEADER, format_request_context(app_id)));
        }
    }

    wanted
        .into_iter()
        .filter(|(name, value)| match insert_if_absent(headers, *name, value) {
            Ok(added) => added,
            Err(e) => {
                debug!("Skipping {} header: {}", name, e);
                false
            }
        })
        .count()
}

/// `k1=v1,k2=v2`, values percent-encoded.
///
/// Members whose key is not a plain token are dropped.
pub fn format_baggage(baggage: &[(String, String)]) -> String {
    baggage
        .iter()
        .filter(|(k, _)| {
            let valid = is_baggage_key(k);
            if !valid {
                debug!("Dropping baggage member with invalid key {:?}", k);
            }
            valid
        })
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join(",")
}

fn is_baggage_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_graphic() && !matches!(b, b'=' | b',' | b';' | b'"' | b'\\'))
}

/// Parse a `Correlation-Context` value. Malformed members are skipped.
pub fn parse_baggage(value: &str) -> Vec<(String, String)> {
    value
        .split(',')
        .filter_map(|member| {
            let (k, v) = member.split_once('=')?;
            let k = k.trim();
            if k.is_empty() {
                return None;
            }
            let v = v.trim();
            let v = urlencoding::decode(v).map_or_else(|_| v.to_string(), |d| d.into_owned());
            Some((k.to_string(), v))
        })
        .collect()
}

/// `appId=cid-v1:<app id>`
pub fn format_request_context(app_id: &str) -> String {
    format!("{}={}{}", APP_ID_KEY, APP_ID_PREFIX, app_id)
}

/// Extract the application id from a `Request-Context` value
pub fn parse_app_id(value: &str) -> Option<String> {
    value.split(',').find_map(|pair| {
        let (key, val) = pair.split_once('=')?;
        if key.trim() != APP_ID_KEY {
            return None;
        }
        let id = val.trim().strip_prefix(APP_ID_PREFIX).unwrap_or(val.trim());
        if id.is_empty() {
            None
        } else {
            Some(id.to_string())
        }
    })
}

/// Application id named by a response's `Request-Context` header
pub fn response_app_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(REQUEST_CONTEXT_HEADER)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(parse_app_id)
}
