//! Dependency telemetry - the finished record handed to sinks
//!
//! Telemetry is built once by the assembler and then shared behind an `Arc`;
//! nothing downstream can change it.

use crate::record::DependencyKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// One finished outbound dependency call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyTelemetry {
    /// Span id of the call
    pub id: String,

    /// Trace id (root operation)
    pub trace_id: String,

    /// Parent span id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    pub name: String,

    pub target: String,

    #[serde(rename = "type")]
    pub kind: DependencyKind,

    /// URL or command text
    pub data: String,

    /// When the call started
    pub timestamp: DateTime<Utc>,

    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,

    pub success: bool,

    pub result_code: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl DependencyTelemetry {
    pub fn duration_ms(&self) -> f64 {
        self.duration.as_secs_f64() * 1000.0
    }
}

mod duration_ms {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64() * 1000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = f64::deserialize(d)?;
        Duration::try_from_secs_f64(ms.max(0.0) / 1000.0)
            .map_err(|e| de::Error::custom(format!("duration_ms {}: {}", ms, e)))
    }
}
