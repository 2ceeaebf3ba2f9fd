//! Call-event replay from JSONL files
//!
//! Recorded begin/end notifications can be replayed through the trackers to
//! reproduce pairing behavior offline, without a live instrumentation
//! source. Each line is one [`CallEvent`]; blank lines and lines starting
//! with `#` are ignored.

use crate::record::FailureInfo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One recorded instrumentation notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CallEvent {
    HttpBegin {
        /// Identity of the call object
        call_id: u64,
        /// Offset from the start of the recording
        #[serde(default)]
        offset_ms: u64,
        url: String,
        #[serde(default = "default_method")]
        method: String,
        /// Headers already set by the application
        #[serde(default)]
        headers: BTreeMap<String, String>,
        /// Ambient parent context
        #[serde(default)]
        traceparent: Option<String>,
        #[serde(default)]
        baggage: Vec<(String, String)>,
    },
    HttpEnd {
        call_id: u64,
        #[serde(default)]
        offset_ms: u64,
        #[serde(default)]
        status: Option<u16>,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        failure: Option<FailureInfo>,
    },
    SqlBegin {
        call_id: u64,
        #[serde(default)]
        offset_ms: u64,
        data_source: String,
        database: String,
        /// Command text; absent for connection and transaction operations
        #[serde(default)]
        command_text: Option<String>,
        #[serde(default)]
        stored_procedure: bool,
        /// Connection/transaction verb, e.g. "Open" or "Commit"
        #[serde(default)]
        operation: Option<String>,
    },
    SqlEnd {
        call_id: u64,
        #[serde(default)]
        offset_ms: u64,
        #[serde(default)]
        failure: Option<FailureInfo>,
        /// Close bookkeeping without emitting telemetry
        #[serde(default)]
        silent: bool,
    },
}

fn default_method() -> String {
    "GET".to_string()
}

impl CallEvent {
    pub fn call_id(&self) -> u64 {
        match self {
            CallEvent::HttpBegin { call_id, .. }
            | CallEvent::HttpEnd { call_id, .. }
            | CallEvent::SqlBegin { call_id, .. }
            | CallEvent::SqlEnd { call_id, .. } => *call_id,
        }
    }

    pub fn offset_ms(&self) -> u64 {
        match self {
            CallEvent::HttpBegin { offset_ms, .. }
            | CallEvent::HttpEnd { offset_ms, .. }
            | CallEvent::SqlBegin { offset_ms, .. }
            | CallEvent::SqlEnd { offset_ms, .. } => *offset_ms,
        }
    }

    pub fn is_begin(&self) -> bool {
        matches!(self, CallEvent::HttpBegin { .. } | CallEvent::SqlBegin { .. })
    }
}

/// Configuration for call-event replay
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Path to the JSONL file containing events
    pub input_file: PathBuf,

    /// Speed multiplier for replay timing
    /// - 1.0 = real-time (preserve recorded offsets)
    /// - 0.0 = instant (no delays between events)
    /// - 2.0 = 2x speed (half the delay)
    pub speed_multiplier: f64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            input_file: PathBuf::new(),
            speed_multiplier: 0.0,
        }
    }
}

/// Call-event replay engine
pub struct CallEventReplay {
    config: ReplayConfig,
    running: Arc<AtomicBool>,
}

impl CallEventReplay {
    pub fn new(config: ReplayConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Check if replay is currently running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Get a handle to stop the replay from another task
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Send every event of the file to `tx`, honoring recorded offsets.
    ///
    /// Returns the number of events sent.
    pub async fn run(&self, tx: mpsc::Sender<CallEvent>) -> anyhow::Result<u64> {
        self.running.store(true, Ordering::Relaxed);

        let file = tokio::fs::File::open(&self.config.input_file).await?;
        let mut lines = BufReader::new(file).lines();

        let mut event_count = 0u64;
        let mut last_offset: Option<u64> = None;
        let mut line_number = 0u64;

        info!(
            "Starting call-event replay from {:?} (speed: {}x)",
            self.config.input_file, self.config.speed_multiplier
        );

        while let Some(line) = lines.next_line().await? {
            line_number += 1;

            if !self.running.load(Ordering::Relaxed) {
                info!("Replay stopped at line {}", line_number);
                break;
            }

            let Some(event) = parse_line(&line, line_number) else {
                continue;
            };

            if let Some(last) = last_offset {
                if self.config.speed_multiplier > 0.0 {
                    let delay = event.offset_ms().saturating_sub(last);
                    let adjusted = (delay as f64 / self.config.speed_multiplier) as u64;
                    // Cap delay at 10 seconds to avoid very long waits
                    let capped = adjusted.min(10_000);
                    if capped > 0 {
                        tokio::time::sleep(tokio::time::Duration::from_millis(capped)).await;
                    }
                }
            }
            last_offset = Some(event.offset_ms());

            if tx.send(event).await.is_err() {
                debug!("Replay receiver closed at line {}", line_number);
                break;
            }
            event_count += 1;
        }

        self.running.store(false, Ordering::Relaxed);
        info!(
            "Replay complete: {} events from {:?}",
            event_count, self.config.input_file
        );
        Ok(event_count)
    }
}

fn parse_line(line: &str, line_number: u64) -> Option<CallEvent> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(event) => Some(event),
        Err(err) => {
            warn!("Failed to parse call event at line {}: {}", line_number, err);
            debug!("Line content: {}", line);
            None
        }
    }
}

/// Read all events from a JSONL file
pub async fn read_events_from_file(path: &Path) -> anyhow::Result<Vec<CallEvent>> {
    let file = tokio::fs::File::open(path).await?;
    let mut lines = BufReader::new(file).lines();

    let mut events = Vec::new();
    let mut line_number = 0u64;
    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if let Some(event) = parse_line(&line, line_number) {
            events.push(event);
        }
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_events(lines: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file
    }

    #[test]
    fn test_parse_http_begin_defaults() {
        let event: CallEvent =
            serde_json::from_str(r#"{"event":"http_begin","call_id":1,"url":"http://svc/a"}"#)
                .unwrap();
        match event {
            CallEvent::HttpBegin {
                call_id,
                method,
                headers,
                ..
            } => {
                assert_eq!(call_id, 1);
                assert_eq!(method, "GET");
                assert!(headers.is_empty());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_parse_sql_end_with_failure() {
        let event: CallEvent = serde_json::from_str(
            r#"{"event":"sql_end","call_id":2,"failure":{"classification":"DatabaseError","message":"deadlock","provider_code":1205}}"#,
        )
        .unwrap();
        assert_eq!(event.call_id(), 2);
        assert!(!event.is_begin());
        match event {
            CallEvent::SqlEnd {
                failure, silent, ..
            } => {
                assert_eq!(failure.unwrap().provider_code, Some(1205));
                assert!(!silent);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_events_skips_comments_and_garbage() {
        let file = write_events(&[
            "# recorded session",
            r#"{"event":"http_begin","call_id":1,"url":"http://svc/a"}"#,
            "",
            "not json",
            r#"{"event":"http_end","call_id":1,"offset_ms":50,"status":404}"#,
        ]);

        let events = read_events_from_file(file.path()).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].is_begin());
        assert_eq!(events[1].offset_ms(), 50);
    }

    #[tokio::test]
    async fn test_replay_instant() {
        let file = write_events(&[
            r#"{"event":"sql_begin","call_id":2,"data_source":"db1","database":"orders","command_text":"EXEC sp_x","stored_procedure":true}"#,
            r#"{"event":"sql_end","call_id":2,"offset_ms":10000}"#,
        ]);

        let replay = CallEventReplay::new(ReplayConfig {
            input_file: file.path().to_path_buf(),
            speed_multiplier: 0.0,
        });
        let (tx, mut rx) = mpsc::channel(16);

        let count = replay.run(tx).await.unwrap();
        assert_eq!(count, 2);
        assert!(!replay.is_running());

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(first.is_begin());
        assert_eq!(second.call_id(), 2);
    }
}
