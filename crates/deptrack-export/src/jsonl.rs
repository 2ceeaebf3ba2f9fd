//! JSONL file sink

use crate::{SinkError, SinkResult};
use deptrack_core::config::JsonlExportConfig;
use deptrack_core::{DependencyTelemetry, TelemetrySink};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// JSONL sink configuration
#[derive(Debug, Clone)]
pub struct JsonlSinkConfig {
    /// Output file path
    pub path: PathBuf,

    /// Whether to append to existing file
    pub append: bool,

    /// Pretty print JSON (not recommended for large files)
    pub pretty: bool,

    /// Flush after each write
    pub flush_each: bool,
}

impl Default for JsonlSinkConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp/deptrack-dependencies.jsonl"),
            append: true,
            pretty: false,
            flush_each: true,
        }
    }
}

impl From<&JsonlExportConfig> for JsonlSinkConfig {
    fn from(config: &JsonlExportConfig) -> Self {
        Self {
            path: PathBuf::from(&config.path),
            append: config.append,
            pretty: config.pretty,
            flush_each: config.flush_each,
        }
    }
}

/// Writes one telemetry record per line.
///
/// Write failures are logged and counted; they never reach the tracker.
pub struct JsonlSink {
    config: JsonlSinkConfig,
    writer: Mutex<BufWriter<File>>,
    written: AtomicU64,
    errors: AtomicU64,
}

impl JsonlSink {
    /// Open (or create) the output file
    pub fn open(config: JsonlSinkConfig) -> SinkResult<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = if config.append {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config.path)?
        } else {
            File::create(&config.path)?
        };
        info!("JSONL sink writing to: {:?}", config.path);

        Ok(Self {
            config,
            writer: Mutex::new(BufWriter::new(file)),
            written: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.config.path
    }

    /// Records written so far
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Records lost to write or serialization errors
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    fn write(&self, telemetry: &DependencyTelemetry) -> SinkResult<()> {
        let json = if self.config.pretty {
            serde_json::to_string_pretty(telemetry)?
        } else {
            serde_json::to_string(telemetry)?
        };

        let mut w = self.writer.lock();
        writeln!(w, "{}", json)?;
        if self.config.flush_each {
            w.flush()?;
        }
        Ok(())
    }
}

impl TelemetrySink for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn track(&self, telemetry: Arc<DependencyTelemetry>) {
        match self.write(&telemetry) {
            Ok(()) => {
                self.written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to write dependency {}: {}", telemetry.id, e);
            }
        }
    }

    fn flush(&self) {
        if let Err(e) = self.writer.lock().flush() {
            warn!("Failed to flush {:?}: {}", self.config.path, SinkError::from(e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use deptrack_core::DependencyKind;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::tempdir;

    fn telemetry(name: &str) -> Arc<DependencyTelemetry> {
        Arc::new(DependencyTelemetry {
            id: "00f067aa0ba902b7".to_string(),
            trace_id: "4bf92f3577b34da6a3ce929d0e0e4736".to_string(),
            parent_id: None,
            name: name.to_string(),
            target: "db1 | orders".to_string(),
            kind: DependencyKind::Sql,
            data: "EXEC sp_x".to_string(),
            timestamp: Utc::now(),
            duration: Duration::from_millis(3),
            success: true,
            result_code: "0".to_string(),
            properties: BTreeMap::new(),
        })
    }

    #[test]
    fn test_writes_one_line_per_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out").join("deps.jsonl");
        let sink = JsonlSink::open(JsonlSinkConfig {
            path: path.clone(),
            ..Default::default()
        })
        .unwrap();

        sink.track(telemetry("first"));
        sink.track(telemetry("second"));
        assert_eq!(sink.written(), 2);

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: DependencyTelemetry = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed.name, "second");
        assert_eq!(parsed.kind, DependencyKind::Sql);
    }

    #[test]
    fn test_append_vs_truncate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("deps.jsonl");
        let config = JsonlSinkConfig {
            path: path.clone(),
            ..Default::default()
        };

        JsonlSink::open(config.clone()).unwrap().track(telemetry("a"));
        JsonlSink::open(config.clone()).unwrap().track(telemetry("b"));
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 2);

        JsonlSink::open(JsonlSinkConfig {
            append: false,
            ..config
        })
        .unwrap()
        .track(telemetry("c"));
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 1);
    }

    #[test]
    fn test_from_export_config() {
        let export = JsonlExportConfig {
            path: "/tmp/x.jsonl".to_string(),
            pretty: true,
            ..Default::default()
        };
        let config = JsonlSinkConfig::from(&export);
        assert_eq!(config.path, PathBuf::from("/tmp/x.jsonl"));
        assert!(config.pretty);
        assert!(config.append);
    }
}
