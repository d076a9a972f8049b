//! NDJSON outcome log for askQuestion requests.
//!
//! One line per request that reached the pipeline: success or the error
//! code it ended with.  Records carry the subject and question length but
//! never the question or answer text.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;

use crate::config::RotationConfig;
use crate::metrics::Metrics;

pub const SCHEMA_VERSION: u32 = 1;

/// Size-based rotating writer.  Backups are `<path>.1` .. `<path>.<keep>`
/// (or `<path>.N.gz` when compressing), `.1` being the newest.
pub struct RotatingWriter {
    path: PathBuf,
    file: fs::File,
    max_bytes: Option<u64>,
    keep: usize,
    compress: bool,
}

impl RotatingWriter {
    pub fn open(path: &str, rotation: &RotationConfig) -> std::io::Result<Self> {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            path: PathBuf::from(path),
            file,
            max_bytes: rotation.max_bytes,
            keep: rotation.keep,
            compress: rotation.compress,
        })
    }

    pub fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        if let Some(limit) = self.max_bytes {
            if self.current_size().is_some_and(|len| len >= limit) {
                self.rotate();
            }
        }
        writeln!(self.file, "{}", line)
    }

    pub fn current_size(&self) -> Option<u64> {
        self.path.metadata().ok().map(|m| m.len())
    }

    fn backup(&self, idx: usize, gz: bool) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{}", idx));
        if gz {
            name.push(".gz");
        }
        PathBuf::from(name)
    }

    fn rotate(&mut self) {
        if self.keep > 0 {
            // A backup may be plain or gzipped (compression is best effort),
            // so both forms shift together and the oldest slot is dropped.
            for gz in [false, true] {
                let oldest = self.backup(self.keep, gz);
                if oldest.exists() {
                    let _ = fs::remove_file(&oldest);
                }
            }
            for idx in (1..self.keep).rev() {
                for gz in [false, true] {
                    let from = self.backup(idx, gz);
                    if from.exists() {
                        let _ = fs::rename(&from, self.backup(idx + 1, gz));
                    }
                }
            }
            if let Err(e) = fs::rename(&self.path, self.backup(1, false)) {
                tracing::warn!(path = %self.path.display(), error = %e, "telemetry rotation failed");
            } else if self.compress {
                self.compress_first_backup();
            }
        }
        match fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
        {
            Ok(f) => self.file = f,
            Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "failed to reopen telemetry log"),
        }
    }

    fn compress_first_backup(&self) {
        let rotated = self.backup(1, false);
        let Ok(data) = fs::read(&rotated) else {
            return;
        };
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        if gz.write_all(&data).is_ok() {
            if let Ok(buf) = gz.finish() {
                if fs::write(self.backup(1, true), buf).is_ok() {
                    let _ = fs::remove_file(&rotated);
                }
            }
        }
    }
}

/// Final state of one askQuestion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Answered,
    Rejected,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent<'a> {
    pub schema_version: u32,
    pub ts: String,
    pub correlation_id: &'a str,
    pub subject: Option<&'a str>,
    pub outcome: Outcome,
    pub code: Option<&'static str>,
    pub latency_ms: u64,
    pub remaining: Option<u32>,
    pub question_chars: usize,
}

impl<'a> ChatEvent<'a> {
    pub fn new(correlation_id: &'a str, at: DateTime<Utc>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            ts: at.to_rfc3339_opts(SecondsFormat::Millis, true),
            correlation_id,
            subject: None,
            outcome: Outcome::Answered,
            code: None,
            latency_ms: 0,
            remaining: None,
            question_chars: 0,
        }
    }
}

#[derive(Clone)]
pub struct TelemetrySink {
    writer: Option<Arc<Mutex<RotatingWriter>>>,
    log_stdout: bool,
    log_sample_n: Option<u64>,
    sample_counter: Arc<AtomicU64>,
    lines_total: Arc<AtomicU64>,
    write_errors_total: Arc<AtomicU64>,
    log_file_size_bytes: Arc<AtomicU64>,
}

impl TelemetrySink {
    pub fn new(
        writer: Option<RotatingWriter>,
        log_stdout: bool,
        log_sample_n: Option<u64>,
        metrics: &Metrics,
    ) -> Self {
        Self {
            writer: writer.map(|w| Arc::new(Mutex::new(w))),
            log_stdout,
            log_sample_n,
            sample_counter: Arc::new(AtomicU64::new(0)),
            lines_total: metrics.telemetry_lines_total().clone(),
            write_errors_total: metrics.telemetry_write_errors_total().clone(),
            log_file_size_bytes: metrics.log_file_size_bytes().clone(),
        }
    }

    /// Sink with no file; records only reach stdout when enabled.
    pub fn disabled(metrics: &Metrics) -> Self {
        Self::new(None, false, None, metrics)
    }

    pub fn emit(&self, event: &ChatEvent<'_>) {
        let wrote = self.write(event);
        if (wrote || self.writer.is_none()) && self.should_log_stdout() {
            tracing::info!(
                target: "telemetry",
                correlationId = event.correlation_id,
                subject = ?event.subject,
                outcome = ?event.outcome,
                code = ?event.code,
                latencyMs = event.latency_ms,
                remaining = ?event.remaining,
                "askQuestion"
            );
        }
    }

    fn write(&self, event: &ChatEvent<'_>) -> bool {
        let Some(target) = self.writer.as_ref() else {
            return false;
        };
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode telemetry record");
                self.write_errors_total.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };
        let Ok(mut guard) = target.lock() else {
            self.write_errors_total.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        match guard.write_line(&line) {
            Ok(()) => {
                self.lines_total.fetch_add(1, Ordering::Relaxed);
                if let Some(sz) = guard.current_size() {
                    self.log_file_size_bytes.store(sz, Ordering::Relaxed);
                }
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to write telemetry line");
                self.write_errors_total.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    fn should_log_stdout(&self) -> bool {
        if !self.log_stdout {
            return false;
        }
        match self.log_sample_n {
            Some(n) => self.sample_counter.fetch_add(1, Ordering::Relaxed) % n == 0,
            None => true,
        }
    }
}
