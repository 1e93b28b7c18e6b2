//! JSONL request log.
//!
//! Diagnostics go through `tracing`; this log keeps one structured entry per
//! relayed request (conversion chain, models, usage) in a bounded ring buffer
//! that is mirrored to disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::translate::{ConversionChain, Usage};

const MAX_LOG_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub component: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            component: component.into(),
            message: message.into(),
            context: None,
        }
    }

    #[must_use]
    pub fn with_context(mut self, ctx: serde_json::Value) -> Self {
        self.context = Some(ctx);
        self
    }
}

/// Summary of one relayed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRecord {
    pub request_id: String,
    pub chain: String,
    pub client_model: String,
    pub upstream_model: String,
    pub stream: bool,
    pub status: u16,
    pub usage: Usage,
    /// Whether the response reached its normal end.
    pub complete: bool,
    /// Hint for an outer failover layer.
    pub retryable: bool,
    pub elapsed_ms: u64,
}

impl RelayRecord {
    pub fn new(request_id: &str, chain: &ConversionChain, client_model: &str, upstream_model: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            chain: chain.to_string(),
            client_model: client_model.to_string(),
            upstream_model: upstream_model.to_string(),
            stream: false,
            status: 200,
            usage: Usage::default(),
            complete: false,
            retryable: false,
            elapsed_ms: 0,
        }
    }
}

/// Ring-buffer logger that persists to JSONL.
pub struct Logger {
    entries: VecDeque<LogEntry>,
    file_path: std::path::PathBuf,
    writer: Option<BufWriter<File>>,
}

impl Logger {
    pub fn new(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file_path = file_path.as_ref().to_path_buf();

        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut entries = VecDeque::with_capacity(MAX_LOG_ENTRIES);
        let mut dropped = 0usize;

        if file_path.exists() {
            let file = File::open(&file_path)?;
            let reader = BufReader::new(file);
            for line in reader.lines().map_while(std::result::Result::ok) {
                if let Ok(entry) = serde_json::from_str::<LogEntry>(&line) {
                    if entries.len() >= MAX_LOG_ENTRIES {
                        entries.pop_front();
                        dropped += 1;
                    }
                    entries.push_back(entry);
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file_path)?;

        let mut logger = Self {
            entries,
            file_path,
            writer: Some(BufWriter::new(file)),
        };
        if dropped > 0 {
            logger.compact()?;
        }
        Ok(logger)
    }

    pub fn log(&mut self, entry: LogEntry) {
        if let Some(ref mut writer) = self.writer {
            if let Ok(json) = serde_json::to_string(&entry) {
                let _ = writeln!(writer, "{}", json);
                let _ = writer.flush();
            }
        }
        if self.entries.len() >= MAX_LOG_ENTRIES {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }

    /// Rewrite the file with only the entries still in the ring buffer.
    pub fn compact(&mut self) -> std::io::Result<()> {
        self.writer = None;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.file_path)?;
        let mut writer = BufWriter::new(file);
        for entry in &self.entries {
            if let Ok(json) = serde_json::to_string(entry) {
                writeln!(writer, "{}", json)?;
            }
        }
        writer.flush()?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }
}

#[derive(Clone)]
pub struct SharedLogger(Arc<Mutex<Logger>>);

impl SharedLogger {
    pub fn new(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self(Arc::new(Mutex::new(Logger::new(file_path)?))))
    }

    pub fn log(&self, entry: LogEntry) {
        if let Ok(mut logger) = self.0.lock() {
            logger.log(entry);
        }
    }

    pub fn info(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Info, component, message));
    }

    pub fn warn(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Warn, component, message));
    }

    pub fn error(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Error, component, message));
    }

    pub fn log_with_context(
        &self,
        level: LogLevel,
        component: impl Into<String>,
        message: impl Into<String>,
        context: serde_json::Value,
    ) {
        self.log(LogEntry::new(level, component, message).with_context(context));
    }

    /// Record a finished relay. Incomplete responses are logged as warnings.
    pub fn relay(&self, record: &RelayRecord) {
        let level = if record.complete && record.status < 400 {
            LogLevel::Info
        } else {
            LogLevel::Warn
        };
        let message = format!(
            "{} {} -> {} prompt={} completion={}",
            record.chain,
            record.client_model,
            record.upstream_model,
            record.usage.prompt_tokens,
            record.usage.completion_tokens
        );
        let context = serde_json::to_value(record).unwrap_or_default();
        self.log_with_context(level, "relay", message, context);
    }

    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        self.0.lock().map(|l| l.recent(limit)).unwrap_or_default()
    }
}
