//! Structured execution log, one JSON line per event.
//!
//! Each line is a self-contained JSON object with an RFC 3339 timestamp and
//! one event: suite boundaries, trial starts, trust-prompt answers, signal
//! completion, and every trial's terminal result.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::debug;

use crate::result::RunResult;
use crate::supervisor::TrialEvent;

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A structured event in the execution log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    #[serde(flatten)]
    pub event: LogEvent,
}

/// All event types that can appear in the execution log.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    SuiteStarted {
        versions: Vec<String>,
    },
    TrialStarted {
        version: String,
        trial: u32,
        program: String,
    },
    /// The target process is running in its PTY.
    TrialSpawned {
        version: String,
        trial: u32,
        pid: Option<u32>,
    },
    TrustPromptAnswered {
        version: String,
        trial: u32,
    },
    SignalsComplete {
        version: String,
        trial: u32,
        elapsed_ms: u64,
    },
    TrialResolved {
        version: String,
        trial: u32,
        result: RunResult,
    },
    VersionSummarized {
        version: String,
        runs: usize,
        avg_ms: f64,
        std_dev_ms: f64,
        primary_outcome: String,
    },
    VersionFailed {
        version: String,
        reason: String,
    },
    SuiteCompleted {
        succeeded: usize,
        failed: usize,
    },
}

impl LogEvent {
    /// Tag a trial event with the version and trial number it belongs to.
    pub fn from_trial(version: &str, trial: u32, event: &TrialEvent) -> Self {
        let version = version.to_string();
        match event {
            TrialEvent::Spawned { pid, .. } => LogEvent::TrialSpawned {
                version,
                trial,
                pid: *pid,
            },
            TrialEvent::TrustPromptAnswered => LogEvent::TrustPromptAnswered { version, trial },
            TrialEvent::SignalsComplete { elapsed_ms } => LogEvent::SignalsComplete {
                version,
                trial,
                elapsed_ms: *elapsed_ms,
            },
            TrialEvent::Resolved(result) => LogEvent::TrialResolved {
                version,
                trial,
                result: result.clone(),
            },
        }
    }
}

/// Writer for JSON lines execution logs.
pub struct ExecutionLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl ExecutionLog {
    /// Create a new execution log, writing to the given path.
    ///
    /// Creates the file (and parent directories) if they don't exist.
    /// Appends to an existing file.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    pub fn log(&self, event: LogEvent) -> Result<()> {
        let entry = LogEntry {
            timestamp: now_rfc3339(),
            event,
        };

        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;

        debug!(event = %json, "execution log");

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow!("execution log lock poisoned"))?;
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
