//! Per-trial results.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::signals::ReadySignals;

/// How a startup trial ended.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// All ready signals seen and the process stayed up through stabilization.
    Ready,
    /// A version-gate banner was printed.
    ErrorDetected,
    /// The prompt was drawn, then the process exited.
    UiThenExit,
    /// The process exited without ever drawing a prompt.
    ExitedEarly,
    /// Nothing conclusive before the deadline.
    Timeout,
    /// The process could not be spawned, or the trial hit an internal error.
    Failed,
}

impl Outcome {
    pub fn label(self) -> &'static str {
        match self {
            Outcome::Ready => "ready",
            Outcome::ErrorDetected => "error_detected",
            Outcome::UiThenExit => "ui_then_exit",
            Outcome::ExitedEarly => "exited_early",
            Outcome::Timeout => "timeout",
            Outcome::Failed => "failed",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Result of one startup trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    /// Milliseconds from spawn to resolution (to readiness for `Ready`).
    pub elapsed_ms: u64,
    pub outcome: Outcome,
    pub reason: String,
    pub signals: ReadySignals,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_version_required: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
}

impl RunResult {
    pub fn new(outcome: Outcome, elapsed: Duration, reason: impl Into<String>) -> Self {
        Self {
            elapsed_ms: elapsed_ms(elapsed),
            outcome,
            reason: reason.into(),
            signals: ReadySignals::default(),
            exit_code: None,
            session_id: None,
            min_version_required: None,
            error_message: None,
            raw_output: None,
        }
    }

    /// A trial that never got a usable child process.
    pub fn failed(elapsed: Duration, reason: impl Into<String>) -> Self {
        Self::new(Outcome::Failed, elapsed, reason)
    }

    pub fn is_ready(&self) -> bool {
        self.outcome == Outcome::Ready
    }
}

/// Whole milliseconds, never zero.
pub fn elapsed_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis())
        .unwrap_or(u64::MAX)
        .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_is_never_zero() {
        assert_eq!(elapsed_ms(Duration::ZERO), 1);
        assert_eq!(elapsed_ms(Duration::from_micros(400)), 1);
        assert_eq!(elapsed_ms(Duration::from_millis(1234)), 1234);
    }

    #[test]
    fn failed_constructor() {
        let r = RunResult::failed(Duration::from_millis(3), "no such file");
        assert_eq!(r.outcome, Outcome::Failed);
        assert_eq!(r.elapsed_ms, 3);
        assert_eq!(r.reason, "no such file");
        assert!(!r.is_ready());
        assert!(r.exit_code.is_none());
    }

    #[test]
    fn outcome_labels_match_serde() {
        for outcome in [
            Outcome::Ready,
            Outcome::ErrorDetected,
            Outcome::UiThenExit,
            Outcome::ExitedEarly,
            Outcome::Timeout,
            Outcome::Failed,
        ] {
            let json = serde_json::to_string(&outcome).unwrap();
            assert_eq!(json, format!("\"{}\"", outcome.label()));
        }
    }

    #[test]
    fn serialization_omits_absent_fields() {
        let r = RunResult::new(Outcome::Timeout, Duration::from_millis(30_000), "deadline");
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains("\"elapsedMs\":30000"));
        assert!(json.contains("\"outcome\":\"timeout\""));
        assert!(!json.contains("exitCode"));
        assert!(!json.contains("minVersionRequired"));

        let parsed: RunResult = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, r);
    }
}
