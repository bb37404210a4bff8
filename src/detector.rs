//! Startup detection state machine.
//!
//! Decides, from raw PTY output and process lifecycle events, how a trial
//! ends. The detector owns no I/O and no clock: the trial driver feeds it
//! output chunks, exit notifications and the current time, and acts on the
//! events it returns (answer the trust prompt, kill the child).
//!
//! ## State machine
//!
//! ```text
//! SPAWNED               → trust prompt seen        → TRUST_PROMPT_ANSWERED (write CR once)
//! SPAWNED | ANSWERED    → version-gate banner      → RESOLVED(ErrorDetected)
//! SPAWNED | ANSWERED    → all three ready signals  → SIGNALS_COMPLETE
//! SIGNALS_COMPLETE      → stabilization elapses    → RESOLVED(Ready)
//! any unresolved        → child exits              → RESOLVED(UiThenExit | ExitedEarly)
//! any unresolved        → timeout                  → RESOLVED(Timeout)
//! ```
//!
//! The first resolution wins. Every entry point checks the resolved guard
//! before touching state, so late output or a late exit cannot change a
//! finished trial.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::prompt::{
    AnsiStripper, DEFAULT_TRUST_PROMPT_PATTERNS, TrustPrompt, VersionPatterns,
    extract_session_id, gate_phrase,
};
use crate::result::{Outcome, RunResult};
use crate::signals::ReadySignals;

/// Minimum version assumed when a banner carries no parsable version.
pub const DEFAULT_EXPECTED_MIN_VERSION: &str = "1.0.24";

/// Bytes of already-scanned stripped output re-examined with each chunk, so
/// a phrase split across chunks is still found. Longer than any phrase.
const SCAN_OVERLAP: usize = 512;

/// Detector lifecycle states.
#[derive(Debug, Clone, PartialEq)]
pub enum StartupState {
    /// Child is running, nothing conclusive yet.
    Spawned,
    /// The trust prompt was seen and a confirmation is (or was) scheduled.
    TrustPromptAnswered,
    /// All ready signals seen; waiting out the stabilization delay.
    SignalsComplete {
        /// When the last signal arrived.
        at: Instant,
    },
    /// Terminal state.
    Resolved(Outcome),
}

/// Configuration for the startup detector.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Give up after this long without a resolution.
    pub timeout: Duration,
    /// How long the process must survive after the signals complete.
    pub stabilization_delay: Duration,
    /// Delay before confirming the trust prompt.
    pub trust_prompt_response_delay: Duration,
    /// Fallback for `min_version_required` when a banner has no version.
    pub expected_min_version: String,
    /// Substrings that identify the trust prompt.
    pub trust_prompt_patterns: Vec<String>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            stabilization_delay: Duration::from_millis(500),
            trust_prompt_response_delay: Duration::from_millis(100),
            expected_min_version: DEFAULT_EXPECTED_MIN_VERSION.to_string(),
            trust_prompt_patterns: DEFAULT_TRUST_PROMPT_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Events emitted by the detector for the trial driver to act on.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorEvent {
    /// Trust prompt seen. Write a carriage return at `respond_at` unless the
    /// trial resolves first.
    TrustPrompt { respond_at: Instant },
    /// All ready signals seen at `at`. The trial resolves `Ready` at
    /// `stable_at` if the child is still alive.
    SignalsComplete { at: Instant, stable_at: Instant },
    /// The trial reached its terminal state. The child must be killed.
    Resolved(RunResult),
}

/// Startup detection state machine for one trial.
pub struct StartupDetector {
    state: StartupState,
    config: DetectorConfig,
    started_at: Instant,
    output: String,
    stripper: AnsiStripper,
    cleaned: String,
    signals: ReadySignals,
    trust: TrustPrompt,
    versions: VersionPatterns,
    trust_answered: bool,
    session_id: Option<String>,
    result: Option<RunResult>,
}

impl StartupDetector {
    /// `started_at` is the spawn instant all elapsed times are measured from.
    pub fn new(config: DetectorConfig, started_at: Instant) -> Self {
        let trust = TrustPrompt::new(config.trust_prompt_patterns.clone());
        Self {
            state: StartupState::Spawned,
            config,
            started_at,
            output: String::new(),
            stripper: AnsiStripper::default(),
            cleaned: String::new(),
            signals: ReadySignals::default(),
            trust,
            versions: VersionPatterns::new(),
            trust_answered: false,
            session_id: None,
            result: None,
        }
    }

    pub fn state(&self) -> &StartupState {
        &self.state
    }

    pub fn signals(&self) -> ReadySignals {
        self.signals
    }

    /// Raw output accumulated so far.
    pub fn output(&self) -> &str {
        &self.output
    }

    /// ANSI-stripped output accumulated so far.
    pub fn cleaned_output(&self) -> &str {
        &self.cleaned
    }

    pub fn result(&self) -> Option<&RunResult> {
        self.result.as_ref()
    }

    pub fn is_resolved(&self) -> bool {
        self.result.is_some()
    }

    /// The next instant at which `tick()` could resolve the trial.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.is_resolved() {
            return None;
        }
        let timeout_at = self.started_at + self.config.timeout;
        match self.state {
            StartupState::SignalsComplete { at } => {
                Some(timeout_at.min(at + self.config.stabilization_delay))
            }
            _ => Some(timeout_at),
        }
    }

    /// Called when a decoded output chunk arrives from the child.
    pub fn on_output(&mut self, chunk: &str, now: Instant) -> Vec<DetectorEvent> {
        let mut events = Vec::new();
        if self.is_resolved() || chunk.is_empty() {
            return events;
        }

        self.output.push_str(chunk);
        let scan_from = scan_start(&self.cleaned);
        let stripped = self.stripper.push(chunk);
        self.cleaned.push_str(&stripped);

        if self.session_id.is_none() {
            self.session_id = extract_session_id(&self.cleaned[scan_from..]);
            if let Some(ref id) = self.session_id {
                debug!(session_id = %id, "session id observed");
            }
        }

        if !self.trust_answered && matches!(self.state, StartupState::Spawned) {
            if let Some(needle) = self.trust.detect(&self.cleaned[scan_from..]) {
                info!(needle, "trust prompt detected, confirming");
                self.trust_answered = true;
                self.state = StartupState::TrustPromptAnswered;
                events.push(DetectorEvent::TrustPrompt {
                    respond_at: now + self.config.trust_prompt_response_delay,
                });
            }
        }

        if matches!(
            self.state,
            StartupState::SignalsComplete { .. } | StartupState::Resolved(_)
        ) {
            return events;
        }

        // Error check runs before the signal check. The phrase is looked for in
        // the new text; the version may sit anywhere in the output.
        let gate = gate_phrase(&self.cleaned[scan_from..])
            .and_then(|_| self.versions.detect_gate(&self.cleaned));
        if let Some(gate) = gate {
            self.signals.observe(&self.output, chunk);
            let min_version = gate
                .version
                .map(|m| m.version)
                .unwrap_or_else(|| self.config.expected_min_version.clone());
            info!(
                phrase = gate.phrase,
                min_version = %min_version,
                "version gate banner detected"
            );

            let mut result = self.base_result(
                Outcome::ErrorDetected,
                now.saturating_duration_since(self.started_at),
                format!("version gate banner matched \"{}\"", gate.phrase),
            );
            result.min_version_required = Some(min_version);
            result.error_message = Some(gate.message);
            result.raw_output = Some(self.cleaned.clone());
            events.push(DetectorEvent::Resolved(self.resolve(result)));
            return events;
        }

        self.signals.observe(&self.output, chunk);
        if self.signals.is_complete() {
            debug!(
                elapsed_ms = now.saturating_duration_since(self.started_at).as_millis() as u64,
                "all ready signals observed, stabilizing"
            );
            self.state = StartupState::SignalsComplete { at: now };
            events.push(DetectorEvent::SignalsComplete {
                at: now,
                stable_at: now + self.config.stabilization_delay,
            });
        }

        events
    }

    /// Called when the driver wakes up without new output.
    ///
    /// Resolves `Ready` once the stabilization delay has passed, or `Timeout`
    /// once the deadline has passed, whichever was due first.
    pub fn tick(&mut self, now: Instant) -> Option<RunResult> {
        if self.is_resolved() {
            return None;
        }

        let timeout_at = self.started_at + self.config.timeout;
        if let StartupState::SignalsComplete { at } = self.state {
            let stable_at = at + self.config.stabilization_delay;
            if now >= stable_at && stable_at <= timeout_at {
                let result = self.base_result(
                    Outcome::Ready,
                    at.saturating_duration_since(self.started_at),
                    format!(
                        "ready signals observed, process stable for {}ms",
                        self.config.stabilization_delay.as_millis()
                    ),
                );
                return Some(self.resolve(result));
            }
        }

        if now >= timeout_at {
            let result = self.base_result(
                Outcome::Timeout,
                self.config.timeout,
                format!(
                    "no resolution within {}ms",
                    self.config.timeout.as_millis()
                ),
            );
            return Some(self.resolve(result));
        }

        None
    }

    /// Called when the child exits on its own.
    pub fn on_exit(&mut self, exit_code: Option<u32>, now: Instant) -> Option<RunResult> {
        if self.is_resolved() {
            return None;
        }

        let code = exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let (outcome, reason) = if self.signals.prompt() {
            (
                Outcome::UiThenExit,
                format!("prompt rendered, then process exited (code {code})"),
            )
        } else {
            (
                Outcome::ExitedEarly,
                format!("process exited before any prompt (code {code})"),
            )
        };

        let mut result =
            self.base_result(outcome, now.saturating_duration_since(self.started_at), reason);
        result.exit_code = exit_code;
        Some(self.resolve(result))
    }

    /// Resolve the trial as `Failed`. Returns the existing result if the
    /// trial had already resolved.
    pub fn fail(&mut self, reason: impl Into<String>, now: Instant) -> RunResult {
        if let Some(ref existing) = self.result {
            return existing.clone();
        }
        let result = self.base_result(
            Outcome::Failed,
            now.saturating_duration_since(self.started_at),
            reason,
        );
        self.resolve(result)
    }

    fn base_result(
        &self,
        outcome: Outcome,
        elapsed: Duration,
        reason: impl Into<String>,
    ) -> RunResult {
        let mut result = RunResult::new(outcome, elapsed, reason);
        result.signals = self.signals;
        result.session_id = self.session_id.clone();
        result
    }

    fn resolve(&mut self, result: RunResult) -> RunResult {
        info!(
            outcome = %result.outcome,
            elapsed_ms = result.elapsed_ms,
            reason = %result.reason,
            "trial resolved"
        );
        self.state = StartupState::Resolved(result.outcome);
        self.result = Some(result.clone());
        result
    }
}

/// Where the next scan of `cleaned` starts: `SCAN_OVERLAP` bytes back from
/// the end, on a char boundary.
fn scan_start(cleaned: &str) -> usize {
    let mut start = cleaned.len().saturating_sub(SCAN_OVERLAP);
    while !cleaned.is_char_boundary(start) {
        start -= 1;
    }
    start
}
