//! Run aggregation.
//!
//! A version is benchmarked by running N fresh trials one after another and
//! folding their elapsed times into summary statistics. A suite does that for
//! a list of versions and sorts each into succeeded or failed. Trials never
//! run in parallel: driving several PTYs from one process interferes.
//!
//! Nothing in here returns an error. A trial that panics becomes a `Failed`
//! run, a version that cannot be resolved becomes a failed entry, and the
//! suite always reports every version it attempted.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::log::{ExecutionLog, LogEvent};
use crate::result::{Outcome, RunResult};
use crate::target::{SpawnConfig, TargetResolver};

/// Default number of trials per version.
pub const DEFAULT_SAMPLES: u32 = 3;

/// Runs a single startup trial. Implementations must not share state
/// between trials.
pub trait TrialRunner {
    fn run_trial(&self, version: &str, trial: u32, spawn: &SpawnConfig) -> RunResult;
}

/// Summary statistics over a set of millisecond samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    /// Population standard deviation.
    pub std_dev_ms: f64,
}

/// Mean, min, max and population standard deviation. `None` for no samples.
pub fn summarize(samples: &[u64]) -> Option<Stats> {
    if samples.is_empty() {
        return None;
    }
    let n = samples.len() as f64;
    let values = samples.iter().map(|&s| s as f64);
    let avg = values.clone().sum::<f64>() / n;
    let variance = values.clone().map(|v| (v - avg).powi(2)).sum::<f64>() / n;

    Some(Stats {
        avg_ms: avg,
        min_ms: values.clone().fold(f64::INFINITY, f64::min),
        max_ms: values.fold(f64::NEG_INFINITY, f64::max),
        std_dev_ms: variance.sqrt(),
    })
}

/// Benchmark summary for one version.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionBenchmarkSummary {
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub runs: Vec<RunResult>,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub std_dev_ms: f64,
    /// Outcome of the first run.
    pub primary_outcome: Outcome,
    /// How often each outcome occurred.
    pub outcome_counts: BTreeMap<Outcome, usize>,
    /// Every run shares the primary outcome.
    pub consistent: bool,
}

impl VersionBenchmarkSummary {
    pub fn from_runs(version: impl Into<String>, runs: Vec<RunResult>) -> Self {
        Self::from_runs_at(version, Utc::now(), runs)
    }

    pub fn from_runs_at(
        version: impl Into<String>,
        timestamp: DateTime<Utc>,
        runs: Vec<RunResult>,
    ) -> Self {
        let samples: Vec<u64> = runs.iter().map(|r| r.elapsed_ms).collect();
        let stats = summarize(&samples).unwrap_or_default();
        let primary_outcome = runs.first().map_or(Outcome::Failed, |r| r.outcome);

        let mut outcome_counts = BTreeMap::new();
        for run in &runs {
            *outcome_counts.entry(run.outcome).or_insert(0) += 1;
        }
        let consistent = runs.iter().all(|r| r.outcome == primary_outcome);

        Self {
            version: version.into(),
            timestamp,
            runs,
            avg_ms: stats.avg_ms,
            min_ms: stats.min_ms,
            max_ms: stats.max_ms,
            std_dev_ms: stats.std_dev_ms,
            primary_outcome,
            outcome_counts,
            consistent,
        }
    }

    /// Every run reached `Ready`.
    pub fn is_fully_successful(&self) -> bool {
        !self.runs.is_empty() && self.runs.iter().all(RunResult::is_ready)
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.outcome_counts.get(&outcome).copied().unwrap_or(0)
    }
}

/// Runs trials for one version and folds them into a summary.
pub struct VersionBench<'a> {
    runner: &'a dyn TrialRunner,
    samples: u32,
    cancel: Option<Arc<AtomicBool>>,
    log: Option<Arc<ExecutionLog>>,
}

impl<'a> VersionBench<'a> {
    pub fn new(runner: &'a dyn TrialRunner, samples: u32) -> Self {
        Self {
            runner,
            samples: samples.max(1),
            cancel: None,
            log: None,
        }
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_log(mut self, log: Arc<ExecutionLog>) -> Self {
        self.log = Some(log);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    fn record(&self, event: LogEvent) {
        if let Some(ref log) = self.log {
            if let Err(e) = log.log(event) {
                warn!("failed to write execution log: {e:#}");
            }
        }
    }

    /// Run the trials sequentially. Stops early (keeping the runs so far)
    /// once cancelled, but always runs at least one trial.
    pub fn run(&self, version: &str, spawn: &SpawnConfig) -> VersionBenchmarkSummary {
        let mut runs = Vec::with_capacity(self.samples as usize);

        for trial in 1..=self.samples {
            if trial > 1 && self.cancelled() {
                warn!(version, completed = runs.len(), "interrupted, skipping remaining trials");
                break;
            }

            self.record(LogEvent::TrialStarted {
                version: version.to_string(),
                trial,
                program: spawn.program.clone(),
            });
            let result = self.run_guarded(version, trial, spawn);
            info!(
                version,
                trial,
                outcome = %result.outcome,
                elapsed_ms = result.elapsed_ms,
                "trial finished"
            );
            runs.push(result);
        }

        let summary = VersionBenchmarkSummary::from_runs(version, runs);
        if !summary.consistent {
            warn!(
                version,
                primary = %summary.primary_outcome,
                "trials disagree on outcome; summary reports the first run"
            );
        }
        self.record(LogEvent::VersionSummarized {
            version: summary.version.clone(),
            runs: summary.runs.len(),
            avg_ms: summary.avg_ms,
            std_dev_ms: summary.std_dev_ms,
            primary_outcome: summary.primary_outcome.to_string(),
        });
        summary
    }

    fn run_guarded(&self, version: &str, trial: u32, spawn: &SpawnConfig) -> RunResult {
        let started = Instant::now();
        panic::catch_unwind(AssertUnwindSafe(|| {
            self.runner.run_trial(version, trial, spawn)
        }))
        .unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            warn!(version, trial, "trial panicked: {message}");
            RunResult::failed(started.elapsed(), format!("trial panicked: {message}"))
        })
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A version that did not produce a successful benchmark.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionFailure {
    pub version: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<VersionBenchmarkSummary>,
}

/// Result of a multi-version suite.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: Vec<VersionBenchmarkSummary>,
    pub failed: Vec<VersionFailure>,
}

impl SuiteReport {
    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Benchmarks a list of versions one after another.
pub struct Suite<'a> {
    bench: VersionBench<'a>,
    resolver: &'a dyn TargetResolver,
}

impl<'a> Suite<'a> {
    pub fn new(bench: VersionBench<'a>, resolver: &'a dyn TargetResolver) -> Self {
        Self { bench, resolver }
    }

    pub fn run(&self, versions: &[String]) -> SuiteReport {
        let started_at = Utc::now();
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();

        self.bench.record(LogEvent::SuiteStarted {
            versions: versions.to_vec(),
        });

        for version in versions {
            if self.bench.cancelled() {
                failed.push(VersionFailure {
                    version: version.clone(),
                    reason: "interrupted before start".to_string(),
                    summary: None,
                });
                continue;
            }

            let spawn = match self.resolver.resolve(version) {
                Ok(spawn) => spawn,
                Err(e) => {
                    warn!(version = %version, "cannot resolve target: {e}");
                    self.bench.record(LogEvent::VersionFailed {
                        version: version.clone(),
                        reason: e.to_string(),
                    });
                    failed.push(VersionFailure {
                        version: version.clone(),
                        reason: e.to_string(),
                        summary: None,
                    });
                    continue;
                }
            };

            let summary = self.bench.run(version, &spawn);
            if summary.primary_outcome == Outcome::Ready {
                succeeded.push(summary);
            } else {
                let reason = summary
                    .runs
                    .first()
                    .map(|r| format!("{}: {}", r.outcome, r.reason))
                    .unwrap_or_else(|| "no runs".to_string());
                self.bench.record(LogEvent::VersionFailed {
                    version: version.clone(),
                    reason: reason.clone(),
                });
                failed.push(VersionFailure {
                    version: version.clone(),
                    reason,
                    summary: Some(summary),
                });
            }
        }

        let report = SuiteReport {
            started_at,
            finished_at: Utc::now(),
            succeeded,
            failed,
        };
        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "suite finished"
        );
        self.bench.record(LogEvent::SuiteCompleted {
            succeeded: report.succeeded.len(),
            failed: report.failed.len(),
        });
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{ResolveError, StaticTargets};
    use std::cell::RefCell;
    use std::path::Path;
    use std::time::Duration;

    /// Replays scripted outcomes and records what it was asked to run.
    struct ScriptedRunner {
        script: RefCell<Vec<(Outcome, u64)>>,
        calls: RefCell<Vec<(String, u32)>>,
    }

    impl ScriptedRunner {
        fn new(script: Vec<(Outcome, u64)>) -> Self {
            Self {
                script: RefCell::new(script.into_iter().rev().collect()),
                calls: RefCell::new(vec![]),
            }
        }
    }

    impl TrialRunner for ScriptedRunner {
        fn run_trial(&self, version: &str, trial: u32, _spawn: &SpawnConfig) -> RunResult {
            self.calls.borrow_mut().push((version.to_string(), trial));
            let (outcome, ms) = self
                .script
                .borrow_mut()
                .pop()
                .unwrap_or((Outcome::Ready, 100));
            RunResult::new(outcome, Duration::from_millis(ms), "scripted")
        }
    }

    struct PanickingRunner;

    impl TrialRunner for PanickingRunner {
        fn run_trial(&self, _version: &str, _trial: u32, _spawn: &SpawnConfig) -> RunResult {
            panic!("malformed chunk");
        }
    }

    fn spawn() -> SpawnConfig {
        SpawnConfig::new("cli", Path::new("/tmp"))
    }

    fn run(ms: u64, outcome: Outcome) -> RunResult {
        RunResult::new(outcome, Duration::from_millis(ms), "test")
    }

    #[test]
    fn summarize_matches_known_values() {
        let stats = summarize(&[100, 200, 300]).unwrap();
        assert_eq!(stats.avg_ms, 200.0);
        assert_eq!(stats.min_ms, 100.0);
        assert_eq!(stats.max_ms, 300.0);
        assert!((stats.std_dev_ms - 81.6497).abs() < 0.001);
    }

    #[test]
    fn summarize_single_sample_has_zero_spread() {
        let stats = summarize(&[42]).unwrap();
        assert_eq!(stats.avg_ms, 42.0);
        assert_eq!(stats.std_dev_ms, 0.0);
    }

    #[test]
    fn summarize_empty_is_none() {
        assert!(summarize(&[]).is_none());
    }

    #[test]
    fn summary_uses_first_run_as_primary() {
        let summary = VersionBenchmarkSummary::from_runs(
            "1.0.24",
            vec![
                run(100, Outcome::Ready),
                run(200, Outcome::Timeout),
                run(300, Outcome::Ready),
            ],
        );
        assert_eq!(summary.primary_outcome, Outcome::Ready);
        assert!(!summary.consistent);
        assert_eq!(summary.count(Outcome::Ready), 2);
        assert_eq!(summary.count(Outcome::Timeout), 1);
        assert_eq!(summary.count(Outcome::Failed), 0);
        assert!(!summary.is_fully_successful());
        assert_eq!(summary.avg_ms, 200.0);
    }

    #[test]
    fn summary_serializes_outcome_counts_by_label() {
        let summary = VersionBenchmarkSummary::from_runs("1.0.0", vec![run(10, Outcome::UiThenExit)]);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["primaryOutcome"], "ui_then_exit");
        assert_eq!(json["outcomeCounts"]["ui_then_exit"], 1);
        assert_eq!(json["runs"][0]["elapsedMs"], 10);
        assert!(json["stdDevMs"].is_number());
    }

    #[test]
    fn version_bench_runs_samples_sequentially() {
        let runner = ScriptedRunner::new(vec![
            (Outcome::Ready, 100),
            (Outcome::Ready, 200),
            (Outcome::Ready, 300),
        ]);
        let summary = VersionBench::new(&runner, 3).run("1.0.24", &spawn());

        assert_eq!(
            *runner.calls.borrow(),
            vec![
                ("1.0.24".to_string(), 1),
                ("1.0.24".to_string(), 2),
                ("1.0.24".to_string(), 3)
            ]
        );
        assert_eq!(summary.runs.len(), 3);
        assert_eq!(summary.min_ms, 100.0);
        assert_eq!(summary.max_ms, 300.0);
        assert!(summary.is_fully_successful());
        assert!(summary.consistent);
    }

    #[test]
    fn zero_samples_still_runs_once() {
        let runner = ScriptedRunner::new(vec![]);
        let summary = VersionBench::new(&runner, 0).run("1.0.0", &spawn());
        assert_eq!(summary.runs.len(), 1);
    }

    #[test]
    fn failed_trials_still_count() {
        let runner = ScriptedRunner::new(vec![(Outcome::Failed, 5), (Outcome::Ready, 95)]);
        let summary = VersionBench::new(&runner, 2).run("1.0.0", &spawn());
        assert_eq!(summary.runs.len(), 2);
        assert_eq!(summary.avg_ms, 50.0);
        assert_eq!(summary.primary_outcome, Outcome::Failed);
    }

    #[test]
    fn panicking_trial_becomes_failed() {
        let runner = PanickingRunner;
        let summary = VersionBench::new(&runner, 2).run("1.0.0", &spawn());
        assert_eq!(summary.runs.len(), 2);
        assert!(summary.runs.iter().all(|r| r.outcome == Outcome::Failed));
        assert!(summary.runs[0].reason.contains("malformed chunk"));
    }

    #[test]
    fn cancellation_stops_after_current_trial() {
        let runner = ScriptedRunner::new(vec![]);
        let cancel = Arc::new(AtomicBool::new(true));
        let summary = VersionBench::new(&runner, 5)
            .with_cancel(cancel)
            .run("1.0.0", &spawn());
        assert_eq!(summary.runs.len(), 1);
    }

    #[test]
    fn suite_partitions_versions() {
        let runner = ScriptedRunner::new(vec![
            (Outcome::Ready, 100),
            (Outcome::ErrorDetected, 40),
        ]);
        let mut table = BTreeMap::new();
        table.insert("1.0.30".to_string(), "cli-30".to_string());
        table.insert("0.2.0".to_string(), "cli-02".to_string());
        let resolver = StaticTargets::new(table, Path::new("/tmp"));

        let suite = Suite::new(VersionBench::new(&runner, 1), &resolver);
        let report = suite.run(&[
            "1.0.30".to_string(),
            "0.2.0".to_string(),
            "9.9.9".to_string(),
        ]);

        assert_eq!(report.attempted(), 3);
        assert!(!report.is_success());
        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.succeeded[0].version, "1.0.30");

        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.failed[0].version, "0.2.0");
        assert!(report.failed[0].reason.starts_with("error_detected"));
        assert!(report.failed[0].summary.is_some());
        assert_eq!(report.failed[1].version, "9.9.9");
        assert!(report.failed[1].summary.is_none());
        assert_eq!(
            report.failed[1].reason,
            ResolveError::Unknown("9.9.9".to_string()).to_string()
        );
    }

    #[test]
    fn suite_writes_execution_log() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("suite.jsonl");
        let log = Arc::new(ExecutionLog::new(&log_path).unwrap());

        let runner = ScriptedRunner::new(vec![]);
        let mut table = BTreeMap::new();
        table.insert("1.0.0".to_string(), "cli".to_string());
        let resolver = StaticTargets::new(table, Path::new("/tmp"));
        let suite = Suite::new(VersionBench::new(&runner, 2).with_log(log), &resolver);
        suite.run(&["1.0.0".to_string()]);

        let contents = std::fs::read_to_string(&log_path).unwrap();
        let events: Vec<String> = contents
            .lines()
            .map(|l| {
                let v: serde_json::Value = serde_json::from_str(l).unwrap();
                v["event"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(
            events,
            vec![
                "suite_started",
                "trial_started",
                "trial_started",
                "version_summarized",
                "suite_completed"
            ]
        );
    }
}
