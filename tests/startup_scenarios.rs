//! End-to-end startup trials against `sh -c` scripts in a real PTY.
#![cfg(unix)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use serial_test::serial;
use startup_bench::aggregate::{Suite, VersionBench};
use startup_bench::detector::DetectorConfig;
use startup_bench::log::ExecutionLog;
use startup_bench::result::Outcome;
use startup_bench::supervisor::{PtyTrialRunner, TrialConfig, TrialEvent, run_trial};
use startup_bench::target::{SpawnConfig, StaticTargets};

fn sh(script: &str) -> SpawnConfig {
    SpawnConfig::new("sh", Path::new("/tmp")).with_args(vec!["-c".to_string(), script.to_string()])
}

fn detector(timeout: Duration) -> DetectorConfig {
    DetectorConfig {
        timeout,
        ..DetectorConfig::default()
    }
}

#[test]
#[serial]
fn ready_ui_is_detected_after_stabilization() {
    let script = r#"printf '\033[?2004h'; sleep 0.2; printf '\033[?1004h'; printf '> '; sleep 2"#;
    let result = run_trial(
        TrialConfig::new(sh(script), detector(Duration::from_secs(10))),
        None,
        None,
    );

    assert_eq!(result.outcome, Outcome::Ready, "{}", result.reason);
    assert!(result.signals.is_complete());
    // Measured when the prompt appeared, not when stabilization ended.
    assert!(result.elapsed_ms >= 150, "{}", result.elapsed_ms);
    assert!(result.elapsed_ms < 1_500, "{}", result.elapsed_ms);
    assert!(result.exit_code.is_none());
}

#[test]
#[serial]
fn version_gate_banner_is_error_detected() {
    let script = r#"printf 'Error: needs update to v1.0.24 or higher\r\n'; sleep 0.1; exit 1"#;
    let result = run_trial(
        TrialConfig::new(sh(script), detector(Duration::from_secs(10))),
        None,
        None,
    );

    assert_eq!(result.outcome, Outcome::ErrorDetected, "{}", result.reason);
    assert_eq!(result.min_version_required.as_deref(), Some("1.0.24"));
    assert!(
        result
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("needs update"))
    );
}

#[test]
#[serial]
fn banner_printed_right_before_exit_is_error_detected() {
    let script = r#"printf 'Error: needs update to v1.0.24 or higher'; exit 1"#;
    let result = run_trial(
        TrialConfig::new(sh(script), detector(Duration::from_secs(10))),
        None,
        None,
    );

    assert_eq!(result.outcome, Outcome::ErrorDetected, "{}", result.reason);
    assert_eq!(result.min_version_required.as_deref(), Some("1.0.24"));
    assert!(result.exit_code.is_none());
}

#[test]
#[serial]
fn trust_prompt_is_not_answered_once_gate_resolves() {
    let script = r#"printf 'Do you trust the files in this folder?
Error: needs update to v1.0.24 or higher
'; sleep 2"#;
    let (tx, rx) = mpsc::channel();
    let result = run_trial(
        TrialConfig::new(sh(script), detector(Duration::from_secs(10))),
        None,
        Some(tx),
    );

    assert_eq!(result.outcome, Outcome::ErrorDetected, "{}", result.reason);
    assert_eq!(result.min_version_required.as_deref(), Some("1.0.24"));

    let events: Vec<TrialEvent> = rx.try_iter().collect();
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, TrialEvent::TrustPromptAnswered)),
        "{events:?}"
    );
    assert!(matches!(events.last(), Some(TrialEvent::Resolved(_))));
}

#[test]
#[serial]
fn prompt_then_exit_is_ui_then_exit() {
    let result = run_trial(
        TrialConfig::new(sh("printf '> '; exit 1"), detector(Duration::from_secs(10))),
        None,
        None,
    );

    assert_eq!(result.outcome, Outcome::UiThenExit, "{}", result.reason);
    assert_eq!(result.exit_code, Some(1));
    assert!(result.signals.prompt());
    assert!(!result.signals.bracketed_paste());
}

#[test]
#[serial]
fn suite_runs_each_version_with_fresh_trials() {
    let tmp = tempfile::tempdir().unwrap();
    let log_path = tmp.path().join("bench.jsonl");
    let log = Arc::new(ExecutionLog::new(&log_path).unwrap());

    let ready = tmp.path().join("ready.sh");
    std::fs::write(
        &ready,
        "#!/bin/sh\nprintf '\\033[?2004h\\033[?1004h> '\nsleep 2\n",
    )
    .unwrap();
    let gated = tmp.path().join("gated.sh");
    std::fs::write(
        &gated,
        "#!/bin/sh\nprintf 'This version requires 2.1.0\\r\\n'\nsleep 2\n",
    )
    .unwrap();
    for script in [&ready, &gated] {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(script, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    let mut table = BTreeMap::new();
    table.insert("2.1.0".to_string(), ready.to_string_lossy().to_string());
    table.insert("2.0.0".to_string(), gated.to_string_lossy().to_string());
    let resolver = StaticTargets::new(table, tmp.path());

    let runner =
        PtyTrialRunner::new(detector(Duration::from_secs(10))).with_log(Arc::clone(&log));
    let bench = VersionBench::new(&runner, 2).with_log(log);
    let report = Suite::new(bench, &resolver).run(&["2.1.0".to_string(), "2.0.0".to_string()]);

    assert_eq!(report.succeeded.len(), 1);
    let ready_summary = &report.succeeded[0];
    assert_eq!(ready_summary.version, "2.1.0");
    assert_eq!(ready_summary.runs.len(), 2);
    assert!(ready_summary.is_fully_successful());

    assert_eq!(report.failed.len(), 1);
    let gated_summary = report.failed[0].summary.as_ref().unwrap();
    assert_eq!(gated_summary.primary_outcome, Outcome::ErrorDetected);
    assert_eq!(
        gated_summary.runs[0].min_version_required.as_deref(),
        Some("2.1.0")
    );

    let contents = std::fs::read_to_string(&log_path).unwrap();
    let resolved = contents
        .lines()
        .filter(|l| l.contains("\"event\":\"trial_resolved\""))
        .count();
    assert_eq!(resolved, 4);
}
