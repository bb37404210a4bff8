//! Human-readable and JSON rendering of benchmark results.

use std::fmt::Display;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::aggregate::{Stats, SuiteReport, VersionBenchmarkSummary};
use crate::config::BenchConfig;
use crate::result::RunResult;
use crate::spawn_timing::SpawnTiming;

fn push_kv(output: &mut String, key: &str, value: impl Display) {
    output.push_str(&format!("  {key:<20} {value}\n"));
}

fn join_or_none(values: &[String]) -> String {
    if values.is_empty() {
        "(none)".to_string()
    } else {
        values.join(", ")
    }
}

pub fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).context("failed to serialize report to JSON")
}

fn render_run_line(output: &mut String, index: usize, run: &RunResult) {
    output.push_str(&format!(
        "  #{:<3} {:<15} {:>8} ms  {}\n",
        index + 1,
        run.outcome.label(),
        run.elapsed_ms,
        run.reason
    ));
    if let Some(ref version) = run.min_version_required {
        output.push_str(&format!("        requires version {version}\n"));
    }
    if let Some(code) = run.exit_code {
        output.push_str(&format!("        exit code {code}\n"));
    }
    if let Some(ref session) = run.session_id {
        output.push_str(&format!("        session {session}\n"));
    }
}

pub fn render_summary_human(summary: &VersionBenchmarkSummary) -> String {
    let mut output = String::new();
    output.push_str(&format!("Version {}\n", summary.version));
    push_kv(&mut output, "outcome", summary.primary_outcome);
    push_kv(&mut output, "runs", summary.runs.len());
    push_kv(&mut output, "avg", format!("{:.1} ms", summary.avg_ms));
    push_kv(&mut output, "min", format!("{:.0} ms", summary.min_ms));
    push_kv(&mut output, "max", format!("{:.0} ms", summary.max_ms));
    push_kv(&mut output, "std_dev", format!("{:.1} ms", summary.std_dev_ms));
    if !summary.consistent {
        let counts: Vec<String> = summary
            .outcome_counts
            .iter()
            .map(|(outcome, count)| format!("{outcome}={count}"))
            .collect();
        push_kv(&mut output, "outcomes", counts.join(", "));
    }
    output.push('\n');

    output.push_str("Runs\n");
    for (i, run) in summary.runs.iter().enumerate() {
        render_run_line(&mut output, i, run);
    }
    output
}

pub fn render_suite_human(report: &SuiteReport) -> String {
    let mut output = String::new();
    output.push_str("Succeeded\n");
    if report.succeeded.is_empty() {
        push_kv(&mut output, "versions", "(none)");
    }
    for summary in &report.succeeded {
        push_kv(
            &mut output,
            &summary.version,
            format!(
                "{:.1} ms avg (min {:.0}, max {:.0}, sd {:.1})",
                summary.avg_ms, summary.min_ms, summary.max_ms, summary.std_dev_ms
            ),
        );
    }
    output.push('\n');

    output.push_str("Failed\n");
    if report.failed.is_empty() {
        push_kv(&mut output, "versions", "(none)");
    }
    for failure in &report.failed {
        push_kv(&mut output, &failure.version, &failure.reason);
    }
    output.push('\n');

    let wall = report.finished_at - report.started_at;
    push_kv(
        &mut output,
        "total",
        format!(
            "{} attempted in {:.1}s",
            report.attempted(),
            wall.num_milliseconds() as f64 / 1000.0
        ),
    );
    output
}

pub fn render_spawn_human(program: &str, timings: &[SpawnTiming], stats: &Stats) -> String {
    let mut output = String::new();
    output.push_str(&format!("Spawn {program}\n"));
    for (i, timing) in timings.iter().enumerate() {
        let status = if timing.timed_out {
            "timed out".to_string()
        } else {
            match timing.exit_code {
                Some(code) => format!("exit {code}"),
                None => "killed".to_string(),
            }
        };
        output.push_str(&format!(
            "  #{:<3} {:>8} ms  {status}\n",
            i + 1,
            timing.elapsed_ms
        ));
    }
    push_kv(&mut output, "avg", format!("{:.1} ms", stats.avg_ms));
    push_kv(&mut output, "std_dev", format!("{:.1} ms", stats.std_dev_ms));
    output
}

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults, no .startup-bench/config.toml found)".to_string())
}

pub fn render_config_human(config: &BenchConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    output.push_str("Bench\n");
    push_kv(&mut output, "samples", config.bench.samples);
    push_kv(&mut output, "timeout", format!("{}ms", config.bench.timeout_ms));
    push_kv(&mut output, "args", join_or_none(&config.bench.args));
    output.push('\n');

    output.push_str("Detector\n");
    push_kv(
        &mut output,
        "stabilization_delay",
        format!("{}ms", config.detector.stabilization_delay_ms),
    );
    push_kv(
        &mut output,
        "trust_prompt_delay",
        format!("{}ms", config.detector.trust_prompt_response_delay_ms),
    );
    push_kv(
        &mut output,
        "min_version",
        &config.detector.expected_min_version,
    );
    push_kv(
        &mut output,
        "trust_patterns",
        join_or_none(&config.detector.trust_prompt_patterns),
    );
    output.push('\n');

    output.push_str("Targets\n");
    if config.targets.is_empty() {
        push_kv(&mut output, "entries", "(none)");
    } else {
        for (version, program) in &config.targets {
            output.push_str(&format!("  - {version} => {program}\n"));
        }
    }
    output.push('\n');

    output.push_str("Install\n");
    push_kv(
        &mut output,
        "root",
        config
            .install
            .root
            .as_ref()
            .map_or_else(|| "(none)".to_string(), |p| p.display().to_string()),
    );
    push_kv(
        &mut output,
        "binary",
        config
            .install
            .binary
            .as_ref()
            .map_or_else(|| "(none)".to_string(), |p| p.display().to_string()),
    );
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

pub fn render_config_json(config: &BenchConfig, config_path: Option<&Path>) -> Result<String> {
    let payload = serde_json::json!({
        "bench": &config.bench,
        "detector": &config.detector,
        "targets": &config.targets,
        "install": &config.install,
        "source_path": config_source_label(config_path)
    });

    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}
