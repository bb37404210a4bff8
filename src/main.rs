mod cli;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use cli::{BenchArgs, Cli, Command};
use startup_bench::aggregate::{Suite, VersionBench};
use startup_bench::config::BenchConfig;
use startup_bench::log::ExecutionLog;
use startup_bench::report;
use startup_bench::spawn_timing::time_spawns;
use startup_bench::supervisor::PtyTrialRunner;
use startup_bench::target::{ChainedResolver, InstallRootTargets, SpawnConfig, TargetResolver};

/// Effective settings for one benchmarking command.
struct BenchPlan {
    samples: u32,
    timeout: Duration,
    work_dir: PathBuf,
    json: bool,
}

impl BenchPlan {
    fn new(args: &BenchArgs, config: &BenchConfig, cwd: &Path) -> Self {
        Self {
            samples: args.samples.unwrap_or(config.bench.samples).max(1),
            timeout: args
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.timeout()),
            work_dir: args.cwd.clone().unwrap_or_else(|| cwd.to_path_buf()),
            json: args.json,
        }
    }
}

fn install_interrupt_handler() -> Result<Arc<AtomicBool>> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            // Second Ctrl-C: give up immediately.
            std::process::exit(130);
        }
        eprintln!("[startup-bench] interrupted, stopping after the current trial");
    })
    .context("failed to install Ctrl-C handler")?;
    Ok(interrupted)
}

fn open_log(path: Option<&Path>) -> Result<Option<Arc<ExecutionLog>>> {
    match path {
        Some(path) => {
            let log = ExecutionLog::new(path)?;
            info!(path = %log.path().display(), "writing execution log");
            Ok(Some(Arc::new(log)))
        }
        None => Ok(None),
    }
}

fn status_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let is_config_command = matches!(&cli.command, Command::Config { .. });

    let filter = match cli.verbose {
        0 if is_config_command => "startup_bench=warn",
        0 => "startup_bench=info",
        1 => "startup_bench=debug",
        _ => "startup_bench=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (config, config_path) = BenchConfig::load(&cwd)?;

    if !is_config_command || cli.verbose > 0 {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no .startup-bench/config.toml found, using defaults"),
        }
    }

    match cli.command {
        Command::Run {
            executable,
            label,
            bench,
            args,
        } => {
            let plan = BenchPlan::new(&bench, &config, &cwd);
            let interrupted = install_interrupt_handler()?;
            let log = open_log(cli.log.as_deref())?;

            let mut runner = PtyTrialRunner::new(config.detector.to_detector_config(plan.timeout))
                .with_cancel(Arc::clone(&interrupted));
            if let Some(ref log) = log {
                runner = runner.with_log(Arc::clone(log));
            }
            let mut version_bench =
                VersionBench::new(&runner, plan.samples).with_cancel(interrupted);
            if let Some(log) = log {
                version_bench = version_bench.with_log(log);
            }

            let mut trial_args = config.bench.args.clone();
            trial_args.extend(args);
            let spawn = SpawnConfig::new(&executable, &plan.work_dir).with_args(trial_args);
            let version = label.unwrap_or(executable);

            let summary = version_bench.run(&version, &spawn);
            if plan.json {
                println!("{}", report::to_json(&summary)?);
            } else {
                print!("{}", report::render_summary_human(&summary));
            }
            Ok(status_code(summary.is_fully_successful()))
        }
        Command::Suite {
            versions,
            install_root,
            binary,
            bench,
        } => {
            let plan = BenchPlan::new(&bench, &config, &cwd);
            let interrupted = install_interrupt_handler()?;
            let log = open_log(cli.log.as_deref())?;

            let mut resolvers: Vec<Box<dyn TargetResolver>> =
                vec![Box::new(config.resolver(&plan.work_dir))];
            if let Some(root) = install_root {
                let binary = binary
                    .or_else(|| config.install.binary.clone())
                    .context("--install-root needs --binary (or install.binary in config)")?;
                resolvers.push(Box::new(
                    InstallRootTargets::new(&root, &binary, &plan.work_dir)
                        .with_args(config.bench.args.clone()),
                ));
            }
            let resolver = ChainedResolver::new(resolvers);

            let mut runner = PtyTrialRunner::new(config.detector.to_detector_config(plan.timeout))
                .with_cancel(Arc::clone(&interrupted));
            if let Some(ref log) = log {
                runner = runner.with_log(Arc::clone(log));
            }
            let mut version_bench =
                VersionBench::new(&runner, plan.samples).with_cancel(interrupted);
            if let Some(log) = log {
                version_bench = version_bench.with_log(log);
            }

            let suite_report = Suite::new(version_bench, &resolver).run(&versions);
            if plan.json {
                println!("{}", report::to_json(&suite_report)?);
            } else {
                print!("{}", report::render_suite_human(&suite_report));
            }
            Ok(status_code(suite_report.is_success()))
        }
        Command::Spawn {
            executable,
            bench,
            args,
        } => {
            let plan = BenchPlan::new(&bench, &config, &cwd);
            let spawn = SpawnConfig::new(&executable, &plan.work_dir).with_args(args);
            let (timings, stats) = time_spawns(&spawn, plan.timeout, plan.samples)?;

            let timed_out = timings.iter().any(|t| t.timed_out);
            if timed_out {
                warn!(program = %executable, "at least one spawn timed out");
            }
            if plan.json {
                let payload = serde_json::json!({
                    "program": executable,
                    "timings": timings,
                    "stats": stats,
                });
                println!("{}", report::to_json(&payload)?);
            } else {
                print!("{}", report::render_spawn_human(&executable, &timings, &stats));
            }
            Ok(status_code(!timed_out))
        }
        Command::Config { json } => {
            if json {
                println!(
                    "{}",
                    report::render_config_json(&config, config_path.as_deref())?
                );
            } else {
                print!(
                    "{}",
                    report::render_config_human(&config, config_path.as_deref())
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
