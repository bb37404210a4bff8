//! Plain spawn timing.
//!
//! Measures how long a program takes to run to completion without a PTY,
//! e.g. `cli --version`. Useful as a baseline next to the interactive
//! startup trials.

use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, warn};

use crate::aggregate::{Stats, summarize};
use crate::result::elapsed_ms;
use crate::target::SpawnConfig;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnTiming {
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

/// Run `spawn` to completion and time it. The process is killed once
/// `timeout` passes. Failing to start the process is an error.
pub fn time_spawn(spawn: &SpawnConfig, timeout: Duration) -> Result<SpawnTiming> {
    let mut cmd = Command::new(&spawn.program);
    cmd.args(&spawn.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if !spawn.work_dir.is_empty() {
        cmd.current_dir(&spawn.work_dir);
    }
    for (key, val) in &spawn.env {
        cmd.env(key, val);
    }

    let started = Instant::now();
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {}", spawn.program))?;

    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                return Ok(SpawnTiming {
                    elapsed_ms: elapsed_ms(started.elapsed()),
                    exit_code: status.code(),
                    timed_out: false,
                });
            }
            Ok(None) => {
                if started.elapsed() >= timeout {
                    warn!(program = %spawn.program, "spawn timing exceeded timeout, killing");
                    if let Err(e) = child.kill() {
                        debug!("kill after timeout failed: {e}");
                    }
                    let status = child
                        .wait()
                        .with_context(|| format!("failed to reap {}", spawn.program))?;
                    return Ok(SpawnTiming {
                        elapsed_ms: elapsed_ms(timeout),
                        exit_code: status.code(),
                        timed_out: true,
                    });
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                let _ = child.kill();
                return Err(e).with_context(|| format!("failed to wait for {}", spawn.program));
            }
        }
    }
}

/// Time `samples` sequential spawns. Stops at the first spawn error.
pub fn time_spawns(
    spawn: &SpawnConfig,
    timeout: Duration,
    samples: u32,
) -> Result<(Vec<SpawnTiming>, Stats)> {
    let mut timings = Vec::with_capacity(samples as usize);
    for _ in 0..samples.max(1) {
        timings.push(time_spawn(spawn, timeout)?);
    }
    let millis: Vec<u64> = timings.iter().map(|t| t.elapsed_ms).collect();
    let stats = summarize(&millis).unwrap_or_default();
    Ok((timings, stats))
}
