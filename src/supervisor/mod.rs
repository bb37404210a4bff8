//! PTY trial driver.
//!
//! Spawns the target in a pseudo-terminal, streams its output into the
//! startup detector, answers the trust prompt, and kills the child once the
//! detector resolves. One driver thread per trial owns the child and polls it
//! for exit; a reader thread forwards PTY output over a channel, and the
//! driver waits on that channel with a timeout equal to the nearest pending
//! deadline.

mod decode;

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use portable_pty::{Child, CommandBuilder, PtySize, native_pty_system};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

pub use decode::Utf8Decoder;

use crate::aggregate::TrialRunner;
use crate::detector::{DetectorConfig, DetectorEvent, StartupDetector};
use crate::log::{ExecutionLog, LogEvent};
use crate::result::{RunResult, elapsed_ms};
use crate::target::SpawnConfig;

/// How long to keep reading after the child exits, so output written just
/// before exit is classified before the exit itself.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Upper bound on a single wait, so interrupts are noticed promptly.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on a single wait while the child is still running.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Bytes sent to confirm the trust prompt.
const TRUST_PROMPT_RESPONSE: &[u8] = b"\r";

#[derive(Debug, Error)]
pub enum TrialError {
    #[error("executable not found: {path}")]
    NotFound {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("not an executable file: {path}")]
    NotExecutable { path: String },
    #[error("PTY error: {0}")]
    Pty(String),
}

/// Events emitted during a trial for logging/audit.
#[derive(Debug, Clone)]
pub enum TrialEvent {
    /// The child process is running.
    Spawned { program: String, pid: Option<u32> },
    /// The trust prompt confirmation was written to the child.
    TrustPromptAnswered,
    /// All ready signals seen; stabilization started.
    SignalsComplete { elapsed_ms: u64 },
    /// The trial resolved.
    Resolved(RunResult),
}

/// Configuration for one trial.
#[derive(Debug, Clone)]
pub struct TrialConfig {
    pub spawn: SpawnConfig,
    pub detector: DetectorConfig,
    pub pty_size: PtySize,
}

impl TrialConfig {
    pub fn new(spawn: SpawnConfig, detector: DetectorConfig) -> Self {
        Self {
            spawn,
            detector,
            pty_size: default_pty_size(),
        }
    }
}

pub fn default_pty_size() -> PtySize {
    PtySize {
        rows: 24,
        cols: 80,
        pixel_width: 0,
        pixel_height: 0,
    }
}

enum PtyMessage {
    Output(Vec<u8>),
    Eof,
}

/// Owns the target process until it is reaped.
///
/// A reaped child is never signalled again, so a recycled pid is safe.
/// Dropping an unreaped child terminates it.
struct ChildGuard {
    child: Box<dyn Child + Send + Sync>,
    reaped: bool,
}

impl ChildGuard {
    fn new(child: Box<dyn Child + Send + Sync>) -> Self {
        Self {
            child,
            reaped: false,
        }
    }

    fn process_id(&self) -> Option<u32> {
        self.child.process_id()
    }

    /// Non-blocking exit check. Returns the exit code once the child has
    /// exited and been reaped.
    fn try_exit(&mut self) -> Option<Option<u32>> {
        if self.reaped {
            return None;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.reaped = true;
                Some(Some(status.exit_code()))
            }
            Ok(None) => None,
            Err(e) => {
                debug!("failed to poll target process: {e}");
                self.reaped = true;
                Some(None)
            }
        }
    }

    /// Stop and reap a child that is still running. Returns whether a signal
    /// was sent.
    ///
    /// portable-pty sends SIGHUP first and escalates to SIGKILL when the
    /// child is still alive after a short grace.
    fn terminate(&mut self) -> bool {
        if self.reaped {
            return false;
        }
        self.reaped = true;
        if let Err(e) = self.child.kill() {
            debug!("kill after resolution failed (process likely exited): {e}");
        }
        if let Err(e) = self.child.wait() {
            debug!("failed to reap target process: {e}");
        }
        true
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Run one startup trial to its terminal result.
///
/// Never returns an error: spawn failures and I/O errors are reported as a
/// `Failed` result. `cancel` aborts the trial (as `Failed`) when set.
/// `event_tx` receives trial events for logging/audit.
pub fn run_trial(
    config: TrialConfig,
    cancel: Option<&AtomicBool>,
    event_tx: Option<mpsc::Sender<TrialEvent>>,
) -> RunResult {
    let started = Instant::now();
    let result = match drive_trial(&config, started, cancel, event_tx.as_ref()) {
        Ok(result) => result,
        Err(e) => {
            warn!(program = %config.spawn.program, "trial failed: {e}");
            RunResult::failed(started.elapsed(), e.to_string())
        }
    };

    if let Some(ref tx) = event_tx {
        let _ = tx.send(TrialEvent::Resolved(result.clone()));
    }
    result
}

fn drive_trial(
    config: &TrialConfig,
    started: Instant,
    cancel: Option<&AtomicBool>,
    event_tx: Option<&mpsc::Sender<TrialEvent>>,
) -> Result<RunResult, TrialError> {
    let mut detector = StartupDetector::new(config.detector.clone(), started);

    check_executable(&config.spawn)?;

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(config.pty_size)
        .map_err(|e| TrialError::Pty(format!("failed to open PTY: {e:#}")))?;

    let mut cmd = CommandBuilder::new(&config.spawn.program);
    for arg in &config.spawn.args {
        cmd.arg(arg);
    }
    if !config.spawn.work_dir.is_empty() {
        cmd.cwd(&config.spawn.work_dir);
    }
    for (key, val) in &config.spawn.env {
        cmd.env(key, val);
    }

    info!(
        program = %config.spawn.program,
        work_dir = %config.spawn.work_dir,
        "spawning target in PTY"
    );

    let mut child = match pair.slave.spawn_command(cmd) {
        Ok(child) => ChildGuard::new(child),
        Err(e) => {
            warn!(program = %config.spawn.program, "spawn failed: {e:#}");
            return Ok(detector.fail(
                format!("failed to spawn {}: {e:#}", config.spawn.program),
                Instant::now(),
            ));
        }
    };

    // Only the master side is used from here on.
    drop(pair.slave);

    let pid = child.process_id();
    if let Some(tx) = event_tx {
        let _ = tx.send(TrialEvent::Spawned {
            program: config.spawn.program.clone(),
            pid,
        });
    }

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| TrialError::Pty(format!("failed to clone PTY reader: {e:#}")))?;
    let mut writer = pair
        .master
        .take_writer()
        .map_err(|e| TrialError::Pty(format!("failed to take PTY writer: {e:#}")))?;

    // `pty_tx` outlives the reader so `rx` never disconnects while the child runs.
    let (pty_tx, rx) = mpsc::channel::<PtyMessage>();

    let output_tx = pty_tx.clone();
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if output_tx.send(PtyMessage::Output(buf[..n].to_vec())).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!("PTY read error (process likely exited): {e}");
                    break;
                }
            }
        }
        let _ = output_tx.send(PtyMessage::Eof);
    });

    let mut decoder = Utf8Decoder::default();
    let mut trust_write_due: Option<Instant> = None;
    let mut exited: Option<(Option<u32>, Instant)> = None;
    let mut eof = false;

    let result = loop {
        let now = Instant::now();

        if exited.is_none() {
            if let Some(code) = child.try_exit() {
                debug!(?code, "target process exited");
                exited = Some((code, now));
            }
        }
        if let Some((code, seen_at)) = exited {
            if eof || now >= seen_at + EXIT_DRAIN_GRACE {
                detector.on_exit(code, seen_at);
            }
        }
        if let Some(result) = detector.result() {
            break result.clone();
        }

        if trust_write_due.is_some_and(|due| now >= due) {
            trust_write_due = None;
            answer_trust_prompt(&mut writer);
            if let Some(tx) = event_tx {
                let _ = tx.send(TrialEvent::TrustPromptAnswered);
            }
        }

        if cancel.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
            break detector.fail("interrupted", now);
        }

        // Exit is pending: only the drain grace matters now.
        if exited.is_none() {
            if let Some(result) = detector.tick(now) {
                break result;
            }
        }

        let mut wake_at = now
            + if exited.is_none() {
                EXIT_POLL_INTERVAL
            } else {
                POLL_INTERVAL
            };
        for deadline in [
            detector.next_deadline(),
            trust_write_due,
            exited.map(|(_, seen_at)| seen_at + EXIT_DRAIN_GRACE),
        ]
        .into_iter()
        .flatten()
        {
            wake_at = wake_at.min(deadline);
        }

        match rx.recv_timeout(wake_at.saturating_duration_since(now)) {
            Ok(PtyMessage::Output(bytes)) => {
                let text = decoder.push(&bytes);
                trace!(bytes = bytes.len(), "PTY output");
                apply_output(&mut detector, &text, &mut trust_write_due, started, event_tx);
            }
            Ok(PtyMessage::Eof) => {
                eof = true;
                let tail = decoder.finish();
                apply_output(&mut detector, &tail, &mut trust_write_due, started, event_tx);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => eof = true,
        }
    };
    drop(pty_tx);

    if child.terminate() {
        debug!(pid = ?pid, "stopped target after resolution");
    }
    Ok(result)
}

fn apply_output(
    detector: &mut StartupDetector,
    text: &str,
    trust_write_due: &mut Option<Instant>,
    started: Instant,
    event_tx: Option<&mpsc::Sender<TrialEvent>>,
) {
    for event in detector.on_output(text, Instant::now()) {
        match event {
            DetectorEvent::TrustPrompt { respond_at } => {
                *trust_write_due = Some(respond_at);
            }
            DetectorEvent::SignalsComplete { at, .. } => {
                if let Some(tx) = event_tx {
                    let _ = tx.send(TrialEvent::SignalsComplete {
                        elapsed_ms: elapsed_ms(at.saturating_duration_since(started)),
                    });
                }
            }
            DetectorEvent::Resolved(_) => {}
        }
    }
}

fn answer_trust_prompt(writer: &mut Box<dyn Write + Send>) {
    let written = writer
        .write_all(TRUST_PROMPT_RESPONSE)
        .and_then(|()| writer.flush());
    match written {
        Ok(()) => info!("answered trust prompt"),
        Err(e) => warn!("failed to answer trust prompt: {e}"),
    }
}

/// Reject explicit paths that cannot be spawned before any PTY is opened.
/// Bare program names are left to the PATH lookup at spawn time.
fn check_executable(spawn: &SpawnConfig) -> Result<(), TrialError> {
    let program = Path::new(&spawn.program);
    if program.components().count() <= 1 && !program.is_absolute() {
        return Ok(());
    }

    let path = Path::new(&spawn.work_dir).join(program);
    let metadata = std::fs::metadata(&path).map_err(|source| TrialError::NotFound {
        path: path.display().to_string(),
        source,
    })?;
    if !metadata.is_file() {
        return Err(TrialError::NotExecutable {
            path: path.display().to_string(),
        });
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(TrialError::NotExecutable {
                path: path.display().to_string(),
            });
        }
    }

    Ok(())
}

/// Trial runner backed by a real PTY.
pub struct PtyTrialRunner {
    detector: DetectorConfig,
    pty_size: PtySize,
    cancel: Option<Arc<AtomicBool>>,
    log: Option<Arc<ExecutionLog>>,
}

impl PtyTrialRunner {
    pub fn new(detector: DetectorConfig) -> Self {
        Self {
            detector,
            pty_size: default_pty_size(),
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
}

impl TrialRunner for PtyTrialRunner {
    fn run_trial(&self, version: &str, trial: u32, spawn: &SpawnConfig) -> RunResult {
        let config = TrialConfig {
            spawn: spawn.clone(),
            detector: self.detector.clone(),
            pty_size: self.pty_size,
        };

        let (tx, rx) = mpsc::channel();
        let result = run_trial(config, self.cancel.as_deref(), Some(tx));

        if let Some(ref log) = self.log {
            for event in rx.try_iter() {
                let entry = LogEvent::from_trial(version, trial, &event);
                if let Err(e) = log.log(entry) {
                    warn!("failed to write execution log: {e:#}");
                }
            }
        }
        result
    }
}
