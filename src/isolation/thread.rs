//! Thread boundary: the degraded mode for hosts without OS resource limits.
//!
//! The child is still a separate interpreter, but it runs without memory or
//! CPU ceilings. A blocking worker drives it and enforces the wall-clock
//! deadline by polling in short slices, so the child is killed at the
//! deadline or soon after the caller drops the future.

use std::path::Path;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use super::{ChildExit, Collector, IsolatedJob, IsolationBoundary, Launcher, RawExecutionOutcome};
use crate::capture::{read_bounded_blocking, BoundedBuffer};
use crate::config::RuntimeConfig;
use crate::error::SandboxFault;
use crate::transport::{read_frame, write_frame, ChildMessage};

/// Longest the worker sleeps before rechecking the deadline and the cancel flag.
const POLL_SLICE: Duration = Duration::from_millis(50);

/// How long to wait for the stderr reader once the child is gone.
const STDERR_GRACE: Duration = Duration::from_secs(1);

type FrameResult = Result<ChildMessage, SandboxFault>;

/// Runs each job in a fresh interpreter process with a wall-clock limit only.
#[derive(Debug, Clone)]
pub struct ThreadBoundary {
    launcher: Launcher,
}

impl ThreadBoundary {
    pub fn new(runtime: &RuntimeConfig) -> Self {
        Self {
            launcher: Launcher::new(runtime),
        }
    }
}

#[async_trait]
impl IsolationBoundary for ThreadBoundary {
    fn name(&self) -> &'static str {
        "thread"
    }

    #[instrument(skip_all, fields(timeout = ?job.timeout))]
    async fn run_isolated(&self, job: &IsolatedJob) -> Result<RawExecutionOutcome, SandboxFault> {
        let payload = serde_json::to_vec(&job.request)
            .map_err(|e| SandboxFault::Protocol(format!("cannot encode request: {e}")))?;
        let cap = job.request.max_stream_bytes;
        let scratch = self.launcher.scratch()?;
        let launcher = self.launcher.clone();
        let timeout = job.timeout;

        let cancel = Arc::new(AtomicBool::new(false));
        let _cancel_on_drop = CancelOnDrop(Arc::clone(&cancel));

        tokio::task::spawn_blocking(move || {
            let outcome = run_blocking(&launcher, scratch.path(), &payload, cap, timeout, &cancel);
            drop(scratch);
            outcome
        })
        .await
        .map_err(|e| SandboxFault::Worker(format!("sandbox worker failed: {e}")))?
    }
}

/// Raises the cancel flag when the async side goes away.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

fn run_blocking(
    launcher: &Launcher,
    scratch: &Path,
    payload: &[u8],
    cap: usize,
    timeout: Duration,
    cancel: &AtomicBool,
) -> Result<RawExecutionOutcome, SandboxFault> {
    let mut child = Command::new(launcher.program())
        .args(Launcher::args())
        .env_clear()
        .envs(Launcher::env(scratch))
        .current_dir(scratch)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| SandboxFault::Spawn {
            program: launcher.program().to_string(),
            source,
        })?;
    let deadline = Instant::now() + timeout;
    debug!(pid = child.id(), "Spawned sandbox child");

    let (Some(mut stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        kill(&mut child);
        return Err(SandboxFault::Protocol("child pipes were not captured".into()));
    };

    let payload = payload.to_vec();
    let (stderr_tx, stderr_rx) = mpsc::channel();
    let (frame_tx, frame_rx) = mpsc::channel();
    let workers = spawn_worker("sandbox-stdin", move || {
        if let Err(e) = write_frame(&mut stdin, &payload) {
            debug!(error = %e, "Child closed stdin before reading the request");
        }
    })
    .and_then(|()| {
        spawn_worker("sandbox-stderr", move || {
            let _ = stderr_tx.send(read_bounded_blocking(stderr, cap));
        })
    })
    .and_then(|()| spawn_worker("sandbox-stdout", move || forward_frames(stdout, &frame_tx)));
    if let Err(fault) = workers {
        kill(&mut child);
        return Err(fault);
    }

    let mut collector = Collector::new(cap);
    let exit = match pump(&frame_rx, &mut collector, &mut child, deadline, cancel) {
        Ok(Some(status)) => ChildExit::Exited(status),
        Ok(None) => {
            debug!("Deadline reached or cancelled, killing sandbox child");
            kill(&mut child);
            ChildExit::Killed
        }
        Err(fault) => {
            kill(&mut child);
            return Err(fault);
        }
    };

    let raw_stderr = stderr_rx
        .recv_timeout(STDERR_GRACE)
        .unwrap_or_else(|_| BoundedBuffer::new(cap));

    let outcome = collector.finish(exit, raw_stderr)?;
    debug!(termination = ?outcome.termination, "Sandbox child finished");
    Ok(outcome)
}

fn spawn_worker<F>(name: &str, f: F) -> Result<(), SandboxFault>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map(drop)
        .map_err(|e| SandboxFault::Worker(format!("cannot start {name} thread: {e}")))
}

/// Decode frames off the child's protocol pipe until it closes.
fn forward_frames(mut stdout: ChildStdout, tx: &Sender<FrameResult>) {
    loop {
        let message = match read_frame(&mut stdout) {
            Ok(Some(frame)) => serde_json::from_slice(&frame)
                .map_err(|e| SandboxFault::Protocol(format!("malformed frame: {e}"))),
            Ok(None) => return,
            Err(e) => Err(SandboxFault::Protocol(e.to_string())),
        };
        let failed = message.is_err();
        if tx.send(message).is_err() || failed {
            return;
        }
    }
}

/// Collect frames, then wait for the child to exit.
///
/// `Ok(None)` means the deadline passed or the caller cancelled first.
fn pump(
    frames: &Receiver<FrameResult>,
    collector: &mut Collector,
    child: &mut Child,
    deadline: Instant,
    cancel: &AtomicBool,
) -> Result<Option<ExitStatus>, SandboxFault> {
    loop {
        let Some(slice) = remaining(deadline, cancel) else {
            return Ok(None);
        };
        match frames.recv_timeout(slice) {
            Ok(message) => collector.accept(message?),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    loop {
        if let Some(status) = child
            .try_wait()
            .map_err(|e| SandboxFault::Worker(format!("failed to wait for child: {e}")))?
        {
            return Ok(Some(status));
        }
        let Some(slice) = remaining(deadline, cancel) else {
            return Ok(None);
        };
        thread::sleep(slice);
    }
}

fn remaining(deadline: Instant, cancel: &AtomicBool) -> Option<Duration> {
    if cancel.load(Ordering::Acquire) {
        return None;
    }
    let left = deadline.checked_duration_since(Instant::now())?;
    (!left.is_zero()).then(|| left.min(POLL_SLICE))
}

fn kill(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!(error = %e, "Child already gone");
    }
    if let Err(e) = child.wait() {
        warn!(error = %e, "Failed to reap killed sandbox child");
    }
}
