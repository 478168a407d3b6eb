//! Isolation boundaries.
//!
//! A boundary runs one [`IsolatedJob`] in a fresh `python3` child driven by
//! the embedded harness, enforces the wall-clock deadline and reports what
//! happened as a [`RawExecutionOutcome`]. The orchestrator only sees the
//! [`IsolationBoundary`] trait, so process and thread isolation are
//! interchangeable.

#[cfg(unix)]
mod process;
mod thread;

#[cfg(unix)]
pub use process::ProcessBoundary;
pub use thread::ThreadBoundary;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::warn;

use crate::capture::BoundedBuffer;
use crate::config::{IsolationMode, RuntimeConfig};
use crate::error::SandboxFault;
use crate::limits::{self, ResourceCeilings};
use crate::transport::{ChildMessage, ChildOutcome, ChildReport, ChildRequest, Stream};

/// The child-side harness, run with `python3 -c`.
pub const HARNESS: &str = include_str!("harness.py");

/// Interpreter flags: isolated mode (no user site, no `PYTHON*` variables),
/// no bytecode files, unbuffered streams.
const PYTHON_FLAGS: [&str; 3] = ["-I", "-B", "-u"];

/// Substrings of raw interpreter stderr that mean the child ran out of
/// memory before it could report.
const MEMORY_PHRASES: &[&str] = &[
    "memoryerror",
    "cannot allocate memory",
    "out of memory",
    "memory allocation failed",
    "too many memory regions",
    "std::bad_alloc",
];

/// One execution handed to a boundary.
#[derive(Debug, Clone)]
pub struct IsolatedJob {
    pub request: ChildRequest,
    /// Wall-clock ceiling.
    pub timeout: Duration,
    /// OS ceilings; ignored by boundaries that cannot apply them.
    pub ceilings: ResourceCeilings,
}

/// How the child ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Completed,
    Raised { exc_type: String, message: String },
    /// The child's `compile()` rejected the code.
    SyntaxInvalid {
        line: Option<usize>,
        column: Option<usize>,
        message: String,
    },
    /// Killed at the wall-clock deadline or on cancellation.
    TimedOut,
    /// Killed by the CPU-time ceiling.
    CpuLimit,
    MemoryExceeded(String),
    /// Died without reporting, for no attributable reason.
    Crashed(String),
}

/// What a boundary observed.
#[derive(Debug, Clone, PartialEq)]
pub struct RawExecutionOutcome {
    pub stdout: String,
    pub stderr: String,
    pub locals_snapshot: Option<Map<String, Value>>,
    pub termination: Termination,
    pub peak_memory_kb: Option<u64>,
    /// Preloaded modules the child could not import.
    pub unavailable_modules: Vec<String>,
}

impl RawExecutionOutcome {
    pub const fn timed_out(&self) -> bool {
        matches!(self.termination, Termination::TimedOut | Termination::CpuLimit)
    }

    pub const fn memory_exceeded(&self) -> bool {
        matches!(self.termination, Termination::MemoryExceeded(_))
    }

    /// Exception class and message, when user code raised.
    pub fn exception_info(&self) -> Option<(&str, &str)> {
        match &self.termination {
            Termination::Raised { exc_type, message } => Some((exc_type, message)),
            _ => None,
        }
    }
}

/// Runs jobs in isolation.
///
/// Implementations must kill the child unconditionally at the deadline, and
/// also when the returned future is dropped.
#[async_trait]
pub trait IsolationBoundary: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    async fn run_isolated(&self, job: &IsolatedJob) -> Result<RawExecutionOutcome, SandboxFault>;
}

/// Pick the boundary the configuration asks for.
///
/// Process isolation needs OS resource limits; where they are unavailable
/// the degraded thread boundary is used instead.
pub fn select(runtime: &RuntimeConfig) -> Arc<dyn IsolationBoundary> {
    if runtime.isolation == IsolationMode::Process {
        if let Some(boundary) = process_boundary(runtime) {
            return boundary;
        }
        warn!("Process isolation is unavailable on this platform, using thread isolation");
    }
    warn!("Thread isolation enforces the wall-clock timeout only: no memory or CPU ceilings");
    Arc::new(ThreadBoundary::new(runtime))
}

#[cfg(unix)]
fn process_boundary(runtime: &RuntimeConfig) -> Option<Arc<dyn IsolationBoundary>> {
    limits::supported().then(|| Arc::new(ProcessBoundary::new(runtime)) as Arc<dyn IsolationBoundary>)
}

#[cfg(not(unix))]
fn process_boundary(_runtime: &RuntimeConfig) -> Option<Arc<dyn IsolationBoundary>> {
    None
}

/// How to launch the interpreter child.
#[derive(Debug, Clone)]
pub(crate) struct Launcher {
    python: String,
    scratch_root: Option<PathBuf>,
}

impl Launcher {
    pub(crate) fn new(runtime: &RuntimeConfig) -> Self {
        Self {
            python: runtime.python.clone(),
            scratch_root: runtime.scratch_dir.clone(),
        }
    }

    pub(crate) fn program(&self) -> &str {
        &self.python
    }

    pub(crate) fn args() -> impl Iterator<Item = &'static str> {
        PYTHON_FLAGS.into_iter().chain(["-c", HARNESS])
    }

    /// A fresh working directory, removed when the handle drops.
    pub(crate) fn scratch(&self) -> Result<tempfile::TempDir, SandboxFault> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("factor-sandbox-");
        match &self.scratch_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(SandboxFault::Scratch)
    }

    /// The child's entire environment.
    pub(crate) fn env(scratch: &Path) -> Vec<(&'static str, OsString)> {
        let mut env = vec![
            ("HOME", scratch.as_os_str().to_owned()),
            ("TMPDIR", scratch.as_os_str().to_owned()),
            ("PYTHONIOENCODING", "utf-8".into()),
            ("OPENBLAS_NUM_THREADS", "1".into()),
            ("OMP_NUM_THREADS", "1".into()),
            ("MKL_NUM_THREADS", "1".into()),
            ("NUMEXPR_NUM_THREADS", "1".into()),
            ("MALLOC_ARENA_MAX", "2".into()),
        ];
        if let Some(path) = std::env::var_os("PATH") {
            env.push(("PATH", path));
        }
        env
    }
}

/// How the child process went away.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ChildExit {
    /// We killed it: deadline or cancellation.
    Killed,
    Exited(ExitStatus),
}

/// Accumulates child frames and turns them into an outcome.
pub(crate) struct Collector {
    stdout: BoundedBuffer,
    stderr: BoundedBuffer,
    report: Option<ChildReport>,
}

impl Collector {
    pub(crate) const fn new(cap: usize) -> Self {
        Self {
            stdout: BoundedBuffer::new(cap),
            stderr: BoundedBuffer::new(cap),
            report: None,
        }
    }

    pub(crate) fn accept(&mut self, message: ChildMessage) {
        match message {
            ChildMessage::Output {
                stream,
                data,
                overflow,
            } => {
                let buffer = match stream {
                    Stream::Stdout => &mut self.stdout,
                    Stream::Stderr => &mut self.stderr,
                };
                buffer.push_str(&data);
                if overflow {
                    buffer.mark_truncated();
                }
            }
            ChildMessage::Report(report) => self.report = Some(report),
        }
    }

    /// Classify the run and merge the raw fd 2 capture into stderr.
    pub(crate) fn finish(
        mut self,
        exit: ChildExit,
        raw_stderr: BoundedBuffer,
    ) -> Result<RawExecutionOutcome, SandboxFault> {
        let raw_truncated = raw_stderr.is_truncated();
        let raw = raw_stderr.into_string();

        let (termination, locals_snapshot, peak_memory_kb, unavailable_modules) =
            match self.report.take() {
                Some(report) => {
                    let termination = from_report(report.outcome)?;
                    (
                        termination,
                        report.locals,
                        report.peak_rss_kb,
                        report.unavailable_modules,
                    )
                }
                None => (classify_exit(exit, &raw), None, None, Vec::new()),
            };

        if !raw.is_empty() {
            self.stderr.push_str(&raw);
        }
        if raw_truncated {
            self.stderr.mark_truncated();
        }

        Ok(RawExecutionOutcome {
            stdout: self.stdout.into_string(),
            stderr: self.stderr.into_string(),
            locals_snapshot,
            termination,
            peak_memory_kb,
            unavailable_modules,
        })
    }
}

fn from_report(outcome: ChildOutcome) -> Result<Termination, SandboxFault> {
    Ok(match outcome {
        ChildOutcome::Completed => Termination::Completed,
        ChildOutcome::Raised { exc_type, message } => Termination::Raised { exc_type, message },
        ChildOutcome::SyntaxInvalid {
            line,
            column,
            message,
        } => Termination::SyntaxInvalid {
            line,
            column,
            message,
        },
        ChildOutcome::MemoryExceeded { message } => Termination::MemoryExceeded(message),
        ChildOutcome::SetupFailed { message } => return Err(SandboxFault::Setup(message)),
    })
}

/// Attribute a death without a report.
fn classify_exit(exit: ChildExit, raw_stderr: &str) -> Termination {
    let status = match exit {
        ChildExit::Killed => return Termination::TimedOut,
        ChildExit::Exited(status) => status,
    };

    // Allocation failures often end in an abort, so the diagnostics beat
    // the signal.
    let lowered = raw_stderr.to_lowercase();
    if MEMORY_PHRASES.iter().any(|p| lowered.contains(p)) {
        return Termination::MemoryExceeded("interpreter ran out of memory".into());
    }

    if let Some(termination) = classify_signal(status) {
        return termination;
    }
    match status.code() {
        Some(code) => Termination::Crashed(format!("child exited with status {code} without reporting")),
        None => Termination::Crashed("child terminated abnormally".into()),
    }
}

#[cfg(unix)]
fn classify_signal(status: ExitStatus) -> Option<Termination> {
    use nix::sys::signal::Signal;
    use std::os::unix::process::ExitStatusExt;

    let raw = status.signal()?;
    Some(match Signal::try_from(raw) {
        // Nothing but the kernel sends SIGKILL to a child we did not kill:
        // the OOM killer or the hard CPU limit. The soft CPU limit comes
        // first as SIGXCPU, so SIGKILL here is memory.
        Ok(Signal::SIGKILL) => Termination::MemoryExceeded("killed by the operating system".into()),
        Ok(Signal::SIGXCPU) => Termination::CpuLimit,
        Ok(signal) => Termination::Crashed(format!("child terminated by {signal}")),
        Err(_) => Termination::Crashed(format!("child terminated by signal {raw}")),
    })
}

#[cfg(not(unix))]
fn classify_signal(_status: ExitStatus) -> Option<Termination> {
    None
}
