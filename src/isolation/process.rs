//! Process boundary: one constrained child process per execution.
//!
//! The child gets its own process group and the resource ceilings are set
//! between fork and exec. At the deadline, or when the caller drops the
//! future, the whole group is SIGKILLed.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, instrument, warn};

use super::{ChildExit, Collector, IsolatedJob, IsolationBoundary, Launcher, RawExecutionOutcome};
use crate::capture::{read_bounded, BoundedBuffer};
use crate::config::RuntimeConfig;
use crate::error::SandboxFault;
use crate::limits;
use crate::transport::{recv_message, send_message, ChildMessage};

/// How long to wait for the stderr reader once the child is gone.
const STDERR_GRACE: Duration = Duration::from_secs(1);

/// Runs each job in a fresh interpreter process under rlimits.
#[derive(Debug, Clone)]
pub struct ProcessBoundary {
    launcher: Launcher,
}

impl ProcessBoundary {
    pub fn new(runtime: &RuntimeConfig) -> Self {
        Self {
            launcher: Launcher::new(runtime),
        }
    }
}

#[async_trait]
impl IsolationBoundary for ProcessBoundary {
    fn name(&self) -> &'static str {
        "process"
    }

    #[instrument(skip_all, fields(timeout = ?job.timeout, memory_mb = job.ceilings.memory_mb))]
    async fn run_isolated(&self, job: &IsolatedJob) -> Result<RawExecutionOutcome, SandboxFault> {
        let payload = serde_json::to_vec(&job.request)
            .map_err(|e| SandboxFault::Protocol(format!("cannot encode request: {e}")))?;
        let cap = job.request.max_stream_bytes;
        let scratch = self.launcher.scratch()?;

        let mut cmd = Command::new(self.launcher.program());
        cmd.args(Launcher::args())
            .env_clear()
            .envs(Launcher::env(scratch.path()))
            .current_dir(scratch.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);
        limits::install(&mut cmd, job.ceilings);

        let mut child = cmd.spawn().map_err(|source| SandboxFault::Spawn {
            program: self.launcher.program().to_string(),
            source,
        })?;
        let mut group = GroupGuard::new(child.id());
        let deadline = Instant::now() + job.timeout;
        debug!(pid = child.id(), "Spawned sandbox child");

        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_bounded(stderr, cap)));

        let (Some(mut stdin), Some(mut stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(SandboxFault::Protocol("child pipes were not captured".into()));
        };

        let mut collector = Collector::new(cap);
        let exchange = async {
            // A child that dies before reading its request shows up as a
            // missing report; the exit status explains why.
            if let Err(e) = send_message(&mut stdin, &payload).await {
                debug!(error = %e, "Child closed stdin before reading the request");
            }
            drop(stdin);

            while let Some(frame) = recv_message(&mut stdout)
                .await
                .map_err(|e| SandboxFault::Protocol(e.to_string()))?
            {
                let message: ChildMessage = serde_json::from_slice(&frame)
                    .map_err(|e| SandboxFault::Protocol(format!("malformed frame: {e}")))?;
                collector.accept(message);
            }
            Ok::<_, SandboxFault>(())
        };

        let exit = match timeout_at(deadline, exchange).await {
            Ok(Ok(())) => match timeout_at(deadline, child.wait()).await {
                Ok(Ok(status)) => ChildExit::Exited(status),
                Ok(Err(e)) => {
                    kill(&mut child, &mut group).await;
                    return Err(SandboxFault::Worker(format!("failed to wait for child: {e}")));
                }
                Err(_) => {
                    kill(&mut child, &mut group).await;
                    ChildExit::Killed
                }
            },
            Ok(Err(fault)) => {
                kill(&mut child, &mut group).await;
                return Err(fault);
            }
            Err(_) => {
                debug!("Deadline reached, killing sandbox child");
                kill(&mut child, &mut group).await;
                ChildExit::Killed
            }
        };
        group.disarm();

        let raw_stderr = match stderr_task {
            Some(task) => match timeout(STDERR_GRACE, task).await {
                Ok(Ok(buffer)) => buffer,
                _ => BoundedBuffer::new(cap),
            },
            None => BoundedBuffer::new(cap),
        };

        let outcome = collector.finish(exit, raw_stderr)?;
        debug!(termination = ?outcome.termination, "Sandbox child finished");
        drop(scratch);
        Ok(outcome)
    }
}

async fn kill(child: &mut Child, group: &mut GroupGuard) {
    group.kill();
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Child already gone");
    }
    if let Err(e) = child.wait().await {
        warn!(error = %e, "Failed to reap killed sandbox child");
    }
    group.disarm();
}

/// SIGKILLs the child's process group when dropped while armed.
///
/// Covers the caller abandoning the execution mid-flight: `kill_on_drop`
/// only reaches the direct child.
struct GroupGuard {
    pgid: Option<Pid>,
}

impl GroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid
                .and_then(|pid| i32::try_from(pid).ok())
                .map(Pid::from_raw),
        }
    }

    fn kill(&self) {
        let Some(pgid) = self.pgid else { return };
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(pgid = pgid.as_raw(), error = %e, "Failed to kill process group"),
        }
    }

    /// The child has been reaped; its pid may be reused.
    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}
