//! OS resource ceilings for the isolated child.
//!
//! Limits are applied in the forked child between `fork` and `exec`, so the
//! interpreter starts already constrained. A failure aborts the spawn; code
//! never runs without its ceilings.

use std::io;

/// Ceilings for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceCeilings {
    /// Address-space ceiling.
    pub memory_mb: u64,
    /// CPU-time soft limit; the hard limit sits one second above.
    pub cpu_seconds: u64,
}

impl ResourceCeilings {
    pub const fn memory_bytes(&self) -> u64 {
        self.memory_mb.saturating_mul(1024 * 1024)
    }
}

/// Whether this host can apply ceilings at all.
pub const fn supported() -> bool {
    cfg!(unix)
}

/// Apply the ceilings to the calling process.
///
/// Limits are only ever lowered: if the inherited hard limit is already
/// below the requested value, the inherited one is kept.
#[cfg(unix)]
pub fn apply_limits(ceilings: ResourceCeilings) -> io::Result<()> {
    use nix::sys::resource::Resource;

    let bytes = ceilings.memory_bytes();
    lower(Resource::RLIMIT_AS, bytes, bytes)?;
    lower(
        Resource::RLIMIT_CPU,
        ceilings.cpu_seconds,
        ceilings.cpu_seconds.saturating_add(1),
    )?;
    lower(Resource::RLIMIT_CORE, 0, 0)?;
    Ok(())
}

#[cfg(not(unix))]
pub fn apply_limits(_ceilings: ResourceCeilings) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "resource limits are not supported on this platform",
    ))
}

#[cfg(unix)]
fn lower(resource: nix::sys::resource::Resource, soft: u64, hard: u64) -> io::Result<()> {
    use nix::sys::resource::{getrlimit, setrlimit};

    let (_, current_hard) = getrlimit(resource)?;
    let hard = hard.min(current_hard);
    setrlimit(resource, soft.min(hard), hard)?;
    Ok(())
}

/// Arrange for `apply_limits` to run in the child of `cmd`.
#[cfg(unix)]
#[allow(unsafe_code)]
pub fn install(cmd: &mut tokio::process::Command, ceilings: ResourceCeilings) {
    // SAFETY: the hook runs in the forked child before exec. It only issues
    // getrlimit/setrlimit syscalls, allocates nothing and touches no state
    // shared with the parent.
    unsafe {
        cmd.pre_exec(move || apply_limits(ceilings));
    }
}
