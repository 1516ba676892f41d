//! Exit-status analysis and non-blocking reaping.

use crate::error::{Result, TurnpoolError};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

/// What a reaped worker's wait status tells us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Normal exit; the status byte is the worker's reported result.
    Result(u8),
    /// Killed by a signal; no result was reported.
    Signaled(Signal),
    /// Anything else the platform can produce (stopped, continued, ...).
    Unknown,
}

impl ExitOutcome {
    /// The result to fold into the aggregate. A worker that died by signal
    /// or an unclassifiable status is scored as missing, i.e. zero.
    pub fn result(&self) -> u8 {
        match self {
            ExitOutcome::Result(value) => *value,
            ExitOutcome::Signaled(_) | ExitOutcome::Unknown => 0,
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, ExitOutcome::Result(_))
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitOutcome::Result(value) => write!(f, "exited with result {}", value),
            ExitOutcome::Signaled(sig) => write!(f, "killed by signal {:?}", sig),
            ExitOutcome::Unknown => write!(f, "unknown termination"),
        }
    }
}

/// Classify a `WaitStatus` from the reap loop.
pub fn analyze_wait_status(status: WaitStatus) -> ExitOutcome {
    match status {
        // Exit statuses are truncated to a byte by the kernel.
        WaitStatus::Exited(_, code) => ExitOutcome::Result((code & 0xff) as u8),
        WaitStatus::Signaled(_, sig, _) => ExitOutcome::Signaled(sig),
        _ => ExitOutcome::Unknown,
    }
}

/// One reaped child.
#[derive(Debug)]
pub struct Reaped {
    pub pid: Pid,
    pub outcome: ExitOutcome,
}

/// Drain every child that has exited, without blocking.
///
/// Several children may exit before the SIGCHLD handler's flag is polled,
/// and the kernel coalesces the signal, so a single waitpid call is not
/// sufficient: this loops until the kernel reports no more exited children.
/// "No children at all" (ECHILD) is success, not an error.
pub fn drain_exited() -> Result<Vec<Reaped>> {
    let mut reaped = Vec::new();
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                if let Some(pid) = status.pid() {
                    reaped.push(Reaped {
                        pid,
                        outcome: analyze_wait_status(status),
                    });
                }
            }
            Err(Errno::ECHILD) => break,
            Err(Errno::EINTR) => continue,
            Err(source) => return Err(TurnpoolError::Reap(source)),
        }
    }
    Ok(reaped)
}
