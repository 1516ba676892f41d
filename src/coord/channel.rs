//! Signal channel primitives shared by the controller and workers.
//!
//! Wraps the OS signal machinery into three operations: handler installation,
//! mask manipulation, and an atomic block-and-wait primitive. Signal masking
//! is the only mutual-exclusion mechanism in the whole system: any code that
//! reads-then-writes handler-visible state must run with the relevant kinds
//! blocked, and may only unblock them through [`wait_while`] (or around a
//! single work unit), which closes the check-then-suspend window that would
//! otherwise lose wakeups.

use crate::error::{Result, TurnpoolError};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::unistd::Pid;

/// The closed signal vocabulary of the protocol.
///
/// Each kind carries nothing but its identity and (for [`Wire::PhaseDone`])
/// the sender PID the kernel attaches. Two kinds share a signal number
/// because they travel in opposite directions and can never be confused by a
/// receiver.
///
/// | Kind        | Signal   | Direction            |
/// |-------------|----------|----------------------|
/// | `Start`     | SIGUSR1  | controller -> worker |
/// | `Pause`     | SIGUSR2  | controller -> worker |
/// | `PhaseDone` | SIGUSR1  | worker -> controller |
/// | `Ack`       | SIGUSR2  | controller -> worker |
/// | `Terminate` | SIGTERM  | controller -> worker |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wire {
    Start,
    Pause,
    PhaseDone,
    Ack,
    Terminate,
}

impl Wire {
    /// The OS signal this kind travels on.
    pub fn signal(self) -> Signal {
        match self {
            Wire::Start | Wire::PhaseDone => Signal::SIGUSR1,
            Wire::Pause | Wire::Ack => Signal::SIGUSR2,
            Wire::Terminate => Signal::SIGTERM,
        }
    }
}

/// Every signal the protocol uses, including SIGINT for terminal-driven
/// shutdown. Workers inherit this set blocked across exec (see
/// `spawn::spawn_worker`), so a signal sent before handler installation stays
/// pending instead of killing the child with the default disposition.
pub const VOCABULARY: [Signal; 4] = [
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGTERM,
    Signal::SIGINT,
];

fn to_sigset(kinds: &[Signal]) -> SigSet {
    let mut set = SigSet::empty();
    for sig in kinds {
        set.add(*sig);
    }
    set
}

/// Install a handler for a signal.
///
/// Registration failure is a non-recoverable setup fault; callers propagate
/// it and tear the group down rather than retrying. `SA_RESTART` is set so
/// interrupted syscalls other than `sigsuspend` resume transparently.
pub fn install(sig: Signal, handler: SigHandler) -> Result<()> {
    let action = SigAction::new(handler, SaFlags::SA_RESTART, SigSet::empty());
    unsafe { signal::sigaction(sig, &action) }
        .map(|_| ())
        .map_err(|source| TurnpoolError::HandlerInstall {
            signal: sig,
            source,
        })
}

/// Add the given kinds to the process signal mask.
pub fn block(kinds: &[Signal]) -> Result<()> {
    signal::sigprocmask(SigmaskHow::SIG_BLOCK, Some(&to_sigset(kinds)), None)
        .map_err(TurnpoolError::Mask)
}

/// Remove the given kinds from the process signal mask. Anything pending is
/// delivered before this returns.
pub fn unblock(kinds: &[Signal]) -> Result<()> {
    signal::sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&to_sigset(kinds)), None)
        .map_err(TurnpoolError::Mask)
}

/// Atomically unblock `kinds`, suspend until a handler runs, re-block, and
/// loop while `predicate` holds.
///
/// This is the single suspension point in the system. The kinds must be
/// blocked on entry; `sigsuspend` swaps the mask and sleeps in one step, so
/// a signal arriving between the predicate check and the suspension is
/// delivered the moment the process suspends rather than being lost.
pub fn wait_while(kinds: &[Signal], mut predicate: impl FnMut() -> bool) -> Result<()> {
    let mut wait_mask = SigSet::thread_get_mask().map_err(TurnpoolError::Mask)?;
    for sig in kinds {
        wait_mask.remove(*sig);
    }
    while predicate() {
        // sigsuspend returning (always EINTR) means a handler has run.
        let _ = wait_mask.suspend();
    }
    Ok(())
}

/// Send one signal kind to a process.
pub fn send(pid: Pid, kind: Wire) -> Result<()> {
    signal::kill(pid, kind.signal()).map_err(|source| TurnpoolError::Notify {
        pid: pid.as_raw(),
        signal: kind.signal(),
        source,
    })
}

/// Send one signal kind, treating an already-exited receiver as success.
///
/// Used for broadcasts and acknowledgments, where the receiver may have
/// terminated between our last bookkeeping and the kill.
pub fn send_if_alive(pid: Pid, kind: Wire) -> Result<()> {
    match signal::kill(pid, kind.signal()) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(source) => Err(TurnpoolError::Notify {
            pid: pid.as_raw(),
            signal: kind.signal(),
            source,
        }),
    }
}

/// Extract the sender PID from a siginfo pointer inside a handler.
///
/// # Safety
/// `info` must be the non-null pointer the kernel passed to an `SA_SIGINFO`
/// handler.
pub unsafe fn sender_pid(info: *mut nix::libc::siginfo_t) -> i32 {
    #[cfg(target_os = "linux")]
    {
        unsafe { (*info).si_pid() }
    }
    #[cfg(not(target_os = "linux"))]
    {
        unsafe { (*info).si_pid }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_signal_mapping() {
        assert_eq!(Wire::Start.signal(), Signal::SIGUSR1);
        assert_eq!(Wire::PhaseDone.signal(), Signal::SIGUSR1);
        assert_eq!(Wire::Pause.signal(), Signal::SIGUSR2);
        assert_eq!(Wire::Ack.signal(), Signal::SIGUSR2);
        assert_eq!(Wire::Terminate.signal(), Signal::SIGTERM);
    }

    #[test]
    fn test_vocabulary_covers_wire() {
        for kind in [
            Wire::Start,
            Wire::Pause,
            Wire::PhaseDone,
            Wire::Ack,
            Wire::Terminate,
        ] {
            assert!(VOCABULARY.contains(&kind.signal()));
        }
    }

    #[test]
    fn test_send_if_alive_tolerates_dead_pid() {
        // A pid from the far end of the valid range that cannot be a live
        // child of the test process.
        let pid = Pid::from_raw(i32::MAX - 1);
        assert!(send_if_alive(pid, Wire::Terminate).is_ok());
    }

    #[test]
    fn test_wait_while_returns_when_predicate_false() {
        // Predicate is already false: wait_while must not suspend at all.
        wait_while(&[Signal::SIGUSR1], || false).unwrap();
    }
}
