//! Worker lifecycle states and handler-visible coordination cells.
//!
//! Both processes are single-threaded: signal handlers interleave with the
//! main control flow on the same thread, so `Relaxed` atomics are sufficient
//! and mutual exclusion comes from signal masking, not memory ordering.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

/// Maximum size of the worker pool; the worker count must lie in (0, 8).
pub const MAX_WORKERS: usize = 8;

/// Per-worker lifecycle.
///
/// ```text
/// SPAWNED -> WAITING_FOR_TURN -> ACTIVE -> (PAUSED | PHASE_DONE_AWAITING_ACK)
///                                   ^               |
///                                   +---------------+
/// any state -> TERMINATED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// After spawn, before handler installation is known to have happened.
    Spawned,
    /// Suspended until a start signal arrives.
    WaitingForTurn,
    /// Executing bounded work units.
    Active,
    /// Suspended until resumed or terminated.
    Paused,
    /// Signaled phase completion, suspended until acknowledged.
    PhaseDoneAwaitingAck,
    /// Exited and reaped.
    Terminated,
}

impl WorkerState {
    /// Whether `next` is a legal successor of `self`. Termination is legal
    /// from every live state; everything else follows the diagram above.
    pub fn can_transition(self, next: WorkerState) -> bool {
        use WorkerState::*;
        if self == Terminated {
            return false;
        }
        if next == Terminated {
            return true;
        }
        matches!(
            (self, next),
            (Spawned, WaitingForTurn)
                | (WaitingForTurn, Active)
                | (Active, Paused)
                | (Active, PhaseDoneAwaitingAck)
                | (Paused, Active)
                | (PhaseDoneAwaitingAck, Active)
        )
    }
}

/// A fixed-capacity set of PIDs, safe to mutate from a signal handler.
///
/// The phase-completion handler inserts the sender PID here; the controller
/// main loop drains it with the signal blocked. Duplicate PIDs coalesce,
/// mirroring what the kernel does with a standard signal that is already
/// pending: a repeat carries no extra information. A full set drops the
/// insert, which the protocol tolerates the same way it tolerates a merged
/// signal burst.
pub struct PendingSet {
    slots: [AtomicI32; MAX_WORKERS],
}

impl PendingSet {
    pub const fn new() -> Self {
        Self {
            slots: [const { AtomicI32::new(0) }; MAX_WORKERS],
        }
    }

    /// Insert a PID. Async-signal-safe: only atomic loads and CAS.
    /// Returns false if the PID was already pending or the set is full.
    pub fn insert(&self, pid: i32) -> bool {
        for slot in &self.slots {
            if slot.load(Ordering::Relaxed) == pid {
                return false;
            }
        }
        for slot in &self.slots {
            if slot
                .compare_exchange(0, pid, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
        false
    }

    /// Remove and return the oldest pending PID, or None if empty.
    pub fn take(&self) -> Option<i32> {
        for slot in &self.slots {
            let pid = slot.load(Ordering::Relaxed);
            if pid != 0
                && slot
                    .compare_exchange(pid, 0, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
            {
                return Some(pid);
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.load(Ordering::Relaxed) == 0)
    }
}

/// Process-wide coordination cells, the only state signal handlers touch.
///
/// Handlers are restricted to storing into these cells; every kill, reap, and
/// aggregation step happens in ordinary control flow that polls them with the
/// corresponding signals blocked. Each process (controller or worker) gets
/// its own instance after exec; the worker-local flags are simply unused in
/// the controller and vice versa.
pub struct CoordCells {
    /// Set once by a termination handler; never cleared.
    shutdown: AtomicBool,
    /// Set by the SIGCHLD handler; cleared by the reap loop.
    pub child_exited: AtomicBool,
    /// Worker-local: this worker currently holds the turn.
    active: AtomicBool,
    /// Worker-local: the controller acknowledged the last completed phase.
    pub acked: AtomicBool,
    /// Worker-local: the acknowledgment retry timer fired.
    pub timer_fired: AtomicBool,
    /// Controller: sender PIDs with an unacknowledged phase completion.
    pub phase_done: PendingSet,
    /// Raw signal number of the most recently handled signal.
    pub last_signal: AtomicI32,
    /// Monotonically incrementing count of handled signals.
    pub event_count: AtomicU64,
}

impl CoordCells {
    pub const fn new() -> Self {
        Self {
            shutdown: AtomicBool::new(false),
            child_exited: AtomicBool::new(false),
            active: AtomicBool::new(false),
            acked: AtomicBool::new(false),
            timer_fired: AtomicBool::new(false),
            phase_done: PendingSet::new(),
            last_signal: AtomicI32::new(0),
            event_count: AtomicU64::new(0),
        }
    }

    /// Record one handler invocation. Async-signal-safe.
    pub fn note_event(&self, signo: i32) {
        self.last_signal.store(signo, Ordering::Relaxed);
        self.event_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Irreversibly request shutdown. Async-signal-safe.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Grant or revoke the turn. Idempotent: a repeated pause (or start) is
    /// absorbed, matching the kernel's coalescing of a pending signal.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }
}

/// The cells of the calling process. Static so `extern "C"` handlers can
/// reach them without captures.
pub static CELLS: CoordCells = CoordCells::new();

/// Shared termination handler body: flag only, no side effects.
pub extern "C" fn note_shutdown(signo: nix::libc::c_int) {
    CELLS.request_shutdown();
    CELLS.note_event(signo);
}

#[cfg(test)]
mod tests {
    use super::*;
    use WorkerState::*;

    #[test]
    fn test_lifecycle_transitions() {
        assert!(Spawned.can_transition(WaitingForTurn));
        assert!(WaitingForTurn.can_transition(Active));
        assert!(Active.can_transition(Paused));
        assert!(Active.can_transition(PhaseDoneAwaitingAck));
        assert!(Paused.can_transition(Active));
        assert!(PhaseDoneAwaitingAck.can_transition(Active));

        // Termination is reachable from every live state.
        for state in [Spawned, WaitingForTurn, Active, Paused, PhaseDoneAwaitingAck] {
            assert!(state.can_transition(Terminated));
        }
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!Spawned.can_transition(Active));
        assert!(!Paused.can_transition(PhaseDoneAwaitingAck));
        assert!(!Terminated.can_transition(Active));
        assert!(!Terminated.can_transition(Terminated));
        assert!(!Active.can_transition(WaitingForTurn));
    }

    #[test]
    fn test_pending_set_insert_take() {
        let set = PendingSet::new();
        assert!(set.is_empty());
        assert!(set.insert(100));
        assert!(set.insert(200));
        assert!(!set.is_empty());
        assert_eq!(set.take(), Some(100));
        assert_eq!(set.take(), Some(200));
        assert_eq!(set.take(), None);
        assert!(set.is_empty());
    }

    #[test]
    fn test_pending_set_coalesces_duplicates() {
        let set = PendingSet::new();
        assert!(set.insert(100));
        assert!(!set.insert(100));
        assert_eq!(set.take(), Some(100));
        assert_eq!(set.take(), None);
    }

    #[test]
    fn test_pending_set_full_drops_insert() {
        let set = PendingSet::new();
        for pid in 1..=MAX_WORKERS as i32 {
            assert!(set.insert(pid));
        }
        assert!(!set.insert(999));
    }

    #[test]
    fn test_flags_idempotent() {
        let cells = CoordCells::new();
        // Double pause is still just paused.
        cells.set_active(true);
        cells.set_active(false);
        cells.set_active(false);
        assert!(!cells.is_active());

        // Shutdown is irreversible once requested.
        cells.request_shutdown();
        cells.request_shutdown();
        assert!(cells.shutdown_requested());
    }

    #[test]
    fn test_event_counter_monotonic() {
        let cells = CoordCells::new();
        cells.note_event(10);
        cells.note_event(12);
        assert_eq!(cells.event_count.load(Ordering::Relaxed), 2);
        assert_eq!(cells.last_signal.load(Ordering::Relaxed), 12);
    }
}
