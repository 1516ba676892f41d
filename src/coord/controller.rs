//! Controller scheduler: spawning, turn assignment, phase acknowledgment,
//! result aggregation, and group shutdown.
//!
//! The controller keeps the whole signal vocabulary (plus SIGCHLD) blocked
//! except inside `channel::wait_while`, so every read-modify-write of pool
//! state is a critical section by construction. Handlers store into
//! [`state::CELLS`]; the loops below do all the kills, reaps, and
//! bookkeeping.

use super::channel::{self, Wire};
use super::reap::{self, ExitOutcome};
use super::spawn;
use super::state::{CELLS, WorkerState, note_shutdown};
use super::{Policy, TaskParams};
use crate::error::Result;
use nix::libc;
use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd::Pid;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

/// How long terminated workers get to exit before being force-killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Poll interval inside the shutdown drain loop.
const REAP_POLL: Duration = Duration::from_millis(10);

/// Full configuration for one controller run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub workers: usize,
    pub policy: Policy,
    pub params: TaskParams,
    /// Turn-advance events to issue (round-robin only).
    pub turns: u32,
    /// Interval between turn advances in milliseconds (round-robin only).
    pub turn_ms: u64,
}

/// Controller-side record of one worker, created synchronously right after
/// spawn so a reaped PID can always be matched.
#[derive(Debug)]
pub struct WorkerSlot {
    pub pid: Pid,
    pub ordinal: usize,
    pub state: WorkerState,
    pub result: Option<u8>,
    /// Highest phase acknowledged so far; only ever incremented.
    pub phases_acked: u32,
}

impl WorkerSlot {
    /// Apply a lifecycle transition, logging (not failing) an illegal one.
    fn transition(&mut self, next: WorkerState) {
        if !self.state.can_transition(next) {
            tracing::warn!(
                ordinal = self.ordinal,
                from = ?self.state,
                to = ?next,
                "illegal lifecycle transition; applying anyway"
            );
        }
        self.state = next;
    }
}

/// The fixed-size pool, owned and mutated exclusively by the controller.
#[derive(Debug, Default)]
pub struct Pool {
    slots: Vec<WorkerSlot>,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly spawned worker. Must be called before the vocabulary
    /// is ever unblocked for this PID to be matchable.
    pub fn register(&mut self, ordinal: usize, pid: Pid) {
        self.slots.push(WorkerSlot {
            pid,
            ordinal,
            state: WorkerState::Spawned,
            result: None,
            phases_acked: 0,
        });
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[WorkerSlot] {
        &self.slots
    }

    pub fn pid_of(&self, ordinal: usize) -> Pid {
        self.slots[ordinal].pid
    }

    pub fn set_state(&mut self, ordinal: usize, next: WorkerState) {
        self.slots[ordinal].transition(next);
    }

    /// Workers not yet reaped.
    pub fn live_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state != WorkerState::Terminated)
            .count()
    }

    /// At most one worker may hold the turn under round-robin scheduling.
    pub fn active_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == WorkerState::Active)
            .count()
    }

    /// Record a phase completion and return the new acked-phase number, or
    /// None if the PID matches no live worker (scored as missing, never
    /// fatal).
    pub fn record_ack(&mut self, pid: Pid) -> Option<u32> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.pid == pid && s.state != WorkerState::Terminated)?;
        slot.transition(WorkerState::PhaseDoneAwaitingAck);
        slot.phases_acked += 1;
        let acked = slot.phases_acked;
        slot.transition(WorkerState::Active);
        Some(acked)
    }

    /// Fold a reaped worker into the pool. An unmatched PID or a double reap
    /// is logged and ignored so a worker is never double-counted.
    pub fn record_exit(&mut self, pid: Pid, outcome: &ExitOutcome) {
        match self.slots.iter_mut().find(|s| s.pid == pid) {
            Some(slot) if slot.state == WorkerState::Terminated => {
                tracing::warn!(pid = pid.as_raw(), "duplicate exit record ignored");
            }
            Some(slot) => {
                if !outcome.is_clean() {
                    tracing::warn!(
                        ordinal = slot.ordinal,
                        pid = pid.as_raw(),
                        outcome = %outcome,
                        "worker did not report a result; scoring as zero"
                    );
                }
                slot.result = Some(outcome.result());
                slot.transition(WorkerState::Terminated);
                tracing::info!(
                    ordinal = slot.ordinal,
                    pid = pid.as_raw(),
                    result = outcome.result(),
                    "worker reaped"
                );
            }
            None => {
                tracing::warn!(
                    pid = pid.as_raw(),
                    outcome = %outcome,
                    "reaped a pid with no pool record; result treated as missing"
                );
            }
        }
    }

    /// Exact aggregate: sum of recorded results, missing scored as zero.
    pub fn total(&self) -> u32 {
        self.slots
            .iter()
            .map(|s| u32::from(s.result.unwrap_or(0)))
            .sum()
    }
}

/// Exclusive round-robin turn assignment.
///
/// The first advance starts worker 0; each later advance pauses the current
/// holder and starts `(current + 1) % n`. Advance requests cannot pile up:
/// the timer loop below is the only driver, so re-entrant requests are
/// coalesced by construction.
#[derive(Debug)]
pub struct TurnScheduler {
    current: Option<usize>,
    count: usize,
}

/// One advance step: who to pause (if anyone) and who to start.
#[derive(Debug, PartialEq, Eq)]
pub struct Advance {
    pub paused: Option<usize>,
    pub started: usize,
}

impl TurnScheduler {
    pub fn new(count: usize) -> Self {
        assert!(count > 0, "pool cannot be empty");
        Self {
            current: None,
            count,
        }
    }

    pub fn current(&self) -> Option<usize> {
        self.current
    }

    pub fn advance(&mut self) -> Advance {
        let started = match self.current {
            None => 0,
            Some(holder) => (holder + 1) % self.count,
        };
        let paused = self.current;
        self.current = Some(started);
        Advance { paused, started }
    }
}

/// Final report of one run.
#[derive(Debug)]
pub struct Summary {
    /// (ordinal, pid, result) per worker, in ordinal order.
    pub per_worker: Vec<(usize, i32, u8)>,
    pub total: u32,
    /// Ordinals visited by turn advances (round-robin only).
    pub turn_sequence: Vec<usize>,
}

impl Summary {
    fn from_pool(pool: &Pool, turn_sequence: Vec<usize>) -> Self {
        let per_worker = pool
            .slots()
            .iter()
            .map(|s| (s.ordinal, s.pid.as_raw(), s.result.unwrap_or(0)))
            .collect();
        Self {
            per_worker,
            total: pool.total(),
            turn_sequence,
        }
    }

    /// Human-readable report, printed to stdout by the CLI layer.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.turn_sequence.is_empty() {
            let visited: Vec<String> = self.turn_sequence.iter().map(usize::to_string).collect();
            let _ = writeln!(out, "Turn sequence: {}", visited.join(" "));
        }
        let _ = writeln!(out, "No. | Worker PID | Result");
        for (ordinal, pid, result) in &self.per_worker {
            let _ = writeln!(out, "{:3} | {:10} | {:6}", ordinal + 1, pid, result);
        }
        let _ = writeln!(out, "Total issues: {}", self.total);
        out
    }
}

extern "C" fn on_phase_done(signo: libc::c_int, info: *mut libc::siginfo_t, _: *mut libc::c_void) {
    if !info.is_null() {
        // Safety: the kernel hands SA_SIGINFO handlers a valid siginfo.
        let pid = unsafe { channel::sender_pid(info) };
        if pid > 0 {
            CELLS.phase_done.insert(pid);
        }
    }
    CELLS.note_event(signo);
}

extern "C" fn on_child_exited(signo: libc::c_int) {
    CELLS.child_exited.store(true, std::sync::atomic::Ordering::Relaxed);
    CELLS.note_event(signo);
}

/// Run a full controller session: spawn, schedule, aggregate, shut down.
pub fn run(config: &RunConfig) -> Result<Summary> {
    // Block everything the handlers touch before any worker exists; from
    // here on, delivery happens only inside wait_while or a unit window.
    let masked = [
        Signal::SIGUSR1,
        Signal::SIGUSR2,
        Signal::SIGTERM,
        Signal::SIGINT,
        Signal::SIGCHLD,
    ];
    channel::block(&masked)?;

    channel::install(Signal::SIGUSR1, SigHandler::SigAction(on_phase_done))?;
    channel::install(Signal::SIGCHLD, SigHandler::Handler(on_child_exited))?;
    channel::install(Signal::SIGTERM, SigHandler::Handler(note_shutdown))?;
    channel::install(Signal::SIGINT, SigHandler::Handler(note_shutdown))?;

    let mut pool = Pool::new();
    for ordinal in 0..config.workers {
        match spawn::spawn_worker(ordinal, config.policy, &config.params) {
            Ok(pid) => {
                pool.register(ordinal, pid);
                tracing::debug!(ordinal, pid = pid.as_raw(), "worker spawned");
            }
            Err(e) => {
                // Setup fault: leaving orphans would be a correctness
                // violation, so the partial pool dies with us.
                tracing::error!(ordinal, error = %e, "spawn failed; killing partial pool");
                kill_group(&pool);
                return Err(e);
            }
        }
    }
    tracing::info!(
        workers = pool.len(),
        policy = config.policy.as_str(),
        "worker pool spawned"
    );

    let run_result = match config.policy {
        Policy::RoundRobin => run_round_robin(config, &mut pool),
        Policy::Handshake => run_handshake(&mut pool).map(|()| Vec::new()),
    };
    conclude(&mut pool, run_result)
}

/// Fold the policy-loop outcome into the final summary. A fatal error from
/// the loop or from graceful shutdown still tears the whole pool down:
/// workers must never outlive the controller as orphans.
fn conclude(pool: &mut Pool, run_result: Result<Vec<usize>>) -> Result<Summary> {
    let turn_sequence = match run_result {
        Ok(seq) => seq,
        Err(e) => {
            tracing::error!(error = %e, "fatal error mid-run; killing worker pool");
            kill_group(pool);
            return Err(e);
        }
    };
    if let Err(e) = shutdown_group(pool) {
        tracing::error!(error = %e, "shutdown failed; force-killing worker pool");
        kill_group(pool);
        return Err(e);
    }
    Ok(Summary::from_pool(pool, turn_sequence))
}

/// Drive `config.turns` advance events off an internal timer.
fn run_round_robin(config: &RunConfig, pool: &mut Pool) -> Result<Vec<usize>> {
    let mut scheduler = TurnScheduler::new(pool.len());
    let mut visited = Vec::with_capacity(config.turns as usize);

    for _ in 0..config.turns {
        if CELLS.shutdown_requested() {
            tracing::info!("shutdown requested; stopping turn rotation");
            break;
        }

        let step = scheduler.advance();
        if let Some(holder) = step.paused {
            channel::send_if_alive(pool.pid_of(holder), Wire::Pause)?;
            pool.set_state(holder, WorkerState::Paused);
        } else {
            // First advance: everyone has been waiting for the first turn.
            for ordinal in 0..pool.len() {
                pool.set_state(ordinal, WorkerState::WaitingForTurn);
            }
        }
        channel::send_if_alive(pool.pid_of(step.started), Wire::Start)?;
        pool.set_state(step.started, WorkerState::Active);
        visited.push(step.started);
        tracing::info!(
            paused = ?step.paused,
            started = step.started,
            "turn advanced"
        );
        debug_assert_eq!(scheduler.current(), Some(step.started));
        debug_assert!(pool.active_count() <= 1);

        // The rotation never suspends in wait_while, so the termination
        // kinds must be unblocked for the duration of the sleep or a
        // terminal interrupt could never reach the handler. std's sleep
        // resumes after EINTR; the flag is observed at the loop head before
        // the next advance.
        channel::unblock(&[Signal::SIGTERM, Signal::SIGINT])?;
        std::thread::sleep(Duration::from_millis(config.turn_ms));
        channel::block(&[Signal::SIGTERM, Signal::SIGINT])?;

        // Workers should not exit mid-rotation, but a crashed one must
        // still be reaped promptly.
        for reaped in reap::drain_exited()? {
            pool.record_exit(reaped.pid, &reaped.outcome);
        }
    }

    Ok(visited)
}

/// Ack phase completions in delivery order until every worker has exited.
fn run_handshake(pool: &mut Pool) -> Result<()> {
    // Handshake workers start working immediately; the whole pool holds a
    // turn at once.
    for ordinal in 0..pool.len() {
        pool.set_state(ordinal, WorkerState::WaitingForTurn);
        pool.set_state(ordinal, WorkerState::Active);
    }

    let wake = [
        Signal::SIGUSR1,
        Signal::SIGCHLD,
        Signal::SIGTERM,
        Signal::SIGINT,
    ];

    while pool.live_count() > 0 && !CELLS.shutdown_requested() {
        channel::wait_while(&wake, || {
            !CELLS.shutdown_requested()
                && CELLS.phase_done.is_empty()
                && !CELLS.child_exited.load(std::sync::atomic::Ordering::Relaxed)
        })?;

        // Drain completions in the order the kernel delivered them. Order
        // across distinct senders is whatever delivery order was; the
        // protocol promises nothing more.
        while let Some(raw) = CELLS.phase_done.take() {
            let pid = Pid::from_raw(raw);
            match pool.record_ack(pid) {
                Some(phase) => {
                    channel::send_if_alive(pid, Wire::Ack)?;
                    tracing::debug!(pid = raw, phase, "phase acknowledged");
                }
                None => {
                    tracing::warn!(
                        pid = raw,
                        "phase completion from unknown pid; treated as missing"
                    );
                }
            }
        }

        if CELLS
            .child_exited
            .swap(false, std::sync::atomic::Ordering::Relaxed)
        {
            for reaped in reap::drain_exited()? {
                pool.record_exit(reaped.pid, &reaped.outcome);
            }
        }
    }

    Ok(())
}

/// Broadcast termination and drain the reap loop within a bounded grace
/// period; stragglers are force-killed so the group can never hang.
fn shutdown_group(pool: &mut Pool) -> Result<()> {
    let live: Vec<Pid> = pool
        .slots()
        .iter()
        .filter(|s| s.state != WorkerState::Terminated)
        .map(|s| s.pid)
        .collect();
    if live.is_empty() {
        return Ok(());
    }

    tracing::info!(live = live.len(), "broadcasting termination");
    for pid in &live {
        channel::send_if_alive(*pid, Wire::Terminate)?;
    }

    let deadline = Instant::now() + SHUTDOWN_GRACE;
    loop {
        for reaped in reap::drain_exited()? {
            pool.record_exit(reaped.pid, &reaped.outcome);
        }
        if pool.live_count() == 0 {
            return Ok(());
        }
        if Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(REAP_POLL);
    }

    tracing::warn!(
        stragglers = pool.live_count(),
        "grace period expired; force-killing remaining workers"
    );
    for slot in pool.slots() {
        if slot.state != WorkerState::Terminated {
            let _ = signal::kill(slot.pid, Signal::SIGKILL);
        }
    }
    let force_deadline = Instant::now() + SHUTDOWN_GRACE;
    while pool.live_count() > 0 && Instant::now() < force_deadline {
        for reaped in reap::drain_exited()? {
            pool.record_exit(reaped.pid, &reaped.outcome);
        }
        std::thread::sleep(REAP_POLL);
    }
    Ok(())
}

/// Last-resort teardown for setup faults: no orphans, no zombies.
fn kill_group(pool: &Pool) {
    for slot in pool.slots() {
        let _ = signal::kill(slot.pid, Signal::SIGKILL);
    }
    loop {
        match nix::sys::wait::waitpid(None, None) {
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(pids: &[i32]) -> Pool {
        let mut pool = Pool::new();
        for (ordinal, pid) in pids.iter().enumerate() {
            pool.register(ordinal, Pid::from_raw(*pid));
        }
        pool
    }

    #[test]
    fn test_turn_scheduler_visits_in_order() {
        // N=3, four advances: active sequence must be [0, 1, 2, 0].
        let mut scheduler = TurnScheduler::new(3);
        let mut visited = Vec::new();
        for _ in 0..4 {
            visited.push(scheduler.advance().started);
        }
        assert_eq!(visited, vec![0, 1, 2, 0]);
    }

    #[test]
    fn test_turn_scheduler_pauses_previous_holder() {
        let mut scheduler = TurnScheduler::new(2);
        assert_eq!(
            scheduler.advance(),
            Advance {
                paused: None,
                started: 0
            }
        );
        assert_eq!(
            scheduler.advance(),
            Advance {
                paused: Some(0),
                started: 1
            }
        );
        assert_eq!(
            scheduler.advance(),
            Advance {
                paused: Some(1),
                started: 0
            }
        );
    }

    #[test]
    fn test_turn_scheduler_single_worker() {
        let mut scheduler = TurnScheduler::new(1);
        for _ in 0..3 {
            assert_eq!(scheduler.advance().started, 0);
        }
    }

    #[test]
    fn test_at_most_one_active_under_round_robin() {
        let mut pool = test_pool(&[101, 102, 103]);
        let mut scheduler = TurnScheduler::new(3);
        for ordinal in 0..3 {
            pool.set_state(ordinal, WorkerState::WaitingForTurn);
        }
        for _ in 0..5 {
            let step = scheduler.advance();
            if let Some(holder) = step.paused {
                pool.set_state(holder, WorkerState::Paused);
            }
            pool.set_state(step.started, WorkerState::Active);
            assert_eq!(pool.active_count(), 1);
        }
    }

    #[test]
    fn test_record_ack_is_monotonic() {
        let mut pool = test_pool(&[101, 102]);
        pool.set_state(0, WorkerState::WaitingForTurn);
        pool.set_state(0, WorkerState::Active);

        let pid = Pid::from_raw(101);
        assert_eq!(pool.record_ack(pid), Some(1));
        assert_eq!(pool.record_ack(pid), Some(2));
        assert_eq!(pool.record_ack(pid), Some(3));
    }

    #[test]
    fn test_record_ack_unknown_pid() {
        let mut pool = test_pool(&[101]);
        assert_eq!(pool.record_ack(Pid::from_raw(999)), None);
    }

    #[test]
    fn test_record_ack_ignores_terminated_worker() {
        let mut pool = test_pool(&[101]);
        pool.record_exit(Pid::from_raw(101), &ExitOutcome::Result(0));
        assert_eq!(pool.record_ack(Pid::from_raw(101)), None);
    }

    #[test]
    fn test_aggregation_is_exact_over_interleavings() {
        // Exits land in an arbitrary order; the total is still the sum.
        let mut pool = test_pool(&[101, 102, 103]);
        pool.record_exit(Pid::from_raw(102), &ExitOutcome::Result(5));
        pool.record_exit(Pid::from_raw(101), &ExitOutcome::Result(2));
        pool.record_exit(Pid::from_raw(103), &ExitOutcome::Result(0));
        assert_eq!(pool.total(), 7);
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn test_aggregation_never_double_counts() {
        let mut pool = test_pool(&[101]);
        pool.record_exit(Pid::from_raw(101), &ExitOutcome::Result(4));
        // A duplicate reap record must not add to the total.
        pool.record_exit(Pid::from_raw(101), &ExitOutcome::Result(4));
        assert_eq!(pool.total(), 4);
    }

    #[test]
    fn test_unmatched_pid_is_missing_not_fatal() {
        let mut pool = test_pool(&[101]);
        pool.record_exit(Pid::from_raw(999), &ExitOutcome::Result(9));
        assert_eq!(pool.total(), 0);
        assert_eq!(pool.live_count(), 1);
    }

    #[test]
    fn test_signaled_worker_scores_zero() {
        let mut pool = test_pool(&[101]);
        pool.record_exit(
            Pid::from_raw(101),
            &ExitOutcome::Signaled(Signal::SIGKILL),
        );
        assert_eq!(pool.total(), 0);
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn test_summary_render() {
        let mut pool = test_pool(&[101, 102]);
        pool.record_exit(Pid::from_raw(101), &ExitOutcome::Result(1));
        pool.record_exit(Pid::from_raw(102), &ExitOutcome::Result(2));
        let summary = Summary::from_pool(&pool, vec![0, 1, 0]);
        let text = summary.render();
        assert!(text.contains("Turn sequence: 0 1 0"));
        assert!(text.contains("No. | Worker PID | Result"));
        assert!(text.contains("Total issues: 3"));
    }

    #[test]
    fn test_conclude_returns_error_after_pool_teardown() {
        use crate::error::TurnpoolError;
        use nix::errno::Errno;

        // PIDs from the far end of the range: the teardown kills are ESRCH
        // and the reap drain sees no children, so this must come straight
        // back with the original error instead of hanging in shutdown.
        let mut pool = test_pool(&[i32::MAX - 2, i32::MAX - 1]);
        let result = conclude(&mut pool, Err(TurnpoolError::Reap(Errno::EINVAL)));
        assert!(matches!(result, Err(TurnpoolError::Reap(_))));
    }

    #[test]
    fn test_conclude_summarizes_reaped_pool() {
        let mut pool = test_pool(&[i32::MAX - 1]);
        pool.record_exit(Pid::from_raw(i32::MAX - 1), &ExitOutcome::Result(2));
        let summary = conclude(&mut pool, Ok(vec![0])).unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.turn_sequence, vec![0]);
    }

    #[test]
    fn test_summary_render_without_turns() {
        let pool = test_pool(&[101]);
        let summary = Summary::from_pool(&pool, Vec::new());
        assert!(!summary.render().contains("Turn sequence"));
    }
}
