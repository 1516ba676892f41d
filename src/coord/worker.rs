//! Worker runtime loop: the child half of the coordination protocol.
//!
//! A worker owns nothing the controller depends on except its own lifetime
//! and its exit status. The vocabulary arrives blocked from the spawner;
//! after handler installation it is unblocked only inside `wait_while` and
//! around individual work units, so flag checks between units can never race
//! with delivery.

use super::channel::{self, VOCABULARY, Wire};
use super::state::{CELLS, note_shutdown};
use super::{Policy, TaskParams};
use crate::error::Result;
use crate::work;
use nix::libc;
use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd::{Pid, getpid, getppid};

extern "C" fn on_start(signo: libc::c_int) {
    CELLS.set_active(true);
    CELLS.note_event(signo);
}

extern "C" fn on_pause(signo: libc::c_int) {
    // A repeat pause while one is pending coalesces to the same state.
    CELLS.set_active(false);
    CELLS.note_event(signo);
}

extern "C" fn on_ack(signo: libc::c_int) {
    CELLS.acked.store(true, std::sync::atomic::Ordering::Relaxed);
    CELLS.note_event(signo);
}

extern "C" fn on_timer(signo: libc::c_int) {
    CELLS
        .timer_fired
        .store(true, std::sync::atomic::Ordering::Relaxed);
    CELLS.note_event(signo);
}

/// How long to wait for an acknowledgment before re-sending the completion.
const ACK_RETRY_SECS: u32 = 1;

/// Poll interval for detecting a vanished controller while suspended.
const ORPHAN_POLL_SECS: u32 = 1;

/// Entry point for the hidden `worker` subcommand. Exits the process with
/// the worker's bounded result; never returns.
pub fn exec(ordinal: usize, policy: Policy, controller_pid: i32, params: &TaskParams) -> ! {
    match run(ordinal, policy, controller_pid, params) {
        Ok(status) => std::process::exit(i32::from(status)),
        Err(e) => {
            // Setup faults take the whole group down: ask the controller to
            // shut down, then die by signal so the exit status can never be
            // mistaken for a result.
            tracing::error!(ordinal, error = %e, "worker setup fault; requesting group shutdown");
            let _ = signal::kill(getppid(), Signal::SIGTERM);
            let _ = signal::raise(Signal::SIGKILL);
            std::process::exit(1);
        }
    }
}

fn run(ordinal: usize, policy: Policy, controller_pid: i32, params: &TaskParams) -> Result<u8> {
    let issues = match policy {
        Policy::RoundRobin => run_round_robin(ordinal, controller_pid, params)?,
        Policy::Handshake => run_handshake(ordinal, controller_pid, params)?,
    };

    // Exit statuses carry at most a byte; a larger result would need an
    // out-of-band channel, so it is capped loudly rather than truncated
    // silently.
    if issues > u32::from(u8::MAX) {
        tracing::warn!(
            ordinal,
            issues,
            "result exceeds the exit-status range; reporting 255"
        );
        Ok(u8::MAX)
    } else {
        Ok(issues as u8)
    }
}

/// Run one work unit with the vocabulary unblocked, then re-block.
///
/// Pending pause/terminate signals are delivered on entry; a signal arriving
/// mid-unit interrupts nothing observable because the following flag checks
/// happen with the mask restored. Units are never observably interrupted
/// partway.
fn unit_window(params: &TaskParams) -> Result<u32> {
    channel::unblock(&VOCABULARY)?;
    let delta = work::do_work_unit(params);
    channel::block(&VOCABULARY)?;
    Ok(delta)
}

/// Alternate between waiting for the turn and working until paused. Issues
/// hit during units count toward the result exactly as under the handshake
/// policy.
fn run_round_robin(ordinal: usize, controller_pid: i32, params: &TaskParams) -> Result<u32> {
    channel::install(Signal::SIGUSR1, SigHandler::Handler(on_start))?;
    channel::install(Signal::SIGUSR2, SigHandler::Handler(on_pause))?;
    channel::install(Signal::SIGTERM, SigHandler::Handler(note_shutdown))?;
    channel::install(Signal::SIGINT, SigHandler::Handler(note_shutdown))?;
    channel::install(Signal::SIGALRM, SigHandler::Handler(on_timer))?;
    // The orphan-poll timer may only fire inside the wait, so its flag
    // check cannot race with delivery.
    channel::block(&[Signal::SIGALRM])?;

    let controller = Pid::from_raw(controller_pid);
    tracing::info!(ordinal, pid = getpid().as_raw(), "waiting for first turn");
    let mut issues: u32 = 0;
    let wake = [
        Signal::SIGUSR1,
        Signal::SIGALRM,
        Signal::SIGTERM,
        Signal::SIGINT,
    ];

    'turns: loop {
        // WAITING_FOR_TURN / PAUSED: wake for a start, for termination, or
        // for the orphan-poll timer. A vanished controller can never send
        // anything again, so the timer is the only way out of that corner.
        loop {
            CELLS
                .timer_fired
                .store(false, std::sync::atomic::Ordering::Relaxed);
            nix::unistd::alarm::set(ORPHAN_POLL_SECS);
            channel::wait_while(&wake, || {
                !CELLS.is_active()
                    && !CELLS.shutdown_requested()
                    && !CELLS.timer_fired.load(std::sync::atomic::Ordering::Relaxed)
            })?;
            if CELLS.is_active() || CELLS.shutdown_requested() {
                nix::unistd::alarm::cancel();
                break;
            }
            if getppid() != controller {
                tracing::warn!(ordinal, "controller is gone; exiting early");
                break 'turns;
            }
        }
        if CELLS.shutdown_requested() {
            break;
        }

        tracing::debug!(ordinal, "turn granted");
        while CELLS.is_active() && !CELLS.shutdown_requested() {
            issues += unit_window(params)?;
            tracing::trace!(ordinal, issues, "unit finished");
            if getppid() != controller {
                tracing::warn!(ordinal, "controller is gone; exiting early");
                break 'turns;
            }
        }
        if CELLS.shutdown_requested() {
            break;
        }
        tracing::debug!(ordinal, issues, "paused");
    }

    tracing::info!(ordinal, issues, "terminating");
    Ok(issues)
}

/// Work through the configured phases, blocking after each for the
/// controller's acknowledgment.
fn run_handshake(ordinal: usize, controller_pid: i32, params: &TaskParams) -> Result<u32> {
    channel::install(Signal::SIGUSR2, SigHandler::Handler(on_ack))?;
    channel::install(Signal::SIGTERM, SigHandler::Handler(note_shutdown))?;
    channel::install(Signal::SIGINT, SigHandler::Handler(note_shutdown))?;
    channel::install(Signal::SIGALRM, SigHandler::Handler(on_timer))?;
    // The retry timer is only allowed to fire inside the ack wait, so its
    // flag check cannot race with delivery.
    channel::block(&[Signal::SIGALRM])?;

    let controller = Pid::from_raw(controller_pid);
    let mut issues: u32 = 0;
    tracing::info!(ordinal, pid = getpid().as_raw(), "task started");

    'phases: for phase in 1..=params.phases {
        tracing::info!(ordinal, phase, total = params.phases, "phase started");
        for _ in 0..params.units {
            if CELLS.shutdown_requested() {
                break 'phases;
            }
            issues += unit_window(params)?;
        }
        if CELLS.shutdown_requested() {
            break;
        }

        // Orphan guard: if the controller is gone we have been reparented
        // and must not signal whoever inherited us.
        if getppid() != controller {
            tracing::warn!(ordinal, "controller is gone; exiting early");
            break;
        }
        channel::send(controller, Wire::PhaseDone)?;
        tracing::info!(ordinal, phase, issues, "phase complete, awaiting acknowledgment");

        // PHASE_DONE_AWAITING_ACK: termination outranks a pending ack.
        // Completions from two workers can merge into one pending signal on
        // the controller side, so an overdue ack is re-requested on a timer
        // instead of waited out forever.
        let wake = [
            Signal::SIGUSR2,
            Signal::SIGALRM,
            Signal::SIGTERM,
            Signal::SIGINT,
        ];
        loop {
            CELLS
                .timer_fired
                .store(false, std::sync::atomic::Ordering::Relaxed);
            nix::unistd::alarm::set(ACK_RETRY_SECS);
            channel::wait_while(&wake, || {
                !CELLS.acked.load(std::sync::atomic::Ordering::Relaxed)
                    && !CELLS.shutdown_requested()
                    && !CELLS.timer_fired.load(std::sync::atomic::Ordering::Relaxed)
            })?;
            if CELLS.acked.load(std::sync::atomic::Ordering::Relaxed)
                || CELLS.shutdown_requested()
            {
                nix::unistd::alarm::cancel();
                break;
            }
            tracing::debug!(ordinal, phase, "acknowledgment overdue, re-sending completion");
            channel::send_if_alive(controller, Wire::PhaseDone)?;
        }
        if CELLS.shutdown_requested() {
            break;
        }
        CELLS
            .acked
            .store(false, std::sync::atomic::Ordering::Relaxed);
    }

    tracing::info!(ordinal, issues, "task complete");
    Ok(issues)
}
