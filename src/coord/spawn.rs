//! Worker subprocess spawning.
//!
//! Re-execs the current binary with a hidden `worker` subcommand rather than
//! forking in place, so each worker starts from a clean runtime. Task
//! parameters travel as plain arguments, never as signals.

use super::{Policy, TaskParams, channel};
use crate::error::{Result, TurnpoolError};
use nix::sys::signal::{self, SigSet, SigmaskHow};
use nix::unistd::{Pid, getpid};
use std::os::unix::process::CommandExt;
use std::process::Command;

/// Spawn one worker with its ordinal and the shared task parameters.
///
/// The returned PID must be recorded by the caller before any signal naming
/// it can be processed; the controller guarantees this by keeping the whole
/// vocabulary blocked outside its wait primitive.
///
/// The child's signal mask is set **before exec** to block the entire
/// vocabulary. The mask survives exec, so a signal sent during the window
/// between spawn and the worker's handler installation stays pending instead
/// of killing the child with the default disposition. This removes the
/// early-signal race instead of papering over it with a grace period.
pub fn spawn_worker(ordinal: usize, policy: Policy, params: &TaskParams) -> Result<Pid> {
    let exe = std::env::current_exe().map_err(|source| TurnpoolError::Spawn { ordinal, source })?;

    let mut cmd = Command::new(exe);
    cmd.arg("worker")
        .arg("--ordinal")
        .arg(ordinal.to_string())
        .arg("--policy")
        .arg(policy.as_str())
        .arg("--controller-pid")
        .arg(getpid().to_string())
        .arg("--phases")
        .arg(params.phases.to_string())
        .arg("--units")
        .arg(params.units.to_string())
        .arg("--unit-ms")
        .arg(params.unit_ms.to_string())
        .arg("--fail-prob")
        .arg(params.fail_prob.to_string());

    // Safety: the pre_exec closure runs in the child between fork and exec
    // and calls only the async-signal-safe sigprocmask.
    unsafe {
        cmd.pre_exec(|| {
            let mut mask = SigSet::empty();
            for sig in channel::VOCABULARY {
                mask.add(sig);
            }
            signal::sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            Ok(())
        });
    }

    let child = cmd
        .spawn()
        .map_err(|source| TurnpoolError::Spawn { ordinal, source })?;

    // The Child handle is dropped deliberately: reaping happens through the
    // controller's waitpid loop, keyed by this PID.
    Ok(Pid::from_raw(child.id() as i32))
}

// No unit tests here: under `cargo test` the current executable is the test
// harness, not the CLI, so spawning is exercised by the integration tests
// against the real binary instead.
