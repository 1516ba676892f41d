//! Signal-mediated coordination between a controller and a worker pool.
//!
//! One controller process spawns a fixed pool of worker processes and drives
//! them with asynchronous signals as the only communication channel: no
//! pipes, no shared memory. The workers report results back through their
//! exit statuses.
//!
//! # Architecture
//!
//! ```text
//!                   ┌──────────────────┐
//!                   │    Controller    │
//!                   │  (scheduler +    │
//!                   │   aggregation)   │
//!                   └────────┬─────────┘
//!              SIGUSR1/2/TERM│  ▲ SIGUSR1 (phase done), SIGCHLD
//!            ┌───────────────┼──┴───────────┐
//!            │               │              │
//!      ┌─────▼─────┐   ┌─────▼─────┐  ┌─────▼─────┐
//!      │ Worker 0  │   │ Worker 1  │  │ Worker N-1│
//!      │ (process) │   │ (process) │  │ (process) │
//!      └───────────┘   └───────────┘  └───────────┘
//! ```
//!
//! Two scheduling policies exist, selected up front and never mixed:
//! exclusive round-robin (at most one worker unpaused at any instant) and
//! the phase handshake (each worker's phase `k+1` is gated on the
//! controller's acknowledgment of phase `k`).

pub mod channel;
pub mod controller;
pub mod reap;
pub mod spawn;
pub mod state;
pub mod worker;

/// Scheduling policy, chosen on the command line. The two are distinct
/// protocols with distinct signal meanings and are never conflated within
/// one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Policy {
    /// Exclusive turns: the controller pauses the active worker and starts
    /// the next on a timer, visiting ordinals 0, 1, ..., N-1, 0, ...
    RoundRobin,
    /// Phased work: every worker runs concurrently but blocks after each
    /// phase until the controller acknowledges it.
    Handshake,
}

impl Policy {
    /// Stable string form, used when re-execing the worker subcommand.
    pub fn as_str(self) -> &'static str {
        match self {
            Policy::RoundRobin => "round-robin",
            Policy::Handshake => "handshake",
        }
    }
}

/// Shared task parameters handed to every worker as plain arguments.
#[derive(Debug, Clone, Copy)]
pub struct TaskParams {
    /// Phases per worker (handshake policy).
    pub phases: u32,
    /// Work units per phase.
    pub units: u32,
    /// Duration of one work unit in milliseconds.
    pub unit_ms: u64,
    /// Probability in percent that a unit reports an issue.
    pub fail_prob: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_as_str_round_trips_value_enum() {
        use clap::ValueEnum;
        for policy in [Policy::RoundRobin, Policy::Handshake] {
            let parsed = Policy::from_str(policy.as_str(), false).unwrap();
            assert_eq!(parsed, policy);
        }
    }
}
