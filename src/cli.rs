//! Command-line interface definitions using clap.

use crate::coord::{Policy, TaskParams};
use clap::{Parser, Subcommand};

/// Signal-driven coordination between a controller and a pool of workers.
#[derive(Parser, Debug)]
#[command(name = "turnpool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a controller with a pool of worker processes.
    Run(RunArgs),

    /// Worker entry point, spawned internally by `run`.
    #[command(hide = true)]
    Worker(WorkerArgs),
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Number of worker processes; must lie in (0, 8).
    #[arg(short = 'n', long, default_value_t = 3,
          value_parser = clap::value_parser!(u32).range(1..8))]
    pub workers: u32,

    /// Scheduling policy.
    #[arg(long, value_enum, default_value_t = Policy::Handshake)]
    pub policy: Policy,

    /// Phases per worker (handshake policy).
    #[arg(long, default_value_t = 3,
          value_parser = clap::value_parser!(u32).range(1..))]
    pub phases: u32,

    /// Work units per phase.
    #[arg(long, default_value_t = 2,
          value_parser = clap::value_parser!(u32).range(1..))]
    pub units: u32,

    /// Duration of one work unit in milliseconds.
    #[arg(long, default_value_t = 50)]
    pub unit_ms: u64,

    /// Probability in percent that a unit reports an issue.
    #[arg(long, default_value_t = 0,
          value_parser = clap::value_parser!(u8).range(0..=100))]
    pub fail_prob: u8,

    /// Turn-advance events to issue (round-robin policy).
    #[arg(long, default_value_t = 4,
          value_parser = clap::value_parser!(u32).range(1..))]
    pub turns: u32,

    /// Interval between turn advances in milliseconds.
    #[arg(long, default_value_t = 200)]
    pub turn_ms: u64,
}

impl RunArgs {
    pub fn task_params(&self) -> TaskParams {
        TaskParams {
            phases: self.phases,
            units: self.units,
            unit_ms: self.unit_ms,
            fail_prob: self.fail_prob,
        }
    }
}

/// Arguments for the hidden worker subcommand. Mirrors what
/// `coord::spawn::spawn_worker` passes on the child command line.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Ordinal index of this worker in the pool.
    #[arg(long)]
    pub ordinal: usize,

    /// Scheduling policy the pool runs under.
    #[arg(long, value_enum)]
    pub policy: Policy,

    /// PID of the spawning controller (orphan guard).
    #[arg(long)]
    pub controller_pid: i32,

    #[arg(long)]
    pub phases: u32,

    #[arg(long)]
    pub units: u32,

    #[arg(long)]
    pub unit_ms: u64,

    #[arg(long)]
    pub fail_prob: u8,
}

impl WorkerArgs {
    pub fn task_params(&self) -> TaskParams {
        TaskParams {
            phases: self.phases,
            units: self.units,
            unit_ms: self.unit_ms,
            fail_prob: self.fail_prob,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_asserts() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_defaults() {
        let cli = Cli::try_parse_from(["turnpool", "run"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run subcommand");
        };
        assert_eq!(args.workers, 3);
        assert_eq!(args.policy, Policy::Handshake);
        assert_eq!(args.fail_prob, 0);
    }

    #[test]
    fn test_worker_count_bounds() {
        // The pool size must lie strictly between 0 and 8.
        assert!(Cli::try_parse_from(["turnpool", "run", "-n", "0"]).is_err());
        assert!(Cli::try_parse_from(["turnpool", "run", "-n", "8"]).is_err());
        assert!(Cli::try_parse_from(["turnpool", "run", "-n", "1"]).is_ok());
        assert!(Cli::try_parse_from(["turnpool", "run", "-n", "7"]).is_ok());
    }

    #[test]
    fn test_fail_prob_bounds() {
        assert!(Cli::try_parse_from(["turnpool", "run", "--fail-prob", "100"]).is_ok());
        assert!(Cli::try_parse_from(["turnpool", "run", "--fail-prob", "101"]).is_err());
    }

    #[test]
    fn test_policy_parsing() {
        let cli =
            Cli::try_parse_from(["turnpool", "run", "--policy", "round-robin"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run subcommand");
        };
        assert_eq!(args.policy, Policy::RoundRobin);
    }

    #[test]
    fn test_worker_subcommand_parses_spawn_args() {
        let cli = Cli::try_parse_from([
            "turnpool", "worker", "--ordinal", "2", "--policy", "handshake",
            "--controller-pid", "1234", "--phases", "3", "--units", "2",
            "--unit-ms", "10", "--fail-prob", "5",
        ])
        .unwrap();
        let Commands::Worker(args) = cli.command else {
            panic!("expected worker subcommand");
        };
        assert_eq!(args.ordinal, 2);
        assert_eq!(args.controller_pid, 1234);
        assert_eq!(args.task_params().fail_prob, 5);
    }
}
